//! Working-tree status via the `git` CLI, shaped for the
//! `get_git_status` payload.

use std::{
    path::{Path, PathBuf},
    process::Command,
};

use crate::bus::interface::{GitFileStatus, GitStatusInfo, GitStatusPayload};

use super::clean_path;

pub(super) fn git_status(working_directory: &Path, allowed_roots: &[PathBuf]) -> GitStatusPayload {
    if run_git(working_directory, &["--version"]).is_none() {
        return GitStatusPayload {
            is_git_repo: false,
            status_info: None,
            error: None,
        };
    }

    if run_git(working_directory, &["rev-parse", "--git-dir"]).is_none() {
        return GitStatusPayload {
            is_git_repo: false,
            status_info: None,
            error: None,
        };
    }

    let branch = run_git(working_directory, &["rev-parse", "--abbrev-ref", "HEAD"]);
    let head_commit = run_git(working_directory, &["rev-parse", "HEAD"]);
    let head_message = run_git(working_directory, &["log", "-1", "--pretty=%B"]);

    let porcelain = match run_git(working_directory, &["status", "--porcelain"]) {
        Some(output) => output,
        None => {
            return GitStatusPayload {
                is_git_repo: true,
                status_info: None,
                error: Some("git status failed".to_owned()),
            }
        }
    };

    let files = porcelain
        .lines()
        .filter_map(parse_porcelain_line)
        .filter_map(|(relative, staged, status)| {
            let absolute = clean_path(&working_directory.join(&relative));
            let contained = allowed_roots.iter().any(|root| absolute.starts_with(root));
            contained.then(|| GitFileStatus {
                absolute_path: absolute.to_string_lossy().into_owned(),
                staged,
                status,
            })
        })
        .collect();

    GitStatusPayload {
        is_git_repo: true,
        status_info: Some(GitStatusInfo {
            branch,
            head_commit,
            head_message,
            files,
        }),
        error: None,
    }
}

fn run_git(working_directory: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(working_directory)
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Parses one `git status --porcelain` line into
/// `(relative path, staged, status)`.
fn parse_porcelain_line(line: &str) -> Option<(String, bool, String)> {
    if line.len() < 4 {
        return None;
    }

    let mut chars = line.chars();
    let index_status = chars.next()?;
    let worktree_status = chars.next()?;
    let path_part = line.get(3..)?;

    // Renames are reported as `OLD -> NEW`; only the new name matters here.
    let path_part = match path_part.split_once(" -> ") {
        Some((_, new_path)) => new_path,
        None => path_part,
    };
    let path = unquote(path_part);

    let staged = index_status != ' ' && index_status != '?';

    let status = if index_status == '?' && worktree_status == '?' {
        "??".to_owned()
    } else if staged && worktree_status == ' ' {
        index_status.to_string()
    } else if !staged && worktree_status != ' ' {
        worktree_status.to_string()
    } else {
        format!("{}{}", index_status, worktree_status)
    };

    Some((path, staged, status))
}

/// Undoes git's C-style quoting of paths with special characters.
fn unquote(path: &str) -> String {
    let Some(inner) = path
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    else {
        return path.to_owned();
    };

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untracked_files_are_double_question() {
        let (path, staged, status) = parse_porcelain_line("?? src/new.tsx").unwrap();
        assert_eq!(path, "src/new.tsx");
        assert!(!staged);
        assert_eq!(status, "??");
    }

    #[test]
    fn staged_only_uses_index_status() {
        let (path, staged, status) = parse_porcelain_line("A  src/added.tsx").unwrap();
        assert_eq!(path, "src/added.tsx");
        assert!(staged);
        assert_eq!(status, "A");
    }

    #[test]
    fn worktree_only_uses_worktree_status() {
        let (_, staged, status) = parse_porcelain_line(" M src/changed.tsx").unwrap();
        assert!(!staged);
        assert_eq!(status, "M");
    }

    #[test]
    fn staged_and_dirty_uses_both() {
        let (_, staged, status) = parse_porcelain_line("MM src/both.tsx").unwrap();
        assert!(staged);
        assert_eq!(status, "MM");
    }

    #[test]
    fn renames_keep_only_the_new_path() {
        let (path, staged, status) = parse_porcelain_line("R  old.tsx -> new.tsx").unwrap();
        assert_eq!(path, "new.tsx");
        assert!(staged);
        assert_eq!(status, "R");
    }

    #[test]
    fn quoted_paths_are_unquoted() {
        let (path, _, _) = parse_porcelain_line(r#"?? "with space.tsx""#).unwrap();
        assert_eq!(path, "with space.tsx");

        let (path, _, _) = parse_porcelain_line(r#"?? "tab\there.tsx""#).unwrap();
        assert_eq!(path, "tab\there.tsx");
    }

    #[test]
    fn short_lines_are_ignored()  {
        assert!(parse_porcelain_line("").is_none());
        assert!(parse_porcelain_line("M").is_none());
    }

    #[test]
    fn status_in_a_real_repository() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();

        if run_git(&root, &["--version"]).is_none() {
            // Machine without git; the absence path is covered below.
            return;
        }

        let git = |args: &[&str]| {
            Command::new("git")
                .args(args)
                .current_dir(&root)
                .output()
                .unwrap()
        };
        git(&["init", "-q"]);
        git(&["config", "user.email", "test@example.com"]);
        git(&["config", "user.name", "Test"]);

        fs_err::write(root.join("tracked.tsx"), "a").unwrap();
        git(&["add", "tracked.tsx"]);
        git(&["commit", "-q", "-m", "initial commit"]);
        fs_err::write(root.join("untracked.tsx"), "b").unwrap();

        let payload = git_status(&root, &[root.clone()]);
        assert!(payload.is_git_repo);

        let info = payload.status_info.unwrap();
        assert_eq!(info.head_message.as_deref(), Some("initial commit"));
        assert_eq!(info.files.len(), 1);
        assert_eq!(info.files[0].status, "??");
        assert!(info.files[0].absolute_path.ends_with("untracked.tsx"));
    }

    #[test]
    fn outside_a_repository_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        // Guard against the tempdir living under some parent repository.
        let payload = git_status(&dir.path().join("missing"), &[]);
        assert!(!payload.is_git_repo);
        assert!(payload.error.is_none());
    }
}
