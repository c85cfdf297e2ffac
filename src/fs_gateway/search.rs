//! Project-wide text search, delegated to ripgrep's `--json` output.

use std::{
    path::PathBuf,
    process::Command,
};

use serde_json::Value;

use crate::bus::interface::{SearchMatch, SearchParams, SearchPayload};

const DEFAULT_MAX_RESULTS: usize = 500;

pub(super) fn search(roots: &[PathBuf], params: &SearchParams) -> SearchPayload {
    if let Err(message) = validate(params) {
        return failure(message);
    }

    let options = &params.options;
    let max_results = options.max_results.unwrap_or(DEFAULT_MAX_RESULTS);

    let mut results = Vec::new();
    let mut truncated = false;

    'roots: for root in roots {
        if !root.is_dir() {
            continue;
        }

        let mut cmd = Command::new("rg");
        cmd.arg("--json");

        match options.case_sensitive {
            Some(true) => {
                cmd.arg("--case-sensitive");
            }
            Some(false) => {
                cmd.arg("--ignore-case");
            }
            None => {
                cmd.arg("--smart-case");
            }
        }
        if options.whole_word {
            cmd.arg("--word-regexp");
        }
        if options.fixed_strings {
            cmd.arg("--fixed-strings");
        }
        for glob in &options.include {
            cmd.arg("--glob").arg(glob);
        }
        for glob in &options.exclude {
            cmd.arg("--glob").arg(format!("!{}", glob));
        }
        if let Some(context) = options.context_lines {
            cmd.arg("--context").arg(context.to_string());
        }

        cmd.arg("--").arg(&params.pattern).arg(root);

        let output = match cmd.output() {
            Ok(output) => output,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return failure("ripgrep (rg) is not installed".to_owned());
            }
            Err(err) => return failure(format!("Failed to run ripgrep: {}", err)),
        };

        // Exit code 1 just means "no matches in this root".
        if !output.status.success() && output.status.code() != Some(1) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return failure(format!("ripgrep failed: {}", stderr.trim()));
        }

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let Some(found) = parse_match_line(line) else {
                continue;
            };
            results.push(found);

            if results.len() >= max_results {
                truncated = true;
                break 'roots;
            }
        }
    }

    SearchPayload {
        success: true,
        results,
        truncated,
        error: None,
    }
}

fn validate(params: &SearchParams) -> Result<(), String> {
    if params.pattern.contains("..") || params.pattern.starts_with('/') {
        return Err("Search pattern must not contain '..' or absolute paths".to_owned());
    }

    for glob in params
        .options
        .include
        .iter()
        .chain(params.options.exclude.iter())
    {
        if glob.contains("..") || glob.starts_with('/') {
            return Err("Search globs must not contain '..' or absolute paths".to_owned());
        }
    }

    Ok(())
}

fn failure(message: String) -> SearchPayload {
    SearchPayload {
        success: false,
        results: Vec::new(),
        truncated: false,
        error: Some(message),
    }
}

/// Extracts a [`SearchMatch`] from one ripgrep `--json` line; only `match`
/// records count, `begin`/`context`/`end`/`summary` records are skipped.
fn parse_match_line(line: &str) -> Option<SearchMatch> {
    let value: Value = serde_json::from_str(line).ok()?;
    if value.get("type")?.as_str()? != "match" {
        return None;
    }

    let data = value.get("data")?;
    let file_path = data.get("path")?.get("text")?.as_str()?.to_owned();
    let line_number = data.get("line_number")?.as_u64()?;
    let text = data
        .get("lines")?
        .get("text")?
        .as_str()?
        .trim_end_matches('\n')
        .to_owned();

    Some(SearchMatch {
        file_path,
        line_number,
        line: text,
    })
}
