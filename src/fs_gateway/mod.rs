//! The filesystem gateway: every read, write, list, and search the bus
//! performs on behalf of a client goes through here.
//!
//! Two rules are enforced on every operation:
//!
//! 1. The resolved path must be contained in one of the allowed roots (the
//!    working directory, the node_modules directory, or an additional
//!    directory). Containment is lexical and rejects `..` escapes.
//! 2. Non-directory targets must carry an allowed web-asset extension or be
//!    one of the recognized dot-files.
//!
//! Domain failures never escape as errors; they are folded into the
//! `response.{success,error}` payload shape the wire expects.

mod git_status;
mod search;
mod tree;
mod watch;

pub use self::watch::{ChangeListener, ChangeWatcher};

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use crate::bus::interface::{
    DirResponse, FileResponse, GitStatusPayload, LsEntry, OpResult, ProjectInfoPayload,
    SearchParams, SearchPayload, WriteFileParams, SERVER_VERSION,
};
use crate::config::SharedConfig;

/// File suffixes the gateway will touch. Anything else is invisible.
const ALLOWED_EXTENSIONS: &[&str] = &[
    ".js", ".jsx", ".ts", ".tsx", ".mjs", ".cjs", ".json", ".xml", ".html", ".htm", ".css",
    ".scss", ".sass", ".less", ".png", ".jpg", ".jpeg", ".gif", ".webp", ".svg", ".ico", ".woff",
    ".woff2", ".ttf", ".otf", ".eot", ".mp4", ".webm", ".ogg", ".mp3", ".wav", ".txt", ".md",
    ".yml", ".yaml", ".map", ".d.ts",
];

/// Exact dot-file names allowed despite having no listed extension.
const ALLOWED_DOT_FILES: &[&str] = &[
    ".gitignore",
    ".env",
    ".prettierrc",
    ".eslintrc",
    ".babelrc",
    ".npmrc",
    ".editorconfig",
];

pub(crate) fn is_allowed_file_name(name: &str) -> bool {
    ALLOWED_DOT_FILES.contains(&name) || ALLOWED_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

/// Resolves `.` and `..` segments lexically without touching the filesystem,
/// so escape attempts are caught even for paths that don't exist.
pub(crate) fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::Normal(_) => {
                out.push(component.as_os_str());
            }
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
        }
    }
    out
}

pub struct FsGateway {
    config: SharedConfig,
}

impl FsGateway {
    pub fn new(config: SharedConfig) -> Self {
        FsGateway { config }
    }

    fn working_directory(&self) -> PathBuf {
        self.config.read().unwrap().working_directory.clone()
    }

    fn allowed_roots(&self) -> Vec<PathBuf> {
        self.config
            .read()
            .unwrap()
            .allowed_roots()
            .into_iter()
            .map(|root| clean_path(&root))
            .collect()
    }

    /// Applies the containment rule and returns the resolved absolute path.
    pub(crate) fn resolve_contained(&self, raw: &str) -> Result<PathBuf, GatewayError> {
        let requested = Path::new(raw);
        let joined = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.working_directory().join(requested)
        };

        let cleaned = clean_path(&joined);
        let contained = self
            .allowed_roots()
            .iter()
            .any(|root| cleaned.starts_with(root));

        if contained {
            Ok(cleaned)
        } else {
            Err(GatewayError::OutsideRoots)
        }
    }

    /// Containment plus the extension rule for non-directory targets.
    fn resolve_file(&self, raw: &str) -> Result<PathBuf, GatewayError> {
        let resolved = self.resolve_contained(raw)?;

        if resolved.is_dir() {
            return Ok(resolved);
        }

        let name = resolved
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("");
        if is_allowed_file_name(name) {
            Ok(resolved)
        } else {
            Err(GatewayError::DisallowedFileType {
                name: name.to_owned(),
            })
        }
    }

    pub fn read_file(&self, file_path: &str) -> FileResponse<String> {
        let response = self
            .resolve_file(file_path)
            .and_then(|resolved| fs_err::read_to_string(resolved).map_err(GatewayError::from))
            .map_or_else(OpResult::err, OpResult::ok);

        FileResponse {
            file_path: file_path.to_owned(),
            response,
        }
    }

    pub fn read_file_many(&self, file_paths: &[String]) -> Vec<FileResponse<String>> {
        file_paths.iter().map(|path| self.read_file(path)).collect()
    }

    pub fn write_file(&self, file_path: &str, content: &str) -> FileResponse<()> {
        let result = self.resolve_file(file_path).and_then(|resolved| {
            if let Some(parent) = resolved.parent() {
                fs_err::create_dir_all(parent)?;
            }
            fs_err::write(resolved, content)?;
            Ok(())
        });

        FileResponse {
            file_path: file_path.to_owned(),
            response: match result {
                Ok(()) => OpResult::done(),
                Err(err) => OpResult::err(err),
            },
        }
    }

    pub fn write_file_many(&self, files: &[WriteFileParams]) -> Vec<FileResponse<()>> {
        files
            .iter()
            .map(|file| self.write_file(&file.file_path, &file.content))
            .collect()
    }

    pub fn exists(&self, file_path: &str) -> FileResponse<bool> {
        let response = self
            .resolve_file(file_path)
            .map(|resolved| resolved.exists())
            .map_or_else(OpResult::err, OpResult::ok);

        FileResponse {
            file_path: file_path.to_owned(),
            response,
        }
    }

    pub fn exists_many(&self, file_paths: &[String]) -> Vec<FileResponse<bool>> {
        file_paths.iter().map(|path| self.exists(path)).collect()
    }

    pub fn ls(&self, dir_path: &str) -> DirResponse<Vec<LsEntry>> {
        let response = self
            .resolve_contained(dir_path)
            .and_then(|resolved| {
                let mut entries = Vec::new();
                for entry in fs_err::read_dir(resolved)? {
                    let entry = entry?;
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let is_directory = entry.file_type()?.is_dir();
                    if is_directory || is_allowed_file_name(&name) {
                        entries.push(LsEntry { name, is_directory });
                    }
                }
                entries.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(entries)
            })
            .map_or_else(OpResult::err, OpResult::ok);

        DirResponse {
            dir_path: dir_path.to_owned(),
            response,
        }
    }

    pub fn ls_many(&self, dir_paths: &[String]) -> Vec<DirResponse<Vec<LsEntry>>> {
        dir_paths.iter().map(|path| self.ls(path)).collect()
    }

    pub fn rm(&self, file_path: &str) -> FileResponse<()> {
        let result = self.resolve_file(file_path).and_then(|resolved| {
            if resolved.is_dir() {
                fs_err::remove_dir_all(resolved)?;
            } else {
                fs_err::remove_file(resolved)?;
            }
            Ok(())
        });

        FileResponse {
            file_path: file_path.to_owned(),
            response: match result {
                Ok(()) => OpResult::done(),
                Err(err) => OpResult::err(err),
            },
        }
    }

    pub fn rm_many(&self, file_paths: &[String]) -> Vec<FileResponse<()>> {
        file_paths.iter().map(|path| self.rm(path)).collect()
    }

    /// Recursive file listing rooted at `dir_path` (the working directory
    /// when absent), with the manifest-driven `node_modules` policy.
    pub fn tree(&self, dir_path: Option<&str>) -> DirResponse<Vec<String>> {
        let working_directory = self.working_directory();
        let raw = dir_path.unwrap_or_else(|| working_directory.to_str().unwrap_or("."));

        let response = self
            .resolve_contained(raw)
            .and_then(|resolved| {
                let node_modules_dir =
                    clean_path(&self.config.read().unwrap().node_modules_dir);
                tree::walk_tree(&resolved, &working_directory, &node_modules_dir)
            })
            .map_or_else(OpResult::err, OpResult::ok);

        DirResponse {
            dir_path: raw.to_owned(),
            response,
        }
    }

    pub fn tree_many(&self, dir_paths: &[String]) -> Vec<DirResponse<Vec<String>>> {
        dir_paths
            .iter()
            .map(|path| self.tree(Some(path)))
            .collect()
    }

    pub fn git_status(&self) -> GitStatusPayload {
        git_status::git_status(&self.working_directory(), &self.allowed_roots())
    }

    pub fn search(&self, params: &SearchParams) -> SearchPayload {
        search::search(&self.allowed_roots(), params)
    }

    pub fn project_info(&self) -> ProjectInfoPayload {
        let config = self.config.read().unwrap();

        let manifest = fs_err::read_to_string(config.working_directory.join("package.json"))
            .ok()
            .and_then(|contents| serde_json::from_str::<serde_json::Value>(&contents).ok());
        let field = |name: &str| {
            manifest
                .as_ref()
                .and_then(|manifest| manifest.get(name))
                .and_then(|value| value.as_str())
                .map(str::to_owned)
        };

        ProjectInfoPayload {
            working_directory: config.working_directory.display().to_string(),
            node_modules_dir: config.node_modules_dir.display().to_string(),
            additional_directories: config
                .additional_directories
                .iter()
                .map(|dir| dir.display().to_string())
                .collect(),
            package_name: field("name"),
            package_version: field("version"),
            ws_url: config.ws_url(),
            server_version: SERVER_VERSION.to_owned(),
        }
    }

    /// Returns `.jsxtool/rules.md` verbatim.
    pub fn prompt_rules(&self) -> FileResponse<String> {
        let path = self.config.read().unwrap().project_dir().join("rules.md");
        let file_path = path.display().to_string();

        let response = fs_err::read_to_string(&path)
            .map_err(GatewayError::from)
            .map_or_else(OpResult::err, OpResult::ok);

        FileResponse {
            file_path,
            response,
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Path must be within working directory")]
    OutsideRoots,

    #[error("File type not allowed: {name}")]
    DisallowedFileType { name: String },

    #[error("Could not parse project manifest: {message}")]
    Manifest { message: String },

    #[error(transparent)]
    Io {
        #[from]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::{shared, Config};

    fn gateway_for(dir: &Path) -> FsGateway {
        let config = Config::defaults(dir.to_path_buf());
        FsGateway::new(shared(config))
    }

    #[test]
    fn escape_attempts_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = gateway_for(dir.path());

        let result = gateway.read_file("../../etc/passwd");
        assert!(!result.response.success);
        assert!(result
            .response
            .error
            .unwrap()
            .contains("Path must be within working directory"));

        let result = gateway.read_file("/etc/passwd");
        assert!(!result.response.success);
    }

    #[test]
    fn disallowed_extensions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs_err::write(dir.path().join("app.exe"), b"MZ").unwrap();
        let gateway = gateway_for(dir.path());

        let result = gateway.read_file("app.exe");
        assert!(!result.response.success);
        assert!(result.response.error.unwrap().contains("not allowed"));
    }

    #[test]
    fn read_and_write_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = gateway_for(dir.path());

        let written = gateway.write_file("src/app.tsx", "export const App = () => null;\n");
        assert!(written.response.success);

        let read = gateway.read_file("src/app.tsx");
        assert!(read.response.success);
        assert_eq!(
            read.response.data.unwrap(),
            "export const App = () => null;\n"
        );
    }

    #[test]
    fn write_creates_intermediate_directories() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = gateway_for(dir.path());

        let written = gateway.write_file("deeply/nested/dir/index.ts", "export {};\n");
        assert!(written.response.success);
        assert!(dir.path().join("deeply/nested/dir/index.ts").is_file());
    }

    #[test]
    fn dot_files_are_recognized() {
        let dir = tempfile::tempdir().unwrap();
        fs_err::write(dir.path().join(".env"), "PORT=3000\n").unwrap();
        let gateway = gateway_for(dir.path());

        let read = gateway.read_file(".env");
        assert!(read.response.success);
        assert_eq!(read.response.data.unwrap(), "PORT=3000\n");
    }

    #[test]
    fn ls_filters_files_but_keeps_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs_err::write(dir.path().join("index.tsx"), "").unwrap();
        fs_err::write(dir.path().join("core.bin"), "").unwrap();
        fs_err::create_dir(dir.path().join("src")).unwrap();
        let gateway = gateway_for(dir.path());

        let listing = gateway.ls(dir.path().to_str().unwrap());
        let entries = listing.response.data.unwrap();
        let names: Vec<&str> = entries.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(names, vec!["index.tsx", "src"]);
    }

    #[test]
    fn missing_file_is_a_payload_error_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = gateway_for(dir.path());

        let result = gateway.read_file("no-such-file.ts");
        assert!(!result.response.success);
        assert!(result.response.error.is_some());
    }

    #[test]
    fn exists_reports_both_ways() {
        let dir = tempfile::tempdir().unwrap();
        fs_err::write(dir.path().join("real.ts"), "").unwrap();
        let gateway = gateway_for(dir.path());

        assert_eq!(gateway.exists("real.ts").response.data, Some(true));
        assert_eq!(gateway.exists("fake.ts").response.data, Some(false));
    }
}
