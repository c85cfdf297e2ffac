//! Recursive project listing with the `node_modules` manifest policy.
//!
//! Inside `node_modules`, only packages named by the project manifest's
//! `dependencies`/`devDependencies` are visited, and for each of those only
//! the files its own manifest actually points at are emitted. This keeps the
//! listing proportional to the project instead of the installed universe.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use serde_json::Value;

use super::{is_allowed_file_name, GatewayError};

#[derive(Debug, Deserialize)]
struct ProjectManifest {
    #[serde(default)]
    dependencies: HashMap<String, String>,
    #[serde(default, rename = "devDependencies")]
    dev_dependencies: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct PackageEntryPoints {
    #[serde(default)]
    main: Option<String>,
    #[serde(default)]
    module: Option<String>,
    #[serde(default)]
    browser: Option<Value>,
    #[serde(default)]
    types: Option<String>,
    #[serde(default)]
    typings: Option<String>,
    #[serde(default)]
    exports: Option<Value>,
}

/// Files always emitted for a visited package, entry points aside.
const PACKAGE_BASICS: &[&str] = &["package.json", "README.md"];

/// One of these is emitted as the entry-point fallback, first match wins.
const INDEX_FALLBACKS: &[&str] = &["index.js", "index.d.ts", "index.mjs", "index.cjs"];

pub(super) fn walk_tree(
    root: &Path,
    working_directory: &Path,
    node_modules_dir: &Path,
) -> Result<Vec<String>, GatewayError> {
    let mut files = Vec::new();

    if root == node_modules_dir {
        collect_node_modules(root, working_directory, &mut files)?;
    } else {
        walk_dir(root, working_directory, node_modules_dir, &mut files, true)?;
    }

    files.sort();
    Ok(files)
}

fn walk_dir(
    dir: &Path,
    working_directory: &Path,
    node_modules_dir: &Path,
    files: &mut Vec<String>,
    is_root: bool,
) -> Result<(), GatewayError> {
    let entries = match fs_err::read_dir(dir) {
        Ok(entries) => entries,
        // The walk root must be readable; everything below it degrades
        // silently.
        Err(err) if is_root => return Err(err.into()),
        Err(_) => return Ok(()),
    };

    for entry in entries {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        let name = entry.file_name().to_string_lossy().into_owned();

        if file_type.is_dir() {
            if path == node_modules_dir {
                collect_node_modules(&path, working_directory, files)?;
            } else if !name.starts_with('.') {
                walk_dir(&path, working_directory, node_modules_dir, files, false)?;
            }
        } else if is_allowed_file_name(&name) {
            files.push(path.to_string_lossy().into_owned());
        }
    }

    Ok(())
}

fn collect_node_modules(
    node_modules_dir: &Path,
    working_directory: &Path,
    files: &mut Vec<String>,
) -> Result<(), GatewayError> {
    let manifest_path = working_directory.join("package.json");
    let contents = fs_err::read_to_string(&manifest_path).map_err(|err| GatewayError::Manifest {
        message: err.to_string(),
    })?;
    let manifest: ProjectManifest =
        serde_json::from_str(&contents).map_err(|err| GatewayError::Manifest {
            message: err.to_string(),
        })?;

    let mut package_names: Vec<&String> = manifest
        .dependencies
        .keys()
        .chain(manifest.dev_dependencies.keys())
        .collect();
    package_names.sort();
    package_names.dedup();

    for package_name in package_names {
        // Scoped names like `@scope/pkg` join into nested directories.
        let package_dir = node_modules_dir.join(package_name.as_str());
        if !package_dir.is_dir() {
            continue;
        }
        collect_package_files(&package_dir, files);
    }

    Ok(())
}

fn collect_package_files(package_dir: &Path, files: &mut Vec<String>) {
    let entry_points = fs_err::read_to_string(package_dir.join("package.json"))
        .ok()
        .and_then(|contents| serde_json::from_str::<PackageEntryPoints>(&contents).ok())
        .unwrap_or_default();

    let mut relative_paths: Vec<String> = Vec::new();
    relative_paths.extend(PACKAGE_BASICS.iter().map(|name| (*name).to_owned()));

    for field in [
        entry_points.main,
        entry_points.module,
        entry_points.types,
        entry_points.typings,
    ]
    .into_iter()
    .flatten()
    {
        relative_paths.push(field);
    }

    if let Some(browser) = &entry_points.browser {
        collect_string_values(browser, &mut relative_paths);
    }
    if let Some(exports) = &entry_points.exports {
        collect_string_values(exports, &mut relative_paths);
    }

    for fallback in INDEX_FALLBACKS {
        if package_dir.join(fallback).is_file() {
            relative_paths.push((*fallback).to_owned());
            break;
        }
    }

    for relative in relative_paths {
        let relative = relative.trim_start_matches("./");
        if relative.is_empty() || relative.contains("..") || relative.contains('*') {
            continue;
        }

        let resolved = package_dir.join(relative);
        let name = resolved
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("")
            .to_owned();

        if resolved.is_file() && is_allowed_file_name(&name) {
            let resolved = resolved.to_string_lossy().into_owned();
            if !files.contains(&resolved) {
                files.push(resolved);
            }
        }
    }
}

/// Collects every string leaf in a manifest value. `exports` maps nest
/// arbitrarily (conditions inside subpaths), `browser` maps may hold `false`
/// to disable a file; both reduce to "take the strings".
fn collect_string_values(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(path) => out.push(path.clone()),
        Value::Object(map) => {
            for nested in map.values() {
                collect_string_values(nested, out);
            }
        }
        Value::Array(items) => {
            for nested in items {
                collect_string_values(nested, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn walk_lists_allowed_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("src/b.tsx"), "");
        write(&dir.path().join("src/a.tsx"), "");
        write(&dir.path().join("src/core.bin"), "");
        write(&dir.path().join("README.md"), "");

        let files = walk_tree(
            dir.path(),
            dir.path(),
            &dir.path().join("node_modules"),
        )
        .unwrap();

        let names: Vec<&str> = files
            .iter()
            .map(|path| path.strip_prefix(dir.path().to_str().unwrap()).unwrap())
            .collect();
        assert_eq!(names, vec!["/README.md", "/src/a.tsx", "/src/b.tsx"]);
    }

    #[test]
    fn node_modules_only_descends_manifest_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("package.json"),
            r#"{ "dependencies": { "react": "^18.0.0" } }"#,
        );

        let react = dir.path().join("node_modules/react");
        write(
            &react.join("package.json"),
            r#"{ "main": "index.js", "exports": { ".": { "default": "./index.js" } } }"#,
        );
        write(&react.join("index.js"), "module.exports = {};");
        write(&react.join("README.md"), "# react");
        write(&react.join("cjs/react.development.js"), "");

        let stray = dir.path().join("node_modules/left-pad");
        write(&stray.join("package.json"), r#"{ "main": "index.js" }"#);
        write(&stray.join("index.js"), "");

        let files = walk_tree(dir.path(), dir.path(), &dir.path().join("node_modules")).unwrap();

        assert!(files.iter().any(|path| path.ends_with("react/index.js")));
        assert!(files.iter().any(|path| path.ends_with("react/package.json")));
        assert!(files.iter().any(|path| path.ends_with("react/README.md")));
        // Not referenced by any entry point field:
        assert!(!files.iter().any(|path| path.contains("react.development")));
        // Not in the project manifest at all:
        assert!(!files.iter().any(|path| path.contains("left-pad")));
    }

    #[test]
    fn unparseable_project_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("package.json"), "{ not json ");
        fs::create_dir_all(dir.path().join("node_modules")).unwrap();

        let result = walk_tree(
            &dir.path().join("node_modules"),
            dir.path(),
            &dir.path().join("node_modules"),
        );
        assert!(matches!(result, Err(GatewayError::Manifest { .. })));
    }

    #[test]
    fn hidden_directories_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join(".git/config.json"), "{}");
        write(&dir.path().join("src/app.ts"), "");

        let files = walk_tree(dir.path(), dir.path(), &dir.path().join("node_modules")).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("src/app.ts"));
    }
}
