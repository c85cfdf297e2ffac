//! Bidirectional prefix rewriting between the dev-container workspace and the
//! host machine's checkout of the same project.
//!
//! Paths cross the bus as strings and may originate on a different operating
//! system than the one we're running on, so everything here is string-based:
//! backslashes are normalized to forward slashes and `.`/`..` segments are
//! resolved lexically before the prefix is compared.

/// Rewrites `path` from the dev-workspace root to the host-workspace root.
///
/// Paths outside `dev_root` are returned unchanged (normalized).
pub fn translate_dev_to_host(path: &str, dev_root: &str, host_root: &str) -> String {
    rewrite_prefix(path, dev_root, host_root)
}

/// Rewrites `path` from the host-workspace root to the dev-workspace root.
///
/// Paths outside `host_root` are returned unchanged (normalized).
pub fn translate_host_to_dev(path: &str, dev_root: &str, host_root: &str) -> String {
    rewrite_prefix(path, host_root, dev_root)
}

/// Rewrites every string in a JSON value that lives under `from_root`.
///
/// Request params and response payloads carry paths in arbitrary positions
/// (`filePath`, `absolutePath`, nested arrays of results); rather than
/// enumerating them per event, the tunnel rewrites any string that starts
/// with the source root and leaves everything else byte-identical.
pub fn translate_value(
    value: serde_json::Value,
    from_root: &str,
    to_root: &str,
) -> serde_json::Value {
    use serde_json::Value;

    match value {
        Value::String(text) => {
            let slashed = text.replace('\\', "/");
            let root = from_root.replace('\\', "/");
            let root = root.trim_end_matches('/');
            if slashed == root || slashed.starts_with(&format!("{}/", root)) {
                Value::String(rewrite_prefix(&text, from_root, to_root))
            } else {
                Value::String(text)
            }
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| translate_value(item, from_root, to_root))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, nested)| (key, translate_value(nested, from_root, to_root)))
                .collect(),
        ),
        other => other,
    }
}

fn rewrite_prefix(path: &str, from_root: &str, to_root: &str) -> String {
    let path = normalize(path);
    let from_root = normalize(from_root);
    let to_root = normalize(to_root);

    if path == from_root {
        return to_root;
    }

    if from_root == "/" {
        if let Some(rest) = path.strip_prefix('/') {
            return format!("{}/{}", to_root, rest);
        }
    } else if let Some(rest) = path.strip_prefix(&from_root) {
        if rest.starts_with('/') {
            return format!("{}{}", to_root, rest);
        }
    }

    path
}

/// Normalizes a path string: backslashes become forward slashes, `.` segments
/// and trailing slashes drop, and `..` segments resolve lexically. Windows
/// drive prefixes (`C:`) are treated as ordinary leading segments.
fn normalize(path: &str) -> String {
    let forward = path.replace('\\', "/");
    let absolute = forward.starts_with('/');

    let mut segments: Vec<&str> = Vec::new();
    for segment in forward.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                match segments.last() {
                    Some(&"..") | None => {
                        // Can't resolve above the start of a relative path.
                        if !absolute {
                            segments.push("..");
                        }
                    }
                    Some(_) => {
                        segments.pop();
                    }
                }
            }
            other => segments.push(other),
        }
    }

    let joined = segments.join("/");
    if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_owned()
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV_ROOT: &str = "/app/web";
    const HOST_ROOT: &str = "/Users/jamie/jsx-tool/web";

    #[test]
    fn host_to_dev_inside_root() {
        let translated = translate_host_to_dev(
            "/Users/jamie/jsx-tool/web/apps/web/.jsxtool/.gitignore",
            DEV_ROOT,
            HOST_ROOT,
        );
        assert_eq!(translated, "/app/web/apps/web/.jsxtool/.gitignore");
    }

    #[test]
    fn round_trip_identity() {
        let host_path = "/Users/jamie/jsx-tool/web/src/components/App.tsx";
        let dev_path = translate_host_to_dev(host_path, DEV_ROOT, HOST_ROOT);
        assert_eq!(translate_dev_to_host(&dev_path, DEV_ROOT, HOST_ROOT), host_path);

        let dev_path = "/app/web/package.json";
        let host_path = translate_dev_to_host(dev_path, DEV_ROOT, HOST_ROOT);
        assert_eq!(translate_host_to_dev(&host_path, DEV_ROOT, HOST_ROOT), dev_path);
    }

    #[test]
    fn root_maps_to_root() {
        assert_eq!(translate_dev_to_host("/app/web", DEV_ROOT, HOST_ROOT), HOST_ROOT);
        assert_eq!(translate_dev_to_host("/app/web/", DEV_ROOT, HOST_ROOT), HOST_ROOT);
        assert_eq!(translate_host_to_dev(HOST_ROOT, DEV_ROOT, HOST_ROOT), DEV_ROOT);
    }

    #[test]
    fn outside_root_unchanged() {
        assert_eq!(
            translate_dev_to_host("/etc/passwd", DEV_ROOT, HOST_ROOT),
            "/etc/passwd"
        );
        // A sibling directory that shares a string prefix is not inside the root.
        assert_eq!(
            translate_dev_to_host("/app/webapp/index.html", DEV_ROOT, HOST_ROOT),
            "/app/webapp/index.html"
        );
    }

    #[test]
    fn trailing_slashes_on_roots_are_trimmed() {
        assert_eq!(
            translate_dev_to_host("/app/web/src/main.tsx", "/app/web/", "/Users/jamie/jsx-tool/web/"),
            "/Users/jamie/jsx-tool/web/src/main.tsx"
        );
    }

    #[test]
    fn value_translation_rewrites_only_paths_under_the_root() {
        use serde_json::json;

        let payload = json!({
            "statusInfo": {
                "files": [
                    { "absolutePath": "/Users/jamie/jsx-tool/web/src/App.tsx", "staged": false },
                ],
            },
            "note": "left alone",
            "lookalike": "/Users/jamie/jsx-toolbox/file.ts",
        });

        let translated = translate_value(payload, HOST_ROOT, DEV_ROOT);
        assert_eq!(
            translated["statusInfo"]["files"][0]["absolutePath"],
            "/app/web/src/App.tsx"
        );
        assert_eq!(translated["note"], "left alone");
        assert_eq!(translated["lookalike"], "/Users/jamie/jsx-toolbox/file.ts");
    }

    #[test]
    fn backslashes_and_dot_segments_resolve() {
        assert_eq!(
            translate_dev_to_host("/app/web/src/./ui/../App.tsx", DEV_ROOT, HOST_ROOT),
            "/Users/jamie/jsx-tool/web/src/App.tsx"
        );
        assert_eq!(
            translate_host_to_dev(
                "C:\\projects\\web\\src\\App.tsx",
                "/app/web",
                "C:\\projects\\web",
            ),
            "/app/web/src/App.tsx"
        );
    }
}
