//! Cross-workspace path translation, exercised through the public API the
//! host agent uses.

use libjsxtool::{translate_dev_to_host, translate_host_to_dev, translate_value};
use serde_json::json;

const DEV_ROOT: &str = "/app/web";
const HOST_ROOT: &str = "/Users/jamie/jsx-tool/web";

#[test]
fn host_to_dev_maps_nested_project_files() {
    assert_eq!(
        translate_host_to_dev(
            "/Users/jamie/jsx-tool/web/apps/web/.jsxtool/.gitignore",
            DEV_ROOT,
            HOST_ROOT,
        ),
        "/app/web/apps/web/.jsxtool/.gitignore"
    );
}

#[test]
fn translation_round_trips_both_ways() {
    let samples = [
        "/app/web",
        "/app/web/package.json",
        "/app/web/src/components/Button/index.tsx",
        "/app/web/node_modules/react/index.js",
    ];

    for dev_path in samples {
        let host_path = translate_dev_to_host(dev_path, DEV_ROOT, HOST_ROOT);
        assert_eq!(
            translate_host_to_dev(&host_path, DEV_ROOT, HOST_ROOT),
            dev_path,
            "round trip failed for {dev_path}"
        );
    }
}

#[test]
fn forwarded_payloads_translate_every_embedded_path() {
    let payload = json!({
        "isGitRepo": true,
        "statusInfo": {
            "branch": "main",
            "files": [
                {
                    "absolutePath": "/Users/jamie/jsx-tool/web/src/App.tsx",
                    "staged": true,
                    "status": "M",
                },
                {
                    "absolutePath": "/Users/jamie/jsx-tool/web/new.tsx",
                    "staged": false,
                    "status": "??",
                },
            ],
        },
    });

    let translated = translate_value(payload, HOST_ROOT, DEV_ROOT);
    assert_eq!(
        translated["statusInfo"]["files"][0]["absolutePath"],
        "/app/web/src/App.tsx"
    );
    assert_eq!(
        translated["statusInfo"]["files"][1]["absolutePath"],
        "/app/web/new.tsx"
    );
    // Non-path fields are untouched.
    assert_eq!(translated["statusInfo"]["branch"], "main");
}
