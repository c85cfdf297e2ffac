//! Envelope signing compatibility: the canonical form and the keypair the
//! sidecar and host agent share on disk.

use libjsxtool::{canonical_request_bytes, sign_request, LocalKeyStore};
use serde_json::json;

#[test]
fn canonical_form_is_stable_across_param_shapes() {
    let bytes = canonical_request_bytes("read_file", &json!({"filePath": "src/app.tsx"}), "m1");
    assert_eq!(
        String::from_utf8(bytes).unwrap(),
        r#"{"event_name":"read_file","params":{"filePath":"src/app.tsx"},"message_id":"m1"}"#
    );

    // Null params serialize explicitly; clients sign exactly this shape.
    let bytes = canonical_request_bytes("get_version", &json!(null), "m2");
    assert_eq!(
        String::from_utf8(bytes).unwrap(),
        r#"{"event_name":"get_version","params":null,"message_id":"m2"}"#
    );
}

#[test]
fn on_disk_keypair_signs_and_survives_reload() {
    let dir = tempfile::tempdir().unwrap();

    let signature = {
        let store = LocalKeyStore::new(dir.path());
        let key = store.signing_key().unwrap();
        sign_request(&key, "host_init", &json!({"timestamp": 1000}), "m1")
    };

    // A second store over the same directory loads the same key and produces
    // verifiable signatures for the same payload.
    let store = LocalKeyStore::new(dir.path());
    let key = store.signing_key().unwrap();

    use p256::ecdsa::signature::Verifier;
    let raw = data_encoding::BASE64.decode(signature.as_bytes()).unwrap();
    let parsed = p256::ecdsa::Signature::from_slice(&raw).unwrap();
    let message = canonical_request_bytes("host_init", &json!({"timestamp": 1000}), "m1");
    assert!(key.verifying_key().verify(&message, &parsed).is_ok());
}
