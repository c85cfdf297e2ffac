//! Envelope signing and verification.
//!
//! A request's signature covers the canonical JSON of
//! `{event_name, params, message_id}` — the struct below fixes that field
//! order; changing it would break compatibility with every deployed client.
//! Signatures are ECDSA-P256 over SHA-256, encoded IEEE-P1363 and base-64.

use std::sync::Arc;

use p256::ecdsa::{
    signature::{Signer, Verifier},
    Signature, SigningKey, VerifyingKey,
};
use p256::pkcs8::DecodePublicKey;
use serde::Serialize;
use serde_json::Value;

use super::KeyManager;

/// The canonical signed projection of a request envelope.
///
/// Field order here is the wire contract: `event_name`, `params`,
/// `message_id`.
#[derive(Serialize)]
struct CanonicalRequest<'a> {
    event_name: &'a str,
    params: &'a Value,
    message_id: &'a str,
}

/// Serializes the canonical form of an envelope for signing or verification.
pub fn canonical_request_bytes(event_name: &str, params: &Value, message_id: &str) -> Vec<u8> {
    serde_json::to_vec(&CanonicalRequest {
        event_name,
        params,
        message_id,
    })
    .expect("canonical request serialization cannot fail")
}

/// Signs an envelope with the local private key, returning the base-64
/// IEEE-P1363 signature. Used by the host agent's `host_init` handshake.
pub fn sign_request(
    key: &SigningKey,
    event_name: &str,
    params: &Value,
    message_id: &str,
) -> String {
    let message = canonical_request_bytes(event_name, params, message_id);
    let signature: Signature = key.sign(&message);
    data_encoding::BASE64.encode(&signature.to_bytes())
}

/// Checks request envelopes against the key currently cached by the
/// [`KeyManager`]. Never panics: any malformed input fails the check.
pub struct SignatureVerifier {
    manager: Arc<KeyManager>,
}

impl SignatureVerifier {
    pub fn new(manager: Arc<KeyManager>) -> Self {
        SignatureVerifier { manager }
    }

    pub fn verify(
        &self,
        event_name: &str,
        params: &Value,
        message_id: &str,
        signature: &str,
    ) -> bool {
        let record = match self.manager.current() {
            Some(record) => record,
            None => {
                log::warn!(
                    "Dropping '{}' request: no editor public key is registered yet",
                    event_name
                );
                return false;
            }
        };

        match verify_with_der(&record.public_key_der, event_name, params, message_id, signature) {
            Ok(valid) => valid,
            Err(message) => {
                log::warn!("Signature check failed for '{}': {}", event_name, message);
                false
            }
        }
    }
}

/// Verifies a signature against a raw SPKI DER key. Shared by the client
/// request path (registry key) and the `host_init` path (project key).
pub(crate) fn verify_with_der(
    public_key_der: &[u8],
    event_name: &str,
    params: &Value,
    message_id: &str,
    signature: &str,
) -> Result<bool, String> {
    let verifying_key =
        VerifyingKey::from_public_key_der(public_key_der).map_err(|err| err.to_string())?;

    let raw_signature = data_encoding::BASE64
        .decode(signature.as_bytes())
        .map_err(|err| err.to_string())?;
    let signature = Signature::from_slice(&raw_signature).map_err(|err| err.to_string())?;

    let message = canonical_request_bytes(event_name, params, message_id);
    Ok(verifying_key.verify(&message, &signature).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    use p256::pkcs8::EncodePublicKey;
    use serde_json::json;

    fn test_key() -> (SigningKey, Vec<u8>) {
        let signing = SigningKey::random(&mut rand::rngs::OsRng);
        let der = signing
            .verifying_key()
            .to_public_key_der()
            .unwrap()
            .into_vec();
        (signing, der)
    }

    #[test]
    fn canonical_field_order_is_fixed() {
        let bytes = canonical_request_bytes("read_file", &json!({"filePath": "src/app.tsx"}), "m1");
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"event_name":"read_file","params":{"filePath":"src/app.tsx"},"message_id":"m1"}"#
        );
    }

    #[test]
    fn signed_request_verifies() {
        let (signing, der) = test_key();
        let params = json!({"filePath": "src/app.tsx"});

        let signature = sign_request(&signing, "read_file", &params, "m1");
        assert!(verify_with_der(&der, "read_file", &params, "m1", &signature).unwrap());
    }

    #[test]
    fn tampered_params_fail_verification() {
        let (signing, der) = test_key();
        let params = json!({"filePath": "src/app.tsx"});

        let signature = sign_request(&signing, "read_file", &params, "m1");
        let tampered = json!({"filePath": "../../etc/passwd"});
        assert!(!verify_with_der(&der, "read_file", &tampered, "m1", &signature).unwrap());
    }

    #[test]
    fn garbage_signature_is_rejected_not_fatal() {
        let (_, der) = test_key();
        let params = json!({});

        assert!(verify_with_der(&der, "ls", &params, "m2", "not base64!!").is_err());
        let wrong_len = data_encoding::BASE64.encode(&[0u8; 12]);
        assert!(verify_with_der(&der, "ls", &params, "m2", &wrong_len).is_err());
    }

    #[test]
    fn params_key_order_round_trips_through_value() {
        // Clients sign the JSON exactly as they serialized it; the bus parses
        // params into a Value and re-serializes during verification, so map
        // ordering must survive that round trip.
        let text = r#"{"zeta":1,"alpha":{"b":2,"a":3}}"#;
        let value: Value = serde_json::from_str(text).unwrap();
        assert_eq!(serde_json::to_string(&value).unwrap(), text);
    }
}
