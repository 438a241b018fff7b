use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::SurveyError;

const NONCE_LEN: usize = 12;

/// Authenticated encryption for sensitive answer payloads.
///
/// The AES-256-GCM key is derived as SHA-256 of a process-wide secret
/// injected at construction. Blobs are `nonce || ciphertext`.
#[derive(Clone)]
pub struct AnswerCodec {
    key: [u8; 32],
}

impl std::fmt::Debug for AnswerCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnswerCodec").finish_non_exhaustive()
    }
}

impl AnswerCodec {
    /// Derives the encryption key from `secret`.
    ///
    /// # Errors
    /// Returns [`SurveyError::Configuration`] for an empty secret.
    pub fn new(secret: &str) -> Result<Self, SurveyError> {
        if secret.trim().is_empty() {
            return Err(SurveyError::Configuration(
                "encryption secret must not be empty".to_string(),
            ));
        }
        let digest = Sha256::digest(secret.as_bytes());
        let mut key = [0_u8; 32];
        key.copy_from_slice(&digest);
        Ok(Self { key })
    }

    /// Encrypts a JSON value into an opaque blob with a fresh random
    /// nonce.
    ///
    /// # Errors
    /// Returns [`SurveyError::Configuration`] when the cipher cannot be
    /// constructed or encryption fails.
    pub fn encrypt(&self, value: &Value) -> Result<Vec<u8>, SurveyError> {
        let payload = serde_json::to_vec(value)
            .map_err(|err| SurveyError::Configuration(format!("payload serialization failed: {err}")))?;

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| SurveyError::Configuration("invalid encryption key".to_string()))?;
        let mut nonce_bytes = [0_u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, payload.as_ref())
            .map_err(|_| SurveyError::Configuration("encryption failed".to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypts a blob produced by [`Self::encrypt`].
    ///
    /// Never fails: on authentication failure the blob is treated as
    /// legacy plaintext bytes, attempting JSON decode, then lossy text,
    /// else `Value::Null`.
    #[must_use]
    pub fn decrypt(&self, blob: &[u8]) -> Value {
        if let Some(plaintext) = self.try_decrypt(blob) {
            return decode_payload(&plaintext);
        }
        decode_payload(blob)
    }

    fn try_decrypt(&self, blob: &[u8]) -> Option<Vec<u8>> {
        if blob.len() <= NONCE_LEN {
            return None;
        }
        let cipher = Aes256Gcm::new_from_slice(&self.key).ok()?;
        let nonce = Nonce::from_slice(&blob[..NONCE_LEN]);
        cipher.decrypt(nonce, &blob[NONCE_LEN..]).ok()
    }
}

fn decode_payload(bytes: &[u8]) -> Value {
    if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
        return value;
    }
    let text = String::from_utf8_lossy(bytes);
    if text.is_empty() {
        Value::Null
    } else {
        Value::String(text.into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn codec() -> AnswerCodec {
        match AnswerCodec::new("unit-test-secret") {
            Ok(value) => value,
            Err(err) => panic!("codec construction failed: {err}"),
        }
    }

    #[test]
    fn empty_secret_is_a_configuration_error() {
        assert!(matches!(
            AnswerCodec::new("   "),
            Err(SurveyError::Configuration(_))
        ));
    }

    #[test]
    fn round_trip_preserves_value_and_blob_differs_from_plaintext() {
        let codec = codec();
        let value = json!({"name": "Alice", "tags": ["a", "b"]});
        let blob = match codec.encrypt(&value) {
            Ok(blob) => blob,
            Err(err) => panic!("encrypt failed: {err}"),
        };
        assert_eq!(codec.decrypt(&blob), value);
        assert_ne!(blob, serde_json::to_vec(&value).unwrap_or_default());
    }

    #[test]
    fn nonces_are_fresh_per_encryption() {
        let codec = codec();
        let value = json!("same payload");
        let first = match codec.encrypt(&value) {
            Ok(blob) => blob,
            Err(err) => panic!("encrypt failed: {err}"),
        };
        let second = match codec.encrypt(&value) {
            Ok(blob) => blob,
            Err(err) => panic!("encrypt failed: {err}"),
        };
        assert_ne!(first, second);
    }

    #[test]
    fn wrong_key_degrades_to_legacy_decode_not_error() {
        let codec = codec();
        let other = match AnswerCodec::new("different-secret") {
            Ok(value) => value,
            Err(err) => panic!("codec construction failed: {err}"),
        };
        let blob = match codec.encrypt(&json!("secret text")) {
            Ok(blob) => blob,
            Err(err) => panic!("encrypt failed: {err}"),
        };
        // Authentication fails under the other key; ciphertext bytes are
        // not valid JSON so the fallback returns lossy text, never an
        // error.
        let fallback = other.decrypt(&blob);
        assert_ne!(fallback, json!("secret text"));
    }

    #[test]
    fn legacy_plaintext_json_blob_is_decoded() {
        let codec = codec();
        let legacy = br#"{"answer": 42}"#;
        assert_eq!(codec.decrypt(legacy), json!({"answer": 42}));
    }

    #[test]
    fn legacy_plaintext_text_blob_is_returned_as_string() {
        let codec = codec();
        // Stored before encryption was introduced, and not JSON either.
        assert_eq!(
            codec.decrypt(b"plain old answer"),
            json!("plain old answer")
        );
    }

    #[test]
    fn empty_blob_decodes_to_null() {
        assert_eq!(codec().decrypt(b""), Value::Null);
    }

    proptest! {
        #[test]
        fn round_trip_is_bit_for_bit_for_arbitrary_strings(payload in ".*") {
            let codec = codec();
            let value = json!(payload);
            let blob = match codec.encrypt(&value) {
                Ok(blob) => blob,
                Err(err) => panic!("encrypt failed: {err}"),
            };
            prop_assert_eq!(codec.decrypt(&blob), value);
        }
    }
}
