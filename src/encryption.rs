//! Opaque encryption collaborator contract.
//!
//! Payment-details persistence treats ciphertext as opaque strings that
//! must round-trip verbatim. Production deployments plug in the external
//! KMS-backed service; [`StaticKeyCipher`] is the dev-grade stand-in used
//! for local runs and tests.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::errors::ServiceError;

pub trait EncryptionService: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, ServiceError>;
    fn decrypt(&self, opaque: &str) -> Result<String, ServiceError>;
}

/// Keyed byte transform + base64. Not cryptographically strong; it exists
/// so the persistence path and its round-trip property are exercised
/// end-to-end without the external service.
pub struct StaticKeyCipher {
    key: Vec<u8>,
}

impl StaticKeyCipher {
    pub fn new(key: impl Into<Vec<u8>>) -> Result<Self, ServiceError> {
        let key = key.into();
        if key.is_empty() {
            return Err(ServiceError::ValidationError(
                "cipher key must not be empty".to_string(),
            ));
        }
        Ok(Self { key })
    }

    fn transform(&self, data: &[u8]) -> Vec<u8> {
        data.iter()
            .zip(self.key.iter().cycle())
            .map(|(byte, key_byte)| byte ^ key_byte)
            .collect()
    }
}

impl EncryptionService for StaticKeyCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String, ServiceError> {
        Ok(BASE64.encode(self.transform(plaintext.as_bytes())))
    }

    fn decrypt(&self, opaque: &str) -> Result<String, ServiceError> {
        let bytes = BASE64
            .decode(opaque)
            .map_err(|e| ServiceError::ValidationError(format!("malformed ciphertext: {}", e)))?;
        String::from_utf8(self.transform(&bytes))
            .map_err(|e| ServiceError::ValidationError(format!("malformed plaintext: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_text() {
        let cipher = StaticKeyCipher::new(b"0123456789abcdef".to_vec()).unwrap();
        for plaintext in ["", "Jace Beleren", "4111 1111 1111 1111", "日本語"] {
            let opaque = cipher.encrypt(plaintext).unwrap();
            assert_eq!(cipher.decrypt(&opaque).unwrap(), plaintext);
        }
    }

    #[test]
    fn ciphertext_differs_from_plaintext() {
        let cipher = StaticKeyCipher::new(b"secret-key".to_vec()).unwrap();
        let opaque = cipher.encrypt("cardholder").unwrap();
        assert_ne!(opaque, "cardholder");
    }

    #[test]
    fn empty_key_is_rejected() {
        assert!(StaticKeyCipher::new(Vec::new()).is_err());
    }

    #[test]
    fn garbage_ciphertext_is_a_validation_error() {
        let cipher = StaticKeyCipher::new(b"secret-key".to_vec()).unwrap();
        assert!(matches!(
            cipher.decrypt("not base64 !!"),
            Err(ServiceError::ValidationError(_))
        ));
    }
}
