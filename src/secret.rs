//! Encrypted field orchestration
//!
//! Secrets (the subscription URL) never reach the store in plaintext. The
//! actual key material and algorithm live behind the [`SecretStore`] seam;
//! this module only sequences encrypt/decrypt calls and defines the
//! null-propagation semantics the repository layer relies on: an absent or
//! undecryptable ciphertext degrades to "no stored value" instead of an
//! error, surfaced later as a validation failure on the next sync attempt.

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use tracing::warn;

use crate::codec::base64::{decode_base64, encode_base64};
use crate::error::SecretError;

/// Encrypt/decrypt primitives supplied by the platform
pub trait SecretStore: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, SecretError>;
    fn decrypt(&self, ciphertext: &str) -> Result<String, SecretError>;
}

// ============================================================================
// Encrypted Field Service
// ============================================================================

/// Thin orchestration layer over a [`SecretStore`]
#[derive(Clone)]
pub struct EncryptedFieldService {
    store: Arc<dyn SecretStore>,
}

impl EncryptedFieldService {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    /// Encrypts a field before it reaches the store. Failures propagate:
    /// a profile must never be persisted with a plaintext URL.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, SecretError> {
        self.store.encrypt(plaintext)
    }

    /// Decrypts a stored field. `None` in, `None` out; corrupt or
    /// undecryptable ciphertext also yields `None` rather than an error.
    pub fn decrypt(&self, ciphertext: Option<&str>) -> Option<String> {
        let ciphertext = ciphertext?;
        match self.store.decrypt(ciphertext) {
            Ok(plaintext) => Some(plaintext),
            Err(e) => {
                warn!("Failed to decrypt stored field, treating as absent: {}", e);
                None
            }
        }
    }
}

// ============================================================================
// AEAD Secret Store
// ============================================================================

const NONCE_LEN: usize = 12;

/// Default [`SecretStore`] backed by AES-256-GCM with caller-supplied key
/// material. A fresh random nonce is prepended to each ciphertext and the
/// whole blob is Base64 encoded for storage in a text column.
pub struct AeadSecretStore {
    cipher: Aes256Gcm,
}

impl AeadSecretStore {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.into()),
        }
    }
}

impl SecretStore for AeadSecretStore {
    fn encrypt(&self, plaintext: &str) -> Result<String, SecretError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| SecretError::Unavailable(e.to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(encode_base64(&blob))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, SecretError> {
        let blob = decode_base64(ciphertext).ok_or(SecretError::Corrupt)?;
        if blob.len() <= NONCE_LEN {
            return Err(SecretError::Corrupt);
        }

        let (nonce_bytes, payload) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, payload)
            .map_err(|_| SecretError::Corrupt)?;
        String::from_utf8(plaintext).map_err(|_| SecretError::Corrupt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> EncryptedFieldService {
        EncryptedFieldService::new(Arc::new(AeadSecretStore::new(&[7u8; 32])))
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let service = service();
        let ciphertext = service.encrypt("https://example.com/sub").unwrap();
        assert_ne!(ciphertext, "https://example.com/sub");
        assert_eq!(
            service.decrypt(Some(&ciphertext)).as_deref(),
            Some("https://example.com/sub")
        );
    }

    #[test]
    fn test_decrypt_none_is_none() {
        assert_eq!(service().decrypt(None), None);
    }

    #[test]
    fn test_decrypt_corrupt_is_none() {
        let service = service();
        assert_eq!(service.decrypt(Some("not-a-ciphertext")), None);
        assert_eq!(service.decrypt(Some("")), None);

        // Valid Base64 but truncated below nonce length
        assert_eq!(service.decrypt(Some(&encode_base64(b"short"))), None);
    }

    #[test]
    fn test_decrypt_wrong_key_is_none() {
        let a = EncryptedFieldService::new(Arc::new(AeadSecretStore::new(&[1u8; 32])));
        let b = EncryptedFieldService::new(Arc::new(AeadSecretStore::new(&[2u8; 32])));
        let ciphertext = a.encrypt("secret").unwrap();
        assert_eq!(b.decrypt(Some(&ciphertext)), None);
    }

    #[test]
    fn test_nonce_uniqueness() {
        let service = service();
        let first = service.encrypt("same input").unwrap();
        let second = service.encrypt("same input").unwrap();
        assert_ne!(first, second);
    }
}
