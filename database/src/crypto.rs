//! Credential encryption.
//!
//! AES-256-GCM with a process-wide master key. The key may be supplied
//! either as a urlsafe-base64 32-byte key or as an arbitrary passphrase,
//! which is derived through SHA-256. Tokens are `base64(nonce || ct)`.
//! The key lives in process memory only and is never logged.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE as BASE64_URL_SAFE};
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{DatabaseError, DatabaseResult};

const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct CredentialCipher {
    key: [u8; 32],
}

impl CredentialCipher {
    /// Build a cipher from the configured master key.
    pub fn from_master_key(raw_key: &str) -> DatabaseResult<Self> {
        let value = raw_key.trim();
        if value.is_empty() {
            return Err(DatabaseError::Configuration(
                "credential encryption key is empty".to_string(),
            ));
        }

        // A urlsafe-base64 32-byte value is used as-is; anything else is
        // treated as a passphrase and derived.
        if let Ok(decoded) = BASE64_URL_SAFE.decode(value.as_bytes()) {
            if decoded.len() == 32 {
                let mut key = [0u8; 32];
                key.copy_from_slice(&decoded);
                return Ok(Self { key });
            }
        }

        let digest = Sha256::digest(value.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Ok(Self { key })
    }

    pub fn encrypt(&self, plaintext: &str) -> DatabaseResult<String> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| DatabaseError::Crypto("encryption failed".to_string()))?;

        let mut token = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        token.extend_from_slice(&nonce_bytes);
        token.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(token))
    }

    /// Decrypt a stored token. Fails without leaking material when the
    /// master key has changed since the token was written.
    pub fn decrypt(&self, token: &str) -> DatabaseResult<String> {
        let raw = BASE64
            .decode(token.trim().as_bytes())
            .map_err(|_| DatabaseError::Crypto("malformed credential token".to_string()))?;
        if raw.len() <= NONCE_LEN {
            return Err(DatabaseError::Crypto(
                "malformed credential token".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| {
                DatabaseError::Crypto(
                    "credential decryption failed: the encryption key may have changed"
                        .to_string(),
                )
            })?;

        String::from_utf8(plaintext)
            .map_err(|_| DatabaseError::Crypto("credential is not valid utf-8".to_string()))
    }
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCipher")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let cipher = CredentialCipher::from_master_key("operator passphrase").unwrap();
        let token = cipher.encrypt("super-secret-api-key").unwrap();
        assert_ne!(token, "super-secret-api-key");
        assert_eq!(cipher.decrypt(&token).unwrap(), "super-secret-api-key");
    }

    #[test]
    fn test_tokens_are_nonce_unique() {
        let cipher = CredentialCipher::from_master_key("operator passphrase").unwrap();
        let first = cipher.encrypt("value").unwrap();
        let second = cipher.encrypt("value").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_rotated_key_fails_decryption() {
        let cipher = CredentialCipher::from_master_key("key one").unwrap();
        let token = cipher.encrypt("secret").unwrap();

        let rotated = CredentialCipher::from_master_key("key two").unwrap();
        let err = rotated.decrypt(&token).unwrap_err();
        assert!(matches!(err, DatabaseError::Crypto(_)));
        assert!(!err.to_string().contains("secret"));
    }

    #[test]
    fn test_base64_key_accepted_directly() {
        let raw = [7u8; 32];
        let encoded = BASE64_URL_SAFE.encode(raw);
        let direct = CredentialCipher::from_master_key(&encoded).unwrap();
        let derived = CredentialCipher::from_master_key("some passphrase").unwrap();

        let token = direct.encrypt("secret").unwrap();
        assert_eq!(direct.decrypt(&token).unwrap(), "secret");
        assert!(derived.decrypt(&token).is_err());
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(CredentialCipher::from_master_key("  ").is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let cipher = CredentialCipher::from_master_key("secret key").unwrap();
        assert!(!format!("{cipher:?}").contains("secret"));
    }
}
