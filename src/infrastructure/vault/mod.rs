//! Passphrase-derived AEAD vault.
//!
//! AES-256-GCM over an argon2id-derived key. The salt is the first 16
//! bytes of SHA-256 of the passphrase, so the same passphrase yields the
//! same key across restarts without persisting salt material.

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use sha2::{Digest, Sha256};

use crate::domain::errors::{GatewayError, GatewayResult};

const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;
const ARGON_TIME_COST: u32 = 1;
const ARGON_MEMORY_KIB: u32 = 64 * 1024;
const ARGON_PARALLELISM: u32 = 4;

/// Symmetric vault for sealing secret payloads.
#[derive(Clone)]
pub struct Vault {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault").finish_non_exhaustive()
    }
}

impl Vault {
    /// Derive the AEAD key from a passphrase.
    pub fn new(passphrase: &str) -> GatewayResult<Self> {
        let salt: [u8; SALT_LEN] = Sha256::digest(passphrase.as_bytes())[..SALT_LEN]
            .try_into()
            .map_err(|_| GatewayError::BadKey)?;

        let params = Params::new(ARGON_MEMORY_KIB, ARGON_TIME_COST, ARGON_PARALLELISM, Some(KEY_LEN))
            .map_err(|_| GatewayError::BadKey)?;
        let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key_bytes = [0u8; KEY_LEN];
        argon
            .hash_password_into(passphrase.as_bytes(), &salt, &mut key_bytes)
            .map_err(|_| GatewayError::BadKey)?;

        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Seal a plaintext. Returns `(ciphertext, nonce)`; the ciphertext
    /// includes the 16-byte auth tag.
    pub fn encrypt(&self, plaintext: &[u8]) -> GatewayResult<(Vec<u8>, Vec<u8>)> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| GatewayError::BadKey)?;
        Ok((ciphertext, nonce.to_vec()))
    }

    /// Open a sealed payload. Fails with `BadKey` when the auth tag does
    /// not verify and `BadCiphertext` when the nonce is malformed.
    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8]) -> GatewayResult<Vec<u8>> {
        if nonce.len() != 12 {
            return Err(GatewayError::BadCiphertext);
        }
        let nonce = Nonce::from_slice(nonce);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| GatewayError::BadKey)
    }

    /// Open a sealed payload into a UTF-8 string.
    pub fn decrypt_string(&self, ciphertext: &[u8], nonce: &[u8]) -> GatewayResult<String> {
        let bytes = self.decrypt(ciphertext, nonce)?;
        String::from_utf8(bytes).map_err(|_| GatewayError::BadCiphertext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let vault = Vault::new("correct horse battery staple").unwrap();
        let (ct, nonce) = vault.encrypt(b"hunter2").unwrap();
        assert_ne!(ct, b"hunter2");
        assert_eq!(nonce.len(), 12);
        assert_eq!(vault.decrypt(&ct, &nonce).unwrap(), b"hunter2");
    }

    #[test]
    fn same_passphrase_yields_same_key() {
        let v1 = Vault::new("pass").unwrap();
        let v2 = Vault::new("pass").unwrap();
        let (ct, nonce) = v1.encrypt(b"payload").unwrap();
        assert_eq!(v2.decrypt(&ct, &nonce).unwrap(), b"payload");
    }

    #[test]
    fn wrong_passphrase_fails_tag_check() {
        let v1 = Vault::new("pass").unwrap();
        let v2 = Vault::new("other").unwrap();
        let (ct, nonce) = v1.encrypt(b"payload").unwrap();
        assert!(matches!(
            v2.decrypt(&ct, &nonce).unwrap_err(),
            GatewayError::BadKey
        ));
    }

    #[test]
    fn short_nonce_is_rejected() {
        let vault = Vault::new("pass").unwrap();
        let (ct, _) = vault.encrypt(b"payload").unwrap();
        assert!(matches!(
            vault.decrypt(&ct, &[0u8; 4]).unwrap_err(),
            GatewayError::BadCiphertext
        ));
    }

    #[test]
    fn nonces_are_unique_per_encryption() {
        let vault = Vault::new("pass").unwrap();
        let (_, n1) = vault.encrypt(b"x").unwrap();
        let (_, n2) = vault.encrypt(b"x").unwrap();
        assert_ne!(n1, n2);
    }
}
