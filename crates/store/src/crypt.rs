use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};

use crate::StoreError;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;

/// AES-256-GCM cipher for values stored at rest.
///
/// Ciphertexts are encoded as base64 of `nonce || ciphertext` so they can be
/// kept in JSON documents.
#[derive(Clone)]
pub struct Cipher {
    key: [u8; KEY_SIZE],
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cipher(..)")
    }
}

impl Cipher {
    /// Derives a key from a passphrase (SHA-256 of the passphrase).
    pub fn from_passphrase(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&digest);
        Self { key }
    }

    /// Generates a random, process-local key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    /// Encrypts `plaintext` and returns the encoded ciphertext.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, StoreError> {
        let cipher = Aes256Gcm::new((&self.key).into());

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from(nonce_bytes);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| StoreError::Encrypt(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    /// Decrypts a value produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>, StoreError> {
        let raw = STANDARD
            .decode(encoded)
            .map_err(|e| StoreError::Decrypt(e.to_string()))?;
        if raw.len() < NONCE_SIZE {
            return Err(StoreError::Decrypt("ciphertext too short".into()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_SIZE);

        let cipher = Aes256Gcm::new((&self.key).into());
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| StoreError::Decrypt(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let cipher = Cipher::generate();
        let sealed = cipher.encrypt(b"client-secret").unwrap();
        assert_ne!(sealed.as_bytes(), b"client-secret");
        assert_eq!(cipher.decrypt(&sealed).unwrap(), b"client-secret");
    }

    #[test]
    fn nonces_differ_between_encryptions() {
        let cipher = Cipher::from_passphrase("pass");
        let a = cipher.encrypt(b"same").unwrap();
        let b = cipher.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn passphrase_keys_are_deterministic() {
        let sealed = Cipher::from_passphrase("pass").encrypt(b"value").unwrap();
        let plain = Cipher::from_passphrase("pass").decrypt(&sealed).unwrap();
        assert_eq!(plain, b"value");
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = Cipher::from_passphrase("one").encrypt(b"value").unwrap();
        let result = Cipher::from_passphrase("two").decrypt(&sealed);
        assert!(matches!(result, Err(StoreError::Decrypt(_))));
    }

    #[test]
    fn garbage_input_fails() {
        let cipher = Cipher::generate();
        assert!(cipher.decrypt("not base64!").is_err());
        assert!(cipher.decrypt("AAAA").is_err());
    }
}
