// AES-256-GCM encryption for sensitive values at rest.
// One per-deployment master key; payload = version byte + nonce + ciphertext.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;
const PAYLOAD_VERSION: u8 = 1;

/// Deployment master key. Thread-safe and cheap to clone.
#[derive(Clone)]
pub struct MasterKey {
    cipher: Aes256Gcm,
}

impl MasterKey {
    /// Create from a base64-encoded 32-byte key.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let key_bytes = BASE64
            .decode(encoded.trim())
            .context("Failed to decode master key from base64")?;

        if key_bytes.len() != KEY_SIZE {
            anyhow::bail!(
                "Master key must be {} bytes, got {}",
                KEY_SIZE,
                key_bytes.len()
            );
        }

        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| anyhow::anyhow!("Failed to create cipher: {}", e))?;
        Ok(Self { cipher })
    }

    /// Encrypt plaintext. Output: `version || nonce || ciphertext+tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| anyhow::anyhow!("Encryption failed: {}", e))?;

        let mut payload = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len());
        payload.push(PAYLOAD_VERSION);
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&ciphertext);
        Ok(payload)
    }

    /// Decrypt a payload produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() < 1 + NONCE_SIZE {
            anyhow::bail!("Encrypted payload too short");
        }
        if payload[0] != PAYLOAD_VERSION {
            anyhow::bail!(
                "Unsupported payload version: {} (expected {})",
                payload[0],
                PAYLOAD_VERSION
            );
        }

        let (nonce_bytes, ciphertext) = payload[1..].split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| anyhow::anyhow!("Decryption failed (data may be corrupted): {}", e))
    }

    pub fn encrypt_string(&self, plaintext: &str) -> Result<Vec<u8>> {
        self.encrypt(plaintext.as_bytes())
    }

    pub fn decrypt_to_string(&self, payload: &[u8]) -> Result<String> {
        let plaintext = self.decrypt(payload)?;
        String::from_utf8(plaintext).context("Decrypted data is not valid UTF-8")
    }
}

/// Generate a new random base64-encoded master key.
pub fn generate_master_key() -> String {
    let mut key = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    BASE64.encode(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = MasterKey::from_base64(&generate_master_key()).unwrap();

        let plaintext = "db-password-12345";
        let encrypted = key.encrypt_string(plaintext).unwrap();
        let decrypted = key.decrypt_to_string(&encrypted).unwrap();

        assert_eq!(plaintext, decrypted);
    }

    #[test]
    fn test_different_ciphertext_per_call() {
        let key = MasterKey::from_base64(&generate_master_key()).unwrap();

        let encrypted1 = key.encrypt_string("same").unwrap();
        let encrypted2 = key.encrypt_string("same").unwrap();

        // Random nonce per value
        assert_ne!(encrypted1, encrypted2);
        assert_eq!(key.decrypt_to_string(&encrypted1).unwrap(), "same");
        assert_eq!(key.decrypt_to_string(&encrypted2).unwrap(), "same");
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = MasterKey::from_base64(&generate_master_key()).unwrap();
        let key2 = MasterKey::from_base64(&generate_master_key()).unwrap();

        let encrypted = key1.encrypt_string("secret").unwrap();
        assert!(key2.decrypt(&encrypted).is_err());
    }

    #[test]
    fn test_invalid_key_material() {
        assert!(MasterKey::from_base64("not-base64!!!").is_err());
        assert!(MasterKey::from_base64(&BASE64.encode([0u8; 16])).is_err());
    }

    #[test]
    fn test_corrupted_payload() {
        let key = MasterKey::from_base64(&generate_master_key()).unwrap();
        let mut encrypted = key.encrypt_string("secret").unwrap();

        let last = encrypted.len() - 1;
        encrypted[last] ^= 0xff;
        assert!(key.decrypt(&encrypted).is_err());

        assert!(key.decrypt(&[1, 2, 3]).is_err());
    }
}
