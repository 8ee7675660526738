//! At-rest encryption for sensitive cached payloads
//!
//! Authenticated encryption (XChaCha20-Poly1305) over the serialized JSON
//! value. Each call uses a fresh random 24-byte nonce, prepended to the
//! ciphertext so the blob is self-contained. The 256-bit key lives in the
//! `settings` partition and is generated once; there is no rotation and no
//! forward secrecy, the key is long-lived by design.

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde_json::Value;

use crate::error::{SyncError, SyncResult};
use crate::store::LocalStore;

/// Settings key holding the raw 32-byte key material.
const KEY_SETTING: &str = "encryption_key";
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;

pub struct PayloadCipher {
    cipher: XChaCha20Poly1305,
}

impl PayloadCipher {
    /// Load the long-lived key from the settings partition, generating and
    /// persisting one if none exists. The same stored material always yields
    /// the same cipher across restarts.
    pub fn from_store(store: &LocalStore) -> SyncResult<Self> {
        let material = match store.get_setting(KEY_SETTING)? {
            Some(bytes) if bytes.len() == KEY_LEN => bytes,
            Some(bytes) => {
                return Err(SyncError::KeyMaterial(format!(
                    "stored key has invalid length {}",
                    bytes.len()
                )))
            }
            None => {
                let mut key = [0u8; KEY_LEN];
                rand::rngs::OsRng.fill_bytes(&mut key);
                store.put_setting(KEY_SETTING, &key)?;
                tracing::info!("generated new at-rest encryption key");
                key.to_vec()
            }
        };

        Ok(Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(&material)),
        })
    }

    /// Build a cipher from raw key material (tests, key import).
    pub fn from_key(material: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(material)),
        }
    }

    /// Serialize and encrypt a value, returning `nonce || ciphertext`.
    pub fn encrypt(&self, value: &Value) -> SyncResult<Vec<u8>> {
        let plaintext = serde_json::to_vec(value)?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| SyncError::Encryption("AEAD encryption failed".to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt and deserialize a blob produced by [`Self::encrypt`].
    ///
    /// Any failure (truncated blob, tampered ciphertext, wrong key, invalid
    /// JSON) is reported as [`SyncError::Decryption`]; callers treat it as
    /// "data unavailable".
    pub fn decrypt(&self, blob: &[u8]) -> SyncResult<Value> {
        if blob.len() <= NONCE_LEN {
            return Err(SyncError::Decryption("blob too short".to_string()));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);

        let plaintext = self
            .cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| SyncError::Decryption("authentication failed".to_string()))?;

        serde_json::from_slice(&plaintext)
            .map_err(|e| SyncError::Decryption(format!("payload deserialization failed: {}", e)))
    }
}
