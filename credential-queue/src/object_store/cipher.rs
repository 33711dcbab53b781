//! Object encryption.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::{Error, Result};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const KEY_SALT: &[u8] = b"credential-queue/object-store";

/// Encrypts object payloads under a key selected by `ref_id`.
pub trait ObjectCipher: Send + Sync {
    fn encrypt(&self, data: &[u8], ref_id: &str) -> Result<Vec<u8>>;
    fn decrypt(&self, data: &[u8], ref_id: &str) -> Result<Vec<u8>>;
}

/// AES-256-GCM with a per-`ref_id` key derived from a master key via HKDF-SHA256.
///
/// Output layout: `nonce (12 bytes) || ciphertext || tag`.
pub struct AesGcmCipher {
    master_key: [u8; KEY_LEN],
}

impl AesGcmCipher {
    pub fn new(master_key: [u8; KEY_LEN]) -> Self {
        Self { master_key }
    }

    /// Build from a hex-encoded 32-byte master key.
    pub fn from_hex(master_key: &str) -> Result<Self> {
        let bytes = hex::decode(master_key.trim())
            .map_err(|e| Error::config(format!("object store master key is not hex: {e}")))?;
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            Error::config(format!(
                "object store master key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self::new(key))
    }

    fn cipher_for(&self, ref_id: &str) -> Result<Aes256Gcm> {
        let hk = Hkdf::<Sha256>::new(Some(KEY_SALT), &self.master_key);
        let mut key = [0u8; KEY_LEN];
        hk.expand(ref_id.as_bytes(), &mut key)
            .map_err(|_| Error::Other("HKDF expand failed".to_string()))?;
        Aes256Gcm::new_from_slice(&key).map_err(|_| Error::Other("Invalid key length".to_string()))
    }
}

impl std::fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmCipher").finish_non_exhaustive()
    }
}

impl ObjectCipher for AesGcmCipher {
    fn encrypt(&self, data: &[u8], ref_id: &str) -> Result<Vec<u8>> {
        let cipher = self.cipher_for(ref_id)?;
        let nonce: [u8; NONCE_LEN] = rand::random();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), data)
            .map_err(|_| Error::Other("AES-GCM encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8], ref_id: &str) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(Error::storage("encrypted object is truncated"));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher_for(ref_id)?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::storage("encrypted object failed authentication"))
    }
}
