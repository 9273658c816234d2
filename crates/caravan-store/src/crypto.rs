//! # Cache Encryption
//!
//! XChaCha20-Poly1305 sealing for sensitive cache values, with Argon2id
//! passphrase-based key derivation.
//!
//! ## Sealed Blob Layout
//! ```text
//! ┌──────────────────────┬──────────────────────────────────────────┐
//! │  24-byte XNonce      │  ciphertext + 16-byte Poly1305 tag       │
//! └──────────────────────┴──────────────────────────────────────────┘
//! ```
//!
//! The cache key is bound in as associated data, so a sealed value copied
//! under a different key fails authentication the same way a corrupted one
//! does.

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{StoreError, StoreResult};

/// Nonce length for XChaCha20-Poly1305.
const NONCE_LEN: usize = 24;

/// Argon2id parameters for deriving the cache data key.
///
/// Tuned for a mobile-class device: 64 MiB memory cost, 3 iterations.
const KDF_M_COST_KIB: u32 = 64 * 1024;
const KDF_T_COST: u32 = 3;
const KDF_P_COST: u32 = 1;

// =============================================================================
// Cache Cipher
// =============================================================================

/// Symmetric cipher for sealed cache segments.
#[derive(Clone)]
pub struct CacheCipher {
    key: [u8; 32],
}

impl std::fmt::Debug for CacheCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("CacheCipher").finish_non_exhaustive()
    }
}

impl CacheCipher {
    /// Wraps an externally-provisioned 32-byte data key.
    pub fn from_key(key: [u8; 32]) -> Self {
        CacheCipher { key }
    }

    /// Derives the data key from a passphrase with Argon2id.
    ///
    /// The salt must be stable across restarts (the host persists it next
    /// to the database) and at least 16 bytes.
    pub fn from_passphrase(passphrase: &str, salt: &[u8]) -> StoreResult<Self> {
        let params = Params::new(KDF_M_COST_KIB, KDF_T_COST, KDF_P_COST, Some(32))
            .map_err(|e| StoreError::KeyDerivation(e.to_string()))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = [0u8; 32];
        argon2
            .hash_password_into(passphrase.as_bytes(), salt, &mut key)
            .map_err(|e| StoreError::KeyDerivation(e.to_string()))?;

        Ok(CacheCipher { key })
    }

    /// Seals a plaintext value. The cache key goes in as associated data.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> StoreResult<Vec<u8>> {
        let cipher = XChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|e| StoreError::SealFailed(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| StoreError::SealFailed(e.to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Opens a sealed blob. Any failure (truncated blob, bad tag, wrong
    /// associated data) is reported uniformly so callers treat it exactly
    /// like a checksum failure.
    pub fn open(&self, blob: &[u8], aad: &[u8], key_name: &str) -> StoreResult<Vec<u8>> {
        if blob.len() < NONCE_LEN {
            return Err(StoreError::DecryptFailed {
                key: key_name.to_string(),
            });
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let cipher = XChaCha20Poly1305::new_from_slice(&self.key).map_err(|_| {
            StoreError::DecryptFailed {
                key: key_name.to_string(),
            }
        })?;
        let nonce = XNonce::from_slice(nonce_bytes);

        cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| StoreError::DecryptFailed {
                key: key_name.to_string(),
            })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> CacheCipher {
        CacheCipher::from_key([7u8; 32])
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let c = cipher();
        let blob = c.seal(b"lesson body", b"lesson/1").unwrap();
        assert_ne!(&blob[NONCE_LEN..], b"lesson body");

        let plain = c.open(&blob, b"lesson/1", "lesson/1").unwrap();
        assert_eq!(plain, b"lesson body");
    }

    #[test]
    fn test_wrong_aad_fails_like_corruption() {
        let c = cipher();
        let blob = c.seal(b"lesson body", b"lesson/1").unwrap();
        let err = c.open(&blob, b"lesson/2", "lesson/2").unwrap_err();
        assert!(matches!(err, StoreError::DecryptFailed { .. }));
    }

    #[test]
    fn test_truncated_blob_fails() {
        let c = cipher();
        let err = c.open(b"short", b"k", "k").unwrap_err();
        assert!(matches!(err, StoreError::DecryptFailed { .. }));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let c = cipher();
        let mut blob = c.seal(b"lesson body", b"lesson/1").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        assert!(c.open(&blob, b"lesson/1", "lesson/1").is_err());
    }

    #[test]
    fn test_passphrase_derivation_is_stable() {
        let a = CacheCipher::from_passphrase("correct horse", b"0123456789abcdef").unwrap();
        let b = CacheCipher::from_passphrase("correct horse", b"0123456789abcdef").unwrap();
        let blob = a.seal(b"v", b"k").unwrap();
        assert_eq!(b.open(&blob, b"k", "k").unwrap(), b"v");
    }
}
