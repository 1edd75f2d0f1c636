//! Symmetric key material.
//!
//! A [`DataKey`] is the per-document AES-256 key. It lives only for the
//! duration of one encrypt or decrypt call and is wiped when dropped.

use crate::error::{CryptoError, CryptoResult};
use rand::RngCore;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Size of a data key in bytes (AES-256).
pub const KEY_SIZE: usize = 32;

/// Variable-length secret bytes that are wiped on drop.
///
/// Used for released key-encryption keys and search master keys.
pub type KeyMaterial = Zeroizing<Vec<u8>>;

/// A per-document symmetric key.
///
/// Deliberately not `Clone`: every copy is another place the key has to be
/// wiped from.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DataKey {
    bytes: [u8; KEY_SIZE],
}

impl DataKey {
    /// Generates a fresh key from the OS random number generator.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Builds a key from unwrapped bytes, checking the length.
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut key = Self {
            bytes: [0u8; KEY_SIZE],
        };
        key.bytes.copy_from_slice(bytes);
        Ok(key)
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataKey([REDACTED])")
    }
}

/// Generates `len` random bytes as wipe-on-drop key material.
pub fn random_key_material(len: usize) -> KeyMaterial {
    let mut bytes = Zeroizing::new(vec![0u8; len]);
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}
