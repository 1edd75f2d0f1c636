//! Cryptographic primitives for confidential document storage.
//!
//! Provides the building blocks of envelope encryption:
//! - AES-256-CBC with PKCS#7 padding for document payloads
//! - RSA-OAEP (SHA-256) for wrapping per-document keys
//! - Wipe-on-drop key types
//! - The self-describing [`EncryptedPackage`] and its wire formats
//!
//! # Architecture
//!
//! Every document gets its own random [`DataKey`]. The payload is encrypted
//! with that key, and the key itself is wrapped by a separate protecting
//! key: either an RSA key pair held in the key store, or a key-encryption
//! key that is only released to an attested environment. The package
//! records which of the two was used so that decryption never has to guess.
//!
//! This crate performs no I/O. Key-store access, attestation and key
//! release live in `confidocs-vault`.

pub mod cipher;
mod error;
pub mod key;
pub mod package;
pub mod wrap;

pub use cipher::{BLOCK_SIZE, IV_SIZE, decrypt_cbc, encrypt_cbc, random_iv};
pub use error::{CryptoError, CryptoResult};
pub use key::{DataKey, KEY_SIZE, KeyMaterial, random_key_material};
pub use package::{EncryptedPackage, WrapAlgorithm, WrappedKey};
pub use wrap::{RsaKeyPair, public_key_from_pem, unwrap_key, wrap_key};
