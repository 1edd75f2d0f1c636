//! AES-256-CBC payload encryption with PKCS#7 padding.

use crate::error::{CryptoError, CryptoResult};
use crate::key::DataKey;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// CBC initialisation vector size in bytes.
pub const IV_SIZE: usize = BLOCK_SIZE;

/// Generates a random IV.
pub fn random_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    iv
}

/// Encrypts `plaintext` under `key` and `iv`.
///
/// The output length is always a positive multiple of [`BLOCK_SIZE`].
pub fn encrypt_cbc(key: &DataKey, iv: &[u8; IV_SIZE], plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let cipher = Aes256CbcEnc::new_from_slices(key.as_bytes(), iv)
        .map_err(|e| CryptoError::Encryption(format!("cipher init failed: {e}")))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Decrypts `ciphertext` and strips the padding.
///
/// Fails if the ciphertext is empty, not block aligned, or the padding is
/// invalid (which is what a wrong key or a tampered tail block produces).
pub fn decrypt_cbc(key: &DataKey, iv: &[u8; IV_SIZE], ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::Decryption(format!(
            "ciphertext length {} is not a positive multiple of {BLOCK_SIZE}",
            ciphertext.len()
        )));
    }

    let cipher = Aes256CbcDec::new_from_slices(key.as_bytes(), iv)
        .map_err(|e| CryptoError::Decryption(format!("cipher init failed: {e}")))?;

    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::Decryption("padding check failed (wrong key or tampered data)".to_string()))
}
