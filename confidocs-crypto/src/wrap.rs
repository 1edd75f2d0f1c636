//! RSA-OAEP key wrapping.
//!
//! Data keys are wrapped with RSA-OAEP using SHA-256 for both the hash and
//! MGF1, with no label. Key pairs are persisted as PKCS#8 PEM.

use crate::error::{CryptoError, CryptoResult};
use crate::key::KeyMaterial;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::fmt;
use zeroize::Zeroizing;

/// Modulus size for generated key pairs.
pub const RSA_KEY_BITS: usize = 2048;

/// An RSA key pair used for direct key wrapping.
///
/// `RsaPrivateKey` zeroizes its components on drop.
pub struct RsaKeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl RsaKeyPair {
    /// Generates a new 2048-bit key pair.
    pub fn generate() -> CryptoResult<Self> {
        let private = RsaPrivateKey::new(&mut rand::rngs::OsRng, RSA_KEY_BITS)
            .map_err(|e| CryptoError::KeyEncoding(format!("RSA key generation failed: {e}")))?;
        Ok(Self::from_private(private))
    }

    pub fn from_private(private: RsaPrivateKey) -> Self {
        let public = private.to_public_key();
        Self { private, public }
    }

    /// Parses a PKCS#8 PEM private key.
    pub fn from_pkcs8_pem(pem: &str) -> CryptoResult<Self> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| CryptoError::KeyEncoding(format!("invalid PKCS#8 PEM: {e}")))?;
        Ok(Self::from_private(private))
    }

    /// Parses a PKCS#8 DER private key (the form a released key arrives in).
    pub fn from_pkcs8_der(der: &[u8]) -> CryptoResult<Self> {
        let private = RsaPrivateKey::from_pkcs8_der(der)
            .map_err(|e| CryptoError::KeyEncoding(format!("invalid PKCS#8 DER: {e}")))?;
        Ok(Self::from_private(private))
    }

    /// Serializes the private key as PKCS#8 PEM.
    pub fn to_pkcs8_pem(&self) -> CryptoResult<Zeroizing<String>> {
        self.private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeyEncoding(format!("PEM encoding failed: {e}")))
    }

    /// Serializes the private key as PKCS#8 DER.
    pub fn to_pkcs8_der(&self) -> CryptoResult<KeyMaterial> {
        let doc = self
            .private
            .to_pkcs8_der()
            .map_err(|e| CryptoError::KeyEncoding(format!("DER encoding failed: {e}")))?;
        Ok(Zeroizing::new(doc.as_bytes().to_vec()))
    }

    /// Serializes the public key as SubjectPublicKeyInfo PEM.
    pub fn public_key_pem(&self) -> CryptoResult<String> {
        self.public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeyEncoding(format!("PEM encoding failed: {e}")))
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private
    }
}

impl fmt::Debug for RsaKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RsaKeyPair([REDACTED])")
    }
}

/// Parses a SubjectPublicKeyInfo PEM public key.
pub fn public_key_from_pem(pem: &str) -> CryptoResult<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .map_err(|e| CryptoError::KeyEncoding(format!("invalid public key PEM: {e}")))
}

/// Wraps key bytes for the holder of `public`'s private key.
pub fn wrap_key(public: &RsaPublicKey, key_bytes: &[u8]) -> CryptoResult<Vec<u8>> {
    public
        .encrypt(&mut rand::rngs::OsRng, Oaep::new::<Sha256>(), key_bytes)
        .map_err(|e| CryptoError::Encryption(format!("RSA-OAEP wrap failed: {e}")))
}

/// Unwraps key bytes previously produced by [`wrap_key`].
pub fn unwrap_key(private: &RsaPrivateKey, wrapped: &[u8]) -> CryptoResult<KeyMaterial> {
    private
        .decrypt(Oaep::new::<Sha256>(), wrapped)
        .map(Zeroizing::new)
        .map_err(|_| {
            CryptoError::Decryption("RSA-OAEP unwrap failed (wrong key or tampered data)".to_string())
        })
}
