//! Envelope encryption service.
//!
//! Every document gets a fresh [`DataKey`]. The payload is encrypted with
//! AES-256-CBC, and the key is wrapped by the deployment's active
//! [`KeyWrapper`]. Decryption reads the package's algorithm and dispatches
//! to the matching wrapper, so packages written before a mode switch stay
//! readable. There is never a fallback from one mode to the other.

use crate::config::WrapMode;
use crate::error::{DocumentError, VaultError, VaultResult};
use crate::key_store::{KeyReference, parse_key_id};
use crate::wrapper::{KeyWrapper, protection_matches};
use confidocs_crypto::{
    DataKey, EncryptedPackage, IV_SIZE, KeyMaterial, WrapAlgorithm, WrappedKey, decrypt_cbc,
    encrypt_cbc, random_iv,
};
use std::sync::Arc;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Generates, wraps and unwraps per-document keys.
pub struct EnvelopeService {
    mode: WrapMode,
    direct: Arc<dyn KeyWrapper>,
    secure_release: Option<Arc<dyn KeyWrapper>>,
}

impl EnvelopeService {
    /// `direct` is always present so RSA-wrapped packages stay readable.
    /// `secure_release` is present only on hosts that can attest, and is
    /// required when `mode` is secure key release.
    pub fn new(
        mode: WrapMode,
        direct: Arc<dyn KeyWrapper>,
        secure_release: Option<Arc<dyn KeyWrapper>>,
    ) -> VaultResult<Self> {
        if mode == WrapMode::SecureKeyRelease && secure_release.is_none() {
            return Err(VaultError::Config(
                "secure-key-release mode without a key release client".to_string(),
            ));
        }
        Ok(Self {
            mode,
            direct,
            secure_release,
        })
    }

    pub fn mode(&self) -> WrapMode {
        self.mode
    }

    fn active(&self) -> VaultResult<&Arc<dyn KeyWrapper>> {
        match self.mode {
            WrapMode::Direct => Ok(&self.direct),
            WrapMode::SecureKeyRelease => self.secure_release.as_ref().ok_or_else(|| {
                VaultError::Encryption("secure key release unavailable on this host".to_string())
            }),
        }
    }

    fn for_algorithm(&self, algorithm: WrapAlgorithm) -> VaultResult<&Arc<dyn KeyWrapper>> {
        match algorithm {
            WrapAlgorithm::RsaOaep => Ok(&self.direct),
            WrapAlgorithm::Skr => self.secure_release.as_ref().ok_or_else(|| {
                VaultError::Decryption("secure key release unavailable on this host".to_string())
            }),
        }
    }

    /// Wraps `key` under the active mode, checking that `key_ref` fits it.
    async fn wrap_for_write(&self, key: &[u8], key_ref: &KeyReference) -> VaultResult<(WrapAlgorithm, Vec<u8>)> {
        let wrapper = self.active()?;
        let algorithm = wrapper.algorithm();
        if !protection_matches(algorithm, key_ref) {
            return Err(VaultError::Encryption(format!(
                "deployment wraps with {algorithm}, but {} is a {}",
                key_ref.name, key_ref.protection
            )));
        }
        let wrapped = wrapper.wrap(key, key_ref).await.map_err(as_encryption)?;
        Ok((algorithm, wrapped))
    }

    /// Unwraps `wrapped` with the wrapper `algorithm` names.
    async fn unwrap_for_read(
        &self,
        algorithm: WrapAlgorithm,
        wrapped: &[u8],
        key_id: Option<&str>,
        key_ref: &KeyReference,
    ) -> VaultResult<KeyMaterial> {
        if !protection_matches(algorithm, key_ref) {
            return Err(VaultError::Decryption(format!(
                "package was wrapped with {algorithm}, but {} is a {}",
                key_ref.name, key_ref.protection
            )));
        }
        let key_ref = resolve_version(key_id, key_ref)?;
        let wrapper = self.for_algorithm(algorithm)?;
        wrapper.unwrap(wrapped, &key_ref).await.map_err(as_decryption)
    }

    /// Encrypts `plaintext` under a fresh data key wrapped for `key_ref`.
    pub async fn encrypt(&self, plaintext: &[u8], key_ref: &KeyReference) -> VaultResult<EncryptedPackage> {
        if plaintext.is_empty() {
            return Err(VaultError::Encryption("plaintext is empty".to_string()));
        }

        let key = DataKey::generate();
        let iv = random_iv();
        let ciphertext =
            encrypt_cbc(&key, &iv, plaintext).map_err(|e| VaultError::Encryption(e.to_string()))?;
        let (algorithm, wrapped_key) = self.wrap_for_write(key.as_bytes(), key_ref).await?;

        debug!("Encrypted {} bytes with {algorithm}", plaintext.len());
        Ok(EncryptedPackage {
            algorithm,
            wrapped_key,
            iv,
            ciphertext,
            key_id: Some(key_ref.key_id()),
        })
    }

    /// Decrypts a package. The package's algorithm decides how the key is
    /// unwrapped; `key_ref` must be of the matching kind.
    pub async fn decrypt(&self, package: &EncryptedPackage, key_ref: &KeyReference) -> VaultResult<Vec<u8>> {
        let key_bytes = self
            .unwrap_for_read(
                package.algorithm,
                &package.wrapped_key,
                package.key_id.as_deref(),
                key_ref,
            )
            .await?;
        let key = DataKey::from_slice(&key_bytes).map_err(|e| VaultError::Decryption(e.to_string()))?;
        decrypt_cbc(&key, &package.iv, &package.ciphertext)
            .map_err(|e| VaultError::Decryption(e.to_string()))
    }

    /// Opens `package` with `from` and seals the plaintext again under
    /// `to` with the active mode. A rotated or replaced key only protects
    /// packages that went through this.
    pub async fn reencrypt(
        &self,
        package: &EncryptedPackage,
        from: &KeyReference,
        to: &KeyReference,
    ) -> VaultResult<EncryptedPackage> {
        let plaintext = Zeroizing::new(self.decrypt(package, from).await?);
        let resealed = self.encrypt(&plaintext[..], to).await?;
        info!(
            "Re-encrypted package from {} ({}) to {} ({})",
            from.name, package.algorithm, to.name, resealed.algorithm
        );
        Ok(resealed)
    }

    /// Generates a data key for encrypting many blobs, returning the key
    /// token to store and the key itself. The caller owns the key and
    /// should drop it as soon as the blobs are written.
    pub async fn generate_and_wrap_blob_key(
        &self,
        key_ref: &KeyReference,
    ) -> VaultResult<(WrappedKey, DataKey)> {
        let key = DataKey::generate();
        let token = self.wrap_existing_key(key.as_bytes(), key_ref).await?;
        Ok((token, key))
    }

    /// Wraps caller-supplied key bytes under the active mode.
    pub async fn wrap_existing_key(&self, key: &[u8], key_ref: &KeyReference) -> VaultResult<WrappedKey> {
        if key.is_empty() {
            return Err(VaultError::Encryption("key is empty".to_string()));
        }
        let (algorithm, wrapped_key) = self.wrap_for_write(key, key_ref).await?;
        Ok(WrappedKey {
            algorithm,
            wrapped_key,
            key_id: Some(key_ref.key_id()),
        })
    }

    /// Unwraps a key token to raw bytes of any length.
    pub async fn unwrap_key_material(
        &self,
        token: &WrappedKey,
        key_ref: &KeyReference,
    ) -> VaultResult<KeyMaterial> {
        self.unwrap_for_read(
            token.algorithm,
            &token.wrapped_key,
            token.key_id.as_deref(),
            key_ref,
        )
        .await
    }

    /// Unwraps a token produced by [`Self::generate_and_wrap_blob_key`].
    pub async fn unwrap_blob_key(&self, token: &WrappedKey, key_ref: &KeyReference) -> VaultResult<DataKey> {
        let bytes = self.unwrap_key_material(token, key_ref).await?;
        DataKey::from_slice(&bytes).map_err(|e| VaultError::Decryption(e.to_string()))
    }

    /// Encrypts one blob with a shared data key. Output is `iv || ciphertext`.
    pub fn encrypt_with_key(key: &DataKey, plaintext: &[u8]) -> VaultResult<Vec<u8>> {
        if plaintext.is_empty() {
            return Err(VaultError::Encryption("plaintext is empty".to_string()));
        }
        let iv = random_iv();
        let ciphertext =
            encrypt_cbc(key, &iv, plaintext).map_err(|e| VaultError::Encryption(e.to_string()))?;
        let mut out = Vec::with_capacity(IV_SIZE + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Reverses [`Self::encrypt_with_key`].
    pub fn decrypt_with_key(key: &DataKey, blob: &[u8]) -> VaultResult<Vec<u8>> {
        if blob.len() < IV_SIZE {
            return Err(VaultError::Decryption(format!(
                "blob is {} bytes, shorter than an IV",
                blob.len()
            )));
        }
        let (iv, ciphertext) = blob.split_at(IV_SIZE);
        let mut iv_block = [0u8; IV_SIZE];
        iv_block.copy_from_slice(iv);
        decrypt_cbc(key, &iv_block, ciphertext).map_err(|e| VaultError::Decryption(e.to_string()))
    }

    /// Encrypts a document for the storage collaborator. Errors carry the
    /// document id.
    pub async fn seal_document(
        &self,
        document_id: &str,
        plaintext: &[u8],
        key_ref: &KeyReference,
    ) -> Result<Vec<u8>, DocumentError> {
        let package = self
            .encrypt(plaintext, key_ref)
            .await
            .map_err(|e| DocumentError::new(document_id, e))?;
        let bytes = package
            .to_bytes()
            .map_err(|e| DocumentError::new(document_id, VaultError::Encryption(e.to_string())))?;
        debug!("Sealed document {document_id} ({})", package.algorithm);
        Ok(bytes)
    }

    /// Decrypts a stored document record.
    pub async fn open_document(
        &self,
        document_id: &str,
        record: &[u8],
        key_ref: &KeyReference,
    ) -> Result<Vec<u8>, DocumentError> {
        let package = EncryptedPackage::from_bytes(record)
            .map_err(|e| DocumentError::new(document_id, VaultError::Decryption(e.to_string())))?;
        self.decrypt(&package, key_ref)
            .await
            .map_err(|e| DocumentError::new(document_id, e))
    }
}

/// Pins `key_ref` to the version recorded in the package. A package sealed
/// under a differently named key is refused.
fn resolve_version(key_id: Option<&str>, key_ref: &KeyReference) -> VaultResult<KeyReference> {
    let Some(key_id) = key_id else {
        return Ok(key_ref.clone());
    };
    match parse_key_id(key_id) {
        Some((name, version)) if name == key_ref.name => Ok(key_ref.at_version(version)),
        Some((name, _)) => Err(VaultError::Decryption(format!(
            "package was sealed under key {name}, not {}",
            key_ref.name
        ))),
        None => Err(VaultError::Decryption(format!("package has malformed key id {key_id}"))),
    }
}

/// Key-release failures keep their cause; everything else is an
/// encryption failure.
fn as_encryption(e: VaultError) -> VaultError {
    match e {
        VaultError::KeyRelease { .. } | VaultError::Encryption(_) => e,
        other => VaultError::Encryption(other.to_string()),
    }
}

fn as_decryption(e: VaultError) -> VaultError {
    match e {
        VaultError::KeyRelease { .. } | VaultError::Decryption(_) => e,
        other => VaultError::Decryption(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_store::KeyProtection;

    fn rsa_ref() -> KeyReference {
        KeyReference {
            name: "doc-key".into(),
            version: "v2".into(),
            protection: KeyProtection::RsaKeyPair,
        }
    }

    #[test]
    fn untagged_key_id_uses_reference_as_is() {
        assert_eq!(resolve_version(None, &rsa_ref()).unwrap(), rsa_ref());
    }

    #[test]
    fn key_id_pins_version() {
        let pinned = resolve_version(Some("doc-key/v1"), &rsa_ref()).unwrap();
        assert_eq!(pinned.version, "v1");
        assert_eq!(pinned.name, "doc-key");
    }

    #[test]
    fn key_id_for_other_key_refused() {
        let err = resolve_version(Some("other/v1"), &rsa_ref()).unwrap_err();
        assert!(matches!(err, VaultError::Decryption(msg) if msg.contains("other")));
    }

    #[test]
    fn shared_key_blob_roundtrip() {
        let key = DataKey::generate();
        let blob = EnvelopeService::encrypt_with_key(&key, b"chunk 1").unwrap();
        assert_eq!(EnvelopeService::decrypt_with_key(&key, &blob).unwrap(), b"chunk 1");
        assert!(EnvelopeService::decrypt_with_key(&key, &blob[..8]).is_err());
    }
}
