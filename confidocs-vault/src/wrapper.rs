//! Key-wrapping capability.
//!
//! Deployments pick one [`KeyWrapper`] variant for new documents at
//! startup. Callers depend only on the trait.

use crate::error::{VaultError, VaultResult};
use crate::key_release::KeyReleaseClient;
use crate::key_store::{KeyProtection, KeyReference, KeyStore};
use async_trait::async_trait;
use confidocs_crypto::{KeyMaterial, WrapAlgorithm, public_key_from_pem};
use std::sync::Arc;

#[async_trait]
pub trait KeyWrapper: Send + Sync {
    /// The algorithm stamped into packages this wrapper produces.
    fn algorithm(&self) -> WrapAlgorithm;

    async fn wrap(&self, key: &[u8], key_ref: &KeyReference) -> VaultResult<Vec<u8>>;

    async fn unwrap(&self, wrapped: &[u8], key_ref: &KeyReference) -> VaultResult<KeyMaterial>;
}

/// RSA-OAEP with a key pair held in the key store.
pub struct DirectWrap {
    store: Arc<KeyStore>,
}

impl DirectWrap {
    pub fn new(store: Arc<KeyStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl KeyWrapper for DirectWrap {
    fn algorithm(&self) -> WrapAlgorithm {
        WrapAlgorithm::RsaOaep
    }

    async fn wrap(&self, key: &[u8], key_ref: &KeyReference) -> VaultResult<Vec<u8>> {
        let pem = self.store.load_public_key(key_ref).await?;
        let public = public_key_from_pem(&pem).map_err(|e| VaultError::Encryption(e.to_string()))?;
        confidocs_crypto::wrap_key(&public, key).map_err(|e| VaultError::Encryption(e.to_string()))
    }

    async fn unwrap(&self, wrapped: &[u8], key_ref: &KeyReference) -> VaultResult<KeyMaterial> {
        let pair = self.store.load_private_key(key_ref).await?;
        confidocs_crypto::unwrap_key(pair.private_key(), wrapped)
            .map_err(|e| VaultError::Decryption(e.to_string()))
    }
}

/// Attestation-gated release of a key-encryption key.
pub struct SecureKeyRelease {
    client: KeyReleaseClient,
}

impl SecureKeyRelease {
    pub fn new(client: KeyReleaseClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KeyWrapper for SecureKeyRelease {
    fn algorithm(&self) -> WrapAlgorithm {
        WrapAlgorithm::Skr
    }

    async fn wrap(&self, key: &[u8], key_ref: &KeyReference) -> VaultResult<Vec<u8>> {
        self.client.wrap_key(key, key_ref).await
    }

    async fn unwrap(&self, wrapped: &[u8], key_ref: &KeyReference) -> VaultResult<KeyMaterial> {
        self.client.unwrap_key(wrapped, key_ref).await
    }
}

/// Whether `key_ref` is the kind of key `algorithm` unwraps with.
pub(crate) fn protection_matches(algorithm: WrapAlgorithm, key_ref: &KeyReference) -> bool {
    matches!(
        (algorithm, &key_ref.protection),
        (WrapAlgorithm::RsaOaep, KeyProtection::RsaKeyPair)
            | (WrapAlgorithm::Skr, KeyProtection::SecureRelease { .. })
    )
}
