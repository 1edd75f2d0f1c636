//! Attestation-gated key release.
//!
//! Each wrap or unwrap attests, presents the token to the key store to
//! release the key-encryption key, performs RSA-OAEP locally with it, and
//! drops it. The released key lives in a [`ReleasedKey`] guard so it is
//! wiped on every exit path, including errors and cancellation.
//!
//! Tokens are not cached: every release attests afresh.

use crate::attestation::Attestor;
use crate::error::{
    AttestationError, AttestationFailure, KeyStoreError, KeyStoreErrorKind, ReleaseFailure,
    VaultError, VaultResult,
};
use crate::key_store::{KeyProtection, KeyReference, KeyVault};
use confidocs_crypto::{KeyMaterial, RsaKeyPair};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Observes when released key material enters and leaves the process.
pub trait KeyMaterialHook: Send + Sync {
    fn on_acquired(&self, key_name: &str);
    fn on_discarded(&self, key_name: &str);
}

/// A released key-encryption key, wiped when dropped.
struct ReleasedKey<'a> {
    name: &'a str,
    der: KeyMaterial,
    hook: Option<&'a dyn KeyMaterialHook>,
}

impl<'a> ReleasedKey<'a> {
    fn new(name: &'a str, der: KeyMaterial, hook: Option<&'a dyn KeyMaterialHook>) -> Self {
        if let Some(hook) = hook {
            hook.on_acquired(name);
        }
        Self { name, der, hook }
    }

    fn key_pair(&self) -> VaultResult<RsaKeyPair> {
        RsaKeyPair::from_pkcs8_der(&self.der).map_err(|_| {
            VaultError::key_release(
                ReleaseFailure::PolicyDenied,
                format!("key store released an unusable key for {}", self.name),
            )
        })
    }
}

impl Drop for ReleasedKey<'_> {
    fn drop(&mut self) {
        // `der` is Zeroizing and wipes itself after this returns.
        if let Some(hook) = self.hook {
            hook.on_discarded(self.name);
        }
    }
}

/// Wraps and unwraps keys with a key-encryption key that the key store
/// releases only to an attested environment.
pub struct KeyReleaseClient {
    attestor: Arc<dyn Attestor>,
    vault: Arc<dyn KeyVault>,
    timeout: Duration,
    hook: Option<Arc<dyn KeyMaterialHook>>,
}

impl KeyReleaseClient {
    pub fn new(attestor: Arc<dyn Attestor>, vault: Arc<dyn KeyVault>, timeout: Duration) -> Self {
        Self {
            attestor,
            vault,
            timeout,
            hook: None,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn KeyMaterialHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Wraps `plaintext_key` for `key_ref`.
    pub async fn wrap_key(&self, plaintext_key: &[u8], key_ref: &KeyReference) -> VaultResult<Vec<u8>> {
        let released = self.release(key_ref).await?;
        let pair = released.key_pair()?;
        confidocs_crypto::wrap_key(pair.public_key(), plaintext_key)
            .map_err(|e| VaultError::Encryption(e.to_string()))
    }

    /// Unwraps a key previously wrapped for `key_ref`. Either returns the
    /// complete key or an error; nothing released is retained.
    pub async fn unwrap_key(&self, wrapped: &[u8], key_ref: &KeyReference) -> VaultResult<KeyMaterial> {
        let released = self.release(key_ref).await?;
        let pair = released.key_pair()?;
        confidocs_crypto::unwrap_key(pair.private_key(), wrapped)
            .map_err(|e| VaultError::Decryption(e.to_string()))
    }

    async fn release<'a>(&'a self, key_ref: &'a KeyReference) -> VaultResult<ReleasedKey<'a>> {
        if !matches!(key_ref.protection, KeyProtection::SecureRelease { .. }) {
            return Err(VaultError::key_release(
                ReleaseFailure::PolicyDenied,
                format!("{} is a {}, not a secure-release key", key_ref.name, key_ref.protection),
            ));
        }

        let exchange = async {
            let token = self.attestor.attest().await.map_err(attestation_failure)?;
            debug!("Requesting release of {}", key_ref.key_id());
            self.vault
                .release_key(&key_ref.name, &key_ref.version, token.as_str())
                .await
                .map_err(|e| release_failure(&key_ref.name, e))
        };

        let der = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("Release of {} timed out after {:?}", key_ref.name, self.timeout);
                return Err(VaultError::key_release(
                    ReleaseFailure::Transport,
                    format!("release of {} timed out after {:?}", key_ref.name, self.timeout),
                ));
            }
        };

        Ok(ReleasedKey::new(&key_ref.name, der, self.hook.as_deref()))
    }
}

fn attestation_failure(e: AttestationError) -> VaultError {
    let cause = match e.kind {
        AttestationFailure::Unreachable => ReleaseFailure::Transport,
        AttestationFailure::Rejected | AttestationFailure::Malformed => {
            ReleaseFailure::AttestationRejected
        }
    };
    warn!("Attestation failed: {e}");
    VaultError::key_release(cause, e.to_string())
}

fn release_failure(name: &str, e: KeyStoreError) -> VaultError {
    let cause = match e.kind {
        KeyStoreErrorKind::Transport => ReleaseFailure::Transport,
        KeyStoreErrorKind::NotFound
        | KeyStoreErrorKind::Denied
        | KeyStoreErrorKind::Conflict
        | KeyStoreErrorKind::WrongKind
        | KeyStoreErrorKind::Invalid => ReleaseFailure::PolicyDenied,
    };
    warn!("Key store refused release of {name}: {e}");
    VaultError::key_release(cause, e.to_string())
}
