//! In-process [`KeyVault`] for local development and tests.
//!
//! Secrets are versioned like the remote vault. Keys are exportable RSA
//! key pairs whose release is gated on an attestation token issued by the
//! authority named in the key's release policy.

use crate::attestation::AttestationToken;
use crate::error::{KeyStoreError, KeyStoreErrorKind};
use crate::key_store::{KeyBundle, KeySpec, KeyVault, SecretBundle};
use async_trait::async_trait;
use confidocs_crypto::{KeyMaterial, RsaKeyPair};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;
use zeroize::Zeroizing;

struct StoredSecret {
    version: String,
    value: Zeroizing<String>,
    content_type: Option<String>,
}

struct StoredKey {
    bundle: KeyBundle,
    material: RsaKeyPair,
}

#[derive(Default)]
struct State {
    secrets: HashMap<String, Vec<StoredSecret>>,
    keys: HashMap<String, Vec<StoredKey>>,
}

/// A vault that lives in process memory.
#[derive(Default)]
pub struct MemoryKeyVault {
    state: RwLock<State>,
    sequence: AtomicU64,
    offline: AtomicBool,
    releases: AtomicU64,
}

impl MemoryKeyVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with a transport error until reset.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of stored versions of a secret.
    pub async fn secret_version_count(&self, name: &str) -> usize {
        self.state
            .read()
            .await
            .secrets
            .get(name)
            .map_or(0, Vec::len)
    }

    /// Number of successful key releases so far.
    pub fn release_count(&self) -> u64 {
        self.releases.load(Ordering::SeqCst)
    }

    fn reachable(&self) -> Result<(), KeyStoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(KeyStoreError::new(KeyStoreErrorKind::Transport, "vault unreachable"))
        } else {
            Ok(())
        }
    }

    fn next_version(&self, name: &str) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let digest = Sha256::digest(format!("{name}:{seq}").as_bytes());
        hex::encode(&digest[..16])
    }
}

#[async_trait]
impl KeyVault for MemoryKeyVault {
    async fn get_secret(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<Option<SecretBundle>, KeyStoreError> {
        self.reachable()?;
        let state = self.state.read().await;
        let Some(versions) = state.secrets.get(name) else {
            return Ok(None);
        };
        let found = match version {
            Some(v) => versions.iter().find(|s| s.version == v),
            None => versions.last(),
        };
        Ok(found.map(|s| SecretBundle {
            name: name.to_string(),
            version: s.version.clone(),
            value: s.value.clone(),
            content_type: s.content_type.clone(),
        }))
    }

    async fn set_secret(
        &self,
        name: &str,
        value: &str,
        content_type: &str,
    ) -> Result<SecretBundle, KeyStoreError> {
        self.reachable()?;
        let version = self.next_version(name);
        let stored = StoredSecret {
            version: version.clone(),
            value: Zeroizing::new(value.to_string()),
            content_type: Some(content_type.to_string()),
        };
        self.state
            .write()
            .await
            .secrets
            .entry(name.to_string())
            .or_default()
            .push(stored);
        debug!("Memory vault stored secret {name} version {version}");

        Ok(SecretBundle {
            name: name.to_string(),
            version,
            value: Zeroizing::new(value.to_string()),
            content_type: Some(content_type.to_string()),
        })
    }

    async fn get_key(&self, name: &str) -> Result<Option<KeyBundle>, KeyStoreError> {
        self.reachable()?;
        Ok(self
            .state
            .read()
            .await
            .keys
            .get(name)
            .and_then(|versions| versions.last())
            .map(|k| k.bundle.clone()))
    }

    async fn create_key(&self, name: &str, spec: &KeySpec) -> Result<KeyBundle, KeyStoreError> {
        self.reachable()?;
        if spec.size != confidocs_crypto::wrap::RSA_KEY_BITS {
            return Err(KeyStoreError::new(
                KeyStoreErrorKind::Invalid,
                format!("unsupported key size {}", spec.size),
            ));
        }
        let material = RsaKeyPair::generate()
            .map_err(|e| KeyStoreError::new(KeyStoreErrorKind::Invalid, e.to_string()))?;
        let bundle = KeyBundle {
            name: name.to_string(),
            version: self.next_version(name),
            exportable: spec.exportable,
            release_policy: spec.release_policy.clone(),
        };
        self.state
            .write()
            .await
            .keys
            .entry(name.to_string())
            .or_default()
            .push(StoredKey {
                bundle: bundle.clone(),
                material,
            });
        debug!("Memory vault created key {name} version {}", bundle.version);
        Ok(bundle)
    }

    async fn release_key(
        &self,
        name: &str,
        version: &str,
        token: &str,
    ) -> Result<KeyMaterial, KeyStoreError> {
        self.reachable()?;
        let state = self.state.read().await;
        let key = state
            .keys
            .get(name)
            .and_then(|versions| versions.iter().find(|k| k.bundle.version == version))
            .ok_or_else(|| KeyStoreError::not_found(format!("key {name}/{version} does not exist")))?;

        let Some(policy) = key.bundle.release_policy.as_ref().filter(|_| key.bundle.exportable)
        else {
            return Err(KeyStoreError::new(
                KeyStoreErrorKind::Denied,
                format!("key {name} is not exportable"),
            ));
        };

        let token = AttestationToken::parse(token)
            .map_err(|_| KeyStoreError::new(KeyStoreErrorKind::Denied, "unparseable attestation token"))?;
        if !policy.admits(&token.issuer) {
            return Err(KeyStoreError::new(
                KeyStoreErrorKind::Denied,
                format!("release policy of {name} does not trust issuer {}", token.issuer),
            ));
        }
        if token.is_expired() {
            return Err(KeyStoreError::new(
                KeyStoreErrorKind::Denied,
                "attestation token has expired",
            ));
        }

        let der = key
            .material
            .to_pkcs8_der()
            .map_err(|e| KeyStoreError::new(KeyStoreErrorKind::Invalid, e.to_string()))?;
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(der)
    }
}
