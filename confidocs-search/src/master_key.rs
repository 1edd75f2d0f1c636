//! The search master key.
//!
//! In direct mode it is a plain master-key secret. Under secure key release
//! it is stored only as a wrapped key token, and every process unwraps it
//! through the attested release path. A deployment that switches from
//! direct mode moves the plain secret over with [`MasterKey::migrate_to_skr`].

use crate::context::{ContextManager, ContextSettings, SearchAlgorithm};
use crate::error::{SearchError, SearchResult};
use confidocs_crypto::{KeyMaterial, WrappedKey, random_key_material};
use confidocs_vault::error::KeyStoreError;
use confidocs_vault::key_store::{
    KeyProtection, KeyReference, MASTER_KEY_CONTENT_TYPE, MASTER_KEY_SIZE, SecretBundle,
};
use confidocs_vault::{Deployment, VaultError, WrapMode};
use std::fmt;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Content type of a wrapped master key token.
pub const WRAPPED_MASTER_KEY_CONTENT_TYPE: &str = "application/x-confidocs-wrapped-key";

pub struct MasterKey {
    name: String,
    version: String,
    material: KeyMaterial,
}

impl MasterKey {
    /// Loads the configured master key, creating it on first use.
    pub async fn load(deployment: &Deployment) -> SearchResult<Self> {
        let name = deployment.config.search_encryption_key_name.as_str();
        match deployment.config.mode {
            WrapMode::Direct => {
                let key_ref = deployment
                    .key_store
                    .get_or_create_symmetric_master_key(name)
                    .await?;
                let material = deployment.key_store.load_symmetric_key(&key_ref).await?;
                debug!("Loaded search master key {}", key_ref.key_id());
                Ok(Self {
                    name: key_ref.name,
                    version: key_ref.version,
                    material,
                })
            }
            WrapMode::SecureKeyRelease => Self::load_wrapped(deployment, name).await,
        }
    }

    async fn load_wrapped(deployment: &Deployment, name: &str) -> SearchResult<Self> {
        let store = &deployment.key_store;
        let pending = match store.read_secret(name).await? {
            Some(existing) if is_plain(&existing) => {
                return Err(VaultError::from(KeyStoreError::wrong_kind(format!(
                    "search master key '{name}' is still a plain direct-mode secret; \
                     migrate it to secure key release first"
                )))
                .into());
            }
            Some(_) => None,
            None => {
                let material = random_key_material(MASTER_KEY_SIZE);
                Some(Self::wrap(deployment, &material).await?)
            }
        };
        let stored = store
            .get_or_create_secret(name, WRAPPED_MASTER_KEY_CONTENT_TYPE, || {
                let token = pending.ok_or_else(|| {
                    VaultError::Config(format!("wrapped master key '{name}' disappeared while loading"))
                })?;
                info!("Provisioning wrapped search master key {name}");
                Ok(token)
            })
            .await?;

        let token = WrappedKey::from_base64(&stored.value)
            .map_err(|e| SearchError::MalformedCiphertext(format!("master key token '{name}': {e}")))?;
        let material = deployment
            .envelope
            .unwrap_key_material(&token, &deployment.key_reference)
            .await?;
        Ok(Self {
            name: name.to_string(),
            version: stored.version,
            material,
        })
    }

    /// Moves a plain direct-mode master key under secure key release.
    ///
    /// The key bytes are kept and stored again as a wrapped token, and a
    /// search context made under the plain secret is carried over to the
    /// new version, so the existing index stays usable. Returns `false`
    /// when there is nothing to migrate.
    pub async fn migrate_to_skr(deployment: &Deployment) -> SearchResult<bool> {
        if deployment.config.mode != WrapMode::SecureKeyRelease {
            return Err(VaultError::Config(
                "search master key migration needs a secure-key-release deployment".to_string(),
            )
            .into());
        }
        let name = deployment.config.search_encryption_key_name.as_str();
        let store = &deployment.key_store;
        let Some(plain) = store.read_secret(name).await?.filter(is_plain) else {
            debug!("Search master key {name} needs no migration");
            return Ok(false);
        };

        let plain_ref = KeyReference {
            name: name.to_string(),
            version: plain.version.clone(),
            protection: KeyProtection::SymmetricMaster,
        };
        let material = store.load_symmetric_key(&plain_ref).await?;
        let token = Self::wrap(deployment, &material).await?;
        let wrapped = store
            .replace_secret(name, &token, WRAPPED_MASTER_KEY_CONTENT_TYPE)
            .await?;
        info!(
            "Migrated search master key {name} to secure key release (version {} to {})",
            plain.version, wrapped.version
        );

        if let Some(algorithm) = SearchAlgorithm::for_mode(deployment.config.search_encryption) {
            let manager = ContextManager::new(
                store.clone(),
                ContextSettings::from_config(&deployment.config, algorithm),
                wrapped.version,
            );
            manager.carry_over(&plain.version).await?;
        }
        Ok(true)
    }

    async fn wrap(deployment: &Deployment, material: &[u8]) -> SearchResult<Zeroizing<String>> {
        let token = deployment
            .envelope
            .wrap_existing_key(material, &deployment.key_reference)
            .await?;
        let encoded = token
            .to_base64()
            .map_err(|e| VaultError::Encryption(e.to_string()))?;
        Ok(Zeroizing::new(encoded))
    }

    /// Builds a key from bytes held elsewhere.
    pub fn from_material(name: impl Into<String>, version: impl Into<String>, material: KeyMaterial) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            material,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.material
    }
}

/// A master key secret written by a direct-mode deployment.
fn is_plain(secret: &SecretBundle) -> bool {
    secret.content_type.as_deref() == Some(MASTER_KEY_CONTENT_TYPE)
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("material", &"[REDACTED]")
            .finish()
    }
}
