//! Key store adapter.
//!
//! [`KeyVault`] is the capability interface to the remote secret/key vault.
//! [`KeyStore`] sits on top of it and provides idempotent get-or-create of
//! named keys, with a process-wide reference cache.
//!
//! # Concurrency
//!
//! The cache is a map of per-name slots. The outer lock is held only long
//! enough to find or insert a slot; the slot lock is held for one
//! check-then-create sequence. A slot is filled only after the vault call
//! succeeded, so a cancelled caller never leaves a half-created entry.

use crate::error::{KeyStoreError, KeyStoreErrorKind, VaultError, VaultResult};
use async_trait::async_trait;
use confidocs_crypto::{KeyMaterial, RsaKeyPair, random_key_material};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Content type of secrets holding a PKCS#8 PEM private key.
pub const PEM_CONTENT_TYPE: &str = "application/x-pem-file";

/// Content type of secrets holding a hex-encoded symmetric master key.
pub const MASTER_KEY_CONTENT_TYPE: &str = "application/x-confidocs-master-key";

/// Length of generated symmetric master keys in bytes.
pub const MASTER_KEY_SIZE: usize = 128;

/// Whether a name holds raw exportable material or an operation-only key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    Secret,
    Key,
}

/// How the key behind a [`KeyReference`] protects data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeyProtection {
    /// RSA key pair stored as a PEM secret; wraps directly with RSA-OAEP.
    RsaKeyPair,
    /// Key-encryption key released only to an environment attested by
    /// `attestation_endpoint`.
    SecureRelease { attestation_endpoint: String },
    /// Raw symmetric master key (searchable encryption).
    SymmetricMaster,
}

impl KeyProtection {
    pub fn storage_kind(&self) -> StorageKind {
        match self {
            Self::SecureRelease { .. } => StorageKind::Key,
            Self::RsaKeyPair | Self::SymmetricMaster => StorageKind::Secret,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::RsaKeyPair => "RSA key pair",
            Self::SecureRelease { .. } => "secure-release key",
            Self::SymmetricMaster => "symmetric master key",
        }
    }
}

impl fmt::Display for KeyProtection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Identifies a protecting key inside the key store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyReference {
    pub name: String,
    pub version: String,
    pub protection: KeyProtection,
}

impl KeyReference {
    /// Identifier stamped into packages: `name/version`.
    pub fn key_id(&self) -> String {
        format!("{}/{}", self.name, self.version)
    }

    /// Same key, pinned to another version.
    pub fn at_version(&self, version: &str) -> Self {
        Self {
            version: version.to_string(),
            ..self.clone()
        }
    }
}

/// Splits a `name/version` key id.
pub fn parse_key_id(key_id: &str) -> Option<(&str, &str)> {
    key_id
        .rsplit_once('/')
        .filter(|(name, version)| !name.is_empty() && !version.is_empty())
}

/// A secret as returned by the vault.
#[derive(Clone)]
pub struct SecretBundle {
    pub name: String,
    pub version: String,
    pub value: Zeroizing<String>,
    pub content_type: Option<String>,
}

impl fmt::Debug for SecretBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretBundle")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("value", &"[REDACTED]")
            .field("content_type", &self.content_type)
            .finish()
    }
}

/// Release policy attached to a key: the attestation authority whose
/// tokens unlock it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasePolicy {
    pub authority: String,
}

impl ReleasePolicy {
    /// Whether tokens issued by `issuer` satisfy this policy.
    pub fn admits(&self, issuer: &str) -> bool {
        self.authority.trim_end_matches('/') == issuer.trim_end_matches('/')
    }
}

/// Key metadata. Operation-only keys never expose material here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyBundle {
    pub name: String,
    pub version: String,
    pub exportable: bool,
    pub release_policy: Option<ReleasePolicy>,
}

/// Parameters for creating an RSA key in the vault.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeySpec {
    pub size: usize,
    pub exportable: bool,
    pub release_policy: Option<ReleasePolicy>,
}

impl KeySpec {
    /// An exportable 2048-bit key released to tokens from `authority`.
    pub fn releasable(authority: impl Into<String>) -> Self {
        Self {
            size: confidocs_crypto::wrap::RSA_KEY_BITS,
            exportable: true,
            release_policy: Some(ReleasePolicy {
                authority: authority.into(),
            }),
        }
    }
}

/// Capability interface to a remote secret/key vault.
#[async_trait]
pub trait KeyVault: Send + Sync {
    /// Fetches a secret; `version = None` means the latest.
    async fn get_secret(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<Option<SecretBundle>, KeyStoreError>;

    /// Stores a new version of a secret.
    async fn set_secret(
        &self,
        name: &str,
        value: &str,
        content_type: &str,
    ) -> Result<SecretBundle, KeyStoreError>;

    async fn get_key(&self, name: &str) -> Result<Option<KeyBundle>, KeyStoreError>;

    async fn create_key(&self, name: &str, spec: &KeySpec) -> Result<KeyBundle, KeyStoreError>;

    /// Releases an exportable key to the holder of an attestation token.
    /// Returns the private key as PKCS#8 DER.
    async fn release_key(
        &self,
        name: &str,
        version: &str,
        token: &str,
    ) -> Result<KeyMaterial, KeyStoreError>;
}

type Slot = Arc<Mutex<Option<KeyReference>>>;

/// Idempotent key management over a [`KeyVault`].
pub struct KeyStore {
    vault: Arc<dyn KeyVault>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl KeyStore {
    pub fn new(vault: Arc<dyn KeyVault>) -> Self {
        Self {
            vault,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn vault(&self) -> &Arc<dyn KeyVault> {
        &self.vault
    }

    async fn slot(&self, name: &str) -> Slot {
        self.slots
            .lock()
            .await
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Returns the RSA key pair stored under `name`, creating it on first use.
    pub async fn get_or_create_asymmetric_keypair(&self, name: &str) -> VaultResult<KeyReference> {
        self.get_or_create_reference(name, KeyProtection::RsaKeyPair, PEM_CONTENT_TYPE, || {
            let pair = RsaKeyPair::generate()
                .map_err(|e| VaultError::Encryption(format!("cannot generate key pair: {e}")))?;
            pair.to_pkcs8_pem()
                .map_err(|e| VaultError::Encryption(format!("cannot encode key pair: {e}")))
        })
        .await
    }

    /// Returns the symmetric master key stored under `name`, creating it on
    /// first use.
    pub async fn get_or_create_symmetric_master_key(&self, name: &str) -> VaultResult<KeyReference> {
        self.get_or_create_reference(
            name,
            KeyProtection::SymmetricMaster,
            MASTER_KEY_CONTENT_TYPE,
            || Ok(Zeroizing::new(hex::encode(random_key_material(MASTER_KEY_SIZE).as_slice()))),
        )
        .await
    }

    async fn get_or_create_reference<F>(
        &self,
        name: &str,
        protection: KeyProtection,
        content_type: &str,
        make: F,
    ) -> VaultResult<KeyReference>
    where
        F: FnOnce() -> VaultResult<Zeroizing<String>>,
    {
        let slot = self.slot(name).await;
        let mut cached = slot.lock().await;

        if let Some(reused) = reuse(cached.as_ref(), name, &protection) {
            return reused;
        }

        if self.vault.get_key(name).await?.is_some() {
            return Err(KeyStoreError::wrong_kind(format!(
                "'{name}' is a vault key, expected a secret holding a {protection}"
            ))
            .into());
        }

        let secret = self.fetch_or_create_secret(name, content_type, make).await?;
        check_secret_shape(&secret, &protection)?;

        let reference = KeyReference {
            name: name.to_string(),
            version: secret.version,
            protection,
        };
        *cached = Some(reference.clone());
        Ok(reference)
    }

    /// Resolves an RSA key pair that must already exist.
    ///
    /// Read paths use this instead of [`Self::get_or_create_asymmetric_keypair`]
    /// so a misnamed key is reported as missing rather than created.
    pub async fn resolve_asymmetric_keypair(&self, name: &str) -> VaultResult<KeyReference> {
        let protection = KeyProtection::RsaKeyPair;
        let slot = self.slot(name).await;
        let mut cached = slot.lock().await;
        if let Some(reused) = reuse(cached.as_ref(), name, &protection) {
            return reused;
        }

        if self.vault.get_key(name).await?.is_some() {
            return Err(KeyStoreError::wrong_kind(format!(
                "'{name}' is a vault key, expected a secret holding a {protection}"
            ))
            .into());
        }
        let Some(secret) = self.vault.get_secret(name, None).await? else {
            return Err(KeyStoreError::not_found(format!("key pair '{name}' does not exist")).into());
        };
        if let Some(found) = secret.content_type.as_deref().filter(|ct| *ct != PEM_CONTENT_TYPE) {
            return Err(KeyStoreError::wrong_kind(format!(
                "secret '{name}' has content type {found}, expected {PEM_CONTENT_TYPE}"
            ))
            .into());
        }
        check_secret_shape(&secret, &protection)?;

        debug!("Resolved key pair {name} (version {})", secret.version);
        let reference = KeyReference {
            name: name.to_string(),
            version: secret.version,
            protection,
        };
        *cached = Some(reference.clone());
        Ok(reference)
    }

    /// Returns the latest version of secret `name`, storing `make()` first
    /// if it does not exist. Existing secrets with another content type are
    /// rejected.
    pub async fn get_or_create_secret<F>(
        &self,
        name: &str,
        content_type: &str,
        make: F,
    ) -> VaultResult<SecretBundle>
    where
        F: FnOnce() -> VaultResult<Zeroizing<String>>,
    {
        let slot = self.slot(name).await;
        let _guard = slot.lock().await;
        self.fetch_or_create_secret(name, content_type, make).await
    }

    async fn fetch_or_create_secret<F>(
        &self,
        name: &str,
        content_type: &str,
        make: F,
    ) -> VaultResult<SecretBundle>
    where
        F: FnOnce() -> VaultResult<Zeroizing<String>>,
    {
        if let Some(existing) = self.vault.get_secret(name, None).await? {
            match existing.content_type.as_deref() {
                Some(found) if found != content_type => {
                    return Err(KeyStoreError::wrong_kind(format!(
                        "secret '{name}' has content type {found}, expected {content_type}"
                    ))
                    .into());
                }
                _ => {
                    debug!("Reusing secret {name} (version {})", existing.version);
                    return Ok(existing);
                }
            }
        }

        let value = make()?;
        let created = self.vault.set_secret(name, &value, content_type).await?;
        info!("Created secret {name} (version {})", created.version);
        Ok(created)
    }

    /// Reports whether `name` is stored as a secret or as a vault key.
    pub async fn resolve_storage_kind(&self, name: &str) -> VaultResult<StorageKind> {
        if self.vault.get_key(name).await?.is_some() {
            return Ok(StorageKind::Key);
        }
        if self.vault.get_secret(name, None).await?.is_some() {
            return Ok(StorageKind::Secret);
        }
        Err(KeyStoreError::not_found(format!("nothing stored under '{name}'")).into())
    }

    /// Resolves a key-encryption key provisioned for secure key release.
    ///
    /// The key must already exist as an exportable vault key whose release
    /// policy names `attestation_endpoint`.
    pub async fn resolve_release_key(
        &self,
        name: &str,
        attestation_endpoint: &str,
    ) -> VaultResult<KeyReference> {
        let protection = KeyProtection::SecureRelease {
            attestation_endpoint: attestation_endpoint.to_string(),
        };
        let slot = self.slot(name).await;
        let mut cached = slot.lock().await;

        if let Some(reused) = reuse(cached.as_ref(), name, &protection) {
            return reused;
        }

        let Some(key) = self.vault.get_key(name).await? else {
            if self.vault.get_secret(name, None).await?.is_some() {
                return Err(KeyStoreError::wrong_kind(format!(
                    "'{name}' is a secret, expected a releasable vault key"
                ))
                .into());
            }
            return Err(KeyStoreError::not_found(format!("release key '{name}' does not exist")).into());
        };

        let Some(policy) = key.release_policy.as_ref().filter(|_| key.exportable) else {
            return Err(KeyStoreError::wrong_kind(format!(
                "vault key '{name}' is not releasable (no export permission or release policy)"
            ))
            .into());
        };
        if !policy.admits(attestation_endpoint) {
            return Err(KeyStoreError::new(
                KeyStoreErrorKind::Invalid,
                format!(
                    "release policy of '{name}' trusts {}, not {attestation_endpoint}",
                    policy.authority
                ),
            )
            .into());
        }

        let reference = KeyReference {
            name: name.to_string(),
            version: key.version,
            protection,
        };
        *cached = Some(reference.clone());
        Ok(reference)
    }

    /// Loads the RSA key pair behind a direct-mode reference.
    pub async fn load_private_key(&self, key_ref: &KeyReference) -> VaultResult<RsaKeyPair> {
        expect_protection(key_ref, &KeyProtection::RsaKeyPair)?;
        let secret = self.required_secret(&key_ref.name, Some(&key_ref.version)).await?;
        RsaKeyPair::from_pkcs8_pem(&secret.value).map_err(|e| {
            KeyStoreError::new(
                KeyStoreErrorKind::Invalid,
                format!("secret '{}' is not a usable private key: {e}", key_ref.name),
            )
            .into()
        })
    }

    /// Loads the public half of a direct-mode reference as SPKI PEM.
    pub async fn load_public_key(&self, key_ref: &KeyReference) -> VaultResult<String> {
        let pair = self.load_private_key(key_ref).await?;
        pair.public_key_pem().map_err(|e| {
            KeyStoreError::new(KeyStoreErrorKind::Invalid, format!("cannot encode public key: {e}"))
                .into()
        })
    }

    /// Loads the bytes of a symmetric master key.
    pub async fn load_symmetric_key(&self, key_ref: &KeyReference) -> VaultResult<KeyMaterial> {
        expect_protection(key_ref, &KeyProtection::SymmetricMaster)?;
        let secret = self.required_secret(&key_ref.name, Some(&key_ref.version)).await?;
        decode_master_key(&key_ref.name, &secret.value)
    }

    /// Reads the latest version of a secret, if present.
    pub async fn read_secret(&self, name: &str) -> VaultResult<Option<SecretBundle>> {
        Ok(self.vault.get_secret(name, None).await?)
    }

    /// Stores a new version of a secret and forgets any cached reference
    /// to the previous one.
    pub async fn replace_secret(
        &self,
        name: &str,
        value: &str,
        content_type: &str,
    ) -> VaultResult<SecretBundle> {
        let slot = self.slot(name).await;
        let mut cached = slot.lock().await;
        let stored = self.vault.set_secret(name, value, content_type).await?;
        *cached = None;
        info!("Stored secret {name} (version {})", stored.version);
        Ok(stored)
    }

    async fn required_secret(&self, name: &str, version: Option<&str>) -> VaultResult<SecretBundle> {
        self.vault.get_secret(name, version).await?.ok_or_else(|| {
            let version = version.unwrap_or("latest");
            KeyStoreError::not_found(format!("secret '{name}' version {version} does not exist")).into()
        })
    }
}

/// A cached reference is reused only for the protection it was made for.
fn reuse(
    cached: Option<&KeyReference>,
    name: &str,
    protection: &KeyProtection,
) -> Option<VaultResult<KeyReference>> {
    cached.map(|existing| {
        if existing.protection == *protection {
            Ok(existing.clone())
        } else {
            Err(wrong_kind(name, &existing.protection, protection))
        }
    })
}

fn wrong_kind(name: &str, existing: &KeyProtection, requested: &KeyProtection) -> VaultError {
    KeyStoreError::wrong_kind(format!("'{name}' holds a {existing}, requested a {requested}")).into()
}

fn expect_protection(key_ref: &KeyReference, expected: &KeyProtection) -> VaultResult<()> {
    if std::mem::discriminant(&key_ref.protection) == std::mem::discriminant(expected) {
        Ok(())
    } else {
        Err(wrong_kind(&key_ref.name, &key_ref.protection, expected))
    }
}

/// Secrets without a content type (written by other tools) are accepted
/// when their value parses as the requested kind.
fn check_secret_shape(secret: &SecretBundle, protection: &KeyProtection) -> VaultResult<()> {
    let ok = match protection {
        KeyProtection::RsaKeyPair => RsaKeyPair::from_pkcs8_pem(&secret.value).is_ok(),
        KeyProtection::SymmetricMaster => decode_master_key(&secret.name, &secret.value).is_ok(),
        KeyProtection::SecureRelease { .. } => false,
    };
    if ok {
        Ok(())
    } else {
        Err(KeyStoreError::wrong_kind(format!(
            "secret '{}' does not hold a {protection}",
            secret.name
        ))
        .into())
    }
}

fn decode_master_key(name: &str, value: &str) -> VaultResult<KeyMaterial> {
    let bytes = Zeroizing::new(hex::decode(value.trim()).map_err(|_| {
        KeyStoreError::new(KeyStoreErrorKind::Invalid, format!("master key '{name}' is not hex"))
    })?);
    if bytes.len() != MASTER_KEY_SIZE {
        return Err(KeyStoreError::new(
            KeyStoreErrorKind::Invalid,
            format!(
                "master key '{name}' is {} bytes, expected {MASTER_KEY_SIZE}",
                bytes.len()
            ),
        )
        .into());
    }
    Ok(bytes)
}
