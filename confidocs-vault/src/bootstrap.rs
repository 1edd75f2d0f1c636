//! Startup wiring.
//!
//! Capabilities are probed once and threaded through constructors; nothing
//! later in the process toggles them.

use crate::attestation::{Attestor, attestor_from_config};
use crate::config::{ServiceConfig, WrapMode};
use crate::envelope::EnvelopeService;
use crate::error::{VaultError, VaultResult};
use crate::http_vault::HttpKeyVault;
use crate::key_release::{KeyMaterialHook, KeyReleaseClient};
use crate::key_store::{KeyReference, KeyStore, KeyVault, parse_key_id};
use crate::wrapper::{DirectWrap, KeyWrapper, SecureKeyRelease, protection_matches};
use confidocs_crypto::{EncryptedPackage, WrapAlgorithm};
use std::sync::Arc;
use tracing::{info, warn};

/// What this host can do, probed once at startup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Platform attestation evidence is present.
    pub attestation_evidence: bool,
    /// Simulated attestation was explicitly requested.
    pub simulated_attestation: bool,
}

impl Capabilities {
    pub fn probe(config: &ServiceConfig) -> Self {
        let attestation_evidence = config
            .attestation_evidence_path
            .as_deref()
            .is_some_and(|p| p.is_file());
        Self {
            attestation_evidence,
            simulated_attestation: config.simulate_attestation,
        }
    }

    /// Whether secure key release can work here.
    pub fn can_attest(&self) -> bool {
        self.attestation_evidence || self.simulated_attestation
    }
}

/// A configured encryption core, ready to serve requests.
pub struct Deployment {
    pub config: ServiceConfig,
    pub capabilities: Capabilities,
    pub key_store: Arc<KeyStore>,
    pub envelope: Arc<EnvelopeService>,
    /// The protecting key new documents are wrapped under.
    pub key_reference: KeyReference,
    /// Key pair that wrapped documents before `key_reference`, kept for
    /// reading them.
    pub previous_key_reference: Option<KeyReference>,
}

impl Deployment {
    /// Builds the core against a vault reachable over HTTP.
    pub async fn connect(config: ServiceConfig) -> VaultResult<Self> {
        let vault = Arc::new(HttpKeyVault::from_config(&config)?);
        Self::start(config, vault, None).await
    }

    /// Builds the core. `attestor` overrides the one derived from the
    /// configuration and is ignored outside secure-key-release mode.
    pub async fn start(
        config: ServiceConfig,
        vault: Arc<dyn KeyVault>,
        attestor: Option<Arc<dyn Attestor>>,
    ) -> VaultResult<Self> {
        Self::start_with_hook(config, vault, attestor, None).await
    }

    /// Like [`Self::start`], observing released key material with `hook`.
    pub async fn start_with_hook(
        config: ServiceConfig,
        vault: Arc<dyn KeyVault>,
        attestor: Option<Arc<dyn Attestor>>,
        hook: Option<Arc<dyn KeyMaterialHook>>,
    ) -> VaultResult<Self> {
        config.validate()?;
        let capabilities = Capabilities::probe(&config);
        let key_store = Arc::new(KeyStore::new(vault.clone()));
        let direct: Arc<dyn KeyWrapper> = Arc::new(DirectWrap::new(key_store.clone()));

        let (secure_release, key_reference) = match config.mode {
            WrapMode::Direct => {
                if attestor.is_some() {
                    warn!("Attestor supplied to a direct-mode deployment; ignoring it");
                }
                let key_ref = key_store
                    .get_or_create_asymmetric_keypair(&config.key_reference_name)
                    .await?;
                (None, key_ref)
            }
            WrapMode::SecureKeyRelease => {
                let attestor = match attestor {
                    Some(a) => a,
                    None => attestor_from_config(&config, &capabilities)?.ok_or_else(|| {
                        VaultError::Config("no attestor for secure-key-release mode".to_string())
                    })?,
                };
                let endpoint = config.attestation_endpoint.as_deref().unwrap_or_default();
                let key_ref = key_store
                    .resolve_release_key(&config.key_reference_name, endpoint)
                    .await?;

                let mut client = KeyReleaseClient::new(attestor, vault, config.request_timeout());
                if let Some(hook) = hook {
                    client = client.with_hook(hook);
                }
                let wrapper: Arc<dyn KeyWrapper> = Arc::new(SecureKeyRelease::new(client));
                (Some(wrapper), key_ref)
            }
        };

        let previous_key_reference = match config.previous_key_reference_name.as_deref() {
            Some(name) => Some(key_store.resolve_asymmetric_keypair(name).await?),
            None => None,
        };

        let envelope = Arc::new(EnvelopeService::new(config.mode, direct, secure_release)?);
        info!(
            "Encryption core started: mode={:?}, key={}, search={:?}",
            config.mode,
            key_reference.key_id(),
            config.search_encryption
        );

        Ok(Self {
            config,
            capabilities,
            key_store,
            envelope,
            key_reference,
            previous_key_reference,
        })
    }

    /// Picks the key that reads packages wrapped with `algorithm`,
    /// preferring the one named in the package's `key_id`.
    pub fn read_reference(
        &self,
        algorithm: WrapAlgorithm,
        key_id: Option<&str>,
    ) -> VaultResult<&KeyReference> {
        let wanted = key_id.and_then(parse_key_id).map(|(name, _)| name);
        [Some(&self.key_reference), self.previous_key_reference.as_ref()]
            .into_iter()
            .flatten()
            .filter(|r| protection_matches(algorithm, r))
            .find(|r| wanted.is_none_or(|name| name == r.name))
            .ok_or_else(|| {
                VaultError::Decryption(format!(
                    "no key on this deployment reads {algorithm} packages sealed under {}",
                    key_id.unwrap_or("an unnamed key")
                ))
            })
    }

    /// Decrypts a package with whichever configured key wrapped it.
    pub async fn decrypt(&self, package: &EncryptedPackage) -> VaultResult<Vec<u8>> {
        let key_ref = self.read_reference(package.algorithm, package.key_id.as_deref())?;
        self.envelope.decrypt(package, key_ref).await
    }

    /// Re-seals a package under the current key and mode.
    pub async fn reencrypt(&self, package: &EncryptedPackage) -> VaultResult<EncryptedPackage> {
        let key_ref = self.read_reference(package.algorithm, package.key_id.as_deref())?;
        self.envelope
            .reencrypt(package, key_ref, &self.key_reference)
            .await
    }
}
