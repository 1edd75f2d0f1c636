//! Deployment configuration.

use crate::error::{VaultError, VaultResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How new document keys are protected. Exactly one per deployment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WrapMode {
    /// RSA-OAEP with a key pair held in the key store.
    #[default]
    Direct,
    /// Attestation-gated release of a key-encryption key.
    SecureKeyRelease,
}

/// Which searchable-encryption backend to use, if any.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchEncryptionMode {
    #[default]
    Off,
    /// Deterministic keyed encoding. Development only.
    Simulated,
    /// Distance-comparison-preserving encryption.
    Real,
}

/// Configuration for the document encryption core.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Key protection mode for newly written documents.
    pub mode: WrapMode,

    /// Name of the protecting key in the key store.
    pub key_reference_name: String,

    /// RSA key pair documents were wrapped under before the current key,
    /// typically the direct-mode key before a switch to secure key release.
    /// Resolved at startup and only ever read.
    pub previous_key_reference_name: Option<String>,

    /// Attestation authority URL. Required in secure-key-release mode.
    pub attestation_endpoint: Option<String>,

    pub search_encryption: SearchEncryptionMode,

    /// Name of the search master key in the key store.
    pub search_encryption_key_name: String,

    /// Base URL of the key vault (e.g., "https://myvault.vault.azure.net").
    pub vault_url: String,

    pub vault_api_version: String,

    /// Bearer token for the key vault, if it is not ambient.
    pub vault_bearer_token: Option<String>,

    /// File holding the platform attestation evidence.
    pub attestation_evidence_path: Option<PathBuf>,

    /// Use the simulated attestation authority. Development only.
    pub simulate_attestation: bool,

    /// Upper bound for each attestation and key-release call (seconds).
    pub request_timeout_secs: u64,

    /// Secret holding the persisted search encryption context.
    pub search_context_name: String,

    pub search_context_ttl_days: i64,

    /// How long a loaded search context is reused before re-reading (seconds).
    pub search_context_cache_secs: i64,

    pub vector_dimension: usize,

    /// Noise bound of the real search backend, in plaintext distance units.
    pub approximation_factor: f32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            mode: WrapMode::Direct,
            key_reference_name: "encryption-private-key".to_string(),
            previous_key_reference_name: None,
            attestation_endpoint: None,
            search_encryption: SearchEncryptionMode::Off,
            search_encryption_key_name: "search-master-key".to_string(),
            vault_url: "http://localhost:8200".to_string(),
            vault_api_version: "7.4".to_string(),
            vault_bearer_token: None,
            attestation_evidence_path: None,
            simulate_attestation: false,
            request_timeout_secs: 30,
            search_context_name: "search-encryption-context".to_string(),
            search_context_ttl_days: 30,
            search_context_cache_secs: 3600,
            vector_dimension: 768,
            approximation_factor: 0.05,
        }
    }
}

impl ServiceConfig {
    /// Parses a JSON configuration document and validates it.
    pub fn from_json(json: &str) -> VaultResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| VaultError::Config(format!("unparseable configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field requirements.
    pub fn validate(&self) -> VaultResult<()> {
        if self.key_reference_name.trim().is_empty() {
            return Err(VaultError::Config("key_reference_name is empty".to_string()));
        }

        if let Some(previous) = self.previous_key_reference_name.as_deref() {
            if previous.trim().is_empty() {
                return Err(VaultError::Config("previous_key_reference_name is empty".to_string()));
            }
            if previous == self.key_reference_name {
                return Err(VaultError::Config(
                    "previous_key_reference_name repeats key_reference_name".to_string(),
                ));
            }
        }

        match self.mode {
            WrapMode::SecureKeyRelease => {
                if self
                    .attestation_endpoint
                    .as_deref()
                    .is_none_or(|e| e.trim().is_empty())
                {
                    return Err(VaultError::Config(
                        "attestation_endpoint is required in secure-key-release mode".to_string(),
                    ));
                }
            }
            WrapMode::Direct => {
                if self.attestation_endpoint.is_some() {
                    return Err(VaultError::Config(
                        "attestation_endpoint is only valid in secure-key-release mode".to_string(),
                    ));
                }
            }
        }

        if self.search_encryption != SearchEncryptionMode::Off {
            if self.search_encryption_key_name.trim().is_empty() {
                return Err(VaultError::Config(
                    "search_encryption_key_name is empty".to_string(),
                ));
            }
            if self.vector_dimension == 0 {
                return Err(VaultError::Config("vector_dimension must be positive".to_string()));
            }
            if !(self.approximation_factor.is_finite() && self.approximation_factor >= 0.0) {
                return Err(VaultError::Config(
                    "approximation_factor must be a non-negative number".to_string(),
                ));
            }
        }

        if self.request_timeout_secs == 0 {
            return Err(VaultError::Config("request_timeout_secs must be positive".to_string()));
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }
}
