//! Shared fixtures for the search encryption tests.

#![allow(dead_code)]

use chrono::{Duration, Utc};
use confidocs_search::{ContextSettings, EncryptionContext, SearchAlgorithm, SearchEncryption};
use confidocs_vault::attestation::SimulatedAttestor;
use confidocs_vault::key_store::{KeySpec, KeyVault};
use confidocs_vault::memory_vault::MemoryKeyVault;
use confidocs_vault::{Deployment, SearchEncryptionMode, ServiceConfig, WrapMode};
use std::sync::Arc;

pub const AUTHORITY: &str = "https://attest.test.example";
pub const KEK_NAME: &str = "document-kek";
pub const DIMENSION: usize = 8;
pub const MASTER_KEY: [u8; 64] = [0x5A; 64];

pub fn settings(algorithm: SearchAlgorithm) -> ContextSettings {
    ContextSettings {
        secret_name: "search-encryption-context".into(),
        algorithm,
        key_name: "search-master-key".into(),
        vector_dimension: DIMENSION,
        approximation_factor: 0.05,
        ttl: Duration::days(30),
        cache_for: Duration::hours(1),
    }
}

pub fn context(algorithm: SearchAlgorithm) -> EncryptionContext {
    EncryptionContext::new(&settings(algorithm), "v1", Utc::now())
}

/// A layer bound to a fresh context under [`MASTER_KEY`].
pub fn layer(algorithm: SearchAlgorithm) -> SearchEncryption {
    SearchEncryption::new(context(algorithm), &MASTER_KEY).expect("layer binds")
}

pub fn direct_config(search: SearchEncryptionMode) -> ServiceConfig {
    ServiceConfig {
        key_reference_name: "document-rsa".into(),
        search_encryption: search,
        vector_dimension: DIMENSION,
        ..ServiceConfig::default()
    }
}

pub fn skr_config(search: SearchEncryptionMode) -> ServiceConfig {
    ServiceConfig {
        mode: WrapMode::SecureKeyRelease,
        key_reference_name: KEK_NAME.into(),
        attestation_endpoint: Some(AUTHORITY.into()),
        simulate_attestation: true,
        search_encryption: search,
        vector_dimension: DIMENSION,
        ..ServiceConfig::default()
    }
}

pub async fn direct_deployment(vault: Arc<MemoryKeyVault>, config: ServiceConfig) -> Deployment {
    Deployment::start(config, vault, None)
        .await
        .expect("direct deployment starts")
}

pub async fn skr_deployment(vault: Arc<MemoryKeyVault>, config: ServiceConfig) -> Deployment {
    if vault.get_key(KEK_NAME).await.expect("vault reachable").is_none() {
        vault
            .create_key(KEK_NAME, &KeySpec::releasable(AUTHORITY))
            .await
            .expect("provision KEK");
    }
    let attestor = Arc::new(SimulatedAttestor::new(AUTHORITY));
    Deployment::start(config, vault, Some(attestor))
        .await
        .expect("SKR deployment starts")
}

/// A query and three candidates with clearly separated similarity to it:
/// `a` most similar, then `b`, then `c`.
pub fn ranked_fixture() -> (Vec<f32>, Vec<Vec<f32>>) {
    let pad = |head: &[f32]| {
        let mut v = head.to_vec();
        v.resize(DIMENSION, 0.0);
        v
    };
    let q = pad(&[1.0, 0.0, 0.0, 0.1]);
    let a = pad(&[0.95, 0.3, 0.0, 0.1]);
    let b = pad(&[0.6, 0.8, 0.0, 0.0]);
    let c = pad(&[0.1, 0.2, 0.97, 0.0]);
    (q, vec![a, b, c])
}
