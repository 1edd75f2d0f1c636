//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use confidocs_vault::attestation::SimulatedAttestor;
use confidocs_vault::key_release::KeyMaterialHook;
use confidocs_vault::key_store::{KeySpec, KeyVault};
use confidocs_vault::memory_vault::MemoryKeyVault;
use confidocs_vault::{Deployment, ServiceConfig, WrapMode};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const AUTHORITY: &str = "https://attest.test.example";
pub const KEK_NAME: &str = "document-kek";
pub const RSA_KEY_NAME: &str = "document-rsa";

pub fn direct_config() -> ServiceConfig {
    ServiceConfig {
        key_reference_name: RSA_KEY_NAME.into(),
        ..ServiceConfig::default()
    }
}

pub fn skr_config() -> ServiceConfig {
    ServiceConfig {
        mode: WrapMode::SecureKeyRelease,
        key_reference_name: KEK_NAME.into(),
        attestation_endpoint: Some(AUTHORITY.into()),
        simulate_attestation: true,
        ..ServiceConfig::default()
    }
}

/// A memory vault with a releasable key-encryption key provisioned.
pub async fn vault_with_kek() -> Arc<MemoryKeyVault> {
    let vault = Arc::new(MemoryKeyVault::new());
    vault
        .create_key(KEK_NAME, &KeySpec::releasable(AUTHORITY))
        .await
        .expect("provision KEK");
    vault
}

pub async fn direct_deployment(vault: Arc<MemoryKeyVault>) -> Deployment {
    Deployment::start(direct_config(), vault, None)
        .await
        .expect("direct deployment starts")
}

pub async fn skr_deployment(
    vault: Arc<MemoryKeyVault>,
    attestor: Arc<SimulatedAttestor>,
    hook: Option<Arc<dyn KeyMaterialHook>>,
) -> Deployment {
    Deployment::start_with_hook(skr_config(), vault, Some(attestor), hook)
        .await
        .expect("SKR deployment starts")
}

/// Counts key material entering and leaving the process.
#[derive(Default)]
pub struct CountingHook {
    pub acquired: AtomicUsize,
    pub discarded: AtomicUsize,
}

impl CountingHook {
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn discarded(&self) -> usize {
        self.discarded.load(Ordering::SeqCst)
    }

    /// Material currently held by the process.
    pub fn resident(&self) -> usize {
        self.acquired() - self.discarded()
    }
}

impl KeyMaterialHook for CountingHook {
    fn on_acquired(&self, _key_name: &str) {
        self.acquired.fetch_add(1, Ordering::SeqCst);
    }

    fn on_discarded(&self, _key_name: &str) {
        self.discarded.fetch_add(1, Ordering::SeqCst);
    }
}
