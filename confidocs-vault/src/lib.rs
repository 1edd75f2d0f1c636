//! Key management and envelope encryption for confidential documents.
//!
//! Provides:
//! - A key store adapter with idempotent get-or-create over a remote vault
//! - Remote attestation for secure-key-release deployments
//! - Attestation-gated key release with wipe-on-drop key handling
//! - The envelope encryption service, polymorphic over both wrap modes
//! - Configuration and one-shot startup wiring

pub mod attestation;
pub mod bootstrap;
pub mod config;
pub mod envelope;
pub mod error;
pub mod http_vault;
pub mod key_release;
pub mod key_store;
pub mod memory_vault;
pub mod wrapper;

pub use bootstrap::{Capabilities, Deployment};
pub use config::{SearchEncryptionMode, ServiceConfig, WrapMode};
pub use envelope::EnvelopeService;
pub use error::{DocumentError, ErrorKind, ReleaseFailure, VaultError, VaultResult};
pub use key_store::{KeyProtection, KeyReference, KeyStore, KeyVault, StorageKind};
