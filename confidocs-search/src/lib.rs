//! Searchable encryption for embedding vectors and indexed text.
//!
//! Sits between the document pipeline and an external vector index. Vectors
//! are transformed so that similarity rankings survive, text fields are
//! encrypted and tagged with the context they belong to.
//!
//! # Architecture
//!
//! An [`EncryptionContext`] is persisted per index by the [`ContextManager`].
//! A [`SearchEncryption`] binds to one context and one backend:
//! - [`SimulatedCipher`]: deterministic keyed encoding, exact rankings
//! - [`DcpeCipher`]: scale-and-perturb encryption, rankings within the
//!   configured approximation factor
//!
//! Both derive their keys with HKDF from a master key held in the key store
//! (plain in direct mode, wrapped under secure key release).

pub mod backend;
pub mod context;
pub mod dcpe;
mod error;
mod keys;
pub mod layer;
pub mod master_key;
pub mod similarity;
pub mod simulated;
mod transform;

pub use backend::{EncryptedVector, NOISE_IV_SIZE, SearchCipher, cipher_for};
pub use context::{ContextInfo, ContextManager, ContextSettings, EncryptionContext, SearchAlgorithm};
pub use dcpe::DcpeCipher;
pub use error::{SearchError, SearchResult};
pub use keys::MIN_MASTER_KEY_SIZE;
pub use layer::SearchEncryption;
pub use master_key::MasterKey;
pub use similarity::{cosine_similarity, rank_by_similarity};
pub use simulated::SimulatedCipher;
