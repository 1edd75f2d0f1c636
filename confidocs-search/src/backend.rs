//! The interface both search encryption backends implement.

use crate::context::{EncryptionContext, SearchAlgorithm};
use crate::dcpe::DcpeCipher;
use crate::error::SearchResult;
use crate::simulated::SimulatedCipher;
use serde::{Deserialize, Serialize};

/// Size of the per-vector IV the DCPE backend seeds its noise from.
pub const NOISE_IV_SIZE: usize = 16;

/// A transformed document vector as handed to the index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EncryptedVector {
    pub values: Vec<f32>,
    /// Needed to decrypt, not to search. Absent for the simulated backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<[u8; NOISE_IV_SIZE]>,
}

/// One property-preserving transform, already keyed for a context.
///
/// Dimensions and contexts are checked by the caller.
pub trait SearchCipher: Send + Sync {
    fn algorithm(&self) -> SearchAlgorithm;

    fn encrypt_vector(&self, vector: &[f32]) -> SearchResult<EncryptedVector>;

    fn decrypt_vector(&self, vector: &EncryptedVector) -> SearchResult<Vec<f32>>;

    /// Transforms a query so it can be compared against encrypted vectors.
    fn encrypt_query(&self, vector: &[f32]) -> SearchResult<Vec<f32>>;

    fn encrypt_text(&self, text: &str) -> SearchResult<Vec<u8>>;

    fn decrypt_text(&self, payload: &[u8]) -> SearchResult<String>;
}

/// Builds the backend `context` names, keyed from `master_key`.
pub fn cipher_for(context: &EncryptionContext, master_key: &[u8]) -> SearchResult<Box<dyn SearchCipher>> {
    Ok(match context.algorithm {
        SearchAlgorithm::Simulated => Box::new(SimulatedCipher::new(context, master_key)?),
        SearchAlgorithm::Dcpe => Box::new(DcpeCipher::new(context, master_key)?),
    })
}
