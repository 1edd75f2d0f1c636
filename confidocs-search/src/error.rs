//! Error types for searchable encryption.

use confidocs_vault::VaultError;
use std::fmt::Display;
use thiserror::Error;

/// Result type for search encryption operations.
pub type SearchResult<T> = Result<T, SearchError>;

/// Errors from the searchable encryption layer.
///
/// Every way a caller could end up comparing values produced under two
/// different contexts is reported as [`SearchError::ContextMismatch`] or
/// [`SearchError::MissingContext`], never as a silently wrong result.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("encryption context mismatch: bound to {expected}, got {found}")]
    ContextMismatch { expected: String, found: String },

    #[error("no encryption context available")]
    MissingContext,

    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("malformed ciphertext: {0}")]
    MalformedCiphertext(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error(transparent)]
    Vault(#[from] VaultError),
}

impl SearchError {
    pub(crate) fn context_mismatch(expected: impl Display, found: impl Display) -> Self {
        Self::ContextMismatch {
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }
}
