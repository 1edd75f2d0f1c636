//! Error taxonomy for key management and envelope encryption.
//!
//! Messages name keys and documents but never carry key bytes, wrapped
//! keys, attestation tokens or evidence.

use std::fmt;
use thiserror::Error;

/// Result type for vault operations.
pub type VaultResult<T> = Result<T, VaultError>;

/// Why a secure key release failed. Callers branch on this: only
/// [`ReleaseFailure::Transport`] is worth retrying.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseFailure {
    /// The attestation authority rejected the evidence or returned garbage.
    AttestationRejected,
    /// The key store refused to release the key (policy mismatch).
    PolicyDenied,
    /// Network failure or timeout talking to the authority or the key store.
    Transport,
}

impl fmt::Display for ReleaseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AttestationRejected => "attestation rejected",
            Self::PolicyDenied => "policy denied",
            Self::Transport => "transport",
        })
    }
}

/// Why an attestation request failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttestationFailure {
    Unreachable,
    Rejected,
    Malformed,
}

impl fmt::Display for AttestationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unreachable => "authority unreachable",
            Self::Rejected => "evidence rejected",
            Self::Malformed => "unparseable response",
        })
    }
}

/// Error returned by an attestation client.
#[derive(Debug, Error)]
#[error("attestation failed ({kind}): {message}")]
pub struct AttestationError {
    pub kind: AttestationFailure,
    pub message: String,
}

impl AttestationError {
    pub fn new(kind: AttestationFailure, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Classification of key-store failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyStoreErrorKind {
    NotFound,
    Denied,
    Conflict,
    /// The name exists but holds a different kind of object.
    WrongKind,
    Transport,
    Invalid,
}

impl fmt::Display for KeyStoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotFound => "not found",
            Self::Denied => "access denied",
            Self::Conflict => "conflict",
            Self::WrongKind => "wrong kind",
            Self::Transport => "transport",
            Self::Invalid => "invalid response",
        })
    }
}

/// Error returned by a key-vault collaborator or the key store adapter.
#[derive(Debug, Error)]
#[error("key store error ({kind}): {message}")]
pub struct KeyStoreError {
    pub kind: KeyStoreErrorKind,
    pub message: String,
}

impl KeyStoreError {
    pub fn new(kind: KeyStoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(KeyStoreErrorKind::NotFound, message)
    }

    pub fn wrong_kind(message: impl Into<String>) -> Self {
        Self::new(KeyStoreErrorKind::WrongKind, message)
    }
}

impl From<reqwest::Error> for KeyStoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::new(KeyStoreErrorKind::Invalid, e.to_string())
        } else {
            Self::new(KeyStoreErrorKind::Transport, e.to_string())
        }
    }
}

/// Stable label for an error, suitable for user-visible reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Encryption,
    Decryption,
    Attestation,
    KeyRelease(ReleaseFailure),
    KeyStore,
    Config,
}

/// Errors from key management and envelope encryption.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error(transparent)]
    Attestation(#[from] AttestationError),

    #[error("key release failed ({cause}): {message}")]
    KeyRelease {
        cause: ReleaseFailure,
        message: String,
    },

    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl VaultError {
    pub fn key_release(cause: ReleaseFailure, message: impl Into<String>) -> Self {
        Self::KeyRelease {
            cause,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Encryption(_) => ErrorKind::Encryption,
            Self::Decryption(_) => ErrorKind::Decryption,
            Self::Attestation(_) => ErrorKind::Attestation,
            Self::KeyRelease { cause, .. } => ErrorKind::KeyRelease(*cause),
            Self::KeyStore(_) => ErrorKind::KeyStore,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether a caller may retry with backoff. Policy denials and data
    /// errors are never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::KeyRelease { cause, .. } => *cause == ReleaseFailure::Transport,
            Self::Attestation(e) => e.kind == AttestationFailure::Unreachable,
            Self::KeyStore(e) => e.kind == KeyStoreErrorKind::Transport,
            _ => false,
        }
    }
}

/// A failure tied to the document it happened on.
#[derive(Debug, Error)]
#[error("document {document_id}: {source}")]
pub struct DocumentError {
    pub document_id: String,
    #[source]
    pub source: VaultError,
}

impl DocumentError {
    pub fn new(document_id: impl Into<String>, source: VaultError) -> Self {
        Self {
            document_id: document_id.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}
