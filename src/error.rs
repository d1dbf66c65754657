//! Error types for the field encryption engine

use thiserror::Error;

/// Result type alias for envelope encryption operations
pub type Result<T> = std::result::Result<T, EnvelopeError>;

/// Errors that can occur during envelope encryption operations
///
/// Every variant is surfaced to the caller. None of them may be turned into
/// a plaintext fallback.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// Encryption enabled but the KEK configuration is missing or malformed
    #[error("Configuration error: {0}")]
    Config(String),

    /// The key catalog has no active key; run `crypto-init`
    #[error("No active encryption key (run crypto-init)")]
    NoActiveKey,

    /// Network or permission failure talking to the KMS, including timeouts
    #[error("KMS unavailable: {0}")]
    KmsUnavailable(String),

    /// A wrapped DEK failed authentication (tamper or wrong KEK)
    #[error("Unwrap authentication failure: {0}")]
    UnwrapAuthFailure(String),

    /// A field ciphertext failed authentication or could not be parsed
    #[error("Invalid ciphertext: {0}")]
    InvalidCiphertext(String),

    /// A ciphertext references a label missing from the key catalog
    #[error("Unknown key label: {0}")]
    UnknownLabel(String),

    /// A key with this label already exists
    #[error("Duplicate key label: {0}")]
    DuplicateLabel(String),

    /// A rotation is already running, or finalize does not match it
    #[error("Rotation conflict: {0}")]
    RotationInProgressConflict(String),

    /// Finalize requested while fields still carry the old key
    #[error("Rotation to {label} incomplete: {remaining} fields remaining")]
    RotationIncomplete { label: String, remaining: u64 },

    /// Finalize requested before every process could observe the new write label
    #[error("Write label transition window still open for {label}: retry in {wait_secs}s")]
    TransitionWindowOpen { label: String, wait_secs: i64 },

    /// `crypto-init` on a catalog that already has an active key
    #[error("Encryption already initialized: active key {0} exists")]
    AlreadyInitialized(String),

    /// Readiness gate refused a protected-field operation
    #[error("Encryption not ready: {0}")]
    NotReady(String),

    /// Another operator holds the catalog lock
    #[error("Key catalog busy: {0}")]
    CatalogBusy(String),

    /// Cryptographic primitive failure (bad key size, cipher init)
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Storage operation failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EnvelopeError {
    /// Whether the caller may retry the same operation unchanged.
    ///
    /// Authentication failures and unknown labels are corruption and are
    /// never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EnvelopeError::KmsUnavailable(_)
                | EnvelopeError::Storage(_)
                | EnvelopeError::CatalogBusy(_)
                | EnvelopeError::TransitionWindowOpen { .. }
        )
    }

    /// Whether the error is an operator workflow mistake rejected up front.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            EnvelopeError::DuplicateLabel(_)
                | EnvelopeError::RotationInProgressConflict(_)
                | EnvelopeError::RotationIncomplete { .. }
                | EnvelopeError::TransitionWindowOpen { .. }
                | EnvelopeError::AlreadyInitialized(_)
        )
    }

    /// Process exit code for the operator CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            EnvelopeError::NotReady(_) | EnvelopeError::NoActiveKey => 3,
            e if e.is_misuse() => 2,
            _ => 1,
        }
    }
}

impl From<serde_json::Error> for EnvelopeError {
    fn from(err: serde_json::Error) -> Self {
        EnvelopeError::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for EnvelopeError {
    fn from(err: sqlx::Error) -> Self {
        EnvelopeError::Storage(err.to_string())
    }
}
