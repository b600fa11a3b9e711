//! Engine error types.

use larder_metadata::MetadataError;
use larder_signer::SignerError;
use larder_storage::StorageError;

/// Engine error type.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage backend error: {0}")]
    StorageBackend(#[source] StorageError),

    /// Retrieved or uploaded bytes do not hash to the name they were stored under.
    #[error("corruption: expected {expected}, got {actual}")]
    Corruption { expected: String, actual: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("metadata error: {0}")]
    Metadata(#[source] MetadataError),

    #[error("signing error: {0}")]
    Signing(#[from] SignerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::StorageBackend(_) => "storage_error",
            Self::Corruption { .. } => "corruption",
            Self::InvalidInput(_) => "invalid_input",
            Self::Metadata(_) => "metadata_error",
            Self::Signing(_) => "signing_error",
            Self::Io(_) => "io_error",
        }
    }

    /// Whether repeating the same call may succeed.
    pub fn is_transient(&self) -> bool {
        use std::io::ErrorKind;
        match self {
            Self::StorageBackend(e) => e.is_transient(),
            Self::Io(e) => matches!(
                e.kind(),
                ErrorKind::Interrupted
                    | ErrorKind::TimedOut
                    | ErrorKind::WouldBlock
                    | ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(key) => Self::NotFound(key),
            other => Self::StorageBackend(other),
        }
    }
}

impl From<MetadataError> for EngineError {
    fn from(e: MetadataError) -> Self {
        match e {
            MetadataError::NotFound(what) => Self::NotFound(what),
            MetadataError::AlreadyExists(what) => Self::Conflict(format!("{what} already exists")),
            MetadataError::Constraint(what) => Self::Conflict(what),
            // A chunk was reclaimed between upload and commit; pushing again succeeds.
            e @ MetadataError::MissingChunks { .. } => Self::Conflict(e.to_string()),
            other => Self::Metadata(other),
        }
    }
}

impl From<larder_core::Error> for EngineError {
    fn from(e: larder_core::Error) -> Self {
        match e {
            larder_core::Error::HashMismatch { expected, actual } => {
                Self::Corruption { expected, actual }
            }
            other => Self::InvalidInput(other.to_string()),
        }
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
