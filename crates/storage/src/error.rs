use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no such blob: {0}")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("s3: {source}")]
    S3 {
        source: Box<dyn std::error::Error + Send + Sync>,
        /// Throttling, 5xx or a transport failure.
        retryable: bool,
    },

    #[error("bad key {0:?}")]
    InvalidKey(String),

    #[error("bad range: {0}")]
    InvalidRange(String),

    #[error("storage configuration: {0}")]
    Config(String),
}

impl StorageError {
    /// Whether repeating the same call may succeed.
    pub fn is_transient(&self) -> bool {
        use std::io::ErrorKind::*;
        match self {
            Self::S3 { retryable, .. } => *retryable,
            Self::Io(e) => matches!(
                e.kind(),
                Interrupted | TimedOut | WouldBlock | ConnectionReset | ConnectionAborted | BrokenPipe
            ),
            Self::NotFound(_) | Self::InvalidKey(_) | Self::InvalidRange(_) | Self::Config(_) => {
                false
            }
        }
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_failures_are_transient() {
        let timeout = StorageError::Io(std::io::Error::from(std::io::ErrorKind::TimedOut));
        assert!(timeout.is_transient());
        let denied = StorageError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(!denied.is_transient());
        assert!(!StorageError::NotFound("chunks/x".into()).is_transient());
    }
}
