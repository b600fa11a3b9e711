use thiserror::Error;

/// Validation failures for the domain types in this crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error("bad store path: {0}")]
    InvalidStorePath(String),

    #[error("bad hash: {0}")]
    InvalidHash(String),

    #[error("content hash is {actual}, expected {expected}")]
    HashMismatch { expected: String, actual: String },

    #[error("chunking: {0}")]
    InvalidChunking(String),

    #[error("bad cache name: {0}")]
    InvalidCacheName(String),

    #[error("manifest: {0}")]
    Manifest(String),

    #[error("narinfo: {0}")]
    NarInfoParse(String),

    #[error("config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
