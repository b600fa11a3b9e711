use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignerError {
    /// A key string that is not `name:base64` of the right length.
    #[error("malformed key: {0}")]
    KeyParsing(String),

    /// The configured key source could not be read.
    #[error("cannot load signing key: {0}")]
    KeyLoad(String),

    #[error("signature does not match")]
    VerificationFailed,

    #[error("malformed signature: {0}")]
    InvalidSignature(String),
}

pub type SignerResult<T> = std::result::Result<T, SignerError>;
