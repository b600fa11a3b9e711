//! Ed25519 signing of narinfos at fetch time.
//!
//! Keys use the Nix `name:base64` encoding so they drop straight into
//! `trusted-public-keys` and `secret-key-files`. Nothing signed is ever
//! persisted; rotating the key changes what the next pull returns.

pub mod error;
pub mod key;
pub mod signer;

pub use error::{SignerError, SignerResult};
pub use key::{KeyPair, PublicKey, SecretKey};
pub use signer::{NarInfoSigner, Signer, verify_narinfo, verify_signature};
