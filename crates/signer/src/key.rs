//! Ed25519 keys in the Nix `name:base64` encoding.

use crate::error::{SignerError, SignerResult};
use base64::Engine;
use ed25519_dalek::{SigningKey, VerifyingKey};
use larder_core::config::{PrivateKeyConfig, SigningConfig};
use std::fmt;

const STANDARD: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

fn validate_key_name(name: &str) -> SignerResult<()> {
    if name.is_empty() || name.contains(':') || name.chars().any(char::is_whitespace) {
        return Err(SignerError::KeyParsing(format!("invalid key name {name:?}")));
    }
    Ok(())
}

/// Split `name:base64` and decode the payload, which must be `len` bytes.
fn decode_nix_key(s: &str, len: usize) -> SignerResult<(String, Vec<u8>)> {
    let (name, encoded) = s
        .trim()
        .split_once(':')
        .ok_or_else(|| SignerError::KeyParsing("missing ':' between name and key".into()))?;
    validate_key_name(name)?;

    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| SignerError::KeyParsing(format!("key {name:?} is not base64: {e}")))?;
    if bytes.len() != len {
        return Err(SignerError::KeyParsing(format!(
            "key {name:?} decodes to {} bytes, want {len}",
            bytes.len()
        )));
    }
    Ok((name.to_string(), bytes))
}

fn encode_nix_key(name: &str, bytes: &[u8]) -> String {
    format!("{name}:{}", STANDARD.encode(bytes))
}

/// An ed25519 signing key. Never printed.
pub struct SecretKey {
    inner: SigningKey,
}

impl SecretKey {
    pub fn generate() -> Self {
        Self {
            inner: SigningKey::generate(&mut rand_core::OsRng),
        }
    }

    /// Parse `name:base64(secret || public)`, the format `nix-store
    /// --generate-binary-cache-key` writes.
    ///
    /// The embedded public half must match the one derived from the secret.
    pub fn from_nix_format(s: &str) -> SignerResult<(String, Self)> {
        let (name, bytes) = decode_nix_key(s, 64)?;
        let (secret, public) = bytes.split_at(32);
        let secret: [u8; 32] = secret
            .try_into()
            .map_err(|_| SignerError::KeyParsing("secret half is not 32 bytes".into()))?;

        let inner = SigningKey::from_bytes(&secret);
        if inner.verifying_key().as_bytes()[..] != *public {
            return Err(SignerError::KeyParsing(format!(
                "key {name:?}: public half does not belong to the secret"
            )));
        }
        Ok((name, Self { inner }))
    }

    pub fn to_nix_format(&self, key_name: &str) -> String {
        let mut bytes = self.inner.to_keypair_bytes().to_vec();
        let encoded = encode_nix_key(key_name, &bytes);
        bytes.fill(0);
        encoded
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: self.inner.verifying_key(),
        }
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.inner
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

/// An ed25519 verifying key.
#[derive(Clone)]
pub struct PublicKey {
    inner: VerifyingKey,
}

impl PublicKey {
    /// Parse `name:base64(public)`, the form listed in `trusted-public-keys`.
    pub fn from_nix_format(s: &str) -> SignerResult<(String, Self)> {
        let (name, bytes) = decode_nix_key(s, 32)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SignerError::KeyParsing("public key is not 32 bytes".into()))?;
        let inner = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| SignerError::KeyParsing(format!("key {name:?} is not a curve point: {e}")))?;
        Ok((name, Self { inner }))
    }

    pub fn to_nix_format(&self, key_name: &str) -> String {
        encode_nix_key(key_name, self.inner.as_bytes())
    }

    pub(crate) fn verifying_key(&self) -> &VerifyingKey {
        &self.inner
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = STANDARD.encode(self.inner.as_bytes());
        write!(f, "PublicKey({}...)", &encoded[..8])
    }
}

/// A named signing key with its public half.
pub struct KeyPair {
    /// Name embedded in every signature, e.g. `cache.example.com-1`.
    pub name: String,
    pub secret: SecretKey,
    pub public: PublicKey,
}

impl KeyPair {
    /// Load the key pair described by the signing configuration.
    ///
    /// The name embedded in a loaded key must equal `config.key_name`.
    /// `Generate` yields an ephemeral key that changes on every start.
    pub fn load(config: &SigningConfig) -> SignerResult<Self> {
        validate_key_name(&config.key_name)?;

        let encoded = match &config.private_key {
            PrivateKeyConfig::File { path } => std::fs::read_to_string(path).map_err(|e| {
                SignerError::KeyLoad(format!("reading {}: {e}", path.display()))
            })?,
            PrivateKeyConfig::Env { var } => std::env::var(var)
                .map_err(|e| SignerError::KeyLoad(format!("environment variable {var}: {e}")))?,
            PrivateKeyConfig::Value { key } => key.clone(),
            PrivateKeyConfig::Generate => {
                tracing::warn!(
                    key_name = %config.key_name,
                    "generating an ephemeral signing key; signatures will not verify after restart"
                );
                return Ok(Self::generate(config.key_name.clone()));
            }
        };

        let keypair = Self::from_nix_secret_key(&encoded)?;
        if keypair.name != config.key_name {
            return Err(SignerError::KeyLoad(format!(
                "key is named {:?} but signing.key_name is {:?}",
                keypair.name, config.key_name
            )));
        }
        tracing::info!(key_name = %keypair.name, "loaded signing key");
        Ok(keypair)
    }

    pub fn generate(name: impl Into<String>) -> Self {
        let secret = SecretKey::generate();
        let public = secret.public_key();
        Self {
            name: name.into(),
            secret,
            public,
        }
    }

    pub fn from_nix_secret_key(s: &str) -> SignerResult<Self> {
        let (name, secret) = SecretKey::from_nix_format(s)?;
        let public = secret.public_key();
        Ok(Self {
            name,
            secret,
            public,
        })
    }

    pub fn to_nix_secret_key(&self) -> String {
        self.secret.to_nix_format(&self.name)
    }

    /// The line to add to `trusted-public-keys`.
    pub fn to_nix_public_key(&self) -> String {
        self.public.to_nix_format(&self.name)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("name", &self.name)
            .field("public", &self.public)
            .finish()
    }
}
