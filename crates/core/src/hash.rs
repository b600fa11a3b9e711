//! SHA-256 content hashes and their textual encodings.
//!
//! Every piece of content in the cache is identified by a [`ContentHash`].
//! Whole objects use the [`NarHash`] wrapper, which knows the Nix-facing
//! renderings (`sha256:<nix32>` in narinfo, `sha256-<base64>` SRI).

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// A SHA-256 content hash represented as 32 bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Compute the SHA-256 of a buffer.
    pub fn compute(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Start an incremental hash.
    pub fn hasher() -> ContentHasher {
        ContentHasher(Sha256::new())
    }

    fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            Error::InvalidHash(format!("expected 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != 64 {
            return Err(Error::InvalidHash(format!(
                "expected 64 hex chars, got {}",
                s.len()
            )));
        }
        let bytes = hex::decode(s).map_err(|e| Error::InvalidHash(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_base64(s: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(s)
            .map_err(|e| Error::InvalidHash(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn from_nix_base32(s: &str) -> Result<Self> {
        let bytes = nix_base32::from_nix_base32(s)
            .ok_or_else(|| Error::InvalidHash(format!("invalid nix base32: {s}")))?;
        Self::from_slice(&bytes)
    }

    pub fn to_nix_base32(&self) -> String {
        nix_base32::to_nix_base32(&self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

/// Incremental SHA-256 hasher that also counts the bytes it has seen.
pub struct ContentHasher(Sha256);

impl ContentHasher {
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> ContentHash {
        ContentHash(self.0.finalize().into())
    }
}

/// The content hash of a whole object (a NAR).
///
/// Serialized and displayed as lowercase hex, which is also how it is
/// keyed in the metadata store.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NarHash(ContentHash);

impl NarHash {
    pub const fn from_content_hash(hash: ContentHash) -> Self {
        Self(hash)
    }

    pub fn compute(data: &[u8]) -> Self {
        Self(ContentHash::compute(data))
    }

    pub fn content_hash(&self) -> &ContentHash {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        ContentHash::from_hex(s).map(Self)
    }

    /// Parse from SRI format (`sha256-<base64>`).
    pub fn from_sri(s: &str) -> Result<Self> {
        let b64 = s
            .strip_prefix("sha256-")
            .ok_or_else(|| Error::InvalidHash(format!("expected sha256- prefix, got: {s}")))?;
        ContentHash::from_base64(b64).map(Self)
    }

    pub fn to_sri(&self) -> String {
        format!("sha256-{}", self.0.to_base64())
    }

    /// Parse the narinfo form (`sha256:<nix32>`). Hex after the colon is
    /// accepted too, since older clients emit it.
    pub fn from_typed(s: &str) -> Result<Self> {
        let digest = s
            .strip_prefix("sha256:")
            .ok_or_else(|| Error::InvalidHash(format!("expected sha256: prefix, got: {s}")))?;
        match digest.len() {
            52 => ContentHash::from_nix_base32(digest).map(Self),
            64 => ContentHash::from_hex(digest).map(Self),
            n => Err(Error::InvalidHash(format!(
                "unexpected sha256 digest length {n}"
            ))),
        }
    }

    /// Render in narinfo form (`sha256:<nix32>`).
    pub fn to_typed(&self) -> String {
        format!("sha256:{}", self.0.to_nix_base32())
    }
}

impl fmt::Debug for NarHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NarHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for NarHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for NarHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.starts_with("sha256:") {
            Self::from_typed(s)
        } else if s.starts_with("sha256-") {
            Self::from_sri(s)
        } else {
            Self::from_hex(s)
        }
    }
}

/// Incremental hasher over a whole object that tracks its length.
pub struct NarHasher {
    inner: ContentHasher,
    size: u64,
}

impl NarHasher {
    pub fn new() -> Self {
        Self {
            inner: ContentHash::hasher(),
            size: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.size += data.len() as u64;
    }

    /// Bytes hashed so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn finalize(self) -> (NarHash, u64) {
        (NarHash(self.inner.finalize()), self.size)
    }
}

impl Default for NarHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_roundtrip() {
        let hash = ContentHash::compute(b"hello world");

        let parsed = ContentHash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, parsed);

        let parsed = ContentHash::from_base64(&hash.to_base64()).unwrap();
        assert_eq!(hash, parsed);

        let parsed = ContentHash::from_nix_base32(&hash.to_nix_base32()).unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn test_known_sha256() {
        let hash = ContentHash::compute(b"");
        assert_eq!(
            hash.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_nar_hash_encodings() {
        let nar_hash = NarHash::compute(b"test");

        let sri = nar_hash.to_sri();
        assert!(sri.starts_with("sha256-"));
        assert_eq!(NarHash::from_sri(&sri).unwrap(), nar_hash);

        let typed = nar_hash.to_typed();
        assert_eq!(typed.len(), "sha256:".len() + 52);
        assert_eq!(NarHash::from_typed(&typed).unwrap(), nar_hash);

        assert_eq!(typed.parse::<NarHash>().unwrap(), nar_hash);
        assert_eq!(nar_hash.to_string().parse::<NarHash>().unwrap(), nar_hash);
    }

    #[test]
    fn test_invalid_hashes_rejected() {
        assert!(ContentHash::from_hex("abcd").is_err());
        assert!(ContentHash::from_hex(&"zz".repeat(32)).is_err());
        assert!(NarHash::from_typed("md5:abc").is_err());
        assert!(NarHash::from_sri("sha256-!!!").is_err());
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let mut hasher = NarHasher::new();
        for piece in data.chunks(7) {
            hasher.update(piece);
        }
        let (hash, size) = hasher.finalize();
        assert_eq!(hash, NarHash::compute(data));
        assert_eq!(size, data.len() as u64);
    }
}
