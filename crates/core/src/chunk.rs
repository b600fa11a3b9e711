//! Chunk identity and payloads.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::hash::ContentHash;
use crate::{Error, Result};

/// SHA-256 of a chunk's bytes; the chunk's identity everywhere.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkHash(ContentHash);

impl ChunkHash {
    pub const fn from_content_hash(hash: ContentHash) -> Self {
        Self(hash)
    }

    pub fn compute(data: &[u8]) -> Self {
        Self(ContentHash::compute(data))
    }

    pub fn content_hash(&self) -> &ContentHash {
        &self.0
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        ContentHash::from_hex(s).map(Self)
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    /// Key of this chunk's blob in the object store.
    ///
    /// Two levels of hash-prefix fan-out keep filesystem directories small.
    pub fn to_object_key(&self) -> String {
        let hex = self.to_hex();
        format!("chunks/{}/{}/{}", &hex[..2], &hex[2..4], hex)
    }

    /// Inverse of [`ChunkHash::to_object_key`].
    pub fn from_object_key(key: &str) -> Option<Self> {
        let rest = key.strip_prefix("chunks/")?;
        let mut parts = rest.split('/');
        let (a, b, hex) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() || !hex.starts_with(a) || hex.get(2..4) != Some(b) {
            return None;
        }
        Self::from_hex(hex).ok()
    }
}

impl fmt::Debug for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// One position in an object's chunk sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub hash: ChunkHash,
    pub size: u64,
}

impl ChunkRef {
    pub fn new(hash: ChunkHash, size: u64) -> Self {
        Self { hash, size }
    }
}

/// A chunk together with its bytes.
#[derive(Clone)]
pub struct Chunk {
    pub hash: ChunkHash,
    pub data: Bytes,
}

impl Chunk {
    /// Wrap data, computing its hash.
    pub fn new(data: Bytes) -> Self {
        let hash = ChunkHash::compute(&data);
        Self { hash, data }
    }

    /// Check that this chunk is the one `expected` names.
    pub fn verify(&self, expected: &ChunkHash) -> Result<()> {
        if &self.hash != expected {
            return Err(Error::HashMismatch {
                expected: expected.to_hex(),
                actual: self.hash.to_hex(),
            });
        }
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn to_ref(&self) -> ChunkRef {
        ChunkRef::new(self.hash, self.size())
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("hash", &self.hash)
            .field("size", &self.data.len())
            .finish()
    }
}
