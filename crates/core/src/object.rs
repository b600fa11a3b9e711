//! Object manifests: the ordered chunk sequence that rebuilds an object.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::chunk::{ChunkHash, ChunkRef};
use crate::hash::{ContentHash, NarHash};
use crate::{Error, Result};

/// SHA-256 over the concatenated chunk hashes of a sequence.
///
/// Two objects with the same manifest hash are made of the same chunks in
/// the same order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManifestHash(ContentHash);

impl ManifestHash {
    pub fn compute<'a>(chunks: impl IntoIterator<Item = &'a ChunkHash>) -> Self {
        let mut hasher = Sha256::new();
        for hash in chunks {
            hasher.update(hash.content_hash().as_bytes());
        }
        Self(ContentHash::from_bytes(hasher.finalize().into()))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        ContentHash::from_hex(s).map(Self)
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }
}

impl fmt::Debug for ManifestHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ManifestHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ManifestHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Everything needed to rebuild and verify an object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectManifest {
    pub nar_hash: NarHash,
    pub nar_size: u64,
    pub chunks: Vec<ChunkRef>,
}

impl ObjectManifest {
    /// Build a manifest, checking that the chunk sizes add up.
    pub fn new(nar_hash: NarHash, nar_size: u64, chunks: Vec<ChunkRef>) -> Result<Self> {
        let manifest = Self {
            nar_hash,
            nar_size,
            chunks,
        };
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(pos) = self.chunks.iter().position(|c| c.size == 0) {
            return Err(Error::Manifest(format!("chunk {pos} is empty")));
        }
        let total: u64 = self.chunks.iter().map(|c| c.size).sum();
        if total != self.nar_size {
            return Err(Error::Manifest(format!(
                "chunk sizes sum to {total}, object size is {}",
                self.nar_size
            )));
        }
        if self.nar_size > 0 && self.chunks.is_empty() {
            return Err(Error::Manifest("non-empty object has no chunks".into()));
        }
        Ok(())
    }

    pub fn manifest_hash(&self) -> ManifestHash {
        ManifestHash::compute(self.chunks.iter().map(|c| &c.hash))
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Occurrence count per distinct chunk, sorted by hash.
    ///
    /// Sorted order is the lock order used when adjusting refcounts.
    pub fn occurrences(&self) -> Vec<(ChunkHash, u64)> {
        let mut hashes: Vec<ChunkHash> = self.chunks.iter().map(|c| c.hash).collect();
        hashes.sort_unstable();
        let mut out: Vec<(ChunkHash, u64)> = Vec::new();
        for hash in hashes {
            match out.last_mut() {
                Some((last, count)) if *last == hash => *count += 1,
                _ => out.push((hash, 1)),
            }
        }
        out
    }
}
