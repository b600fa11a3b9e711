//! Whole-object records: a NAR hash mapped to its ordered chunk sequence.

use crate::error::{EngineError, EngineResult};
use crate::metrics;
use larder_core::{ChunkHash, ChunkRef, NarHash, ObjectManifest};
use larder_metadata::MetadataStore;
use larder_metadata::models::{ObjectRow, ReleasedObject};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::instrument;

pub use larder_metadata::models::PutObjectOutcome;

/// A stored object with its access bookkeeping.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub manifest: ObjectManifest,
    pub created_at: OffsetDateTime,
    pub last_accessed_at: OffsetDateTime,
}

/// The object store. Objects are shared by every cache entry that points
/// at them and hold one chunk reference per occurrence.
pub struct NarStore {
    metadata: Arc<dyn MetadataStore>,
}

impl NarStore {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self { metadata }
    }

    /// Record an object whose chunks are all stored.
    ///
    /// An existing object is `Deduplicated` and its chunk references are
    /// left alone. Otherwise every chunk gains one reference per occurrence
    /// in the same transaction that records the sequence; a chunk that is
    /// not stored (or is being reclaimed) aborts the whole call with
    /// `Conflict` and nothing is committed.
    #[instrument(skip(self, manifest), fields(nar_hash = %manifest.nar_hash, chunks = manifest.chunk_count()))]
    pub async fn put_object(&self, manifest: &ObjectManifest) -> EngineResult<PutObjectOutcome> {
        manifest.validate()?;
        let outcome = self
            .metadata
            .put_object(manifest, OffsetDateTime::now_utc())
            .await?;
        match outcome {
            PutObjectOutcome::Created => metrics::OBJECTS_CREATED.inc(),
            PutObjectOutcome::Deduplicated => metrics::OBJECTS_DEDUPLICATED.inc(),
        }
        Ok(outcome)
    }

    /// The object's chunk sequence.
    pub async fn get_object(&self, nar_hash: &NarHash) -> EngineResult<StoredObject> {
        let hex = nar_hash.to_hex();
        let row = self
            .metadata
            .get_object(&hex)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("object {nar_hash}")))?;

        let chunks = self
            .metadata
            .get_object_chunks(&hex)
            .await?
            .into_iter()
            .map(|c| {
                let hash = ChunkHash::from_hex(&c.chunk_hash)?;
                Ok(ChunkRef::new(hash, c.size_bytes.max(0) as u64))
            })
            .collect::<EngineResult<Vec<_>>>()?;

        if chunks.len() as i64 != row.chunk_count {
            return Err(EngineError::Corruption {
                expected: format!("{} chunks for object {nar_hash}", row.chunk_count),
                actual: format!("{} chunks", chunks.len()),
            });
        }

        let manifest = ObjectManifest::new(*nar_hash, row.nar_size.max(0) as u64, chunks)
            .map_err(|e| EngineError::Corruption {
                expected: format!("consistent manifest for object {nar_hash}"),
                actual: e.to_string(),
            })?;

        Ok(StoredObject {
            manifest,
            created_at: row.created_at,
            last_accessed_at: row.last_accessed_at,
        })
    }

    /// Whether an object is recorded.
    pub async fn contains(&self, nar_hash: &NarHash) -> EngineResult<bool> {
        Ok(self.metadata.get_object(&nar_hash.to_hex()).await?.is_some())
    }

    /// Drop an object and one chunk reference per occurrence.
    ///
    /// The "no cache entry references it" check runs in the same
    /// transaction as the decrements; if an entry still (or again) points
    /// at the object the result is `Conflict` and nothing changes.
    #[instrument(skip(self), fields(nar_hash = %nar_hash))]
    pub async fn release_object(&self, nar_hash: &NarHash) -> EngineResult<ReleasedObject> {
        self.try_release(&nar_hash.to_hex()).await?.ok_or_else(|| {
            EngineError::Conflict(format!("object {nar_hash} is still referenced"))
        })
    }

    /// Like [`NarStore::release_object`] but reports a live reference as `None`.
    pub(crate) async fn try_release(&self, nar_hash: &str) -> EngineResult<Option<ReleasedObject>> {
        Ok(self.metadata.release_object_if_unreferenced(nar_hash).await?)
    }

    /// Objects no cache entry points at, least recently accessed first.
    pub async fn unreferenced_objects(&self) -> EngineResult<Vec<ObjectRow>> {
        Ok(self.metadata.get_unreferenced_objects().await?)
    }

    /// Total logical bytes of all stored objects.
    pub async fn total_bytes(&self) -> EngineResult<u64> {
        Ok(self.metadata.total_object_bytes().await?)
    }
}
