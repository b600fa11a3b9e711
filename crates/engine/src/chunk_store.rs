//! Content-addressed chunk storage with metadata-backed reference counts.
//!
//! A chunk has a metadata row (size, refcount, lifecycle state) and a blob in
//! the storage backend under [`ChunkHash::to_object_key`]. The row is the
//! source of truth: a blob without a `valid` row is never served and is
//! reclaimable, and refcounts only ever move on `valid` rows.
//!
//! Row lifecycle: `pending` (blob being written) -> `valid` -> `deleting`
//! (GC removing the blob) -> gone. `put_if_absent` never touches refcounts;
//! the object store takes references once a whole object is durable.

use crate::error::{EngineError, EngineResult};
use crate::metrics;
use crate::retry::Backoff;
use bytes::Bytes;
use larder_core::ChunkHash;
use larder_metadata::MetadataStore;
use larder_metadata::models::{ChunkRow, ChunkState};
use larder_storage::{ObjectStore, StorageError};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::instrument;

/// Result of [`ChunkStore::put_if_absent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// This call created the chunk.
    Inserted,
    /// The chunk was already stored (or being stored by a concurrent caller).
    AlreadyPresent,
}

/// Chunk blobs plus their metadata rows.
pub struct ChunkStore {
    storage: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
    backoff: Backoff,
}

impl ChunkStore {
    pub fn new(storage: Arc<dyn ObjectStore>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self {
            storage,
            metadata,
            backoff: Backoff::default(),
        }
    }

    /// Override the retry schedule.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Store a chunk unless it already exists.
    ///
    /// Concurrent callers with the same hash all succeed. Exactly one of
    /// them sees `Inserted`, and the backend's conditional write ensures the
    /// blob is written at most once. A chunk that GC is deleting is waited
    /// out with backoff; if GC is still holding it afterwards the result is
    /// `Conflict`.
    #[instrument(skip(self, data), fields(chunk_hash = %hash, size = data.len()))]
    pub async fn put_if_absent(&self, hash: &ChunkHash, data: Bytes) -> EngineResult<PutOutcome> {
        let actual = ChunkHash::compute(&data);
        if actual != *hash {
            return Err(EngineError::Corruption {
                expected: hash.to_hex(),
                actual: actual.to_hex(),
            });
        }
        if data.is_empty() {
            return Err(EngineError::InvalidInput("empty chunk".into()));
        }

        let hex = hash.to_hex();
        let key = hash.to_object_key();
        let size = i64::try_from(data.len())
            .map_err(|_| EngineError::InvalidInput("chunk too large".into()))?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let now = OffsetDateTime::now_utc();

            if self
                .metadata
                .insert_pending_chunk(&hex, size, &key, now)
                .await?
            {
                // The row is ours: write the blob, then publish it. If the
                // write fails the pending row stays behind for GC to reap.
                self.write_blob(&key, data.clone()).await?;
                if self.metadata.mark_chunk_valid(&hex).await? {
                    metrics::CHUNKS_UPLOADED.inc();
                    metrics::BYTES_UPLOADED.inc_by(data.len() as u64);
                    tracing::debug!(chunk_hash = %hex, "stored new chunk");
                    return Ok(PutOutcome::Inserted);
                }
                // GC reaped the pending row mid-write and may have taken the
                // blob with it. Start over so the blob ends up with a row.
                tracing::debug!(chunk_hash = %hex, "pending chunk reaped during write, retrying");
                continue;
            }

            // The touch only lands on a `valid` row, so GC (which claims rows
            // last touched before its cutoff) cannot slip in between the
            // state check and the touch.
            if let Some(row) = self.metadata.touch_valid_chunk(&hex, now).await? {
                if row.refcount == 0 {
                    self.ensure_blob(&row, &data).await?;
                }
                metrics::CHUNKS_DEDUPLICATED.inc();
                return Ok(PutOutcome::AlreadyPresent);
            }

            let Some(row) = self.metadata.get_chunk(&hex).await? else {
                // Deleted since our insert attempt.
                continue;
            };

            match row.chunk_state() {
                // Published since the touch; the next pass touches it.
                ChunkState::Valid => continue,
                ChunkState::Pending => {
                    // Another caller owns the row and is writing. Writing the
                    // same bytes conditionally is harmless and means we never
                    // depend on that caller finishing.
                    self.write_blob(&key, data.clone()).await?;
                    self.metadata.mark_chunk_valid(&hex).await?;
                }
                ChunkState::Deleting => {
                    if attempt >= self.backoff.max_attempts {
                        return Err(EngineError::Conflict(format!(
                            "chunk {hex} is being garbage collected"
                        )));
                    }
                    let delay = self.backoff.delay(attempt);
                    tracing::debug!(
                        chunk_hash = %hex,
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        "chunk is being deleted, waiting"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Fetch a chunk's bytes, verified against its hash.
    ///
    /// `NotFound` if the chunk is absent or being reclaimed; `Corruption` if
    /// the stored bytes hash to something else.
    #[instrument(skip(self), fields(chunk_hash = %hash))]
    pub async fn get(&self, hash: &ChunkHash) -> EngineResult<Bytes> {
        let hex = hash.to_hex();
        let row = self
            .metadata
            .get_chunk(&hex)
            .await?
            .filter(|row| row.chunk_state() == ChunkState::Valid)
            .ok_or_else(|| EngineError::NotFound(format!("chunk {hex}")))?;

        let storage = &self.storage;
        let key = row.object_key.as_str();
        let data = self
            .backoff
            .retry("get chunk", || async move {
                storage.get(key).await.map_err(EngineError::from)
            })
            .await?;

        let actual = ChunkHash::compute(&data);
        if actual != *hash {
            metrics::CORRUPTION_DETECTED.inc();
            tracing::error!(
                chunk_hash = %hex,
                actual = %actual,
                "stored chunk does not match its hash"
            );
            return Err(EngineError::Corruption {
                expected: hex,
                actual: actual.to_hex(),
            });
        }
        Ok(data)
    }

    /// Chunk metadata row, if any.
    pub async fn info(&self, hash: &ChunkHash) -> EngineResult<Option<ChunkRow>> {
        Ok(self.metadata.get_chunk(&hash.to_hex()).await?)
    }

    /// Add `by` references. `NotFound` unless the chunk is `valid`.
    pub async fn increment_ref(&self, hash: &ChunkHash, by: u64) -> EngineResult<()> {
        let by = i64::try_from(by).map_err(|_| EngineError::InvalidInput("count".into()))?;
        self.metadata.increment_refcount(&hash.to_hex(), by).await?;
        Ok(())
    }

    /// Drop `by` references, returning the new count.
    ///
    /// Reaching zero only makes the chunk eligible for GC; nothing is
    /// deleted here. Dropping below zero is a `Conflict`.
    pub async fn decrement_ref(&self, hash: &ChunkHash, by: u64) -> EngineResult<u64> {
        let by = i64::try_from(by).map_err(|_| EngineError::InvalidInput("count".into()))?;
        let remaining = self.metadata.decrement_refcount(&hash.to_hex(), by).await?;
        Ok(remaining.max(0) as u64)
    }

    /// Delete a chunk if nothing references it and it was last touched at
    /// or before `touched_before`.
    ///
    /// Returns the freed size, or `None` when the chunk is referenced, too
    /// recent, or already gone. The refcount check and the claim are one
    /// statement, and claimed rows refuse new references, so a concurrent
    /// upload either wins before the claim or waits for the row to go. On a
    /// backend failure the claim is released and the chunk stays at
    /// refcount 0 for the next sweep.
    #[instrument(skip(self), fields(chunk_hash = %hash))]
    pub async fn delete_if_zero(
        &self,
        hash: &ChunkHash,
        touched_before: OffsetDateTime,
    ) -> EngineResult<Option<u64>> {
        let hex = hash.to_hex();
        let Some(row) = self
            .metadata
            .claim_chunk_for_deletion(&hex, touched_before)
            .await?
        else {
            return Ok(None);
        };

        let storage = &self.storage;
        let key = row.object_key.as_str();
        let deleted = self
            .backoff
            .retry("delete chunk", || async move {
                match storage.delete(key).await {
                    Ok(()) | Err(StorageError::NotFound(_)) => Ok(()),
                    Err(e) => Err(EngineError::StorageBackend(e)),
                }
            })
            .await;

        if let Err(e) = deleted {
            if let Err(revert_err) = self.metadata.revert_chunk_deletion(&hex).await {
                // Left `deleting`; the next sweep reverts it before retrying.
                tracing::warn!(
                    chunk_hash = %hex,
                    error = %revert_err,
                    "failed to release chunk deletion claim"
                );
            }
            return Err(e);
        }

        self.metadata.finish_chunk_deletion(&hex).await?;
        tracing::debug!(chunk_hash = %hex, size = row.size_bytes, "deleted chunk");
        Ok(Some(row.size_bytes.max(0) as u64))
    }

    async fn write_blob(&self, key: &str, data: Bytes) -> EngineResult<bool> {
        let storage = &self.storage;
        self.backoff
            .retry("put chunk", || {
                let data = data.clone();
                async move {
                    storage
                        .put_if_not_exists(key, data)
                        .await
                        .map_err(EngineError::StorageBackend)
                }
            })
            .await
    }

    /// Rewrite the blob of a revived chunk if the backend lost it.
    async fn ensure_blob(&self, row: &ChunkRow, data: &Bytes) -> EngineResult<()> {
        let storage = &self.storage;
        let key = row.object_key.as_str();
        let present = self
            .backoff
            .retry("check chunk", || async move {
                storage.exists(key).await.map_err(EngineError::StorageBackend)
            })
            .await?;
        if !present {
            tracing::warn!(
                chunk_hash = %row.chunk_hash,
                "chunk blob missing from storage, rewriting"
            );
            self.write_blob(key, data.clone()).await?;
        }
        Ok(())
    }
}
