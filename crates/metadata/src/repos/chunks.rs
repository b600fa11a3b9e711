//! Chunk repository.
//!
//! Chunk rows carry the refcount and lifecycle state. Refcounts only move
//! through explicit increments and decrements here or inside the object
//! transactions in [`ObjectRepo`](super::ObjectRepo).

use crate::error::MetadataResult;
use crate::models::{ChunkRow, ChunkStats};
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for chunk operations.
#[async_trait]
pub trait ChunkRepo: Send + Sync {
    /// Insert a `pending` chunk row with refcount 0.
    ///
    /// Returns `false` if a row for this hash already exists, in any state.
    async fn insert_pending_chunk(
        &self,
        chunk_hash: &str,
        size_bytes: i64,
        object_key: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Get a chunk by hash.
    async fn get_chunk(&self, chunk_hash: &str) -> MetadataResult<Option<ChunkRow>>;

    /// Promote a `pending` chunk to `valid`. Returns `false` if it was not pending.
    async fn mark_chunk_valid(&self, chunk_hash: &str) -> MetadataResult<bool>;

    /// Stamp the access time on a `valid` chunk and return the updated row.
    ///
    /// `None` if the chunk is absent or not `valid`; a row GC has claimed is
    /// left untouched.
    async fn touch_valid_chunk(
        &self,
        chunk_hash: &str,
        accessed_at: OffsetDateTime,
    ) -> MetadataResult<Option<ChunkRow>>;

    /// Add `by` references to a `valid` chunk.
    ///
    /// `NotFound` if the chunk is absent or not valid.
    async fn increment_refcount(&self, chunk_hash: &str, by: i64) -> MetadataResult<()>;

    /// Remove `by` references. Returns the new refcount.
    ///
    /// `Constraint` if that would take the count below zero; `NotFound` if absent.
    async fn decrement_refcount(&self, chunk_hash: &str, by: i64) -> MetadataResult<i64>;

    /// Atomically move an unreferenced chunk to `deleting`.
    ///
    /// Succeeds only while refcount is 0, the chunk is `valid` or `pending`,
    /// and it was last touched at or before `touched_before`. The returned
    /// row is the caller's claim on the blob.
    async fn claim_chunk_for_deletion(
        &self,
        chunk_hash: &str,
        touched_before: OffsetDateTime,
    ) -> MetadataResult<Option<ChunkRow>>;

    /// Drop a claimed chunk row after its blob is gone.
    async fn finish_chunk_deletion(&self, chunk_hash: &str) -> MetadataResult<bool>;

    /// Return a claimed chunk to `valid` after a failed blob delete.
    async fn revert_chunk_deletion(&self, chunk_hash: &str) -> MetadataResult<bool>;

    /// Revert every `deleting` row to `valid`. Returns the number reverted.
    async fn revert_stale_deletions(&self) -> MetadataResult<u64>;

    /// Unreferenced chunks not touched since `older_than`, ordered by
    /// `(last_accessed_at, chunk_hash)`.
    ///
    /// `after` is the key of the last row of the previous page; rows at or
    /// before it are skipped.
    async fn get_orphan_chunks(
        &self,
        older_than: OffsetDateTime,
        after: Option<(OffsetDateTime, &str)>,
        limit: u32,
    ) -> MetadataResult<Vec<ChunkRow>>;

    /// Get total chunk count and size.
    async fn get_chunk_stats(&self) -> MetadataResult<ChunkStats>;
}
