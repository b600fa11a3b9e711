//! Object repository: whole-NAR records and their chunk sequences.

use crate::error::MetadataResult;
use crate::models::{ObjectChunkRow, ObjectRow, PutObjectOutcome, ReleasedObject};
use async_trait::async_trait;
use larder_core::ObjectManifest;
use time::OffsetDateTime;

/// Repository for object operations.
#[async_trait]
pub trait ObjectRepo: Send + Sync {
    /// Record an object and take its chunk references in one transaction.
    ///
    /// If the object already exists nothing but its access time changes and
    /// `Deduplicated` is returned. Otherwise each chunk's refcount grows by
    /// its number of occurrences; if any chunk is not `valid` the transaction
    /// rolls back with `MissingChunks`.
    async fn put_object(
        &self,
        manifest: &ObjectManifest,
        now: OffsetDateTime,
    ) -> MetadataResult<PutObjectOutcome>;

    /// Get an object by NAR hash.
    async fn get_object(&self, nar_hash: &str) -> MetadataResult<Option<ObjectRow>>;

    /// The object's chunk sequence in position order.
    async fn get_object_chunks(&self, nar_hash: &str) -> MetadataResult<Vec<ObjectChunkRow>>;

    /// Update last accessed time.
    async fn touch_object(&self, nar_hash: &str, accessed_at: OffsetDateTime)
    -> MetadataResult<()>;

    /// Delete an object and drop its chunk references, if no cache entry
    /// points at it.
    ///
    /// The entry check and the decrements share one transaction, so a bind
    /// racing with this call either lands first (and `None` is returned) or
    /// fails because the object is gone.
    async fn release_object_if_unreferenced(
        &self,
        nar_hash: &str,
    ) -> MetadataResult<Option<ReleasedObject>>;

    /// Objects with no cache entry, least recently accessed first
    /// (ties by creation time, then hash).
    async fn get_unreferenced_objects(&self) -> MetadataResult<Vec<ObjectRow>>;

    /// Sum of `nar_size` over all objects.
    async fn total_object_bytes(&self) -> MetadataResult<u64>;
}
