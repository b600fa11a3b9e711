//! Cache entry repository: per-tenant bindings from store paths to objects.
//!
//! Every query is scoped by `cache_id`; there is no cross-cache lookup.

use crate::error::MetadataResult;
use crate::models::CacheEntryRow;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for cache entry operations.
#[async_trait]
pub trait EntryRepo: Send + Sync {
    /// Insert or replace the binding for `(cache_id, store_path_hash)`.
    ///
    /// `NotFound` if the cache or the object does not exist. Never creates objects.
    async fn upsert_entry(&self, entry: &CacheEntryRow) -> MetadataResult<()>;

    /// Get the entry for a store path in one cache.
    async fn get_entry(
        &self,
        cache_id: Uuid,
        store_path_hash: &str,
    ) -> MetadataResult<Option<CacheEntryRow>>;

    /// Stamp `accessed_at` on the entry and on the object it points at.
    async fn record_access(
        &self,
        cache_id: Uuid,
        store_path_hash: &str,
        accessed_at: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Remove a binding. Returns `false` if there was none.
    async fn delete_entry(&self, cache_id: Uuid, store_path_hash: &str) -> MetadataResult<bool>;

    /// The subset of `store_path_hashes` with no entry in this cache, in input order.
    async fn missing_entries(
        &self,
        cache_id: Uuid,
        store_path_hashes: &[String],
    ) -> MetadataResult<Vec<String>>;

    /// Entries in one cache ordered by store path.
    async fn list_entries(&self, cache_id: Uuid) -> MetadataResult<Vec<CacheEntryRow>>;

    /// Remove entries of `cache_id` not accessed since `older_than`.
    async fn expire_entries(
        &self,
        cache_id: Uuid,
        older_than: OffsetDateTime,
    ) -> MetadataResult<u64>;

    /// Number of entries, across all caches, pointing at an object.
    async fn count_entries_for_object(&self, nar_hash: &str) -> MetadataResult<u64>;
}
