//! Caches are the tenant boundary: every entry belongs to exactly one.

use crate::error::MetadataResult;
use crate::models::CacheRow;
use async_trait::async_trait;
use uuid::Uuid;

#[async_trait]
pub trait CacheRepo: Send + Sync {
    /// `AlreadyExists` if the name is taken.
    async fn create_cache(&self, cache: &CacheRow) -> MetadataResult<()>;

    async fn get_cache(&self, cache_id: Uuid) -> MetadataResult<Option<CacheRow>>;

    async fn get_cache_by_name(&self, name: &str) -> MetadataResult<Option<CacheRow>>;

    /// Remove the cache and its entries, returning how many entries went
    /// with it. Objects stay until GC finds them unreferenced.
    async fn delete_cache(&self, cache_id: Uuid) -> MetadataResult<u64>;

    /// Sorted by name.
    async fn list_caches(&self) -> MetadataResult<Vec<CacheRow>>;
}
