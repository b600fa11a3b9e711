//! The backend abstraction the chunk store is written against.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use time::OffsetDateTime;

use crate::error::StorageResult;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Metadata returned by [`ObjectStore::head`].
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    pub size: u64,
    pub last_modified: Option<OffsetDateTime>,
}

/// Keyed blob storage.
///
/// Keys are `/`-separated relative paths. Writes are atomic: a reader sees
/// either nothing or the complete object.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Size and modification time without fetching content.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream>;

    /// Bytes `start..end` of an object. `end` is exclusive.
    async fn get_range(&self, key: &str, start: u64, end: u64) -> StorageResult<Bytes>;

    /// Write an object, replacing any existing one.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Write an object unless the key is already taken.
    ///
    /// Returns `true` if this call created the object. Of several concurrent
    /// callers for one key, at most one gets `true`; the others see `false`
    /// once the winner's object is complete.
    async fn put_if_not_exists(&self, key: &str, data: Bytes) -> StorageResult<bool>;

    /// Delete an object. Fails with `NotFound` if it does not exist.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// All keys under a prefix.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Static identifier used in logs and metrics.
    fn backend_name(&self) -> &'static str;

    async fn health_check(&self) -> StorageResult<()>;
}
