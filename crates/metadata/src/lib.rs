//! SQLite-backed metadata for the dedup engine.
//!
//! Holds caches and their entries, object manifests as ordered chunk rows,
//! per-chunk reference counts with a pending/valid/deleting lifecycle, and
//! GC sweep records. Every refcount change commits in the same transaction
//! as the row that causes it.

pub mod error;
pub mod models;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use store::{MetadataStore, SqliteStore};

use larder_core::config::MetadataConfig;
use std::sync::Arc;

pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    let MetadataConfig::Sqlite {
        path,
        query_timeout_secs,
    } = config;
    let store = SqliteStore::new(path, *query_timeout_secs).await?;
    tracing::debug!(path = %path.display(), "metadata store ready");
    Ok(Arc::new(store))
}
