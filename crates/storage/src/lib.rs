//! Content-addressed blob storage.
//!
//! Chunk blobs are the only thing the engine keeps outside the metadata
//! database. Backends implement [`ObjectStore`]; the engine relies on
//! `put_if_not_exists` so racing writers of one chunk store it once.

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::{filesystem::FilesystemBackend, s3::S3Backend};
pub use error::{StorageError, StorageResult};
pub use traits::{ByteStream, ObjectMeta, ObjectStore};

use larder_core::config::StorageConfig;
use std::sync::Arc;

pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    config
        .validate()
        .map_err(|e| StorageError::Config(e.to_string()))?;

    let store: Arc<dyn ObjectStore> = match config {
        StorageConfig::Filesystem { path } => Arc::new(FilesystemBackend::new(path).await?),
        StorageConfig::S3 {
            bucket,
            endpoint,
            region,
            prefix,
            access_key_id,
            secret_access_key,
            force_path_style,
        } => Arc::new(
            S3Backend::new(
                bucket,
                endpoint.clone(),
                region.clone(),
                prefix.clone(),
                access_key_id.clone(),
                secret_access_key.clone(),
                *force_path_style,
            )
            .await?,
        ),
    };
    tracing::debug!(backend = store.backend_name(), "object store ready");
    Ok(store)
}
