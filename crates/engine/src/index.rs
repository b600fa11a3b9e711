//! Per-cache bindings from store paths to shared objects.
//!
//! A cache is a view: it sees exactly the store paths bound to it, while
//! the objects behind them are stored once for everyone. Every lookup here
//! is keyed by `(cache_id, store path hash)`.

use crate::error::{EngineError, EngineResult};
use larder_core::{NarHash, StorePath, StorePathHash};
use larder_metadata::MetadataStore;
use larder_metadata::models::CacheEntryRow;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

/// What a cache entry records about a store path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryBinding {
    pub store_path: StorePath,
    pub nar_hash: NarHash,
    pub references: Vec<StorePath>,
    pub deriver: Option<StorePath>,
    pub ca: Option<String>,
}

impl EntryBinding {
    pub fn new(store_path: StorePath, nar_hash: NarHash) -> Self {
        Self {
            store_path,
            nar_hash,
            references: Vec::new(),
            deriver: None,
            ca: None,
        }
    }
}

/// A resolved entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub cache_id: Uuid,
    pub binding: EntryBinding,
    pub created_at: OffsetDateTime,
    pub last_accessed_at: OffsetDateTime,
}

impl TryFrom<CacheEntryRow> for CacheEntry {
    type Error = EngineError;

    fn try_from(row: CacheEntryRow) -> EngineResult<Self> {
        let references: Vec<String> = serde_json::from_str(&row.references_json)
            .map_err(|e| EngineError::InvalidInput(format!("stored references: {e}")))?;
        let references = references
            .iter()
            .map(|path| StorePath::parse(path))
            .collect::<larder_core::Result<Vec<_>>>()?;
        let deriver = row.deriver.as_deref().map(StorePath::parse).transpose()?;

        Ok(Self {
            cache_id: row.cache_id,
            binding: EntryBinding {
                store_path: StorePath::parse(&row.store_path)?,
                nar_hash: NarHash::from_hex(&row.nar_hash)?,
                references,
                deriver,
                ca: row.ca,
            },
            created_at: row.created_at,
            last_accessed_at: row.last_accessed_at,
        })
    }
}

/// The cache entry index.
pub struct CacheIndex {
    metadata: Arc<dyn MetadataStore>,
}

impl CacheIndex {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self { metadata }
    }

    /// Bind a store path in a cache to an existing object, replacing any
    /// previous binding for that path.
    ///
    /// Never creates objects: `NotFound` if the object (or the cache) does
    /// not exist.
    pub async fn bind(&self, cache_id: Uuid, binding: &EntryBinding) -> EngineResult<()> {
        let references: Vec<String> = binding
            .references
            .iter()
            .map(StorePath::to_path_string)
            .collect();
        let references_json = serde_json::to_string(&references)
            .map_err(|e| EngineError::InvalidInput(format!("references: {e}")))?;

        let now = OffsetDateTime::now_utc();
        let row = CacheEntryRow {
            cache_id,
            store_path_hash: binding.store_path.hash().to_string(),
            store_path: binding.store_path.to_path_string(),
            nar_hash: binding.nar_hash.to_hex(),
            references_json,
            deriver: binding.deriver.as_ref().map(StorePath::to_path_string),
            ca: binding.ca.clone(),
            created_at: now,
            last_accessed_at: now,
        };
        self.metadata.upsert_entry(&row).await?;
        tracing::debug!(
            cache_id = %cache_id,
            store_path = %binding.store_path,
            nar_hash = %binding.nar_hash,
            "bound cache entry"
        );
        Ok(())
    }

    /// Look up a store path in one cache.
    ///
    /// Only entries bound to `cache_id` are visible; the same path bound in
    /// another cache is `NotFound` here.
    pub async fn resolve(&self, cache_id: Uuid, store_path: &StorePath) -> EngineResult<CacheEntry> {
        let row = self
            .metadata
            .get_entry(cache_id, store_path.hash().as_str())
            .await?
            .filter(|row| row.store_path == store_path.to_path_string())
            .ok_or_else(|| EngineError::NotFound(format!("{store_path} in cache {cache_id}")))?;
        row.try_into()
    }

    /// Remove a binding. The object stays until GC finds it unreferenced.
    pub async fn unbind(&self, cache_id: Uuid, store_path: &StorePath) -> EngineResult<()> {
        if !self
            .metadata
            .delete_entry(cache_id, store_path.hash().as_str())
            .await?
        {
            return Err(EngineError::NotFound(format!(
                "{store_path} in cache {cache_id}"
            )));
        }
        tracing::debug!(cache_id = %cache_id, store_path = %store_path, "unbound cache entry");
        Ok(())
    }

    /// Stamp an access on the entry and its object.
    pub async fn record_access(&self, cache_id: Uuid, store_path: &StorePath) -> EngineResult<()> {
        self.metadata
            .record_access(cache_id, store_path.hash().as_str(), OffsetDateTime::now_utc())
            .await?;
        Ok(())
    }

    /// The requested hashes this cache has no entry for, in request order.
    pub async fn missing(
        &self,
        cache_id: Uuid,
        hashes: &[StorePathHash],
    ) -> EngineResult<Vec<StorePathHash>> {
        let wanted: Vec<String> = hashes.iter().map(|h| h.as_str().to_string()).collect();
        self.metadata
            .missing_entries(cache_id, &wanted)
            .await?
            .into_iter()
            .map(|h| StorePathHash::new(h).map_err(EngineError::from))
            .collect()
    }

    /// All entries of one cache, ordered by store path.
    pub async fn list(&self, cache_id: Uuid) -> EngineResult<Vec<CacheEntry>> {
        self.metadata
            .list_entries(cache_id)
            .await?
            .into_iter()
            .map(CacheEntry::try_from)
            .collect()
    }
}
