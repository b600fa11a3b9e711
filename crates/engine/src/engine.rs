//! The engine facade: tenants, push, pull and GC over shared storage.

use crate::chunk_store::ChunkStore;
use crate::error::{EngineError, EngineResult};
use crate::gc::{GarbageCollector, GcPolicy, GcReport};
use crate::index::{CacheIndex, EntryBinding};
use crate::ingest::ingest;
use crate::metrics;
use crate::object_store::{NarStore, PutObjectOutcome};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use larder_core::config::LarderConfig;
use larder_core::{
    CacheName, Chunker, DEFAULT_PRIORITY, NarHash, NarHasher, NarInfo, StorePath, StorePathHash,
    Visibility,
};
use larder_metadata::MetadataStore;
use larder_metadata::models::CacheRow;
use larder_signer::{NarInfoSigner, Signer};
use larder_storage::ObjectStore;
use serde::Serialize;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use time::OffsetDateTime;
use tracing::instrument;
use uuid::Uuid;

/// Chunks fetched ahead of the consumer while streaming a pull.
const PULL_PREFETCH: usize = 4;

/// A stream of NAR bytes.
pub type NarStream = Pin<Box<dyn Stream<Item = EngineResult<Bytes>> + Send>>;

/// Settings for a new cache.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub name: CacheName,
    pub visibility: Visibility,
    pub priority: i32,
    /// Entry retention in seconds. `None` uses the global default, `Some(0)`
    /// keeps entries forever.
    pub retention_secs: Option<u64>,
}

impl CacheSettings {
    pub fn new(name: CacheName) -> Self {
        Self {
            name,
            visibility: Visibility::default(),
            priority: DEFAULT_PRIORITY,
            retention_secs: None,
        }
    }
}

/// A cache as reported to callers.
#[derive(Debug, Clone, Serialize)]
pub struct CacheInfo {
    pub cache_id: Uuid,
    pub name: String,
    pub visibility: Visibility,
    pub priority: i64,
    pub retention_secs: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<CacheRow> for CacheInfo {
    fn from(row: CacheRow) -> Self {
        Self {
            cache_id: row.cache_id,
            name: row.cache_name,
            visibility: Visibility::from_public(row.is_public),
            priority: row.priority,
            retention_secs: row.retention_secs,
            created_at: row.created_at,
        }
    }
}

/// Narinfo fields supplied by the pusher.
#[derive(Debug, Clone, Default)]
pub struct PushMetadata {
    pub references: Vec<StorePath>,
    pub deriver: Option<StorePath>,
    pub ca: Option<String>,
}

/// Options for [`Engine::push`].
#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    pub metadata: PushMetadata,
    /// Reject the push with `Corruption` unless the bytes hash to this.
    pub expected_nar_hash: Option<NarHash>,
    pub expected_nar_size: Option<u64>,
}

/// Result of a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushResult {
    pub nar_hash: NarHash,
    pub nar_size: u64,
    /// The object already existed; no new object was recorded.
    pub deduplicated: bool,
    pub chunks_total: u64,
    /// Chunks this push stored for the first time.
    pub chunks_new: u64,
    pub bytes_new: u64,
}

/// A pull: a freshly signed narinfo and the object's bytes.
pub struct PullResponse {
    pub narinfo: NarInfo,
    /// NAR bytes in chunk order. Ends with `Corruption` if the reassembled
    /// bytes do not match the narinfo.
    pub stream: NarStream,
}

impl std::fmt::Debug for PullResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullResponse")
            .field("narinfo", &self.narinfo)
            .finish_non_exhaustive()
    }
}

/// Multi-tenant dedup engine.
///
/// Cheap to share behind an `Arc`; every operation takes `&self`.
pub struct Engine {
    config: LarderConfig,
    storage: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
    chunker: Chunker,
    chunks: Arc<ChunkStore>,
    objects: Arc<NarStore>,
    index: CacheIndex,
    signer: RwLock<Arc<dyn Signer>>,
    gc: Arc<GarbageCollector>,
}

impl Engine {
    /// Build an engine from configuration: open the storage backend and
    /// metadata database, load the signing key and recover sweeps
    /// interrupted by a previous process.
    ///
    /// A signing key that cannot be loaded is fatal.
    pub async fn open(config: LarderConfig) -> EngineResult<Self> {
        config.validate()?;
        let storage = larder_storage::from_config(&config.storage).await?;
        let metadata = larder_metadata::from_config(&config.metadata).await?;
        let signer = NarInfoSigner::from_config(&config.signing)?;
        tracing::info!(
            key_name = %signer.key_name(),
            public_key = %signer.nix_public_key(),
            "signing key loaded"
        );

        let engine = Self::new(config, storage, metadata, Arc::new(signer))?;
        engine.gc.recover().await?;
        Ok(engine)
    }

    /// Build an engine over existing stores.
    pub fn new(
        config: LarderConfig,
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        signer: Arc<dyn Signer>,
    ) -> EngineResult<Self> {
        let chunker = Chunker::new(config.chunking.params()?)?;
        let chunks = Arc::new(ChunkStore::new(Arc::clone(&storage), Arc::clone(&metadata)));
        let objects = Arc::new(NarStore::new(Arc::clone(&metadata)));
        let index = CacheIndex::new(Arc::clone(&metadata));
        let gc = Arc::new(GarbageCollector::new(
            Arc::clone(&metadata),
            Arc::clone(&chunks),
            Arc::clone(&objects),
            config.gc.clone(),
        ));

        Ok(Self {
            config,
            storage,
            metadata,
            chunker,
            chunks,
            objects,
            index,
            signer: RwLock::new(signer),
            gc,
        })
    }

    pub fn config(&self) -> &LarderConfig {
        &self.config
    }

    pub fn chunks(&self) -> &ChunkStore {
        &self.chunks
    }

    pub fn objects(&self) -> &NarStore {
        &self.objects
    }

    pub fn index(&self) -> &CacheIndex {
        &self.index
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub fn gc(&self) -> &Arc<GarbageCollector> {
        &self.gc
    }

    fn signer(&self) -> Arc<dyn Signer> {
        Arc::clone(&self.signer.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Swap the signing key. Pulls after this return narinfos signed with
    /// the new key; nothing stored needs rewriting.
    pub fn rotate_signer(&self, signer: Arc<dyn Signer>) {
        tracing::info!(key_name = %signer.key_name(), "signing key rotated");
        *self.signer.write().unwrap_or_else(PoisonError::into_inner) = signer;
    }

    /// The active public key in Nix `name:base64` form.
    pub fn nix_public_key(&self) -> String {
        self.signer().nix_public_key()
    }

    // ---------------------------------------------------------------------
    // Caches
    // ---------------------------------------------------------------------

    /// Create a tenant cache. `Conflict` if the name is taken.
    #[instrument(skip(self, settings), fields(cache = %settings.name))]
    pub async fn create_cache(&self, settings: CacheSettings) -> EngineResult<CacheInfo> {
        let retention_secs = settings
            .retention_secs
            .map(|secs| {
                i64::try_from(secs)
                    .map_err(|_| EngineError::InvalidInput(format!("retention {secs}s too large")))
            })
            .transpose()?;
        let now = OffsetDateTime::now_utc();
        let row = CacheRow {
            cache_id: Uuid::new_v4(),
            cache_name: settings.name.as_str().to_string(),
            is_public: settings.visibility.is_public(),
            priority: i64::from(settings.priority),
            retention_secs,
            created_at: now,
            updated_at: now,
        };
        self.metadata.create_cache(&row).await?;
        tracing::info!(cache_id = %row.cache_id, "cache created");
        Ok(row.into())
    }

    pub async fn get_cache(&self, name: &CacheName) -> EngineResult<CacheInfo> {
        self.metadata
            .get_cache_by_name(name.as_str())
            .await?
            .map(CacheInfo::from)
            .ok_or_else(|| EngineError::NotFound(format!("cache {name}")))
    }

    pub async fn list_caches(&self) -> EngineResult<Vec<CacheInfo>> {
        Ok(self
            .metadata
            .list_caches()
            .await?
            .into_iter()
            .map(CacheInfo::from)
            .collect())
    }

    /// Delete a cache and all of its entries. Objects only it referenced
    /// become reclaimable by the next sweep. Returns the entries removed.
    #[instrument(skip(self))]
    pub async fn delete_cache(&self, cache_id: Uuid) -> EngineResult<u64> {
        let removed = self.metadata.delete_cache(cache_id).await?;
        tracing::info!(entries_removed = removed, "cache deleted");
        Ok(removed)
    }

    async fn require_cache(&self, cache_id: Uuid) -> EngineResult<CacheRow> {
        self.metadata
            .get_cache(cache_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("cache {cache_id}")))
    }

    // ---------------------------------------------------------------------
    // Push / pull
    // ---------------------------------------------------------------------

    /// Store a NAR and bind `store_path` to it in `cache_id`.
    ///
    /// Chunks are stored as the stream is read; the object is recorded only
    /// once every chunk is durable, and the entry only once the object is.
    /// A failure at any point leaves no entry and no references, only
    /// unreferenced chunks for GC to reap. Pushing bytes that are already
    /// stored (from any cache) writes nothing new.
    #[instrument(skip(self, stream, options), fields(cache_id = %cache_id, store_path = %store_path))]
    pub async fn push<S, E>(
        &self,
        cache_id: Uuid,
        store_path: &StorePath,
        stream: S,
        options: PushOptions,
    ) -> EngineResult<PushResult>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: Into<EngineError>,
    {
        let result = self.push_inner(cache_id, store_path, stream, options).await;
        if let Err(e) = &result {
            metrics::record_error("push", e.code());
            tracing::warn!(error = %e, "push failed");
        }
        result
    }

    async fn push_inner<S, E>(
        &self,
        cache_id: Uuid,
        store_path: &StorePath,
        stream: S,
        options: PushOptions,
    ) -> EngineResult<PushResult>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: Into<EngineError>,
    {
        self.require_cache(cache_id).await?;

        let ingested = ingest(&self.chunker, &self.chunks, stream).await?;
        let manifest = ingested.manifest;

        if let Some(expected) = options.expected_nar_hash
            && expected != manifest.nar_hash
        {
            return Err(EngineError::Corruption {
                expected: expected.to_typed(),
                actual: manifest.nar_hash.to_typed(),
            });
        }
        if let Some(expected) = options.expected_nar_size
            && expected != manifest.nar_size
        {
            return Err(EngineError::Corruption {
                expected: format!("{expected} bytes"),
                actual: format!("{} bytes", manifest.nar_size),
            });
        }

        let binding = EntryBinding {
            store_path: store_path.clone(),
            nar_hash: manifest.nar_hash,
            references: options.metadata.references,
            deriver: options.metadata.deriver,
            ca: options.metadata.ca,
        };

        let mut outcome = self.objects.put_object(&manifest).await?;
        if let Err(e) = self.index.bind(cache_id, &binding).await {
            // A sweep can release the object between recording and binding
            // it. Record it again once; the chunks are still there unless the
            // sweep also reaped them, which surfaces as Conflict.
            let EngineError::NotFound(_) = e else {
                return Err(e);
            };
            tracing::debug!("object released before bind, recording again");
            outcome = self.objects.put_object(&manifest).await?;
            self.index.bind(cache_id, &binding).await?;
        }

        let result = PushResult {
            nar_hash: manifest.nar_hash,
            nar_size: manifest.nar_size,
            deduplicated: outcome == PutObjectOutcome::Deduplicated,
            chunks_total: manifest.chunk_count() as u64,
            chunks_new: ingested.new_chunks,
            bytes_new: ingested.new_bytes,
        };
        tracing::info!(
            nar_hash = %result.nar_hash,
            nar_size = result.nar_size,
            deduplicated = result.deduplicated,
            chunks_total = result.chunks_total,
            chunks_new = result.chunks_new,
            "push complete"
        );
        Ok(result)
    }

    /// [`Engine::push`] for an in-memory NAR.
    pub async fn push_bytes(
        &self,
        cache_id: Uuid,
        store_path: &StorePath,
        nar: Bytes,
        options: PushOptions,
    ) -> EngineResult<PushResult> {
        let stream = futures::stream::iter([Ok::<_, EngineError>(nar)]);
        self.push(cache_id, store_path, stream, options).await
    }

    /// Resolve `store_path` in `cache_id` and stream its NAR.
    ///
    /// The narinfo is signed now with the active key. Entries bound in
    /// other caches are invisible: `NotFound`.
    #[instrument(skip(self), fields(cache_id = %cache_id, store_path = %store_path))]
    pub async fn pull(&self, cache_id: Uuid, store_path: &StorePath) -> EngineResult<PullResponse> {
        let result = self.pull_inner(cache_id, store_path).await;
        match &result {
            Ok(_) => metrics::PULLS.inc(),
            Err(e) => metrics::record_error("pull", e.code()),
        }
        result
    }

    async fn pull_inner(&self, cache_id: Uuid, store_path: &StorePath) -> EngineResult<PullResponse> {
        let entry = self.index.resolve(cache_id, store_path).await?;
        let stored = self.objects.get_object(&entry.binding.nar_hash).await?;

        if let Err(e) = self.index.record_access(cache_id, store_path).await {
            tracing::warn!(error = %e, "failed to record access");
        }

        let manifest = stored.manifest;
        let mut narinfo = NarInfo::new(entry.binding.store_path, manifest.nar_hash, manifest.nar_size);
        narinfo.references = entry.binding.references;
        narinfo.deriver = entry.binding.deriver;
        narinfo.ca = entry.binding.ca;
        self.signer().sign(&mut narinfo);

        let chunks = Arc::clone(&self.chunks);
        let stream = async_stream::try_stream! {
            let fetches = futures::stream::iter(manifest.chunks.clone())
                .map(move |chunk| {
                    let chunks = Arc::clone(&chunks);
                    async move { chunks.get(&chunk.hash).await }
                })
                .buffered(PULL_PREFETCH);
            let mut fetches = std::pin::pin!(fetches);

            let mut hasher = NarHasher::new();
            while let Some(data) = fetches.next().await {
                let data = data?;
                hasher.update(&data);
                yield data;
            }

            let (nar_hash, nar_size) = hasher.finalize();
            if nar_hash != manifest.nar_hash || nar_size != manifest.nar_size {
                metrics::CORRUPTION_DETECTED.inc();
                Err::<(), _>(EngineError::Corruption {
                    expected: format!("{} ({} bytes)", manifest.nar_hash.to_typed(), manifest.nar_size),
                    actual: format!("{} ({nar_size} bytes)", nar_hash.to_typed()),
                })?;
            }
        };

        Ok(PullResponse {
            narinfo,
            stream: Box::pin(stream),
        })
    }

    /// [`Engine::pull`], collecting the NAR into memory.
    pub async fn pull_to_bytes(
        &self,
        cache_id: Uuid,
        store_path: &StorePath,
    ) -> EngineResult<(NarInfo, Bytes)> {
        let mut response = self.pull(cache_id, store_path).await?;
        let mut nar = Vec::with_capacity(response.narinfo.nar_size as usize);
        while let Some(piece) = response.stream.next().await {
            nar.extend_from_slice(&piece?);
        }
        Ok((response.narinfo, Bytes::from(nar)))
    }

    /// Remove one entry. The object stays until a sweep finds nothing
    /// referencing it.
    #[instrument(skip(self), fields(cache_id = %cache_id, store_path = %store_path))]
    pub async fn delete_cache_entry(&self, cache_id: Uuid, store_path: &StorePath) -> EngineResult<()> {
        self.index.unbind(cache_id, store_path).await
    }

    /// Which of `hashes` the cache has no entry for.
    pub async fn missing_paths(
        &self,
        cache_id: Uuid,
        hashes: &[StorePathHash],
    ) -> EngineResult<Vec<StorePathHash>> {
        self.index.missing(cache_id, hashes).await
    }

    // ---------------------------------------------------------------------
    // Maintenance
    // ---------------------------------------------------------------------

    /// Run one GC sweep now. `None` uses the configured policy.
    pub async fn run_gc_sweep(&self, policy: Option<GcPolicy>) -> EngineResult<GcReport> {
        self.gc.sweep(policy).await
    }

    /// Check that both the storage backend and the database respond.
    pub async fn health_check(&self) -> EngineResult<()> {
        self.storage.health_check().await?;
        self.metadata.health_check().await?;
        Ok(())
    }
}
