use async_trait::async_trait;
use bytes::Bytes;
use larder_core::config::LarderConfig;
use larder_core::{CacheName, StorePath};
use larder_engine::{CacheSettings, Engine};
use larder_signer::NarInfoSigner;
use larder_storage::{ByteStream, FilesystemBackend, ObjectMeta, ObjectStore, StorageError, StorageResult};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use uuid::Uuid;

/// Deterministic pseudo-random bytes; the same seed gives the same output.
#[allow(dead_code)]
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    // LCG
    for chunk in data.chunks_mut(8) {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let bytes = state.to_le_bytes();
        chunk.copy_from_slice(&bytes[..chunk.len()]);
    }

    Bytes::from(data)
}

/// A valid store path whose hash part is derived from `name`.
#[allow(dead_code)]
pub fn test_store_path(name: &str) -> StorePath {
    let digest = Sha256::digest(name.as_bytes());
    let hash = nix_base32::to_nix_base32(&digest[..20]);
    StorePath::parse(&format!("/nix/store/{hash}-{name}")).unwrap()
}

/// Filesystem backend that counts blob writes and fails deletes on demand.
pub struct FaultyStore {
    inner: Arc<dyn ObjectStore>,
    blob_writes: AtomicUsize,
    failing_deletes: Mutex<HashSet<String>>,
}

#[allow(dead_code)]
impl FaultyStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            blob_writes: AtomicUsize::new(0),
            failing_deletes: Mutex::new(HashSet::new()),
        }
    }

    /// Conditional writes that created a blob.
    pub fn blob_writes(&self) -> usize {
        self.blob_writes.load(Ordering::SeqCst)
    }

    pub fn fail_deletes_for(&self, key: &str) {
        self.failing_deletes.lock().unwrap().insert(key.to_string());
    }

    pub fn heal(&self) {
        self.failing_deletes.lock().unwrap().clear();
    }

    /// Overwrite a blob behind the engine's back.
    pub async fn overwrite(&self, key: &str, data: Bytes) {
        self.inner.put(key, data).await.unwrap();
    }

    pub async fn chunk_keys(&self) -> Vec<String> {
        self.inner.list("chunks/").await.unwrap()
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner.head(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.inner.get(key).await
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        self.inner.get_stream(key).await
    }

    async fn get_range(&self, key: &str, start: u64, end: u64) -> StorageResult<Bytes> {
        self.inner.get_range(key, start, end).await
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.blob_writes.fetch_add(1, Ordering::SeqCst);
        self.inner.put(key, data).await
    }

    async fn put_if_not_exists(&self, key: &str, data: Bytes) -> StorageResult<bool> {
        let created = self.inner.put_if_not_exists(key, data).await?;
        if created {
            self.blob_writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(created)
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        if self.failing_deletes.lock().unwrap().contains(key) {
            return Err(StorageError::Io(std::io::Error::other("injected delete failure")));
        }
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix).await
    }

    fn backend_name(&self) -> &'static str {
        "faulty"
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.inner.health_check().await
    }
}

/// An engine on a temp dir with a filesystem backend and a SQLite file.
pub struct TestEngine {
    pub engine: Arc<Engine>,
    pub store: Arc<FaultyStore>,
    pub signer: Arc<NarInfoSigner>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestEngine {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Like [`TestEngine::new`], with `adjust` applied to the test config.
    pub async fn with_config(adjust: impl FnOnce(&mut LarderConfig)) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let mut config = LarderConfig::for_testing(temp_dir.path());
        adjust(&mut config);
        let inner = FilesystemBackend::new(temp_dir.path().join("storage"))
            .await
            .unwrap();
        let store = Arc::new(FaultyStore::new(Arc::new(inner)));
        let metadata = larder_metadata::from_config(&config.metadata).await.unwrap();
        let signer = Arc::new(NarInfoSigner::generate("larder-test-1"));

        let engine = Engine::new(config, store.clone(), metadata, signer.clone()).unwrap();
        Self {
            engine: Arc::new(engine),
            store,
            signer,
            _temp_dir: temp_dir,
        }
    }

    pub async fn create_cache(&self, name: &str) -> Uuid {
        self.engine
            .create_cache(CacheSettings::new(CacheName::new(name).unwrap()))
            .await
            .unwrap()
            .cache_id
    }

    pub async fn refcount(&self, hash: &larder_core::ChunkHash) -> Option<i64> {
        self.engine
            .chunks()
            .info(hash)
            .await
            .unwrap()
            .map(|row| row.refcount)
    }
}
