//! Multi-tenant dedup engine for the Larder Nix binary cache.
//!
//! This crate provides the data plane:
//! - Content-addressed chunk storage with reference counts
//! - Objects (whole NARs) as ordered chunk sequences shared across caches
//! - Per-cache entries binding store paths to objects
//! - Push and pull with fetch-time narinfo signing
//! - Garbage collection sweeps with pluggable retention policies

pub mod chunk_store;
pub mod engine;
pub mod error;
pub mod gc;
pub mod index;
pub mod ingest;
pub mod metrics;
pub mod object_store;
pub mod retry;

pub use chunk_store::{ChunkStore, PutOutcome};
pub use engine::{
    CacheInfo, CacheSettings, Engine, NarStream, PullResponse, PushMetadata, PushOptions,
    PushResult,
};
pub use error::{EngineError, EngineResult};
pub use gc::{GarbageCollector, GcPolicy, GcReport, ReclaimTarget};
pub use index::{CacheEntry, CacheIndex, EntryBinding};
pub use object_store::{NarStore, PutObjectOutcome, StoredObject};
