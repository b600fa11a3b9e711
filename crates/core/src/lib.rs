//! Core domain types for the larder binary cache.
//!
//! Nothing in here performs I/O. The crate defines:
//! - content hashes for chunks and whole objects
//! - the content-defined chunker
//! - object manifests (ordered chunk sequences)
//! - store paths, cache names and narinfo documents
//! - configuration shared by the other crates

pub mod cache;
pub mod chunk;
pub mod chunker;
pub mod config;
pub mod error;
pub mod hash;
pub mod narinfo;
pub mod object;
pub mod store_path;

pub use cache::{CacheName, DEFAULT_PRIORITY, Visibility};
pub use chunk::{Chunk, ChunkHash, ChunkRef};
pub use chunker::{Chunker, ChunkingParams, StreamChunker};
pub use error::{Error, Result};
pub use hash::{ContentHash, ContentHasher, NarHash, NarHasher};
pub use narinfo::{NarInfo, Signature};
pub use object::{ManifestHash, ObjectManifest};
pub use store_path::{StorePath, StorePathHash};
