//! Repository traits for metadata operations.

pub mod caches;
pub mod chunks;
pub mod entries;
pub mod gc;
pub mod objects;

pub use caches::CacheRepo;
pub use chunks::ChunkRepo;
pub use entries::EntryRepo;
pub use gc::GcRepo;
pub use objects::ObjectRepo;
