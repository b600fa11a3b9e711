//! Database models mapping to the metadata schema.

use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Caches
// =============================================================================

/// Tenant cache record.
#[derive(Debug, Clone, FromRow)]
pub struct CacheRow {
    pub cache_id: Uuid,
    pub cache_name: String,
    pub is_public: bool,
    pub priority: i64,
    /// Entry retention window in seconds. `None` falls back to the global
    /// default, `Some(0)` never expires.
    pub retention_secs: Option<i64>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

// =============================================================================
// Chunks
// =============================================================================

/// Lifecycle of a chunk row.
///
/// `pending` while the blob is being written, `valid` once it is durable and
/// `deleting` while GC removes the blob. Only `valid` chunks may gain references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Pending,
    Valid,
    Deleting,
}

impl ChunkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Valid => "valid",
            Self::Deleting => "deleting",
        }
    }
}

impl fmt::Display for ChunkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "valid" => Ok(Self::Valid),
            "deleting" => Ok(Self::Deleting),
            other => Err(format!("unknown chunk state: {other}")),
        }
    }
}

/// Global chunk record.
#[derive(Debug, Clone, FromRow)]
pub struct ChunkRow {
    pub chunk_hash: String,
    pub size_bytes: i64,
    pub object_key: String,
    pub refcount: i64,
    pub state: String,
    pub created_at: OffsetDateTime,
    pub last_accessed_at: OffsetDateTime,
}

impl ChunkRow {
    /// Parsed `state` column. Unknown values read as `Pending`, which no
    /// reference path accepts.
    pub fn chunk_state(&self) -> ChunkState {
        self.state.parse().unwrap_or(ChunkState::Pending)
    }
}

/// Chunk table statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkStats {
    pub count: u64,
    pub total_size: u64,
    /// Chunks with refcount 0.
    pub unreferenced_count: u64,
}

// =============================================================================
// Objects
// =============================================================================

/// A stored NAR, identified by its content hash.
#[derive(Debug, Clone, FromRow)]
pub struct ObjectRow {
    pub nar_hash: String,
    pub nar_size: i64,
    pub chunk_count: i64,
    pub manifest_hash: String,
    pub created_at: OffsetDateTime,
    pub last_accessed_at: OffsetDateTime,
}

/// One position in an object's chunk sequence, joined with the chunk row.
#[derive(Debug, Clone, FromRow)]
pub struct ObjectChunkRow {
    pub position: i64,
    pub chunk_hash: String,
    pub size_bytes: i64,
    pub object_key: String,
}

/// Result of inserting an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutObjectOutcome {
    Created,
    Deduplicated,
}

/// What `release_object_if_unreferenced` removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasedObject {
    pub nar_hash: String,
    pub nar_size: i64,
    /// Distinct chunk hashes whose refcounts were decremented, sorted.
    pub chunk_hashes: Vec<String>,
}

// =============================================================================
// Cache entries
// =============================================================================

/// Tenant-visible binding from a store path to an object.
#[derive(Debug, Clone, FromRow)]
pub struct CacheEntryRow {
    pub cache_id: Uuid,
    pub store_path_hash: String,
    pub store_path: String,
    pub nar_hash: String,
    /// JSON array of full store paths.
    pub references_json: String,
    pub deriver: Option<String>,
    pub ca: Option<String>,
    pub created_at: OffsetDateTime,
    pub last_accessed_at: OffsetDateTime,
}

// =============================================================================
// GC sweeps
// =============================================================================

/// Sweep lifecycle. A process with no active row is idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcSweepState {
    Scanning,
    Reclaiming,
    Finished,
    Failed,
}

impl GcSweepState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scanning => "scanning",
            Self::Reclaiming => "reclaiming",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Scanning | Self::Reclaiming)
    }
}

impl fmt::Display for GcSweepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GcSweepState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scanning" => Ok(Self::Scanning),
            "reclaiming" => Ok(Self::Reclaiming),
            "finished" => Ok(Self::Finished),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown sweep state: {other}")),
        }
    }
}

/// GC sweep record.
#[derive(Debug, Clone, FromRow)]
pub struct GcSweepRow {
    pub sweep_id: Uuid,
    pub state: String,
    pub started_at: OffsetDateTime,
    pub finished_at: Option<OffsetDateTime>,
    pub stats_json: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_strings_roundtrip() {
        for state in [ChunkState::Pending, ChunkState::Valid, ChunkState::Deleting] {
            assert_eq!(state.as_str().parse::<ChunkState>().unwrap(), state);
        }
        for state in [
            GcSweepState::Scanning,
            GcSweepState::Reclaiming,
            GcSweepState::Finished,
            GcSweepState::Failed,
        ] {
            assert_eq!(state.to_string().parse::<GcSweepState>().unwrap(), state);
        }
        assert!("bogus".parse::<ChunkState>().is_err());
    }

    #[test]
    fn test_sweep_activity() {
        assert!(GcSweepState::Scanning.is_active());
        assert!(GcSweepState::Reclaiming.is_active());
        assert!(!GcSweepState::Finished.is_active());
        assert!(!GcSweepState::Failed.is_active());
    }
}
