//! Garbage collection repository.

use crate::error::MetadataResult;
use crate::models::{GcSweepRow, GcSweepState};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for GC sweep bookkeeping.
#[async_trait]
pub trait GcRepo: Send + Sync {
    /// Record a new active sweep.
    ///
    /// Fails with `Constraint` while another sweep is scanning or reclaiming.
    async fn begin_sweep(&self, sweep: &GcSweepRow) -> MetadataResult<()>;

    /// Get a sweep by ID.
    async fn get_sweep(&self, sweep_id: Uuid) -> MetadataResult<Option<GcSweepRow>>;

    /// Update sweep state.
    async fn update_sweep_state(
        &self,
        sweep_id: Uuid,
        state: GcSweepState,
        finished_at: Option<OffsetDateTime>,
        stats_json: Option<&str>,
    ) -> MetadataResult<()>;

    /// Most recent sweeps first.
    async fn get_recent_sweeps(&self, limit: u32) -> MetadataResult<Vec<GcSweepRow>>;

    /// Mark sweeps left active by a crashed process as failed.
    async fn fail_orphaned_sweeps(&self, now: OffsetDateTime) -> MetadataResult<u64>;
}
