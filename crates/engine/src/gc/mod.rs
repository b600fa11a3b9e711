//! Garbage collection sweeps.
//!
//! A sweep moves Idle -> Scanning -> Reclaiming -> Idle:
//!
//! 1. Chunk claims left behind by a crashed sweep are released.
//! 2. Entries past their cache's retention window are unbound.
//! 3. Scanning: unreferenced objects are filtered through the policy and
//!    ordered least recently used first. Nothing is mutated.
//! 4. Reclaiming: each selected object is released (the "no entry points
//!    here" check is repeated inside the release transaction), then its
//!    chunks are deleted if their refcount reached zero.
//! 5. Unreferenced chunks past the grace period, including those left by
//!    abandoned pushes, are deleted.
//!
//! A failed chunk delete is counted and left at refcount 0 for the next
//! sweep; it never aborts the sweep. Only one sweep runs at a time: the
//! in-process lock covers this process, the active-sweep row covers others.

pub mod policy;

pub use policy::{
    Always, GcPolicy, GracePeriod, NotAccessedWithin, ObjectCandidate, ReclaimTarget,
    RetentionPolicy,
};

use crate::chunk_store::ChunkStore;
use crate::error::EngineResult;
use crate::metrics;
use crate::object_store::NarStore;
use futures::StreamExt;
use larder_core::ChunkHash;
use larder_core::config::GcConfig;
use larder_metadata::models::{GcSweepRow, GcSweepState};
use larder_metadata::{MetadataError, MetadataStore};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub sweep_id: Option<Uuid>,
    /// Another sweep was active; nothing was done.
    pub skipped: bool,
    pub dry_run: bool,
    pub stale_deletions_reverted: u64,
    pub entries_expired: u64,
    /// Objects selected for reclamation. A dry run leaves expired entries
    /// bound, so it also counts objects that only expired entries point at.
    pub candidates: u64,
    pub objects_reclaimed: u64,
    pub chunks_reclaimed: u64,
    /// Chunk bytes removed from the storage backend.
    pub bytes_freed: u64,
    pub chunk_delete_failures: u64,
}

impl GcReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Runs sweeps against the shared stores.
pub struct GarbageCollector {
    metadata: Arc<dyn MetadataStore>,
    chunks: Arc<ChunkStore>,
    objects: Arc<NarStore>,
    config: GcConfig,
    running: Mutex<()>,
}

impl GarbageCollector {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        chunks: Arc<ChunkStore>,
        objects: Arc<NarStore>,
        config: GcConfig,
    ) -> Self {
        Self {
            metadata,
            chunks,
            objects,
            config,
            running: Mutex::new(()),
        }
    }

    /// Mark sweeps left active by a crashed process as failed so the next
    /// sweep can start.
    pub async fn recover(&self) -> EngineResult<u64> {
        let failed = self
            .metadata
            .fail_orphaned_sweeps(OffsetDateTime::now_utc())
            .await?;
        if failed > 0 {
            tracing::warn!(count = failed, "marked sweeps from a previous process as failed");
        }
        Ok(failed)
    }

    /// Run one sweep. `None` uses the policy built from configuration.
    ///
    /// Returns a report with `skipped` set if another sweep is active.
    pub async fn sweep(&self, policy: Option<GcPolicy>) -> EngineResult<GcReport> {
        let Ok(_guard) = self.running.try_lock() else {
            tracing::info!("GC sweep already running in this process, skipping");
            metrics::GC_SWEEPS.with_label_values(&["skipped"]).inc();
            return Ok(GcReport::skipped());
        };

        let policy = policy.unwrap_or_else(|| GcPolicy::from_config(&self.config));
        let sweep_id = Uuid::new_v4();
        let started_at = OffsetDateTime::now_utc();

        if !policy.dry_run {
            let row = GcSweepRow {
                sweep_id,
                state: GcSweepState::Scanning.as_str().to_string(),
                started_at,
                finished_at: None,
                stats_json: None,
            };
            match self.metadata.begin_sweep(&row).await {
                Ok(()) => {}
                Err(MetadataError::Constraint(_)) => {
                    tracing::info!("GC sweep active in another process, skipping");
                    metrics::GC_SWEEPS.with_label_values(&["skipped"]).inc();
                    return Ok(GcReport::skipped());
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::info!(
            sweep_id = %sweep_id,
            dry_run = policy.dry_run,
            budget_bytes = ?policy.target.budget_bytes,
            max_objects = ?policy.target.max_objects,
            "GC sweep started"
        );

        let mut report = GcReport {
            sweep_id: Some(sweep_id),
            dry_run: policy.dry_run,
            ..GcReport::default()
        };
        let timer = metrics::GC_SWEEP_DURATION.start_timer();
        let result = self.run(sweep_id, &policy, started_at, &mut report).await;
        timer.observe_duration();

        let state = if result.is_ok() {
            GcSweepState::Finished
        } else {
            GcSweepState::Failed
        };
        if !policy.dry_run {
            let stats_json = serde_json::to_string(&report).ok();
            if let Err(e) = self
                .metadata
                .update_sweep_state(
                    sweep_id,
                    state,
                    Some(OffsetDateTime::now_utc()),
                    stats_json.as_deref(),
                )
                .await
            {
                tracing::error!(sweep_id = %sweep_id, error = %e, "failed to record sweep outcome");
            }
        }
        metrics::GC_SWEEPS.with_label_values(&[state.as_str()]).inc();

        match result {
            Ok(()) => {
                tracing::info!(
                    sweep_id = %sweep_id,
                    entries_expired = report.entries_expired,
                    candidates = report.candidates,
                    objects_reclaimed = report.objects_reclaimed,
                    chunks_reclaimed = report.chunks_reclaimed,
                    bytes_freed = report.bytes_freed,
                    chunk_delete_failures = report.chunk_delete_failures,
                    "GC sweep finished"
                );
                Ok(report)
            }
            Err(e) => {
                tracing::error!(sweep_id = %sweep_id, error = %e, "GC sweep failed");
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        sweep_id: Uuid,
        policy: &GcPolicy,
        now: OffsetDateTime,
        report: &mut GcReport,
    ) -> EngineResult<()> {
        if !policy.dry_run {
            report.stale_deletions_reverted = self.metadata.revert_stale_deletions().await?;
            if report.stale_deletions_reverted > 0 {
                tracing::warn!(
                    sweep_id = %sweep_id,
                    count = report.stale_deletions_reverted,
                    "released chunk claims from an interrupted sweep"
                );
            }
        }

        let mut expiring = HashMap::new();
        report.entries_expired = self
            .expire_entries(sweep_id, now, policy.dry_run, &mut expiring)
            .await?;

        // Scanning
        let mut candidates: Vec<ObjectCandidate> = self
            .objects
            .unreferenced_objects()
            .await?
            .into_iter()
            .map(ObjectCandidate::from)
            .collect();
        for (nar_hash, count) in expiring {
            if self.metadata.count_entries_for_object(&nar_hash).await? != count {
                continue;
            }
            if let Some(object) = self.metadata.get_object(&nar_hash).await? {
                candidates.push(ObjectCandidate::from(object));
            }
        }
        let total_bytes = self.objects.total_bytes().await?;
        let scanned = candidates.len();
        let selected = policy.select(candidates, total_bytes, now);
        report.candidates = selected.len() as u64;
        tracing::debug!(
            sweep_id = %sweep_id,
            unreferenced = scanned,
            selected = selected.len(),
            total_bytes,
            "GC scan complete"
        );

        if policy.dry_run {
            for candidate in &selected {
                tracing::info!(
                    sweep_id = %sweep_id,
                    nar_hash = %candidate.nar_hash,
                    nar_size = candidate.nar_size,
                    last_accessed_at = %candidate.last_accessed_at,
                    "DRY-RUN: would reclaim object"
                );
            }
            return Ok(());
        }

        // Reclaiming
        self.metadata
            .update_sweep_state(sweep_id, GcSweepState::Reclaiming, None, None)
            .await?;

        let chunk_cutoff = now.checked_sub(policy.chunk_grace);
        let mut released_chunks = BTreeSet::new();
        for candidate in &selected {
            match self.objects.try_release(&candidate.nar_hash).await {
                Ok(Some(released)) => {
                    report.objects_reclaimed += 1;
                    metrics::GC_OBJECTS_RECLAIMED.inc();
                    tracing::debug!(
                        sweep_id = %sweep_id,
                        nar_hash = %released.nar_hash,
                        chunks = released.chunk_hashes.len(),
                        "released object"
                    );
                    released_chunks.extend(released.chunk_hashes);
                }
                Ok(None) => {
                    tracing::debug!(
                        sweep_id = %sweep_id,
                        nar_hash = %candidate.nar_hash,
                        "object was bound again during the sweep, keeping"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        sweep_id = %sweep_id,
                        nar_hash = %candidate.nar_hash,
                        error = %e,
                        "failed to release object, leaving it for the next sweep"
                    );
                }
            }
        }

        let Some(chunk_cutoff) = chunk_cutoff else {
            return Ok(());
        };
        let mut attempted = HashSet::new();
        self.delete_chunks(sweep_id, released_chunks, chunk_cutoff, &mut attempted, report)
            .await;

        // Orphans: refcount 0 past the grace period, from released objects
        // still in grace on an earlier sweep or from pushes that never committed.
        // Paged by key so a chunk whose delete failed (and was put back with
        // its old access time) is behind the cursor rather than in every page.
        let mut cursor: Option<(OffsetDateTime, String)> = None;
        loop {
            let after = cursor.as_ref().map(|(at, hash)| (*at, hash.as_str()));
            let batch = self
                .metadata
                .get_orphan_chunks(chunk_cutoff, after, self.config.batch_size)
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            cursor = Some((last.last_accessed_at, last.chunk_hash.clone()));
            let full_page = batch.len() >= self.config.batch_size as usize;
            self.delete_chunks(
                sweep_id,
                batch.into_iter().map(|row| row.chunk_hash),
                chunk_cutoff,
                &mut attempted,
                report,
            )
            .await;
            if !full_page {
                break;
            }
        }
        Ok(())
    }

    /// Unbind entries older than their cache's retention window.
    ///
    /// A dry run unbinds nothing; it records in `expiring` how many entries
    /// per object would go.
    async fn expire_entries(
        &self,
        sweep_id: Uuid,
        now: OffsetDateTime,
        dry_run: bool,
        expiring: &mut HashMap<String, u64>,
    ) -> EngineResult<u64> {
        let mut expired = 0;
        for cache in self.metadata.list_caches().await? {
            let retention = match cache.retention_secs {
                Some(secs) => Some(secs.max(0) as u64),
                None => self.config.default_retention_secs,
            };
            let Some(secs) = retention.filter(|secs| *secs > 0) else {
                continue;
            };
            let window = Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX));
            let Some(cutoff) = now.checked_sub(window) else {
                continue;
            };

            let count = if dry_run {
                let mut count = 0;
                for entry in self.metadata.list_entries(cache.cache_id).await? {
                    if entry.last_accessed_at < cutoff {
                        *expiring.entry(entry.nar_hash).or_default() += 1;
                        count += 1;
                    }
                }
                count
            } else {
                self.metadata.expire_entries(cache.cache_id, cutoff).await?
            };
            if count > 0 {
                tracing::info!(
                    sweep_id = %sweep_id,
                    cache = %cache.cache_name,
                    count,
                    retention_secs = secs,
                    dry_run,
                    "expired cache entries"
                );
            }
            expired += count;
        }
        Ok(expired)
    }

    async fn delete_chunks(
        &self,
        sweep_id: Uuid,
        hashes: impl IntoIterator<Item = String>,
        cutoff: OffsetDateTime,
        attempted: &mut HashSet<String>,
        report: &mut GcReport,
    ) {
        let pending: Vec<String> = hashes
            .into_iter()
            .filter(|hash| attempted.insert(hash.clone()))
            .collect();

        let chunks = &self.chunks;
        let results: Vec<(String, EngineResult<Option<u64>>)> = futures::stream::iter(pending)
            .map(|hex| async move {
                let result = match ChunkHash::from_hex(&hex) {
                    Ok(hash) => chunks.delete_if_zero(&hash, cutoff).await,
                    Err(e) => Err(e.into()),
                };
                (hex, result)
            })
            .buffer_unordered(self.config.delete_concurrency.max(1))
            .collect()
            .await;

        for (hex, result) in results {
            match result {
                Ok(Some(size)) => {
                    report.chunks_reclaimed += 1;
                    report.bytes_freed += size;
                    metrics::GC_CHUNKS_RECLAIMED.inc();
                    metrics::GC_BYTES_FREED.inc_by(size);
                }
                Ok(None) => {
                    tracing::trace!(sweep_id = %sweep_id, chunk_hash = %hex, "chunk kept");
                }
                Err(e) => {
                    report.chunk_delete_failures += 1;
                    metrics::GC_CHUNK_DELETE_FAILURES.inc();
                    tracing::warn!(
                        sweep_id = %sweep_id,
                        chunk_hash = %hex,
                        error = %e,
                        "failed to delete chunk, will retry next sweep"
                    );
                }
            }
        }
    }

    /// Sweep every `interval` until `shutdown` fires. Sweep errors are
    /// logged and the schedule continues.
    pub fn spawn_scheduler(
        self: Arc<Self>,
        interval: std::time::Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs(), "GC scheduler started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = self.sweep(None).await {
                            tracing::error!(error = %e, "scheduled GC sweep failed");
                        }
                    }
                }
            }
            tracing::info!("GC scheduler stopped");
        })
    }
}
