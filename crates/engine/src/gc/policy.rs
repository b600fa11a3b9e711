//! Which unreferenced objects a sweep reclaims, and how many.
//!
//! Retention policies decide eligibility and combine conjunctively: an
//! object is a candidate only if every policy agrees. The reclaim target
//! then bounds how much of the eligible set goes, least recently used
//! first.

use larder_core::config::GcConfig;
use larder_metadata::models::ObjectRow;
use std::fmt;
use time::{Duration, OffsetDateTime};

/// An unreferenced object considered by a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectCandidate {
    pub nar_hash: String,
    pub nar_size: u64,
    pub created_at: OffsetDateTime,
    pub last_accessed_at: OffsetDateTime,
}

impl From<ObjectRow> for ObjectCandidate {
    fn from(row: ObjectRow) -> Self {
        Self {
            nar_hash: row.nar_hash,
            nar_size: row.nar_size.max(0) as u64,
            created_at: row.created_at,
            last_accessed_at: row.last_accessed_at,
        }
    }
}

/// Decides whether an unreferenced object may be reclaimed.
pub trait RetentionPolicy: Send + Sync + fmt::Debug {
    fn is_eligible(&self, candidate: &ObjectCandidate, now: OffsetDateTime) -> bool;
}

/// Keep objects created or accessed within the window. Protects objects
/// whose push has committed but not yet bound.
#[derive(Debug, Clone, Copy)]
pub struct GracePeriod(pub Duration);

impl RetentionPolicy for GracePeriod {
    fn is_eligible(&self, candidate: &ObjectCandidate, now: OffsetDateTime) -> bool {
        match now.checked_sub(self.0) {
            Some(cutoff) => candidate.created_at <= cutoff && candidate.last_accessed_at <= cutoff,
            None => false,
        }
    }
}

/// Eligible once not accessed for the window.
#[derive(Debug, Clone, Copy)]
pub struct NotAccessedWithin(pub Duration);

impl RetentionPolicy for NotAccessedWithin {
    fn is_eligible(&self, candidate: &ObjectCandidate, now: OffsetDateTime) -> bool {
        now.checked_sub(self.0)
            .is_some_and(|cutoff| candidate.last_accessed_at <= cutoff)
    }
}

/// Every unreferenced object is eligible.
#[derive(Debug, Clone, Copy)]
pub struct Always;

impl RetentionPolicy for Always {
    fn is_eligible(&self, _candidate: &ObjectCandidate, _now: OffsetDateTime) -> bool {
        true
    }
}

/// How much of the eligible set one sweep reclaims. Unset fields do not limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimTarget {
    /// Stop once stored object bytes are at or below this.
    pub budget_bytes: Option<u64>,
    /// Stop after this many objects.
    pub max_objects: Option<u64>,
}

/// Policy for one sweep.
#[derive(Debug)]
pub struct GcPolicy {
    pub retention: Vec<Box<dyn RetentionPolicy>>,
    pub target: ReclaimTarget,
    /// Minimum idle time before an unreferenced chunk is deleted.
    pub chunk_grace: Duration,
    /// Report what would be reclaimed without changing anything.
    pub dry_run: bool,
}

impl GcPolicy {
    /// The policy scheduled sweeps use.
    pub fn from_config(config: &GcConfig) -> Self {
        Self {
            retention: vec![Box::new(GracePeriod(config.grace_period()))],
            target: ReclaimTarget {
                budget_bytes: config.budget_bytes,
                max_objects: config.max_objects_per_sweep,
            },
            chunk_grace: config.grace_period(),
            dry_run: false,
        }
    }

    /// Reclaim everything unreferenced, with no grace.
    pub fn immediate() -> Self {
        Self {
            retention: vec![Box::new(Always)],
            target: ReclaimTarget::default(),
            chunk_grace: Duration::ZERO,
            dry_run: false,
        }
    }

    pub fn with_retention(mut self, policy: impl RetentionPolicy + 'static) -> Self {
        self.retention.push(Box::new(policy));
        self
    }

    pub fn with_target(mut self, target: ReclaimTarget) -> Self {
        self.target = target;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn is_eligible(&self, candidate: &ObjectCandidate, now: OffsetDateTime) -> bool {
        self.retention.iter().all(|p| p.is_eligible(candidate, now))
    }

    /// Pick the objects to reclaim.
    ///
    /// Eligible candidates are ordered by last access, then creation time,
    /// then hash, and taken until the target is met. `total_bytes` is the
    /// current size of all stored objects.
    pub fn select(
        &self,
        candidates: Vec<ObjectCandidate>,
        total_bytes: u64,
        now: OffsetDateTime,
    ) -> Vec<ObjectCandidate> {
        let mut eligible: Vec<ObjectCandidate> = candidates
            .into_iter()
            .filter(|c| self.is_eligible(c, now))
            .collect();
        eligible.sort_by(|a, b| {
            a.last_accessed_at
                .cmp(&b.last_accessed_at)
                .then(a.created_at.cmp(&b.created_at))
                .then_with(|| a.nar_hash.cmp(&b.nar_hash))
        });

        let mut remaining = total_bytes;
        let mut selected = Vec::new();
        for candidate in eligible {
            if let Some(budget) = self.target.budget_bytes
                && remaining <= budget
            {
                break;
            }
            if let Some(max) = self.target.max_objects
                && selected.len() as u64 >= max
            {
                break;
            }
            remaining = remaining.saturating_sub(candidate.nar_size);
            selected.push(candidate);
        }
        selected
    }
}
