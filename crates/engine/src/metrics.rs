//! Prometheus metrics for the Larder engine.
//!
//! Metrics are aggregate only: no cache IDs, store paths or hashes appear
//! in labels.

use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Chunk metrics
pub static CHUNKS_UPLOADED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "larder_chunks_uploaded_total",
        "Total number of chunks written to the storage backend",
    )
    .expect("metric creation failed")
});

pub static CHUNKS_DEDUPLICATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "larder_chunks_deduplicated_total",
        "Total number of chunks skipped because they were already stored",
    )
    .expect("metric creation failed")
});

pub static BYTES_INGESTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "larder_bytes_ingested_total",
        "Total bytes received by push, before deduplication",
    )
    .expect("metric creation failed")
});

pub static BYTES_UPLOADED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "larder_bytes_uploaded_total",
        "Total bytes written to the storage backend (new chunks only)",
    )
    .expect("metric creation failed")
});

// Object metrics
pub static OBJECTS_CREATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "larder_objects_created_total",
        "Total number of objects recorded for the first time",
    )
    .expect("metric creation failed")
});

pub static OBJECTS_DEDUPLICATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "larder_objects_deduplicated_total",
        "Total number of pushes whose object already existed",
    )
    .expect("metric creation failed")
});

// Fetch metrics
pub static PULLS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("larder_pulls_total", "Total number of successful resolves for pull")
        .expect("metric creation failed")
});

pub static CORRUPTION_DETECTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "larder_corruption_detected_total",
        "Total number of chunks or objects that failed hash verification",
    )
    .expect("metric creation failed")
});

pub static OPERATION_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "larder_operation_errors_total",
            "Total engine operation errors by operation and error code",
        ),
        &["operation", "code"],
    )
    .expect("metric creation failed")
});

// GC metrics
pub static GC_SWEEPS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("larder_gc_sweeps_total", "Total GC sweeps by outcome"),
        &["outcome"],
    )
    .expect("metric creation failed")
});

pub static GC_OBJECTS_RECLAIMED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "larder_gc_objects_reclaimed_total",
        "Total number of objects released by GC",
    )
    .expect("metric creation failed")
});

pub static GC_CHUNKS_RECLAIMED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "larder_gc_chunks_reclaimed_total",
        "Total number of chunks physically deleted by GC",
    )
    .expect("metric creation failed")
});

pub static GC_BYTES_FREED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "larder_gc_bytes_freed_total",
        "Total chunk bytes deleted from the storage backend by GC",
    )
    .expect("metric creation failed")
});

pub static GC_CHUNK_DELETE_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "larder_gc_chunk_delete_failures_total",
        "Total chunk deletions that failed and were left for the next sweep",
    )
    .expect("metric creation failed")
});

pub static GC_SWEEP_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("larder_gc_sweep_duration_seconds", "GC sweep duration")
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0]),
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent, so tests and embedders may call it freely.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(CHUNKS_UPLOADED.clone()),
            Box::new(CHUNKS_DEDUPLICATED.clone()),
            Box::new(BYTES_INGESTED.clone()),
            Box::new(BYTES_UPLOADED.clone()),
            Box::new(OBJECTS_CREATED.clone()),
            Box::new(OBJECTS_DEDUPLICATED.clone()),
            Box::new(PULLS.clone()),
            Box::new(CORRUPTION_DETECTED.clone()),
            Box::new(OPERATION_ERRORS.clone()),
            Box::new(GC_SWEEPS.clone()),
            Box::new(GC_OBJECTS_RECLAIMED.clone()),
            Box::new(GC_CHUNKS_RECLAIMED.clone()),
            Box::new(GC_BYTES_FREED.clone()),
            Box::new(GC_CHUNK_DELETE_FAILURES.clone()),
            Box::new(GC_SWEEP_DURATION.clone()),
        ];
        for collector in collectors {
            REGISTRY
                .register(collector)
                .expect("metric registration failed");
        }
    });
}

/// Render every registered metric in the Prometheus text format.
pub fn gather_text() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Helper to record operation errors by type.
pub fn record_error(operation: &str, code: &str) {
    OPERATION_ERRORS.with_label_values(&[operation, code]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        register_metrics();
        register_metrics();
        PULLS.inc();
        let text = gather_text().unwrap();
        assert!(text.contains("larder_pulls_total"));
    }
}
