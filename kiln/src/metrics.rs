//! Prometheus metrics instrumentation for kiln.
//!
//! Conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `kiln_jobs_submitted_total` - Jobs entered into the registry
//! - `kiln_jobs_finished_total` - Jobs that reached a terminal state
//! - `kiln_backends_orphaned_total` - Backends whose release failed
//!
//! ## Gauges
//! - `kiln_live_backends` - Currently provisioned backends (cost exposure)
//!
//! ## Histograms
//! - `kiln_provision_duration_seconds` - Per-backend acquisition time
#![cfg(feature = "metrics")]

use prometheus::{
    exponential_buckets, CounterVec, Gauge, HistogramVec, IntCounter, Opts, Registry,
};
use std::sync::LazyLock;

/// Global Prometheus registry for kiln metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Counter for jobs submitted.
///
/// Labels:
/// - `model`: The referenced model name
/// - `mode`: The execution mode (local, remote)
pub static JOBS_SUBMITTED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("kiln_jobs_submitted_total", "Total number of jobs submitted");
    CounterVec::new(opts, &["model", "mode"])
        .expect("kiln_jobs_submitted_total metric creation failed")
});

/// Counter for jobs that reached a terminal state.
///
/// Labels:
/// - `state`: The terminal state (completed, failed, aborted)
pub static JOBS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "kiln_jobs_finished_total",
        "Total number of jobs that reached a terminal state",
    );
    CounterVec::new(opts, &["state"]).expect("kiln_jobs_finished_total metric creation failed")
});

/// Counter for backends whose release failed.
pub static BACKENDS_ORPHANED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "kiln_backends_orphaned_total",
        "Total number of backends whose release failed",
    )
    .expect("kiln_backends_orphaned_total metric creation failed")
});

/// Gauge for currently provisioned backends.
pub static LIVE_BACKENDS: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new(
        "kiln_live_backends",
        "Number of currently provisioned backends",
    )
    .expect("kiln_live_backends metric creation failed")
});

/// Histogram for per-backend acquisition time in seconds.
///
/// Labels:
/// - `mode`: The execution mode (local, remote)
pub static PROVISION_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.01, 2.0, 15).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "kiln_provision_duration_seconds",
        "Backend acquisition duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["mode"])
        .expect("kiln_provision_duration_seconds metric creation failed")
});

/// Initialize all metrics by registering them with the global registry.
///
/// Idempotent - calling it multiple times is safe.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_SUBMITTED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_FINISHED_TOTAL.clone()),
        Box::new(BACKENDS_ORPHANED_TOTAL.clone()),
        Box::new(LIVE_BACKENDS.clone()),
        Box::new(PROVISION_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

/// Helper to record a job submission.
pub fn record_job_submitted(model: &str, mode: &str) {
    JOBS_SUBMITTED_TOTAL.with_label_values(&[model, mode]).inc();
}

/// Helper to record a job reaching a terminal state.
pub fn record_job_finished(state: &str) {
    JOBS_FINISHED_TOTAL.with_label_values(&[state]).inc();
}

/// Helper to record an orphaned backend.
pub fn record_backend_orphaned() {
    BACKENDS_ORPHANED_TOTAL.inc();
}

/// Helper to adjust the live-backend gauge.
pub fn add_live_backends(delta: i64) {
    LIVE_BACKENDS.add(delta as f64);
}

/// Helper to observe a backend acquisition duration.
pub fn observe_provision_duration(mode: &str, duration_secs: f64) {
    PROVISION_DURATION_SECONDS
        .with_label_values(&[mode])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
