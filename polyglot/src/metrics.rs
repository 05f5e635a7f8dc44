//! Prometheus metrics, compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `polyglot_translations_total` - Engine calls by instance kind and outcome
//! - `polyglot_tasks_assigned_total` - Tasks bound to resources
//! - `polyglot_resources_released_total` - Resource bindings reaped
//! - `polyglot_tasks_timed_out_total` - Tasks flipped to Timeout
//!
//! ## Gauges
//! - `polyglot_queue_depth` - Queue entries by assignment state
//! - `polyglot_resource_memory_free_bytes` - Free device memory per resource
//!
//! ## Histograms
//! - `polyglot_translation_seconds` - Engine call latency by instance kind
#![cfg(feature = "metrics")]

use prometheus::{
    exponential_buckets, CounterVec, HistogramVec, IntCounter, IntGaugeVec, Opts, Registry,
};
use std::sync::LazyLock;

/// Global Prometheus registry for this crate's metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Counter for engine calls.
///
/// Labels:
/// - `kind`: The instance kind that served the call (`cpu`, `accelerator`)
/// - `status`: The outcome (`success`, `failure`)
pub static TRANSLATIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "polyglot_translations_total",
        "Total number of engine translation calls",
    );
    CounterVec::new(opts, &["kind", "status"])
        .expect("polyglot_translations_total metric creation failed")
});

/// Counter for tasks bound to resources by the scheduler.
pub static TASKS_ASSIGNED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "polyglot_tasks_assigned_total",
        "Total number of tasks bound to resources",
    )
    .expect("polyglot_tasks_assigned_total metric creation failed")
});

/// Counter for resource bindings released by the reap pass.
pub static RESOURCES_RELEASED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "polyglot_resources_released_total",
        "Total number of resource bindings released",
    )
    .expect("polyglot_resources_released_total metric creation failed")
});

/// Counter for tasks timed out by the sweep pass.
pub static TASKS_TIMED_OUT_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "polyglot_tasks_timed_out_total",
        "Total number of tasks flipped to Timeout",
    )
    .expect("polyglot_tasks_timed_out_total metric creation failed")
});

/// Gauge for queue occupancy.
///
/// Labels:
/// - `state`: The queue entry state (`waiting`, `assigned`)
pub static QUEUE_DEPTH: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("polyglot_queue_depth", "Queue entries by assignment state");
    IntGaugeVec::new(opts, &["state"]).expect("polyglot_queue_depth metric creation failed")
});

/// Gauge for free device memory per tracked resource.
///
/// Labels:
/// - `resource`: The resource identifier
pub static RESOURCE_MEMORY_FREE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "polyglot_resource_memory_free_bytes",
        "Free device memory in bytes per tracked resource",
    );
    IntGaugeVec::new(opts, &["resource"])
        .expect("polyglot_resource_memory_free_bytes metric creation failed")
});

/// Histogram for engine call latency in seconds.
///
/// Labels:
/// - `kind`: The instance kind that served the call
pub static TRANSLATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 15).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "polyglot_translation_seconds",
        "Engine translation call duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["kind"])
        .expect("polyglot_translation_seconds metric creation failed")
});

/// Register every metric with the global registry.
///
/// Idempotent; repeated calls tolerate duplicate registration.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(TRANSLATIONS_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(TASKS_ASSIGNED_TOTAL.clone()),
        Box::new(RESOURCES_RELEASED_TOTAL.clone()),
        Box::new(TASKS_TIMED_OUT_TOTAL.clone()),
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(RESOURCE_MEMORY_FREE.clone()),
        Box::new(TRANSLATION_SECONDS.clone()),
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

/// Record one engine call with its outcome and latency.
pub fn record_translation(kind: &str, success: bool, duration_secs: f64) {
    let status = if success { "success" } else { "failure" };
    TRANSLATIONS_TOTAL.with_label_values(&[kind, status]).inc();
    TRANSLATION_SECONDS
        .with_label_values(&[kind])
        .observe(duration_secs);
}

/// Record tasks bound to resources.
pub fn record_assignments(count: u64) {
    TASKS_ASSIGNED_TOTAL.inc_by(count);
}

/// Record resource bindings released.
pub fn record_releases(count: u64) {
    RESOURCES_RELEASED_TOTAL.inc_by(count);
}

/// Record tasks timed out.
pub fn record_timeouts(count: u64) {
    TASKS_TIMED_OUT_TOTAL.inc_by(count);
}

/// Set the queue occupancy gauges.
pub fn set_queue_depth(waiting: u64, assigned: u64) {
    QUEUE_DEPTH
        .with_label_values(&["waiting"])
        .set(waiting as i64);
    QUEUE_DEPTH
        .with_label_values(&["assigned"])
        .set(assigned as i64);
}

/// Set the free-memory gauge for one resource.
pub fn set_resource_memory_free(resource_id: &str, bytes: u64) {
    RESOURCE_MEMORY_FREE
        .with_label_values(&[resource_id])
        .set(bytes as i64);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
