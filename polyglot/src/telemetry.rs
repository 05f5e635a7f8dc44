//! Tracing spans and metric recording for translation and scheduling.
//!
//! Span helpers work with or without the `metrics` feature. The
//! `record_*` functions log through `tracing` and additionally update
//! Prometheus collectors when the `metrics` feature is enabled.

use std::time::Duration;

use tracing::{info_span, Span};

use crate::pool::InstanceKind;

/// Span covering one direct translation leg. Pivoted requests get one
/// span per leg.
#[must_use]
pub fn translate_span(source: &str, target: &str, batch_len: usize) -> Span {
    info_span!(
        "polyglot.translate",
        source = %source,
        target = %target,
        batch_len = batch_len,
    )
}

/// Record the outcome of one engine call.
pub fn record_translation(kind: InstanceKind, success: bool, elapsed: Duration) {
    tracing::debug!(
        kind = %kind,
        success,
        elapsed_ms = elapsed.as_millis() as u64,
        "translation finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_translation(kind.as_str(), success, elapsed.as_secs_f64());
}

/// Record tasks bound to resources by an assignment pass.
pub fn record_assignments(count: usize) {
    tracing::debug!(count, "tasks assigned to resources");

    #[cfg(feature = "metrics")]
    crate::metrics::record_assignments(count as u64);
}

/// Record resource bindings released by a reap pass.
pub fn record_releases(count: usize) {
    tracing::debug!(count, "resource bindings released");

    #[cfg(feature = "metrics")]
    crate::metrics::record_releases(count as u64);
}

/// Record tasks flipped to Timeout by a sweep pass.
pub fn record_timeouts(count: usize) {
    tracing::debug!(count, "tasks timed out");

    #[cfg(feature = "metrics")]
    crate::metrics::record_timeouts(count as u64);
}

/// Update the queue occupancy gauges.
pub fn set_queue_depth(waiting: usize, assigned: usize) {
    tracing::debug!(waiting, assigned, "queue depth updated");

    #[cfg(feature = "metrics")]
    crate::metrics::set_queue_depth(waiting as u64, assigned as u64);
}

/// Update the free-memory gauge for one resource.
pub fn set_resource_memory_free(resource_id: &str, bytes: u64) {
    tracing::trace!(resource = %resource_id, free_bytes = bytes, "resource memory refreshed");

    #[cfg(feature = "metrics")]
    crate::metrics::set_resource_memory_free(resource_id, bytes);
}
