//! Metric instrument factories for handoff-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"handoff-rs"` meter. With no
//! provider installed they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for handoff-rs instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("handoff-rs")
}

/// Counter: work items submitted.
/// Labels: `result` ("created" | "existing" | "conflict").
pub fn work_submitted() -> Counter<u64> {
    meter()
        .u64_counter("handoff.work.submitted")
        .with_description("Number of work items submitted")
        .build()
}

/// Counter: delegation state transitions.
/// Labels: `from`, `to`.
pub fn work_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("handoff.work.state_transitions")
        .with_description("Number of delegation state transitions")
        .build()
}

/// Counter: escalations raised.
/// Labels: `cause` ("attempts_exhausted" | "critical_check" | "no_worker").
pub fn escalations() -> Counter<u64> {
    meter()
        .u64_counter("handoff.work.escalations")
        .with_description("Number of work items escalated to an operator")
        .build()
}

/// Counter: notifications sent on the escalation channel.
/// Labels: `level`.
pub fn notifications() -> Counter<u64> {
    meter()
        .u64_counter("handoff.notifications")
        .with_description("Number of notifications sent")
        .build()
}

/// Counter: cache entries removed.
/// Labels: `reason` ("evicted" | "expired" | "reassigned").
pub fn cache_removals() -> Counter<u64> {
    meter()
        .u64_counter("handoff.cache.removals")
        .with_description("Number of scratch cache entries removed")
        .build()
}

/// Counter: durable writes.
/// Labels: `outcome` ("won" | "lost").
pub fn fact_writes() -> Counter<u64> {
    meter()
        .u64_counter("handoff.facts.writes")
        .with_description("Number of durable fact writes")
        .build()
}

/// Counter: durable rows purged by retention.
/// Labels: `table` ("facts" | "archive").
pub fn facts_purged() -> Counter<u64> {
    meter()
        .u64_counter("handoff.facts.purged")
        .with_description("Number of durable rows purged by retention")
        .build()
}

/// Counter: validation gate runs.
/// Labels: `accepted` ("true" | "false").
pub fn validation_runs() -> Counter<u64> {
    meter()
        .u64_counter("handoff.validation.runs")
        .with_description("Number of validation gate runs")
        .build()
}

/// Histogram: backoff applied before a retry, in milliseconds.
pub fn retry_backoff_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("handoff.retry.backoff_ms")
        .with_description("Backoff before re-dispatch in milliseconds")
        .with_unit("ms")
        .build()
}
