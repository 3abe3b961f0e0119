//! Metric instrument factories for workq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"workq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("workq")
}

/// Counter: successful claims.
/// Labels: `work_type`.
pub fn work_claimed() -> Counter<u64> {
    meter()
        .u64_counter("workq.work.claimed")
        .with_description("Number of work items claimed")
        .build()
}

/// Counter: claim attempts lost to another worker. Expected under contention.
/// Labels: `work_type`.
pub fn work_claim_lost() -> Counter<u64> {
    meter()
        .u64_counter("workq.work.claim_lost")
        .with_description("Number of claim attempts lost to another worker")
        .build()
}

/// Counter: work item status transitions.
/// Labels: `from`, `to`.
pub fn work_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("workq.work.state_transitions")
        .with_description("Number of work item status transitions")
        .build()
}

/// Counter: failed attempts rescheduled for retry.
/// Labels: `work_type`.
pub fn work_retries() -> Counter<u64> {
    meter()
        .u64_counter("workq.work.retries")
        .with_description("Number of failed attempts rescheduled for retry")
        .build()
}

/// Counter: claimed items with no registered processor.
/// Labels: `work_type`.
pub fn work_unroutable() -> Counter<u64> {
    meter()
        .u64_counter("workq.work.unroutable")
        .with_description("Work items with no registered processor")
        .build()
}

/// Histogram: wall time of one `process()` call.
/// Labels: `work_type`, `outcome`.
pub fn work_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("workq.work.duration_ms")
        .with_description("Processing duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: store-level operations (poll, claim, update, cancel).
/// Labels: `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("workq.queue.operations")
        .with_description("Number of queue store operations")
        .build()
}
