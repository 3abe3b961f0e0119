//! Work execution span helpers.
//!
//! Provides span creation and status-transition recording for work items
//! flowing through the dispatcher.

use opentelemetry::KeyValue;
use tracing::Span;

use crate::model::{Status, WorkItemId};
use crate::telemetry::metrics;

/// Start a span for one processing attempt of a work item.
///
/// The `work.status` field is declared empty and is filled by
/// [`record_state_transition`].
pub fn start_work_span(work_type: &str, id: WorkItemId, attempt: u32) -> Span {
    tracing::info_span!(
        "work.process",
        "work.type" = work_type,
        "work.id" = %id.0,
        "work.attempt" = attempt,
        "work.status" = tracing::field::Empty,
    )
}

/// Record a status transition on the span and in the transition counter.
pub fn record_state_transition(span: &Span, from: Status, to: Status) {
    span.record("work.status", tracing::field::display(to));
    span.in_scope(|| {
        tracing::info!(%from, %to, "state_transition");
    });
    metrics::work_state_transitions().add(
        1,
        &[
            KeyValue::new("from", from.to_string()),
            KeyValue::new("to", to.to_string()),
        ],
    );
}
