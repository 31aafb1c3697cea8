//! Delegation span helpers.
//!
//! One span per work item, covering its whole lifecycle in the coordinator.

use tracing::Span;

use crate::model::{State, WorkItemId};

/// Start the span a work item's driver runs in.
///
/// The `delegation.state` field is declared empty and updated by
/// [`record_state_transition`].
pub fn start_delegation_span(id: &WorkItemId, requester: &str) -> Span {
    tracing::info_span!(
        "delegation",
        "work_item_id" = %id,
        "delegation.requester" = requester,
        "delegation.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the given span.
pub fn record_state_transition(span: &Span, from: State, to: State) {
    span.record("delegation.state", tracing::field::display(to));
    span.in_scope(|| {
        tracing::info!(%from, %to, "state_transition");
    });
}
