//! Task execution span helpers.
//!
//! Provides span creation and state-transition recording for tasks
//! flowing through a runner.

use tracing::Span;

use crate::model::TaskId;

/// Start a span for one task execution.
///
/// The `task.outcome` field is declared empty and is filled once the
/// runner has reported the result.
pub fn start_task_span(queue: &str, tool: &str, task_id: &TaskId) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.queue" = queue,
        "task.tool" = tool,
        "task.id" = %task_id,
        "task.outcome" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}

/// Record the final outcome on the span.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("task.outcome", outcome);
}
