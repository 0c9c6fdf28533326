//! Metric instrument factories for sparkq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"sparkq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for sparkq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("sparkq")
}

/// Counter: tasks enqueued.
/// Labels: `queue`.
pub fn tasks_created() -> Counter<u64> {
    meter()
        .u64_counter("sparkq.task.created")
        .with_description("Number of tasks enqueued")
        .build()
}

/// Counter: task state transitions.
/// Labels: `from`, `to`.
pub fn task_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("sparkq.task.state_transitions")
        .with_description("Number of task state transitions")
        .build()
}

/// Counter: claims that lost the race to another claimant.
pub fn claim_conflicts() -> Counter<u64> {
    meter()
        .u64_counter("sparkq.task.claim_conflicts")
        .with_description("Claims rejected because the task was no longer queued")
        .build()
}

/// Counter: watchdog actions.
/// Labels: `action` ("warned" | "auto_failed").
pub fn watchdog_actions() -> Counter<u64> {
    meter()
        .u64_counter("sparkq.watchdog.actions")
        .with_description("Stale-task warnings and auto-fails issued by the watchdog")
        .build()
}

/// Counter: finished tasks removed by retention.
pub fn tasks_purged() -> Counter<u64> {
    meter()
        .u64_counter("sparkq.task.purged")
        .with_description("Finished tasks deleted by retention")
        .build()
}

/// Histogram: invoker call duration in milliseconds.
/// Labels: `tool`, `outcome` ("ok" | "error").
pub fn invoke_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("sparkq.invoke.duration_ms")
        .with_description("Invoker call duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: LLM token usage.
/// Labels: `model`, `provider`, `direction` ("input" | "output").
pub fn llm_tokens() -> Counter<u64> {
    meter()
        .u64_counter("sparkq.llm.tokens")
        .with_description("LLM token usage")
        .build()
}
