//! Telemetry initialization and span helpers.

use sparkq::model::TaskId;
use sparkq::telemetry::{TelemetryConfig, genai, init_telemetry, metrics, task};

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be set once per process; a second
    // initialization returns Err instead of panicking.
    let config = TelemetryConfig {
        endpoint: None,
        service_name: "sparkq-test".to_string(),
        default_filter: "sparkq=debug".to_string(),
    };
    let _guard = init_telemetry(config);
}

#[test]
fn genai_chat_span_creates_and_records_tokens() {
    let span = genai::start_chat_span("claude-sonnet-4-20250514", "anthropic");
    genai::record_token_usage(&span, 100, 50);
}

#[test]
fn task_span_records_transitions_and_outcome() {
    let id = TaskId::new();
    let span = task::start_task_span("jobs", "llm-haiku", &id);
    task::record_state_transition(&span, "queued", "running");
    task::record_state_transition(&span, "running", "succeeded");
    task::record_outcome(&span, "succeeded");
}

#[test]
fn metric_instruments_build_against_the_noop_provider() {
    metrics::tasks_created().add(1, &[]);
    metrics::claim_conflicts().add(1, &[]);
    metrics::invoke_duration_ms().record(12.5, &[]);
}

/// Requires an OTLP collector on localhost:4317:
/// `cargo test --test telemetry_test -- --ignored`
#[tokio::test]
#[ignore]
async fn exports_to_local_collector() {
    let guard = init_telemetry(TelemetryConfig {
        endpoint: Some("http://localhost:4317".to_string()),
        service_name: "sparkq-smoke-test".to_string(),
        default_filter: "info".to_string(),
    })
    .unwrap();

    {
        let span = task::start_task_span("smoke", "dry-run", &TaskId::new());
        let _entered = span.enter();
        tracing::info!("smoke test event");
        task::record_outcome(&span, "succeeded");
    }
    metrics::tasks_created().add(1, &[opentelemetry::KeyValue::new("queue", "smoke")]);
    guard.force_flush();
}
