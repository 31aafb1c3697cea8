//! Integration tests for telemetry initialization and span helpers.

use handoff_rs::config::CoordinatorConfig;
use handoff_rs::model::{State, WorkItemId};
use handoff_rs::telemetry::{
    TelemetryConfig, coordinator_attributes, init_telemetry, metrics, work,
};

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be set once per process; a second init
    // in the same binary may return Err, which is acceptable here.
    let config = TelemetryConfig {
        endpoint: None,
        service_name: "handoff-test".to_string(),
        log_level: "debug".to_string(),
        attributes: Vec::new(),
    };
    if let Ok(guard) = init_telemetry(config) {
        assert!(!guard.exporting());
        guard.force_flush();
    }
}

#[test]
fn delegation_span_records_transitions() {
    let id = WorkItemId::new("W1");
    let span = work::start_delegation_span(&id, "planner");
    work::record_state_transition(&span, State::Pending, State::Dispatched);
    work::record_state_transition(&span, State::Dispatched, State::Escalated);
}

#[test]
fn instruments_work_without_a_provider() {
    metrics::work_submitted().add(1, &[]);
    metrics::retry_backoff_ms().record(200.0, &[]);
}

#[test]
fn resource_attributes_describe_coordinator_tuning() {
    let config = CoordinatorConfig {
        max_attempts: 5,
        backoff_base_ms: 250,
        ..Default::default()
    };
    let attributes = coordinator_attributes(&config);
    let value_of = |key: &str| {
        attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| kv.value.to_string())
    };
    assert_eq!(value_of("handoff.max_attempts").as_deref(), Some("5"));
    assert_eq!(value_of("handoff.backoff_base_ms").as_deref(), Some("250"));
    assert_eq!(value_of("handoff.retention_hours").as_deref(), Some("168"));
}
