//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export utilities."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleet_events::{EventBroker, OperationStateChanged, StepProcessed};
use fleet_metrics::{new_registry, render, spawn_http_server, EngineMetrics};
use fleet_store::{Operation, OperationState, OperationType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn step(outcome_delay: Duration, error: Option<&str>) -> StepProcessed {
    StepProcessed {
        operation_id: "op-1".into(),
        operation_type: OperationType::Provision,
        orchestration_id: None,
        stage: "create_runtime".into(),
        step: "create_cluster".into(),
        duration: Duration::from_millis(12),
        delay: outcome_delay,
        error: error.map(str::to_owned),
        old_state: OperationState::InProgress,
        new_state: OperationState::InProgress,
        timestamp: Utc::now(),
    }
}

#[test]
fn step_events_are_counted_by_outcome() {
    let metrics = EngineMetrics::new(new_registry()).unwrap();
    metrics.record_step(&step(Duration::ZERO, None));
    metrics.record_step(&step(Duration::from_secs(5), None));
    metrics.record_step(&step(Duration::ZERO, Some("boom")));

    let text = render(&metrics.registry()).unwrap();
    assert!(text.contains(
        r#"fleet_steps_processed_total{operation_type="provision",outcome="done",step="create_cluster"} 1"#
    ));
    assert!(text.contains(r#"outcome="delayed""#));
    assert!(text.contains(r#"outcome="error""#));
    assert!(text.contains("fleet_step_duration_seconds_count"));
}

#[test]
fn only_terminal_operation_states_are_counted() {
    let metrics = EngineMetrics::new(new_registry()).unwrap();
    let mut op = Operation::new("op-1", "inst-1", OperationType::Deprovision);
    op.state = OperationState::InProgress;
    metrics.record_operation(&OperationStateChanged::new(&op, OperationState::Pending));
    op.state = OperationState::Succeeded;
    metrics.record_operation(&OperationStateChanged::new(&op, OperationState::InProgress));

    let text = render(&metrics.registry()).unwrap();
    assert!(text.contains(r#"fleet_operations_finished_total{state="succeeded",type="deprovision"} 1"#));
    assert!(!text.contains(r#"state="in_progress""#));
}

#[tokio::test]
async fn attached_metrics_follow_the_broker() {
    let broker = EventBroker::shared();
    let metrics = Arc::new(EngineMetrics::new(new_registry()).unwrap());
    metrics.attach(&broker).unwrap();

    broker.publish_step(step(Duration::ZERO, None));

    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            let text = render(&metrics.registry()).unwrap();
            if text.contains("fleet_steps_processed_total{") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("step recorded");
}

#[tokio::test]
async fn exporter_binds_an_ephemeral_port_and_shuts_down() {
    let registry = new_registry();
    let server = spawn_http_server(registry, "127.0.0.1:0".parse().unwrap()).unwrap();
    assert_ne!(server.addr().port(), 0);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn exporter_serves_text_exposition() {
    let registry = new_registry();
    let metrics = EngineMetrics::new(registry.clone()).unwrap();
    metrics.record_step(&step(Duration::ZERO, None));
    let server = spawn_http_server(registry, "127.0.0.1:0".parse().unwrap()).unwrap();

    let mut stream = TcpStream::connect(server.addr()).await.unwrap();
    stream
        .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("text/plain"));
    assert!(response.contains("fleet_step_duration_seconds"));
    server.shutdown().await.unwrap();
}
