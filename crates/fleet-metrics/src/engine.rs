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

use anyhow::{Context, Result};
use async_trait::async_trait;
use fleet_events::{
    EventBroker, OperationStateChanged, OrchestrationStateChanged, StepProcessed, Subscriber,
};
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts};

use crate::SharedRegistry;

const SUBSCRIBER_NAME: &str = "engine_metrics";

/// Counters fed by the engine event stream.
#[derive(Clone, Debug)]
pub struct EngineMetrics {
    registry: SharedRegistry,
    steps_processed: IntCounterVec,
    step_duration: HistogramVec,
    operations_finished: IntCounterVec,
    orchestrations_finished: IntCounterVec,
}

impl EngineMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let steps_processed = IntCounterVec::new(
            Opts::new(
                "fleet_steps_processed_total",
                "Step executions by operation type, step and outcome",
            ),
            &["operation_type", "step", "outcome"],
        )?;
        registry.register(Box::new(steps_processed.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let step_duration = HistogramVec::new(
            HistogramOpts::new("fleet_step_duration_seconds", "Wall-clock time of one step run")
                .buckets(buckets),
            &["operation_type", "step"],
        )?;
        registry.register(Box::new(step_duration.clone()))?;

        let operations_finished = IntCounterVec::new(
            Opts::new(
                "fleet_operations_finished_total",
                "Operations that reached a terminal state",
            ),
            &["type", "state"],
        )?;
        registry.register(Box::new(operations_finished.clone()))?;

        let orchestrations_finished = IntCounterVec::new(
            Opts::new(
                "fleet_orchestrations_finished_total",
                "Orchestrations that reached a terminal state",
            ),
            &["type", "state"],
        )?;
        registry.register(Box::new(orchestrations_finished.clone()))?;

        Ok(Self {
            registry,
            steps_processed,
            step_duration,
            operations_finished,
            orchestrations_finished,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// Subscribe to every topic of `broker`. Needs a running tokio runtime.
    pub fn attach(self: &Arc<Self>, broker: &EventBroker) -> Result<()> {
        broker
            .step_processed()
            .subscribe(SUBSCRIBER_NAME, self.clone())
            .context("subscribe to step events")?;
        broker
            .operation_state_changed()
            .subscribe(SUBSCRIBER_NAME, self.clone())
            .context("subscribe to operation state events")?;
        broker
            .orchestration_state_changed()
            .subscribe(SUBSCRIBER_NAME, self.clone())
            .context("subscribe to orchestration state events")?;
        Ok(())
    }

    pub fn record_step(&self, event: &StepProcessed) {
        let operation_type = event.operation_type.to_string();
        self.steps_processed
            .with_label_values(&[operation_type.as_str(), event.step.as_str(), event.outcome()])
            .inc();
        self.step_duration
            .with_label_values(&[operation_type.as_str(), event.step.as_str()])
            .observe(event.duration.as_secs_f64());
    }

    pub fn record_operation(&self, event: &OperationStateChanged) {
        if !event.new_state.is_finished() {
            return;
        }
        self.operations_finished
            .with_label_values(&[&event.operation_type.to_string(), &event.new_state.to_string()])
            .inc();
    }

    pub fn record_orchestration(&self, event: &OrchestrationStateChanged) {
        if !event.new_state.is_finished() {
            return;
        }
        self.orchestrations_finished
            .with_label_values(&[
                &event.orchestration_type.to_string(),
                &event.new_state.to_string(),
            ])
            .inc();
    }
}

#[async_trait]
impl Subscriber<StepProcessed> for EngineMetrics {
    async fn on_event(&self, event: StepProcessed) -> fleet_events::Result<()> {
        self.record_step(&event);
        Ok(())
    }
}

#[async_trait]
impl Subscriber<OperationStateChanged> for EngineMetrics {
    async fn on_event(&self, event: OperationStateChanged) -> fleet_events::Result<()> {
        self.record_operation(&event);
        Ok(())
    }
}

#[async_trait]
impl Subscriber<OrchestrationStateChanged> for EngineMetrics {
    async fn on_event(&self, event: OrchestrationStateChanged) -> fleet_events::Result<()> {
        self.record_orchestration(&event);
        Ok(())
    }
}
