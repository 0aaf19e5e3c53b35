//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persistence abstractions and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::runtime::Runtime;

/// Lifecycle state of a single operation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationState {
    /// Created, no step has run yet.
    #[default]
    Pending,
    /// At least one step has been attempted.
    InProgress,
    /// Marked for another attempt by an orchestration retry.
    Retrying,
    /// Every stage completed.
    Succeeded,
    /// A step failed or the operation timed out.
    Failed,
    /// Dropped by an orchestration cancel before it started.
    Canceled,
}

impl OperationState {
    /// States that still need processing.
    pub const NOT_FINISHED: [OperationState; 3] = [
        OperationState::Pending,
        OperationState::InProgress,
        OperationState::Retrying,
    ];

    /// True for terminal states.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            OperationState::Succeeded | OperationState::Failed | OperationState::Canceled
        )
    }
}

/// Lifecycle action an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationType {
    /// Create a runtime.
    Provision,
    /// Tear a runtime down.
    Deprovision,
    /// Change runtime parameters in place.
    Update,
    /// Upgrade the runtime components, driven by an orchestration.
    UpgradeRuntime,
    /// Upgrade the underlying cluster, driven by an orchestration.
    UpgradeCluster,
}

/// Durable record of one lifecycle action for one runtime instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique identifier.
    pub id: String,
    /// Instance the operation acts on.
    pub instance_id: String,
    /// What the operation does.
    pub operation_type: OperationType,
    /// Current lifecycle state.
    pub state: OperationState,
    /// Append-only, human-readable progress log.
    pub description: String,
    /// Optimistic-lock counter, bumped by every successful write.
    pub version: u64,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last write timestamp.
    pub updated_at: DateTime<Utc>,
    /// Start of the current attempt; the processing timeout counts from here.
    pub started_at: DateTime<Utc>,
    /// Owning orchestration, if the operation is part of a campaign.
    #[serde(default)]
    pub orchestration_id: Option<String>,
    /// Stages that have completed; never re-entered.
    #[serde(default)]
    pub finished_stages: Vec<String>,
    /// Target runtime snapshot for orchestrated operations.
    #[serde(default)]
    pub runtime: Option<Runtime>,
    /// Opaque request parameters.
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// Domain payload maintained by the steps.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Operation {
    /// Construct a pending operation stamped with the current time.
    pub fn new(
        id: impl Into<String>,
        instance_id: impl Into<String>,
        operation_type: OperationType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            instance_id: instance_id.into(),
            operation_type,
            state: OperationState::Pending,
            description: String::new(),
            version: 0,
            created_at: now,
            updated_at: now,
            started_at: now,
            orchestration_id: None,
            finished_stages: Vec::new(),
            runtime: None,
            parameters: serde_json::Value::Null,
            payload: serde_json::Value::Null,
        }
    }

    /// Attach the owning orchestration.
    pub fn with_orchestration(mut self, orchestration_id: impl Into<String>) -> Self {
        self.orchestration_id = Some(orchestration_id.into());
        self
    }

    /// Attach the target runtime snapshot.
    pub fn with_runtime(mut self, runtime: Runtime) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// True once the operation reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    /// Append an entry to the description log.
    pub fn append_description(&mut self, entry: impl AsRef<str>) {
        let entry = entry.as_ref().trim();
        if entry.is_empty() {
            return;
        }
        if !self.description.is_empty() {
            self.description.push_str("; ");
        }
        self.description.push_str(entry);
    }

    /// True when the named stage already completed.
    pub fn is_stage_finished(&self, stage: &str) -> bool {
        self.finished_stages.iter().any(|s| s == stage)
    }

    /// Record the named stage as completed.
    pub fn finish_stage(&mut self, stage: &str) {
        if !self.is_stage_finished(stage) {
            self.finished_stages.push(stage.to_owned());
        }
    }

    /// Wall-clock time spent in the current attempt.
    pub fn elapsed_since_start(&self, now: DateTime<Utc>) -> Duration {
        (now - self.started_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Query filter for listing operations. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct OperationFilter {
    /// Restrict to these operation types.
    pub types: Vec<OperationType>,
    /// Restrict to these states.
    pub states: Vec<OperationState>,
    /// Restrict to one orchestration.
    pub orchestration_id: Option<String>,
    /// Restrict to one instance.
    pub instance_id: Option<String>,
}

impl OperationFilter {
    /// Filter matching every operation of an orchestration.
    pub fn for_orchestration(orchestration_id: impl Into<String>) -> Self {
        Self {
            orchestration_id: Some(orchestration_id.into()),
            ..Self::default()
        }
    }

    /// Restrict the filter to the given states.
    pub fn with_states(mut self, states: impl IntoIterator<Item = OperationState>) -> Self {
        self.states = states.into_iter().collect();
        self
    }

    /// True when the operation satisfies every populated field.
    pub fn matches(&self, operation: &Operation) -> bool {
        (self.types.is_empty() || self.types.contains(&operation.operation_type))
            && (self.states.is_empty() || self.states.contains(&operation.state))
            && self
                .orchestration_id
                .as_deref()
                .map_or(true, |id| operation.orchestration_id.as_deref() == Some(id))
            && self
                .instance_id
                .as_deref()
                .map_or(true, |id| operation.instance_id == id)
    }
}

/// Per-state operation counts for one orchestration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationStats {
    counts: HashMap<OperationState, usize>,
}

impl OperationStats {
    /// Count one operation in the given state.
    pub fn record(&mut self, state: OperationState) {
        *self.counts.entry(state).or_default() += 1;
    }

    /// Number of operations in `state`.
    pub fn count(&self, state: OperationState) -> usize {
        self.counts.get(&state).copied().unwrap_or_default()
    }

    /// Pending + InProgress + Retrying.
    pub fn not_finished(&self) -> usize {
        OperationState::NOT_FINISHED
            .iter()
            .map(|state| self.count(*state))
            .sum()
    }

    /// Total number of operations counted.
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }
}

impl FromIterator<OperationState> for OperationStats {
    fn from_iter<I: IntoIterator<Item = OperationState>>(iter: I) -> Self {
        let mut stats = Self::default();
        for state in iter {
            stats.record(state);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_strings_are_snake_case() {
        assert_eq!(OperationState::InProgress.to_string(), "in_progress");
        assert_eq!(
            "canceled".parse::<OperationState>().unwrap(),
            OperationState::Canceled
        );
        assert_eq!(OperationType::UpgradeCluster.to_string(), "upgrade_cluster");
    }

    #[test]
    fn description_is_append_only() {
        let mut op = Operation::new("op-1", "inst-1", OperationType::Provision);
        op.append_description("started");
        op.append_description("  ");
        op.append_description("runtime created");
        assert_eq!(op.description, "started; runtime created");
    }

    #[test]
    fn finished_stages_are_recorded_once() {
        let mut op = Operation::new("op-1", "inst-1", OperationType::Provision);
        op.finish_stage("start");
        op.finish_stage("start");
        assert!(op.is_stage_finished("start"));
        assert!(!op.is_stage_finished("create_runtime"));
        assert_eq!(op.finished_stages.len(), 1);
    }

    #[test]
    fn stats_sum_not_finished_states() {
        let stats: OperationStats = [
            OperationState::Pending,
            OperationState::InProgress,
            OperationState::Retrying,
            OperationState::Failed,
            OperationState::Succeeded,
            OperationState::Succeeded,
        ]
        .into_iter()
        .collect();
        assert_eq!(stats.not_finished(), 3);
        assert_eq!(stats.count(OperationState::Succeeded), 2);
        assert_eq!(stats.count(OperationState::Canceled), 0);
        assert_eq!(stats.total(), 6);
    }

    #[test]
    fn filter_matches_populated_fields_only() {
        let op = Operation::new("op-1", "inst-1", OperationType::UpgradeRuntime)
            .with_orchestration("orch-1");
        assert!(OperationFilter::default().matches(&op));
        assert!(OperationFilter::for_orchestration("orch-1").matches(&op));
        assert!(!OperationFilter::for_orchestration("orch-2").matches(&op));
        assert!(!OperationFilter::for_orchestration("orch-1")
            .with_states([OperationState::Failed])
            .matches(&op));
    }
}
