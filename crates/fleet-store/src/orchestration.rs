//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persistence abstractions and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::operation::OperationType;

/// Target keyword selecting every runtime.
pub const TARGET_ALL: &str = "all";

/// Lifecycle state of a fleet-wide campaign.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrchestrationState {
    /// Accepted, targets not resolved yet.
    #[default]
    Pending,
    /// Per-runtime operations are running.
    InProgress,
    /// A finished campaign was asked to retry a subset of operations.
    Retrying,
    /// Cancel requested; observed on the next poll.
    Canceling,
    /// Cancel completed.
    Canceled,
    /// Every per-runtime operation succeeded.
    Succeeded,
    /// At least one per-runtime operation failed.
    Failed,
}

impl OrchestrationState {
    /// True for terminal states.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            OrchestrationState::Canceled
                | OrchestrationState::Succeeded
                | OrchestrationState::Failed
        )
    }
}

/// Kind of campaign; decides which per-runtime pipeline runs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrchestrationType {
    /// Upgrade runtime components.
    #[default]
    UpgradeRuntime,
    /// Upgrade the Kubernetes cluster.
    UpgradeCluster,
}

impl OrchestrationType {
    /// Type of the per-runtime operations this campaign creates.
    pub fn operation_type(&self) -> OperationType {
        match self {
            OrchestrationType::UpgradeRuntime => OperationType::UpgradeRuntime,
            OrchestrationType::UpgradeCluster => OperationType::UpgradeCluster,
        }
    }
}

/// Customer notification lifecycle. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationState {
    /// Initialised, create event not sent yet.
    Pending,
    /// Create event delivered.
    Created,
    /// Cancel event delivered.
    Cancelled,
}

/// Concurrency policy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StrategyType {
    /// Run every operation concurrently, bounded by the worker count.
    #[default]
    Parallel,
}

/// Settings for the parallel strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelStrategySpec {
    /// Concurrent per-runtime operations.
    pub workers: usize,
}

impl Default for ParallelStrategySpec {
    fn default() -> Self {
        Self { workers: 1 }
    }
}

/// How the per-runtime operations of a campaign are scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StrategySpec {
    /// Concurrency policy.
    #[serde(default, rename = "type")]
    pub strategy_type: StrategyType,
    /// Honour per-runtime maintenance windows.
    #[serde(default)]
    pub maintenance_window: bool,
    /// Earliest time any operation may start.
    #[serde(default)]
    pub schedule_time: Option<DateTime<Utc>>,
    /// Parallel strategy settings.
    #[serde(default)]
    pub parallel: ParallelStrategySpec,
}

/// Operations an operator asked to run again.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetryOperationParameters {
    /// Skip maintenance windows for the retried operations.
    #[serde(default)]
    pub immediate: bool,
    /// Operation identifiers to retry.
    #[serde(default)]
    pub retry_operations: Vec<String>,
}

/// One selector in a target specification. Populated fields must all match.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RuntimeTarget {
    /// [`TARGET_ALL`] selects every runtime.
    #[serde(default)]
    pub target: Option<String>,
    /// Exact global account.
    #[serde(default)]
    pub global_account: Option<String>,
    /// Exact sub account.
    #[serde(default)]
    pub sub_account: Option<String>,
    /// Exact instance identifier.
    #[serde(default)]
    pub instance_id: Option<String>,
    /// Exact runtime identifier.
    #[serde(default)]
    pub runtime_id: Option<String>,
    /// Exact plan name.
    #[serde(default)]
    pub plan_name: Option<String>,
    /// Region regular expression.
    #[serde(default)]
    pub region: Option<String>,
}

impl RuntimeTarget {
    /// Selector matching every runtime.
    pub fn all() -> Self {
        Self {
            target: Some(TARGET_ALL.to_owned()),
            ..Self::default()
        }
    }
}

/// Include/exclude target selection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TargetSpec {
    /// Runtimes matching any include selector are targeted...
    #[serde(default)]
    pub include: Vec<RuntimeTarget>,
    /// ...unless they match an exclude selector.
    #[serde(default)]
    pub exclude: Vec<RuntimeTarget>,
}

/// Campaign parameters.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OrchestrationParameters {
    /// Runtimes to act on.
    #[serde(default)]
    pub targets: TargetSpec,
    /// Scheduling policy.
    #[serde(default)]
    pub strategy: StrategySpec,
    /// Resolve and schedule without side effects in the steps.
    #[serde(default)]
    pub dry_run: bool,
    /// Pending retry request.
    #[serde(default)]
    pub retry_operation: RetryOperationParameters,
    /// Customer notification progress; `None` until initialised.
    #[serde(default)]
    pub notification_state: Option<NotificationState>,
    /// Target runtime component version.
    #[serde(default)]
    pub runtime_version: Option<String>,
    /// Target Kubernetes version.
    #[serde(default)]
    pub kubernetes_version: Option<String>,
}

/// Durable record of one fleet-wide campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Orchestration {
    /// Unique identifier.
    pub id: String,
    /// Campaign kind.
    pub orchestration_type: OrchestrationType,
    /// Current lifecycle state.
    pub state: OrchestrationState,
    /// Campaign parameters.
    pub parameters: OrchestrationParameters,
    /// Human-readable progress summary.
    pub description: String,
    /// Optimistic-lock counter.
    pub version: u64,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last write timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Orchestration {
    /// Construct a pending orchestration stamped with the current time.
    pub fn new(
        id: impl Into<String>,
        orchestration_type: OrchestrationType,
        parameters: OrchestrationParameters,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            orchestration_type,
            state: OrchestrationState::Pending,
            parameters,
            description: String::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// True once the campaign reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    /// Advance the notification state; never moves backwards.
    pub fn advance_notification(&mut self, next: NotificationState) {
        match self.parameters.notification_state {
            Some(current) if current >= next => {}
            _ => self.parameters.notification_state = Some(next),
        }
    }
}

/// Query filter for listing orchestrations. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct OrchestrationFilter {
    /// Restrict to these types.
    pub types: Vec<OrchestrationType>,
    /// Restrict to these states.
    pub states: Vec<OrchestrationState>,
}

impl OrchestrationFilter {
    /// True when the orchestration satisfies every populated field.
    pub fn matches(&self, orchestration: &Orchestration) -> bool {
        (self.types.is_empty() || self.types.contains(&orchestration.orchestration_type))
            && (self.states.is_empty() || self.states.contains(&orchestration.state))
    }
}
