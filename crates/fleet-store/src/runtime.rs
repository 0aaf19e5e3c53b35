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

/// Concrete time range in which a disruptive action may run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    /// Window start.
    pub begin: DateTime<Utc>,
    /// Window end, always after `begin`.
    pub end: DateTime<Utc>,
    /// Allowed weekdays the window was derived from (`Mon`, `Tue`, ...).
    #[serde(default)]
    pub days: Vec<String>,
}

/// Target runtime resolved from an orchestration's target specification.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Runtime {
    /// Broker instance identifier.
    pub instance_id: String,
    /// Cluster runtime identifier.
    pub runtime_id: String,
    /// Owning global account.
    pub global_account_id: String,
    /// Owning sub account.
    #[serde(default)]
    pub sub_account_id: String,
    /// Service plan name.
    pub plan: String,
    /// Provider region.
    pub region: String,
    /// Window assigned for this campaign; `None` means no constraint.
    #[serde(default)]
    pub maintenance_window: Option<MaintenanceWindow>,
}

impl Runtime {
    /// Start of the assigned window, if any.
    pub fn window_begin(&self) -> Option<DateTime<Utc>> {
        self.maintenance_window.as_ref().map(|w| w.begin)
    }
}
