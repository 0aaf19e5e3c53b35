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

use crate::runtime::Runtime;

/// Provisioned runtime instance as recorded by the API layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Broker instance identifier.
    pub instance_id: String,
    /// Cluster runtime identifier; empty until provisioning assigns it.
    #[serde(default)]
    pub runtime_id: String,
    /// Owning global account.
    pub global_account_id: String,
    /// Owning sub account.
    #[serde(default)]
    pub sub_account_id: String,
    /// Service plan name.
    pub service_plan_name: String,
    /// Provider region.
    pub provider_region: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Optimistic-lock counter.
    #[serde(default)]
    pub version: u64,
}

impl Instance {
    /// Construct an instance record stamped with the current time.
    pub fn new(
        instance_id: impl Into<String>,
        runtime_id: impl Into<String>,
        global_account_id: impl Into<String>,
        service_plan_name: impl Into<String>,
        provider_region: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            runtime_id: runtime_id.into(),
            global_account_id: global_account_id.into(),
            sub_account_id: String::new(),
            service_plan_name: service_plan_name.into(),
            provider_region: provider_region.into(),
            created_at: Utc::now(),
            version: 0,
        }
    }

    /// Runtime descriptor without a maintenance window.
    pub fn to_runtime(&self) -> Runtime {
        Runtime {
            instance_id: self.instance_id.clone(),
            runtime_id: self.runtime_id.clone(),
            global_account_id: self.global_account_id.clone(),
            sub_account_id: self.sub_account_id.clone(),
            plan: self.service_plan_name.clone(),
            region: self.provider_region.clone(),
            maintenance_window: None,
        }
    }
}
