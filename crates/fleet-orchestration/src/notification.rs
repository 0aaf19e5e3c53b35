//! ---
//! ems_section: "04-configuration-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "High-level orchestration kernel coordinating fleet campaigns."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Customer notification boundary.

use async_trait::async_trait;
use fleet_store::OrchestrationType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Event type announcing a runtime component upgrade.
pub const RUNTIME_MAINTENANCE_EVENT: &str = "runtime_maintenance";
/// Event type announcing a Kubernetes upgrade.
pub const KUBERNETES_MAINTENANCE_EVENT: &str = "kubernetes_maintenance";

/// Event type announced for a campaign kind.
pub fn event_type_for(orchestration_type: OrchestrationType) -> &'static str {
    match orchestration_type {
        OrchestrationType::UpgradeRuntime => RUNTIME_MAINTENANCE_EVENT,
        OrchestrationType::UpgradeCluster => KUBERNETES_MAINTENANCE_EVENT,
    }
}

/// One affected tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationTenant {
    /// Affected instance.
    pub instance_id: String,
    /// Announced start, `%Y-%m-%d %H:%M:%S` UTC.
    pub start_date: String,
    /// Announced end; empty when the campaign has no windows.
    #[serde(default)]
    pub end_date: String,
}

/// Payload of a notification event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationParams {
    /// Owning orchestration.
    pub orchestration_id: String,
    /// See [`RUNTIME_MAINTENANCE_EVENT`] and [`KUBERNETES_MAINTENANCE_EVENT`].
    pub event_type: String,
    /// Affected tenants.
    pub tenants: Vec<NotificationTenant>,
}

/// Notification backend failure.
#[derive(Debug, Clone, Error)]
pub enum NotificationError {
    /// Worth retrying after a short backoff.
    #[error("temporary notification failure: {0}")]
    Temporary(String),
    /// Will not succeed on retry.
    #[error("notification failure: {0}")]
    Permanent(String),
}

impl NotificationError {
    /// True for [`NotificationError::Temporary`].
    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }
}

/// Pending notification for one orchestration.
#[async_trait]
pub trait Bundle: Send + Sync {
    /// Announce the campaign.
    async fn create_notification_event(&self) -> Result<(), NotificationError>;
    /// Refresh the announced tenants.
    async fn update_notification_event(&self) -> Result<(), NotificationError>;
    /// Withdraw the announcement.
    async fn cancel_notification_event(&self) -> Result<(), NotificationError>;
}

/// Creates bundles.
pub trait BundleBuilder: Send + Sync {
    /// True when notifications are switched off.
    fn disabled_check(&self) -> bool;
    /// Bundle for orchestration `id`.
    fn new_bundle(
        &self,
        id: &str,
        params: NotificationParams,
    ) -> Result<Box<dyn Bundle>, NotificationError>;
}

/// Builder used when no notification backend is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledBundleBuilder;

struct NoopBundle;

#[async_trait]
impl Bundle for NoopBundle {
    async fn create_notification_event(&self) -> Result<(), NotificationError> {
        Ok(())
    }

    async fn update_notification_event(&self) -> Result<(), NotificationError> {
        Ok(())
    }

    async fn cancel_notification_event(&self) -> Result<(), NotificationError> {
        Ok(())
    }
}

impl BundleBuilder for DisabledBundleBuilder {
    fn disabled_check(&self) -> bool {
        true
    }

    fn new_bundle(
        &self,
        _id: &str,
        _params: NotificationParams,
    ) -> Result<Box<dyn Bundle>, NotificationError> {
        Ok(Box::new(NoopBundle))
    }
}
