//! ---
//! ems_section: "04-configuration-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "High-level orchestration kernel coordinating fleet campaigns."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::maintenance::MaintenancePolicy;
use crate::{OrchestrationError, Result};

/// Supplies the maintenance policy. Loaded once per orchestration pass.
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// Current policy.
    async fn load(&self) -> Result<MaintenancePolicy>;
}

/// Policy stored as a JSON document on disk.
#[derive(Debug, Clone)]
pub struct JsonFilePolicySource {
    path: PathBuf,
}

impl JsonFilePolicySource {
    /// Read the policy from `path` on every load.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PolicySource for JsonFilePolicySource {
    async fn load(&self) -> Result<MaintenancePolicy> {
        let raw = tokio::fs::read(&self.path).await.map_err(|err| {
            OrchestrationError::Policy(format!("read {}: {err}", self.path.display()))
        })?;
        serde_json::from_slice(&raw).map_err(|err| {
            OrchestrationError::Policy(format!("parse {}: {err}", self.path.display()))
        })
    }
}

/// Fixed in-memory policy. An empty policy yields no windows.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicySource(pub MaintenancePolicy);

#[async_trait]
impl PolicySource for StaticPolicySource {
    async fn load(&self) -> Result<MaintenancePolicy> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn loads_policy_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"rules": [], "default": {{"days": ["Mon", "Wed"], "timeBegin": "020000+0000", "timeEnd": "040000+0000"}}}}"#
        )
        .unwrap();

        let policy = JsonFilePolicySource::new(file.path()).load().await.unwrap();
        assert_eq!(policy.default.days, vec!["Mon", "Wed"]);
        assert!(policy.rules.is_empty());
    }

    #[tokio::test]
    async fn missing_file_is_a_policy_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = JsonFilePolicySource::new(dir.path().join("policy.json"))
            .load()
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Policy(_)));
    }

    #[tokio::test]
    async fn malformed_document_is_a_policy_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        let err = JsonFilePolicySource::new(file.path()).load().await.unwrap_err();
        assert!(err.to_string().contains("parse"));
    }
}
