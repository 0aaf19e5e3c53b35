//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the engine runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_provisioning_workers() -> usize {
    60
}

fn default_deprovisioning_workers() -> usize {
    5
}

fn default_update_workers() -> usize {
    20
}

fn default_orchestration_workers() -> usize {
    3
}

fn default_operation_timeout() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_temporary_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_polling_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_not_found_backoff() -> Duration {
    Duration::from_secs(60)
}

fn default_speed_factor() -> u32 {
    1
}

fn default_parallel_workers() -> usize {
    1
}

fn default_runtime_version() -> String {
    "2.0.0".to_owned()
}

fn default_kubernetes_version() -> String {
    "1.27".to_owned()
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

/// Primary configuration object for the engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub queues: QueueConfig,
    #[serde(default)]
    pub operations: OperationsConfig,
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "FLEET_CONFIG";

    /// Load configuration from disk, respecting the `FLEET_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.queues.validate()?;
        self.orchestration.validate()?;
        if self.operations.timeout.is_zero() {
            return Err(anyhow!("operations.timeout must be greater than zero"));
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Worker pool sizes. Orchestration workers hold a slot for a whole campaign,
/// so they live in their own small pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_provisioning_workers")]
    pub provisioning_workers: usize,
    #[serde(default = "default_deprovisioning_workers")]
    pub deprovisioning_workers: usize,
    #[serde(default = "default_update_workers")]
    pub update_workers: usize,
    #[serde(default = "default_orchestration_workers")]
    pub orchestration_workers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            provisioning_workers: default_provisioning_workers(),
            deprovisioning_workers: default_deprovisioning_workers(),
            update_workers: default_update_workers(),
            orchestration_workers: default_orchestration_workers(),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, workers) in [
            ("provisioning_workers", self.provisioning_workers),
            ("deprovisioning_workers", self.deprovisioning_workers),
            ("update_workers", self.update_workers),
            ("orchestration_workers", self.orchestration_workers),
        ] {
            if workers == 0 {
                return Err(anyhow!("queues.{} must be at least 1", name));
            }
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationsConfig {
    #[serde(default = "default_operation_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
    #[serde(default = "default_temporary_backoff")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub temporary_backoff: Duration,
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            timeout: default_operation_timeout(),
            temporary_backoff: default_temporary_backoff(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    #[serde(default = "default_polling_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub polling_interval: Duration,
    #[serde(default = "default_not_found_backoff")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub not_found_backoff: Duration,
    #[serde(default)]
    pub maintenance_policy_path: Option<PathBuf>,
    #[serde(default = "default_runtime_version")]
    pub default_runtime_version: String,
    #[serde(default = "default_kubernetes_version")]
    pub default_kubernetes_version: String,
    /// Divides every strategy wait; only meant for tests.
    #[serde(default = "default_speed_factor")]
    pub speed_factor: u32,
    #[serde(default = "default_parallel_workers")]
    pub parallel_workers: usize,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            polling_interval: default_polling_interval(),
            not_found_backoff: default_not_found_backoff(),
            maintenance_policy_path: None,
            default_runtime_version: default_runtime_version(),
            default_kubernetes_version: default_kubernetes_version(),
            speed_factor: default_speed_factor(),
            parallel_workers: default_parallel_workers(),
        }
    }
}

impl OrchestrationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.polling_interval.is_zero() {
            return Err(anyhow!("orchestration.polling_interval must be greater than zero"));
        }
        if self.speed_factor == 0 {
            return Err(anyhow!("orchestration.speed_factor must be at least 1"));
        }
        if self.parallel_workers == 0 {
            return Err(anyhow!("orchestration.parallel_workers must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}
