//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the engine runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the fleet engine workspace.
//! This crate exposes configuration loading, tracing initialisation, and the
//! clock abstraction consumed by the process and orchestration crates.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    AppConfig, LoggingConfig, MetricsConfig, OperationsConfig, OrchestrationConfig, QueueConfig,
};
pub use logging::{init_tracing, LogFormat};
pub use time::{scale_duration, Clock, ManualClock, SharedClock, SystemClock};
