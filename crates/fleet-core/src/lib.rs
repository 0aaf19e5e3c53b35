//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary engine wiring and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Engine entrypoint: builds pipelines, worker queues and the orchestration
//! manager from an [`fleet_common::AppConfig`], resumes unfinished work and
//! hands back a handle for submission and shutdown.

pub mod engine;
pub mod reprocess;

pub use engine::{EngineHandle, FleetEngine};
pub use reprocess::{orchestrations_to_resume, QUEUED_OPERATION_TYPES};
