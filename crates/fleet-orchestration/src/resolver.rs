//! ---
//! ems_section: "04-configuration-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "High-level orchestration kernel coordinating fleet campaigns."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use fleet_store::{Instance, Instances, Runtime, RuntimeTarget, TargetSpec, TARGET_ALL};
use regex::Regex;
use tracing::debug;

use crate::{OrchestrationError, Result};

/// Expands a target specification into concrete runtimes.
#[async_trait]
pub trait RuntimeResolver: Send + Sync {
    /// Runtimes selected by `targets`, without maintenance windows.
    async fn resolve(&self, targets: &TargetSpec) -> Result<Vec<Runtime>>;
}

/// Resolver backed by the instance store.
///
/// A runtime is selected when it matches any include selector and no exclude
/// selector. Instances that have not been assigned a runtime yet are skipped.
#[derive(Clone)]
pub struct InstanceResolver {
    instances: Arc<dyn Instances>,
}

impl InstanceResolver {
    /// Resolver reading from `instances`.
    pub fn new(instances: Arc<dyn Instances>) -> Self {
        Self { instances }
    }
}

impl std::fmt::Debug for InstanceResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceResolver").finish_non_exhaustive()
    }
}

struct Selector<'a> {
    target: &'a RuntimeTarget,
    region: Option<Regex>,
}

impl<'a> Selector<'a> {
    fn compile(target: &'a RuntimeTarget) -> Result<Self> {
        let region = match target.region.as_deref() {
            Some(pattern) if !pattern.is_empty() => Some(Regex::new(pattern).map_err(|err| {
                OrchestrationError::InvalidTarget(format!("region pattern {pattern}: {err}"))
            })?),
            _ => None,
        };
        if let Some(kind) = target.target.as_deref() {
            if kind != TARGET_ALL {
                return Err(OrchestrationError::InvalidTarget(format!(
                    "unknown target {kind}"
                )));
            }
        }
        Ok(Self { target, region })
    }

    fn matches(&self, instance: &Instance) -> bool {
        if self.target.target.is_some() {
            return true;
        }
        fn exact(expected: &Option<String>, actual: &str) -> bool {
            expected.as_deref().map_or(true, |value| value == actual)
        }
        let selective = self.target.global_account.is_some()
            || self.target.sub_account.is_some()
            || self.target.instance_id.is_some()
            || self.target.runtime_id.is_some()
            || self.target.plan_name.is_some()
            || self.region.is_some();
        selective
            && exact(&self.target.global_account, &instance.global_account_id)
            && exact(&self.target.sub_account, &instance.sub_account_id)
            && exact(&self.target.instance_id, &instance.instance_id)
            && exact(&self.target.runtime_id, &instance.runtime_id)
            && exact(&self.target.plan_name, &instance.service_plan_name)
            && self
                .region
                .as_ref()
                .map_or(true, |re| re.is_match(&instance.provider_region))
    }
}

fn compile_all(targets: &[RuntimeTarget]) -> Result<Vec<Selector<'_>>> {
    targets.iter().map(Selector::compile).collect()
}

#[async_trait]
impl RuntimeResolver for InstanceResolver {
    async fn resolve(&self, targets: &TargetSpec) -> Result<Vec<Runtime>> {
        let include = compile_all(&targets.include)?;
        let exclude = compile_all(&targets.exclude)?;

        let mut seen = HashSet::new();
        let mut runtimes = Vec::new();
        for instance in self.instances.list_instances().await? {
            if instance.runtime_id.is_empty() {
                debug!(instance_id = %instance.instance_id, "instance has no runtime yet, skipping");
                continue;
            }
            if !include.iter().any(|s| s.matches(&instance)) {
                continue;
            }
            if exclude.iter().any(|s| s.matches(&instance)) {
                continue;
            }
            if seen.insert(instance.instance_id.clone()) {
                runtimes.push(instance.to_runtime());
            }
        }
        Ok(runtimes)
    }
}
