//! Desired-state builder
//!
//! Turns a [`Stack`] into the Deployments, StatefulSets, DaemonSets and
//! Services that realize it. Building is pure: the observed state is only used
//! as a base so that fields owned by other actors survive.
//!
//! Workload kind per service:
//!
//! | persistent volume | global mode | kind        |
//! |-------------------|-------------|-------------|
//! | no                | no          | Deployment  |
//! | no                | yes         | DaemonSet   |
//! | yes               | no          | StatefulSet |
//! | yes               | yes         | error       |

pub mod labels;
mod placement;
mod pod;
pub mod quantity;
mod services;
mod strategy;
mod volumes;
mod workloads;


use kube::ResourceExt;
use tracing::debug;

use crate::crd::{stack_key, ServiceConfig, Stack};
use crate::error::{Error, Result};
use crate::stackresources::StackState;

pub use labels::{
    selector_for_stack, EXPECTED_GENERATION_ANNOTATION, EXTERNAL_LABEL, SERVICE_ID_LABEL,
    SERVICE_NAME_LABEL, STACK_NAME_LABEL, USER_LABELS_ANNOTATION,
};
pub use pod::pull_policy;
pub use services::{HEADLESS_PORT, PUBLISHED_SUFFIX, RANDOM_PORTS_SUFFIX};
pub use strategy::{LoadBalancerStrategy, NodePortStrategy, ServiceStrategy, StrategyKind};

enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
}

fn workload_kind(service: &ServiceConfig) -> Result<WorkloadKind> {
    match (service.has_persistent_volume(), service.is_global()) {
        (false, false) => Ok(WorkloadKind::Deployment),
        (false, true) => Ok(WorkloadKind::DaemonSet),
        (true, false) => Ok(WorkloadKind::StatefulSet),
        (true, true) => Err(Error::GlobalWithPersistentVolume(service.name.clone())),
    }
}

/// Build the desired state of a stack.
///
/// `original` is the currently observed state of the stack's children. Clean
/// stacks reuse observed workloads whose generation matches the one recorded
/// after the last write; dirty stacks always recompute.
pub fn stack_to_stack(
    stack: &Stack,
    strategy: &dyn ServiceStrategy,
    original: &StackState,
) -> Result<StackState> {
    if stack.spec.services.is_empty() {
        return Err(Error::EmptySpec);
    }

    let namespace = stack.namespace().unwrap_or_default();
    let dirty = stack.is_dirty();

    let mut sorted: Vec<&ServiceConfig> = stack.spec.services.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut desired = StackState::default();
    for service in sorted {
        let key = stack_key(&namespace, &service.name);
        match workload_kind(service)? {
            WorkloadKind::Deployment => desired.add_deployment(workloads::deployment(
                stack,
                service,
                original.deployments.get(&key),
                dirty,
            )?),
            WorkloadKind::StatefulSet => desired.add_stateful_set(workloads::stateful_set(
                stack,
                service,
                original.stateful_sets.get(&key),
                dirty,
            )?),
            WorkloadKind::DaemonSet => desired.add_daemon_set(workloads::daemon_set(
                stack,
                service,
                original.daemon_sets.get(&key),
                dirty,
            )?),
        }
        for svc in services::services(stack, service, strategy, original)? {
            desired.add_service(svc);
        }
    }

    debug!(
        stack = %stack.key(),
        deployments = desired.deployments.len(),
        stateful_sets = desired.stateful_sets.len(),
        daemon_sets = desired.daemon_sets.len(),
        services = desired.services.len(),
        "Built desired state"
    );
    Ok(desired)
}

/// Render the desired children of `stack` as a YAML list, without touching
/// a cluster. A stack without namespace is placed in `default`.
pub fn dry_run(stack: &Stack, strategy: &dyn ServiceStrategy) -> Result<String> {
    let mut stack = stack.clone();
    if stack.metadata.namespace.is_none() {
        stack.metadata.namespace = Some("default".to_string());
    }
    let desired = stack_to_stack(&stack, strategy, &StackState::default())?;

    let mut objects = Vec::with_capacity(
        desired.deployments.len()
            + desired.stateful_sets.len()
            + desired.daemon_sets.len()
            + desired.services.len(),
    );
    for d in desired.deployments.values() {
        objects.push(serde_json::to_value(d)?);
    }
    for s in desired.stateful_sets.values() {
        objects.push(serde_json::to_value(s)?);
    }
    for d in desired.daemon_sets.values() {
        objects.push(serde_json::to_value(d)?);
    }
    for s in desired.services.values() {
        objects.push(serde_json::to_value(s)?);
    }
    Ok(serde_yaml::to_string(&objects)?)
}
