//! Diff between observed and desired stack state
//!
//! `compute_diff` is a pure function. Equality is evaluated on the managed
//! parts of each object (labels, annotations and spec) after normalizing away
//! changes made by other actors that must not trigger updates:
//!
//! - tolerations injected by the infrastructure (key prefix
//!   [`INFRA_TOLERATION_PREFIX`])
//! - images pinned to a digest after admission (`image:tag@sha256:...`)
//! - empty resource requirements filled in by the server
//!
//! Services whose cluster IP is already allocated cannot change it in place;
//! such changes are expressed as delete + add.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec,
};
use k8s_openapi::api::core::v1::{PodTemplateSpec, ResourceRequirements, Service};
use kube::Resource;

use super::state::StackState;

/// Tolerations with this key prefix are managed by the cluster infrastructure
pub const INFRA_TOLERATION_PREFIX: &str = "com.docker.ucp";

/// Changes needed to move the observed state to the desired state
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StackStateDiff {
    pub deployments_to_add: Vec<Deployment>,
    pub deployments_to_update: Vec<Deployment>,
    pub deployments_to_delete: Vec<Deployment>,
    pub stateful_sets_to_add: Vec<StatefulSet>,
    pub stateful_sets_to_update: Vec<StatefulSet>,
    pub stateful_sets_to_delete: Vec<StatefulSet>,
    pub daemon_sets_to_add: Vec<DaemonSet>,
    pub daemon_sets_to_update: Vec<DaemonSet>,
    pub daemon_sets_to_delete: Vec<DaemonSet>,
    pub services_to_add: Vec<Service>,
    pub services_to_update: Vec<Service>,
    pub services_to_delete: Vec<Service>,
}

impl StackStateDiff {
    /// True when no cluster mutation is needed
    pub fn is_empty(&self) -> bool {
        self.deployments_to_add.is_empty()
            && self.deployments_to_update.is_empty()
            && self.deployments_to_delete.is_empty()
            && self.stateful_sets_to_add.is_empty()
            && self.stateful_sets_to_update.is_empty()
            && self.stateful_sets_to_delete.is_empty()
            && self.daemon_sets_to_add.is_empty()
            && self.daemon_sets_to_update.is_empty()
            && self.daemon_sets_to_delete.is_empty()
            && self.services_to_add.is_empty()
            && self.services_to_update.is_empty()
            && self.services_to_delete.is_empty()
    }

    /// Total number of changes, for logging
    pub fn len(&self) -> usize {
        self.deployments_to_add.len()
            + self.deployments_to_update.len()
            + self.deployments_to_delete.len()
            + self.stateful_sets_to_add.len()
            + self.stateful_sets_to_update.len()
            + self.stateful_sets_to_delete.len()
            + self.daemon_sets_to_add.len()
            + self.daemon_sets_to_update.len()
            + self.daemon_sets_to_delete.len()
            + self.services_to_add.len()
            + self.services_to_update.len()
            + self.services_to_delete.len()
    }
}

enum Change {
    None,
    Update,
    Recreate,
}

struct KindDiff<K> {
    add: Vec<K>,
    update: Vec<K>,
    delete: Vec<K>,
}

fn diff_kind<K, F>(
    current: &BTreeMap<String, K>,
    desired: &BTreeMap<String, K>,
    classify: F,
) -> KindDiff<K>
where
    K: Resource + Clone,
    F: Fn(&K, &K) -> Change,
{
    let mut result = KindDiff {
        add: Vec::new(),
        update: Vec::new(),
        delete: Vec::new(),
    };

    for (key, wanted) in desired {
        match current.get(key) {
            None => result.add.push(for_create(wanted)),
            Some(existing) => match classify(existing, wanted) {
                Change::None => {}
                Change::Update => {
                    let mut updated = wanted.clone();
                    updated.meta_mut().resource_version = existing.meta().resource_version.clone();
                    result.update.push(updated);
                }
                Change::Recreate => {
                    result.delete.push(existing.clone());
                    result.add.push(for_create(wanted));
                }
            },
        }
    }

    for (key, existing) in current {
        if !desired.contains_key(key) {
            result.delete.push(existing.clone());
        }
    }

    result
}

/// Server-owned identity must not be sent on create
fn for_create<K: Resource + Clone>(obj: &K) -> K {
    let mut obj = obj.clone();
    let meta = obj.meta_mut();
    meta.resource_version = None;
    meta.uid = None;
    meta.creation_timestamp = None;
    meta.generation = None;
    meta.managed_fields = None;
    obj
}

/// Compare observed and desired state.
pub fn compute_diff(current: &StackState, desired: &StackState) -> StackStateDiff {
    let deployments = diff_kind(&current.deployments, &desired.deployments, |c, d| {
        workload_change(c, d, c.spec.as_ref(), d.spec.as_ref())
    });
    let stateful_sets = diff_kind(&current.stateful_sets, &desired.stateful_sets, |c, d| {
        workload_change(c, d, c.spec.as_ref(), d.spec.as_ref())
    });
    let daemon_sets = diff_kind(&current.daemon_sets, &desired.daemon_sets, |c, d| {
        workload_change(c, d, c.spec.as_ref(), d.spec.as_ref())
    });
    let services = diff_kind(&current.services, &desired.services, classify_service);

    StackStateDiff {
        deployments_to_add: deployments.add,
        deployments_to_update: deployments.update,
        deployments_to_delete: deployments.delete,
        stateful_sets_to_add: stateful_sets.add,
        stateful_sets_to_update: stateful_sets.update,
        stateful_sets_to_delete: stateful_sets.delete,
        daemon_sets_to_add: daemon_sets.add,
        daemon_sets_to_update: daemon_sets.update,
        daemon_sets_to_delete: daemon_sets.delete,
        services_to_add: services.add,
        services_to_update: services.update,
        services_to_delete: services.delete,
    }
}

fn meta_equal<K: Resource>(current: &K, desired: &K) -> bool {
    let (c, d) = (current.meta(), desired.meta());
    c.labels.clone().unwrap_or_default() == d.labels.clone().unwrap_or_default()
        && c.annotations.clone().unwrap_or_default()
            == d.annotations.clone().unwrap_or_default()
}

/// Workload specs expose their pod template for normalization
pub(crate) trait PodTemplated: Clone + PartialEq {
    fn template_mut(&mut self) -> &mut PodTemplateSpec;
}

impl PodTemplated for DeploymentSpec {
    fn template_mut(&mut self) -> &mut PodTemplateSpec {
        &mut self.template
    }
}

impl PodTemplated for StatefulSetSpec {
    fn template_mut(&mut self) -> &mut PodTemplateSpec {
        &mut self.template
    }
}

impl PodTemplated for DaemonSetSpec {
    fn template_mut(&mut self) -> &mut PodTemplateSpec {
        &mut self.template
    }
}

fn workload_change<K: Resource, S: PodTemplated>(
    current: &K,
    desired: &K,
    current_spec: Option<&S>,
    desired_spec: Option<&S>,
) -> Change {
    if meta_equal(current, desired) && spec_equal(current_spec, desired_spec) {
        Change::None
    } else {
        Change::Update
    }
}

/// Compare two workload specs after normalizing the observed pod template
/// against the desired one.
pub(crate) fn spec_equal<S: PodTemplated>(current: Option<&S>, desired: Option<&S>) -> bool {
    match (current, desired) {
        (None, None) => true,
        (Some(current), Some(desired)) => {
            let mut current = current.clone();
            let mut desired = desired.clone();
            strip_infra_tolerations(desired.template_mut());
            normalize_pod_template(current.template_mut(), desired.template_mut());
            current == desired
        }
        _ => false,
    }
}

fn strip_infra_tolerations(template: &mut PodTemplateSpec) {
    if let Some(tolerations) = template
        .spec
        .as_mut()
        .and_then(|spec| spec.tolerations.as_mut())
    {
        tolerations.retain(|t| {
            !t.key
                .as_deref()
                .unwrap_or_default()
                .starts_with(INFRA_TOLERATION_PREFIX)
        });
        if tolerations.is_empty() {
            if let Some(spec) = template.spec.as_mut() {
                spec.tolerations = None;
            }
        }
    }
}

/// Remove differences introduced by other actors from the observed template.
fn normalize_pod_template(current: &mut PodTemplateSpec, desired: &PodTemplateSpec) {
    strip_infra_tolerations(current);

    let (Some(current_spec), Some(desired_spec)) = (current.spec.as_mut(), desired.spec.as_ref())
    else {
        return;
    };

    if let (Some(current_init), Some(desired_init)) = (
        current_spec.init_containers.as_mut(),
        desired_spec.init_containers.as_ref(),
    ) {
        if current_init.len() == desired_init.len() {
            for (c, d) in current_init.iter_mut().zip(desired_init) {
                unpin_image(&mut c.image, d.image.as_deref());
            }
        }
    }

    if current_spec.containers.len() == desired_spec.containers.len() {
        for (c, d) in current_spec
            .containers
            .iter_mut()
            .zip(&desired_spec.containers)
        {
            unpin_image(&mut c.image, d.image.as_deref());
            if d.resources.is_none() && c.resources == Some(ResourceRequirements::default()) {
                c.resources = None;
            }
        }
    }
}

/// `nginx:1.25@sha256:...` observed against `nginx:1.25` desired is the same image.
fn unpin_image(current: &mut Option<String>, desired: Option<&str>) {
    let Some(desired) = desired else {
        return;
    };
    let pinned = current
        .as_deref()
        .and_then(|image| image.strip_prefix(desired))
        .is_some_and(|rest| rest.starts_with('@'));
    if pinned {
        *current = Some(desired.to_string());
    }
}

fn classify_service(current: &Service, desired: &Service) -> Change {
    if meta_equal(current, desired) && current.spec == desired.spec {
        return Change::None;
    }

    let current_spec = current.spec.clone().unwrap_or_default();
    let desired_spec = desired.spec.clone().unwrap_or_default();
    let external_name = |t: &Option<String>| t.as_deref() == Some("ExternalName");
    let current_ip = current_spec.cluster_ip.clone().unwrap_or_default();
    let desired_ip = desired_spec.cluster_ip.clone().unwrap_or_default();

    if !external_name(&current_spec.type_)
        && !external_name(&desired_spec.type_)
        && !current_ip.is_empty()
        && current_ip != desired_ip
    {
        // cluster IP is immutable once allocated
        Change::Recreate
    } else {
        Change::Update
    }
}
