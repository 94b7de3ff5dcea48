//! Deployment, StatefulSet and DaemonSet of a service

use k8s_openapi::api::apps::v1::{
    DaemonSet, DaemonSetSpec, DaemonSetUpdateStrategy, Deployment, DeploymentStrategy,
    StatefulSet, StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};

use super::labels::{self, EXPECTED_GENERATION_ANNOTATION};
use super::pod::pod_template;
use super::volumes::service_volumes;
use crate::crd::{ServiceConfig, Stack};
use crate::error::Result;
use crate::stackresources::{spec_equal, PodTemplated};

/// Observed object that can be reused verbatim: the stack is clean and the
/// object's generation is the one recorded after the last write.
fn reusable<K: Resource + Clone>(observed: Option<&K>, dirty: bool) -> Option<K> {
    if dirty {
        return None;
    }
    let observed = observed?;
    let meta = observed.meta();
    let expected = meta.annotations.as_ref()?.get(EXPECTED_GENERATION_ANNOTATION)?;
    let generation = meta.generation?;
    (expected.parse::<i64>().ok()? == generation).then(|| observed.clone())
}

/// Generation the object will have once the desired spec is written.
///
/// The server bumps the generation on spec changes only. Objects that never
/// went through the server (no generation yet) fall back to the recorded
/// annotation.
fn expected_generation<K: Resource>(observed: Option<&K>, spec_changed: bool) -> i64 {
    let current = observed
        .map(|o| {
            let meta = o.meta();
            meta.generation.unwrap_or_else(|| {
                meta.annotations
                    .as_ref()
                    .and_then(|a| a.get(EXPECTED_GENERATION_ANNOTATION))
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0)
            })
        })
        .unwrap_or(0);
    current + i64::from(spec_changed)
}

fn stamp<K: Resource, S: PodTemplated>(
    desired: &mut K,
    observed: Option<&K>,
    desired_spec: Option<&S>,
    observed_spec: Option<&S>,
) {
    let changed = observed.is_none() || !spec_equal(observed_spec, desired_spec);
    let generation = expected_generation(observed, changed);
    desired
        .annotations_mut()
        .insert(EXPECTED_GENERATION_ANNOTATION.to_string(), generation.to_string());
}

fn workload_meta(stack: &Stack, service: &ServiceConfig, base: Option<&ObjectMeta>) -> ObjectMeta {
    let mut meta = base.cloned().unwrap_or_default();
    let stack_name = stack.name_any();
    meta.name = Some(service.name.clone());
    meta.namespace = stack.namespace();
    labels::apply_labels(
        &mut meta,
        &service.deploy.labels,
        &labels::for_service(&stack_name, &service.name),
    );
    if let Some(refs) = labels::owner_references(stack) {
        meta.owner_references = Some(refs);
    }
    meta
}

fn selector(stack: &Stack, service: &ServiceConfig) -> LabelSelector {
    LabelSelector {
        match_labels: Some(labels::for_service(&stack.name_any(), &service.name)),
        match_expressions: None,
    }
}

fn parallelism(service: &ServiceConfig) -> Option<IntOrString> {
    service
        .deploy
        .update_config
        .as_ref()
        .and_then(|u| u.parallelism)
        .map(IntOrString::Int)
}

/// Replicated service without persistent volumes
pub fn deployment(
    stack: &Stack,
    service: &ServiceConfig,
    observed: Option<&Deployment>,
    dirty: bool,
) -> Result<Deployment> {
    if let Some(reused) = reusable(observed, dirty) {
        return Ok(reused);
    }

    let resolved = service_volumes(service)?;
    let observed_spec = observed.and_then(|o| o.spec.as_ref());
    let mut spec = observed_spec.cloned().unwrap_or_default();
    spec.replicas = Some(service.deploy.replicas.unwrap_or(1));
    spec.revision_history_limit = Some(3);
    spec.selector = selector(stack, service);
    spec.template = pod_template(
        &stack.name_any(),
        service,
        &resolved,
        observed_spec.map(|s| &s.template),
    )?;
    if let Some(max_unavailable) = parallelism(service) {
        let mut strategy = spec.strategy.take().unwrap_or_default();
        let mut rolling = strategy.rolling_update.take().unwrap_or_default();
        rolling.max_unavailable = Some(max_unavailable);
        spec.strategy = Some(DeploymentStrategy {
            type_: Some("RollingUpdate".to_string()),
            rolling_update: Some(rolling),
        });
    }

    let mut desired = Deployment {
        metadata: workload_meta(stack, service, observed.map(|o| &o.metadata)),
        spec: Some(spec),
        status: None,
    };
    let desired_spec = desired.spec.clone();
    stamp(&mut desired, observed, desired_spec.as_ref(), observed_spec);
    Ok(desired)
}

/// Keep existing claim templates: they are immutable once the set exists.
fn claim_templates(
    wanted: Vec<PersistentVolumeClaim>,
    observed: Option<&Vec<PersistentVolumeClaim>>,
) -> Option<Vec<PersistentVolumeClaim>> {
    let claims: Vec<_> = wanted
        .into_iter()
        .map(|claim| {
            observed
                .and_then(|existing| {
                    existing
                        .iter()
                        .find(|c| c.metadata.name == claim.metadata.name)
                })
                .cloned()
                .unwrap_or(claim)
        })
        .collect();
    (!claims.is_empty()).then_some(claims)
}

/// Replicated service with at least one named volume
pub fn stateful_set(
    stack: &Stack,
    service: &ServiceConfig,
    observed: Option<&StatefulSet>,
    dirty: bool,
) -> Result<StatefulSet> {
    if let Some(reused) = reusable(observed, dirty) {
        return Ok(reused);
    }

    let resolved = service_volumes(service)?;
    let observed_spec = observed.and_then(|o| o.spec.as_ref());
    let mut spec = observed_spec.cloned().unwrap_or_default();
    spec.replicas = Some(service.deploy.replicas.unwrap_or(1));
    spec.revision_history_limit = Some(3);
    spec.selector = selector(stack, service);
    spec.service_name = service.name.clone();
    spec.template = pod_template(
        &stack.name_any(),
        service,
        &resolved,
        observed_spec.map(|s| &s.template),
    )?;
    spec.volume_claim_templates = claim_templates(
        resolved.claims,
        observed_spec.and_then(|s| s.volume_claim_templates.as_ref()),
    );
    if let Some(max_unavailable) = parallelism(service) {
        let mut strategy = spec.update_strategy.take().unwrap_or_default();
        let mut rolling = strategy.rolling_update.take().unwrap_or_default();
        rolling.max_unavailable = Some(max_unavailable);
        spec.update_strategy = Some(StatefulSetUpdateStrategy {
            type_: Some("RollingUpdate".to_string()),
            rolling_update: Some(rolling),
        });
    }

    let mut desired = StatefulSet {
        metadata: workload_meta(stack, service, observed.map(|o| &o.metadata)),
        spec: Some(spec),
        status: None,
    };
    let desired_spec = desired.spec.clone();
    stamp(&mut desired, observed, desired_spec.as_ref(), observed_spec);
    Ok(desired)
}

/// Global service; one pod per eligible node
pub fn daemon_set(
    stack: &Stack,
    service: &ServiceConfig,
    observed: Option<&DaemonSet>,
    dirty: bool,
) -> Result<DaemonSet> {
    if let Some(reused) = reusable(observed, dirty) {
        return Ok(reused);
    }

    let resolved = service_volumes(service)?;
    let observed_spec = observed.and_then(|o| o.spec.as_ref());
    let mut spec: DaemonSetSpec = observed_spec.cloned().unwrap_or_default();
    spec.revision_history_limit = Some(3);
    spec.selector = selector(stack, service);
    spec.template = pod_template(
        &stack.name_any(),
        service,
        &resolved,
        observed_spec.map(|s| &s.template),
    )?;
    if let Some(max_unavailable) = parallelism(service) {
        let mut strategy = spec.update_strategy.take().unwrap_or_default();
        let mut rolling = strategy.rolling_update.take().unwrap_or_default();
        rolling.max_unavailable = Some(max_unavailable);
        spec.update_strategy = Some(DaemonSetUpdateStrategy {
            type_: Some("RollingUpdate".to_string()),
            rolling_update: Some(rolling),
        });
    }

    let mut desired = DaemonSet {
        metadata: workload_meta(stack, service, observed.map(|o| &o.metadata)),
        spec: Some(spec),
        status: None,
    };
    let desired_spec = desired.spec.clone();
    stamp(&mut desired, observed, desired_spec.as_ref(), observed_spec);
    Ok(desired)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::ResourceRequirements;

    use super::*;
    use crate::crd::{StackPhase, StackStatus, UpdateConfig};

    fn stack(dirty: bool) -> Stack {
        let mut stack = Stack::new("app", Default::default());
        stack.metadata.namespace = Some("default".to_string());
        stack.metadata.uid = Some("uid-1".to_string());
        let phase = if dirty {
            StackPhase::Failure
        } else {
            StackPhase::Available
        };
        stack.status = Some(StackStatus::new(phase, "test"));
        stack
    }

    fn service(image: &str) -> ServiceConfig {
        ServiceConfig {
            name: "web".to_string(),
            image: image.to_string(),
            ..Default::default()
        }
    }

    /// Simulate the server persisting the object
    fn persisted(mut d: Deployment, generation: i64) -> Deployment {
        d.metadata.generation = Some(generation);
        d.metadata.resource_version = Some("42".to_string());
        d
    }

    fn annotation(d: &Deployment) -> Option<&String> {
        d.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(EXPECTED_GENERATION_ANNOTATION))
    }

    #[test]
    fn test_new_deployment_defaults() {
        let d = deployment(&stack(true), &service("nginx"), None, true).unwrap();
        let spec = d.spec.as_ref().unwrap();

        assert_eq!(d.metadata.name.as_deref(), Some("web"));
        assert_eq!(d.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(spec.revision_history_limit, Some(3));
        assert!(spec.strategy.is_none());
        assert_eq!(annotation(&d).map(String::as_str), Some("1"));
        assert_eq!(d.metadata.owner_references.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_clean_stack_reuses_object_at_expected_generation() {
        let built = deployment(&stack(true), &service("nginx:1"), None, true).unwrap();
        let mut observed = persisted(built, 1);
        // mutated by another controller since the last write
        observed
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert("injected".to_string(), "yes".to_string());

        let reused = deployment(&stack(false), &service("nginx:2"), Some(&observed), false).unwrap();
        assert_eq!(reused, observed);

        // a dirty stack always recomputes
        let rebuilt = deployment(&stack(true), &service("nginx:2"), Some(&observed), true).unwrap();
        let image = rebuilt.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
            .image
            .clone();
        assert_eq!(image.as_deref(), Some("nginx:2"));
        assert_eq!(annotation(&rebuilt).map(String::as_str), Some("2"));
        assert_eq!(rebuilt.metadata.labels.as_ref().unwrap()["injected"], "yes");
        assert_eq!(rebuilt.metadata.resource_version.as_deref(), Some("42"));
    }

    #[test]
    fn test_generation_mismatch_forces_recompute() {
        let built = deployment(&stack(true), &service("nginx:1"), None, true).unwrap();
        let observed = persisted(built, 3);

        let rebuilt = deployment(&stack(false), &service("nginx:1"), Some(&observed), false).unwrap();
        // spec unchanged: expected generation catches up with the observed one
        assert_eq!(annotation(&rebuilt).map(String::as_str), Some("3"));
    }

    #[test]
    fn test_server_defaulted_resources_do_not_bump_generation() {
        let built = deployment(&stack(true), &service("nginx:1"), None, true).unwrap();
        let mut observed = persisted(built, 1);
        if let Some(pod) = observed.spec.as_mut().and_then(|s| s.template.spec.as_mut()) {
            pod.containers[0].resources = Some(ResourceRequirements::default());
        }

        let rebuilt = deployment(&stack(true), &service("nginx:1"), Some(&observed), true).unwrap();
        assert_eq!(annotation(&rebuilt).map(String::as_str), Some("1"));
        assert_eq!(rebuilt, observed);
    }

    #[test]
    fn test_removed_deploy_label_is_dropped() {
        let mut svc = service("nginx:1");
        svc.deploy.labels = BTreeMap::from([("tier".to_string(), "front".to_string())]);
        let built = deployment(&stack(true), &svc, None, true).unwrap();
        assert_eq!(built.metadata.labels.as_ref().unwrap()["tier"], "front");
        let observed = persisted(built, 1);

        svc.deploy.labels.clear();
        let rebuilt = deployment(&stack(true), &svc, Some(&observed), true).unwrap();
        assert!(!rebuilt.metadata.labels.as_ref().unwrap().contains_key("tier"));
        let template = &rebuilt.spec.as_ref().unwrap().template;
        let template_labels = template.metadata.as_ref().unwrap().labels.as_ref().unwrap();
        assert!(!template_labels.contains_key("tier"));
        assert_eq!(template_labels["com.docker.service.name"], "web");
    }

    #[test]
    fn test_parallelism_sets_rolling_update() {
        let mut svc = service("nginx");
        svc.deploy.update_config = Some(UpdateConfig {
            parallelism: Some(2),
        });
        let d = deployment(&stack(true), &svc, None, true).unwrap();
        let strategy = d.spec.unwrap().strategy.unwrap();
        assert_eq!(strategy.type_.as_deref(), Some("RollingUpdate"));
        assert_eq!(
            strategy.rolling_update.unwrap().max_unavailable,
            Some(IntOrString::Int(2))
        );
    }

    #[test]
    fn test_stateful_set_keeps_existing_claim_template() {
        let mut svc = service("postgres");
        svc.volumes = vec![crate::crd::ServiceVolumeConfig {
            source: "data".to_string(),
            target: "/var/lib/postgresql/data".to_string(),
            ..Default::default()
        }];
        let first = stateful_set(&stack(true), &svc, None, true).unwrap();
        let mut observed = first.clone();
        if let Some(claims) = observed
            .spec
            .as_mut()
            .and_then(|s| s.volume_claim_templates.as_mut())
        {
            claims[0].metadata.uid = Some("claim-uid".to_string());
        }

        let second = stateful_set(&stack(true), &svc, Some(&observed), true).unwrap();
        let spec = second.spec.unwrap();
        assert_eq!(spec.service_name, "web");
        let claims = spec.volume_claim_templates.unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].metadata.uid.as_deref(), Some("claim-uid"));
    }

    #[test]
    fn test_daemon_set_has_no_replicas() {
        let mut svc = service("fluentd");
        svc.deploy.mode = Some("global".to_string());
        let ds = daemon_set(&stack(true), &svc, None, true).unwrap();
        let spec = ds.spec.unwrap();
        assert_eq!(
            spec.template.spec.unwrap().restart_policy.as_deref(),
            Some("Always")
        );
        assert_eq!(spec.selector.match_labels.unwrap()["com.docker.service.name"], "fluentd");
    }
}
