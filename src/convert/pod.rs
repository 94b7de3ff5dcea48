//! Pod template of a service
//!
//! The template is merged into the observed one: only the fields listed here
//! are owned by the builder, everything else (sidecar containers, injected
//! volumes, server defaults) is carried over from the observed object.
//!
//! Managed container fields: name, image, pull policy, command, args,
//! working dir, tty, stdin, ports, env, resources, security context, liveness
//! probe, volume mounts.
//!
//! Managed pod fields: restart policy, node affinity, host aliases,
//! termination grace period, image pull secrets, auto-named volumes.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EnvVar, ExecAction, LocalObjectReference,
    PodTemplateSpec, Probe, ResourceRequirements, SecurityContext, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use super::labels;
use super::placement;
use super::quantity;
use super::strategy::protocol;
use super::volumes::{self, ServiceVolumes};
use crate::crd::{HealthCheckConfig, Resource, ServiceConfig};
use crate::error::{Error, Result};

/// `Always` for untagged and `latest` images, `IfNotPresent` otherwise.
pub fn pull_policy(image: &str) -> &'static str {
    if image.contains('@') {
        return "IfNotPresent";
    }
    // a ':' after the last '/' is a tag, before it a registry port
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    match last_segment.split_once(':') {
        None => "Always",
        Some((_, "latest")) => "Always",
        Some(_) => "IfNotPresent",
    }
}

/// Compose restart condition, validated. The pod itself always restarts:
/// Deployments, StatefulSets and DaemonSets reject any other policy.
pub fn restart_policy(service: &ServiceConfig) -> Result<&'static str> {
    let Some(policy) = service.deploy.restart_policy.as_ref() else {
        return Ok("Always");
    };
    match policy.condition.as_str() {
        "" | "any" => Ok("Always"),
        "on-failure" => Ok("OnFailure"),
        "none" => Ok("Never"),
        other => Err(Error::UnsupportedRestartPolicy(other.to_string())),
    }
}

fn env(service: &ServiceConfig) -> Result<Option<Vec<EnvVar>>> {
    let mut vars = Vec::with_capacity(service.environment.len());
    for (name, value) in &service.environment {
        let value = value.as_ref().ok_or_else(|| Error::UnsettableEnv {
            service: service.name.clone(),
            variable: name.clone(),
        })?;
        vars.push(EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            value_from: None,
        });
    }
    Ok((!vars.is_empty()).then_some(vars))
}

fn quantities(resource: Option<&Resource>) -> Result<Option<BTreeMap<String, Quantity>>> {
    let Some(resource) = resource else {
        return Ok(None);
    };
    let mut out = BTreeMap::new();
    if let Some(cpus) = resource.cpus.as_deref() {
        out.insert("cpu".to_string(), Quantity(quantity::cpus(cpus)?));
    }
    if let Some(memory) = resource.memory {
        out.insert("memory".to_string(), Quantity(quantity::memory(memory)?));
    }
    Ok((!out.is_empty()).then_some(out))
}

fn resources(service: &ServiceConfig) -> Result<Option<ResourceRequirements>> {
    let res = &service.deploy.resources;
    let limits = quantities(res.limits.as_ref())?;
    let requests = quantities(res.reservations.as_ref())?;
    if limits.is_none() && requests.is_none() {
        return Ok(None);
    }
    Ok(Some(ResourceRequirements {
        limits,
        requests,
        claims: None,
    }))
}

fn security_context(service: &ServiceConfig) -> Option<SecurityContext> {
    let capabilities = (!service.cap_add.is_empty() || !service.cap_drop.is_empty()).then(|| {
        Capabilities {
            add: (!service.cap_add.is_empty()).then(|| service.cap_add.clone()),
            drop: (!service.cap_drop.is_empty()).then(|| service.cap_drop.clone()),
        }
    });
    if !service.privileged && !service.read_only && capabilities.is_none() && service.user.is_none()
    {
        return None;
    }
    Some(SecurityContext {
        privileged: service.privileged.then_some(true),
        read_only_root_filesystem: service.read_only.then_some(true),
        capabilities,
        run_as_user: service.user,
        ..Default::default()
    })
}

/// Exec liveness probe from a compose health check
pub fn liveness_probe(health_check: Option<&HealthCheckConfig>) -> Option<Probe> {
    let hc = health_check?;
    let command = match hc.test.split_first() {
        None => return None,
        Some((first, _)) if first == "NONE" => return None,
        Some((first, rest)) if first == "CMD" => rest.to_vec(),
        Some((first, rest)) if first == "CMD-SHELL" => {
            vec!["sh".to_string(), "-c".to_string(), rest.join(" ")]
        }
        Some(_) => hc.test.clone(),
    };
    if command.is_empty() {
        return None;
    }
    Some(Probe {
        exec: Some(ExecAction {
            command: Some(command),
        }),
        initial_delay_seconds: hc.start_period,
        timeout_seconds: Some(hc.timeout.unwrap_or(1)),
        period_seconds: Some(hc.interval.unwrap_or(10)),
        failure_threshold: Some(hc.retries.unwrap_or(3)),
        success_threshold: Some(1),
        ..Default::default()
    })
}

fn container_ports(service: &ServiceConfig) -> Option<Vec<ContainerPort>> {
    let declared = service
        .ports
        .iter()
        .map(|p| (p.target, protocol(p.protocol.as_deref())))
        .chain(
            service
                .internal_ports
                .iter()
                .map(|p| (p.port, protocol(p.protocol.as_deref()))),
        );
    let mut ports: Vec<ContainerPort> = Vec::new();
    for (port, proto) in declared {
        let duplicate = ports
            .iter()
            .any(|p| p.container_port == port && p.protocol.as_deref() == Some(proto.as_str()));
        if !duplicate {
            ports.push(ContainerPort {
                container_port: port,
                protocol: Some(proto),
                ..Default::default()
            });
        }
    }
    (!ports.is_empty()).then_some(ports)
}

fn non_empty(values: &[String]) -> Option<Vec<String>> {
    (!values.is_empty()).then(|| values.to_vec())
}

/// Overwrite the managed fields of the service container.
fn merge_container(
    mut container: Container,
    service: &ServiceConfig,
    mounts: Vec<VolumeMount>,
) -> Result<Container> {
    container.name = service.name.clone();
    container.image = Some(service.image.clone());
    container.image_pull_policy = Some(pull_policy(&service.image).to_string());
    container.command = non_empty(&service.entrypoint);
    container.args = non_empty(&service.command);
    container.working_dir = service.working_dir.clone();
    container.tty = service.tty.then_some(true);
    container.stdin = service.stdin_open.then_some(true);
    container.ports = container_ports(service);
    container.env = env(service)?;
    // the server stores an empty requirements object when none is declared
    container.resources = match resources(service)? {
        Some(declared) => Some(declared),
        None => container
            .resources
            .take()
            .filter(|observed| *observed == ResourceRequirements::default()),
    };
    container.security_context = security_context(service);
    container.liveness_probe = liveness_probe(service.health_check.as_ref());
    container.volume_mounts = (!mounts.is_empty()).then_some(mounts);
    Ok(container)
}

/// Build the pod template of a service on top of the observed one.
pub fn pod_template(
    stack_name: &str,
    service: &ServiceConfig,
    resolved: &ServiceVolumes,
    base: Option<&PodTemplateSpec>,
) -> Result<PodTemplateSpec> {
    restart_policy(service)?;

    let base = base.cloned().unwrap_or_default();
    let mut meta = base.metadata.unwrap_or_default();
    let mut extra = service.labels.clone();
    extra.extend(service.deploy.labels.clone());
    labels::apply_labels(
        &mut meta,
        &extra,
        &labels::for_service(stack_name, &service.name),
    );

    let mut spec = base.spec.unwrap_or_default();

    let mut containers = std::mem::take(&mut spec.containers);
    let index = containers
        .iter()
        .position(|c| c.name == service.name)
        .unwrap_or(0);
    if containers.is_empty() {
        containers.push(Container::default());
    }
    let own = std::mem::take(&mut containers[index]);
    containers[index] = merge_container(own, service, resolved.mounts.clone())?;
    spec.containers = containers;

    let node_affinity = placement::node_affinity(service.deploy.placement.constraints.as_ref())?;
    spec.affinity = Some(placement::merge_affinity(spec.affinity.take(), node_affinity));
    spec.restart_policy = Some("Always".to_string());
    spec.host_aliases = placement::host_aliases(&service.extra_hosts);
    if let Some(grace) = service.stop_grace_period {
        spec.termination_grace_period_seconds = Some(grace);
    }
    spec.image_pull_secrets = service.pull_secret.as_ref().map(|name| {
        vec![LocalObjectReference {
            name: Some(name.clone()),
        }]
    });
    spec.volumes = volumes::merge_volumes(resolved.volumes.clone(), spec.volumes.take());

    Ok(PodTemplateSpec {
        metadata: Some(meta),
        spec: Some(spec),
    })
}
