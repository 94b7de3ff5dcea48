//! Services of a compose service
//!
//! Each compose service gets up to three Services:
//!
//! - `<name>`: internal name resolution. Headless with a placeholder port
//!   unless internal ports are declared.
//! - `<name>-published`: ports with a published number, shaped by the
//!   [`ServiceStrategy`].
//! - `<name>-random-ports`: ports without one, exposed on a node port the
//!   cluster picks.

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::ResourceExt;

use super::labels;
use super::strategy::{protocol, ServiceStrategy};
use crate::crd::{stack_key, InternalServiceType, ServiceConfig, ServicePortConfig, Stack};
use crate::error::{Error, Result};
use crate::stackresources::StackState;

pub const PUBLISHED_SUFFIX: &str = "-published";
pub const RANDOM_PORTS_SUFFIX: &str = "-random-ports";

/// Placeholder port of headless services
pub const HEADLESS_PORT: i32 = 55555;
pub const HEADLESS_PORT_NAME: &str = "headless";

fn port_name(port: i32, proto: Option<&str>) -> String {
    format!("{port}-{}", protocol(proto).to_ascii_lowercase())
}

fn service_meta(
    stack: &Stack,
    service: &ServiceConfig,
    name: &str,
    base: Option<&Service>,
) -> ObjectMeta {
    let mut meta = base.map(|b| b.metadata.clone()).unwrap_or_default();
    meta.name = Some(name.to_string());
    meta.namespace = stack.namespace();
    labels::apply_labels(
        &mut meta,
        &Default::default(),
        &labels::for_service(&stack.name_any(), &service.name),
    );
    if let Some(refs) = labels::owner_references(stack) {
        meta.owner_references = Some(refs);
    }
    meta
}

/// Observed spec with the managed fields reset
fn base_spec(
    stack: &Stack,
    service: &ServiceConfig,
    base: Option<&Service>,
    type_: &str,
) -> ServiceSpec {
    let mut spec = base.and_then(|b| b.spec.clone()).unwrap_or_default();
    spec.type_ = Some(type_.to_string());
    spec.selector = Some(labels::for_service(&stack.name_any(), &service.name));
    spec
}

/// Keep node ports the cluster already allocated, matched by port name.
fn keep_node_ports(ports: &mut [ServicePort], base: Option<&Service>) {
    let observed = base
        .and_then(|b| b.spec.as_ref())
        .and_then(|s| s.ports.as_ref());
    let Some(observed) = observed else {
        return;
    };
    for port in ports.iter_mut().filter(|p| p.node_port.is_none()) {
        port.node_port = observed
            .iter()
            .find(|o| o.name == port.name)
            .and_then(|o| o.node_port);
    }
}

fn is_allocated(ip: Option<&str>) -> bool {
    ip.is_some_and(|ip| !ip.is_empty() && ip != "None")
}

fn internal_service(
    stack: &Stack,
    service: &ServiceConfig,
    base: Option<&Service>,
) -> Result<Service> {
    let headless = match service.internal_service_type {
        InternalServiceType::Headless => true,
        InternalServiceType::Auto => service.internal_ports.is_empty(),
        InternalServiceType::ClusterIP if service.internal_ports.is_empty() => {
            return Err(Error::InvalidPort(format!(
                "service {} requests a cluster IP but declares no internal ports",
                service.name
            )))
        }
        InternalServiceType::ClusterIP => false,
    };

    let mut spec = base_spec(stack, service, base, "ClusterIP");
    if headless {
        spec.cluster_ip = Some("None".to_string());
        spec.cluster_ips = Some(vec!["None".to_string()]);
        spec.ports = Some(vec![ServicePort {
            name: Some(HEADLESS_PORT_NAME.to_string()),
            port: HEADLESS_PORT,
            target_port: Some(IntOrString::Int(HEADLESS_PORT)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]);
    } else {
        if !is_allocated(spec.cluster_ip.as_deref()) {
            spec.cluster_ip = None;
            spec.cluster_ips = None;
        }
        let mut ports: Vec<ServicePort> = Vec::new();
        for internal in &service.internal_ports {
            let name = port_name(internal.port, internal.protocol.as_deref());
            if ports.iter().any(|p| p.name.as_deref() == Some(name.as_str())) {
                continue;
            }
            ports.push(ServicePort {
                name: Some(name),
                port: internal.port,
                target_port: Some(IntOrString::Int(internal.port)),
                protocol: Some(protocol(internal.protocol.as_deref())),
                ..Default::default()
            });
        }
        spec.ports = Some(ports);
    }

    Ok(Service {
        metadata: service_meta(stack, service, &service.name, base),
        spec: Some(spec),
        status: None,
    })
}

fn external_service(
    stack: &Stack,
    service: &ServiceConfig,
    name: &str,
    type_: &str,
    ports: Vec<ServicePort>,
    base: Option<&Service>,
) -> Service {
    let mut ports = ports;
    keep_node_ports(&mut ports, base);
    let mut spec = base_spec(stack, service, base, type_);
    spec.ports = Some(ports);
    Service {
        metadata: service_meta(stack, service, name, base),
        spec: Some(spec),
        status: None,
    }
}

fn convert_ports<F>(
    ports: &[&ServicePortConfig],
    number: fn(&ServicePortConfig) -> i32,
    convert: F,
) -> Vec<ServicePort>
where
    F: Fn(&ServicePortConfig, String) -> ServicePort,
{
    let mut out: Vec<ServicePort> = Vec::new();
    for port in ports {
        let name = port_name(number(port), port.protocol.as_deref());
        if !out.iter().any(|p| p.name.as_deref() == Some(name.as_str())) {
            out.push(convert(port, name));
        }
    }
    out
}

/// Services of one compose service, reusing observed Services as bases.
pub fn services(
    stack: &Stack,
    service: &ServiceConfig,
    strategy: &dyn ServiceStrategy,
    observed: &StackState,
) -> Result<Vec<Service>> {
    let namespace = stack.namespace().unwrap_or_default();
    let base = |name: &str| observed.services.get(&stack_key(&namespace, name));

    let mut out = vec![internal_service(stack, service, base(&service.name))?];

    let (published, random): (Vec<&ServicePortConfig>, Vec<&ServicePortConfig>) =
        service.ports.iter().partition(|p| p.published.is_some());

    if !published.is_empty() {
        let name = format!("{}{PUBLISHED_SUFFIX}", service.name);
        let ports = convert_ports(
            &published,
            |p| p.published.unwrap_or(p.target),
            |p, n| strategy.convert_published_port(p, n),
        );
        out.push(external_service(
            stack,
            service,
            &name,
            strategy.published_service_type(),
            ports,
            base(&name),
        ));
    }

    if !random.is_empty() {
        let name = format!("{}{RANDOM_PORTS_SUFFIX}", service.name);
        let ports = convert_ports(&random, |p| p.target, |p, n| strategy.convert_random_port(p, n));
        out.push(external_service(
            stack,
            service,
            &name,
            strategy.random_ports_service_type(),
            ports,
            base(&name),
        ));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::{LoadBalancerStrategy, NodePortStrategy};
    use crate::crd::InternalPort;

    fn stack() -> Stack {
        let mut stack = Stack::new("app", Default::default());
        stack.metadata.namespace = Some("default".to_string());
        stack
    }

    fn port(target: i32, published: Option<i32>) -> ServicePortConfig {
        ServicePortConfig {
            target,
            published,
            protocol: None,
        }
    }

    fn names(services: &[Service]) -> Vec<String> {
        services.iter().map(|s| s.name_any()).collect()
    }

    #[test]
    fn test_no_ports_yields_headless_only() {
        let svc = ServiceConfig {
            name: "worker".to_string(),
            ..Default::default()
        };
        let out = services(&stack(), &svc, &LoadBalancerStrategy, &StackState::default()).unwrap();
        assert_eq!(names(&out), vec!["worker"]);

        let spec = out[0].spec.as_ref().unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        let ports = spec.ports.as_ref().unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, HEADLESS_PORT);
        assert_eq!(ports[0].name.as_deref(), Some(HEADLESS_PORT_NAME));
    }

    #[test]
    fn test_published_and_random_ports_split() {
        let svc = ServiceConfig {
            name: "web".to_string(),
            ports: vec![port(8080, Some(80)), port(9090, None)],
            ..Default::default()
        };
        let out = services(&stack(), &svc, &LoadBalancerStrategy, &StackState::default()).unwrap();
        assert_eq!(names(&out), vec!["web", "web-published", "web-random-ports"]);

        let published = out[1].spec.as_ref().unwrap();
        assert_eq!(published.type_.as_deref(), Some("LoadBalancer"));
        let p = &published.ports.as_ref().unwrap()[0];
        assert_eq!(p.name.as_deref(), Some("80-tcp"));
        assert_eq!(p.port, 80);
        assert_eq!(p.target_port, Some(IntOrString::Int(8080)));

        let random = out[2].spec.as_ref().unwrap();
        assert_eq!(random.type_.as_deref(), Some("NodePort"));
        assert_eq!(random.ports.as_ref().unwrap()[0].port, 9090);
    }

    #[test]
    fn test_node_port_strategy() {
        let svc = ServiceConfig {
            name: "web".to_string(),
            ports: vec![port(8080, Some(30080))],
            ..Default::default()
        };
        let out = services(&stack(), &svc, &NodePortStrategy, &StackState::default()).unwrap();
        let spec = out[1].spec.as_ref().unwrap();
        assert_eq!(spec.type_.as_deref(), Some("NodePort"));
        let p = &spec.ports.as_ref().unwrap()[0];
        assert_eq!(p.port, 8080);
        assert_eq!(p.node_port, Some(30080));
    }

    #[test]
    fn test_internal_ports_use_cluster_ip() {
        let mut svc = ServiceConfig {
            name: "api".to_string(),
            internal_ports: vec![InternalPort {
                port: 5000,
                protocol: Some("udp".to_string()),
            }],
            ..Default::default()
        };
        let out = services(&stack(), &svc, &LoadBalancerStrategy, &StackState::default()).unwrap();
        let spec = out[0].spec.as_ref().unwrap();
        assert_eq!(spec.cluster_ip, None);
        let p = &spec.ports.as_ref().unwrap()[0];
        assert_eq!(p.name.as_deref(), Some("5000-udp"));
        assert_eq!(p.protocol.as_deref(), Some("UDP"));

        svc.internal_service_type = InternalServiceType::Headless;
        let out = services(&stack(), &svc, &LoadBalancerStrategy, &StackState::default()).unwrap();
        assert_eq!(out[0].spec.as_ref().unwrap().cluster_ip.as_deref(), Some("None"));

        svc.internal_ports.clear();
        svc.internal_service_type = InternalServiceType::ClusterIP;
        assert!(matches!(
            services(&stack(), &svc, &LoadBalancerStrategy, &StackState::default()),
            Err(Error::InvalidPort(_))
        ));
    }

    #[test]
    fn test_observed_allocations_are_preserved() {
        let svc = ServiceConfig {
            name: "web".to_string(),
            ports: vec![port(9090, None)],
            internal_ports: vec![InternalPort {
                port: 9090,
                protocol: None,
            }],
            ..Default::default()
        };
        let first = services(&stack(), &svc, &LoadBalancerStrategy, &StackState::default()).unwrap();

        let mut observed = first.clone();
        if let Some(spec) = observed[0].spec.as_mut() {
            spec.cluster_ip = Some("10.0.0.7".to_string());
            spec.cluster_ips = Some(vec!["10.0.0.7".to_string()]);
        }
        if let Some(spec) = observed[1].spec.as_mut() {
            spec.ports.as_mut().unwrap()[0].node_port = Some(31234);
        }
        let observed = StackState::new(vec![], vec![], vec![], observed);

        let second = services(&stack(), &svc, &LoadBalancerStrategy, &observed).unwrap();
        assert_eq!(
            second[0].spec.as_ref().unwrap().cluster_ip.as_deref(),
            Some("10.0.0.7")
        );
        assert_eq!(
            second[1].spec.as_ref().unwrap().ports.as_ref().unwrap()[0].node_port,
            Some(31234)
        );
    }
}
