//! How published and random ports are exposed outside the cluster

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use k8s_openapi::api::core::v1::ServicePort;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::crd::ServicePortConfig;
use crate::error::Error;

/// Maps compose ports onto Service ports for the `-published` and
/// `-random-ports` services. Selected once at startup and shared by every
/// reconciliation.
pub trait ServiceStrategy: Send + Sync + fmt::Debug {
    /// Service type of the `-published` service
    fn published_service_type(&self) -> &'static str;

    /// Service type of the `-random-ports` service
    fn random_ports_service_type(&self) -> &'static str;

    /// Port of the `-published` service for a port with a published number
    fn convert_published_port(&self, port: &ServicePortConfig, name: String) -> ServicePort;

    /// Port of the `-random-ports` service for a port without one
    fn convert_random_port(&self, port: &ServicePortConfig, name: String) -> ServicePort {
        ServicePort {
            name: Some(name),
            port: port.target,
            target_port: Some(IntOrString::Int(port.target)),
            protocol: Some(protocol(port.protocol.as_deref())),
            ..Default::default()
        }
    }
}

/// Upper-cased protocol, TCP when unset
pub(crate) fn protocol(proto: Option<&str>) -> String {
    proto
        .filter(|p| !p.is_empty())
        .unwrap_or("tcp")
        .to_ascii_uppercase()
}

/// Published ports on a `LoadBalancer` service, listening on the published
/// number.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoadBalancerStrategy;

impl ServiceStrategy for LoadBalancerStrategy {
    fn published_service_type(&self) -> &'static str {
        "LoadBalancer"
    }

    fn random_ports_service_type(&self) -> &'static str {
        "NodePort"
    }

    fn convert_published_port(&self, port: &ServicePortConfig, name: String) -> ServicePort {
        ServicePort {
            name: Some(name),
            port: port.published.unwrap_or(port.target),
            target_port: Some(IntOrString::Int(port.target)),
            protocol: Some(protocol(port.protocol.as_deref())),
            ..Default::default()
        }
    }
}

/// Published ports on a `NodePort` service, the published number being the
/// node port. Clusters without load balancer support use this.
#[derive(Clone, Copy, Debug, Default)]
pub struct NodePortStrategy;

impl ServiceStrategy for NodePortStrategy {
    fn published_service_type(&self) -> &'static str {
        "NodePort"
    }

    fn random_ports_service_type(&self) -> &'static str {
        "NodePort"
    }

    fn convert_published_port(&self, port: &ServicePortConfig, name: String) -> ServicePort {
        ServicePort {
            name: Some(name),
            port: port.target,
            target_port: Some(IntOrString::Int(port.target)),
            node_port: port.published,
            protocol: Some(protocol(port.protocol.as_deref())),
            ..Default::default()
        }
    }
}

/// Strategy selected on the command line
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StrategyKind {
    #[default]
    LoadBalancer,
    NodePort,
}

impl StrategyKind {
    pub fn build(self) -> Arc<dyn ServiceStrategy> {
        match self {
            StrategyKind::LoadBalancer => Arc::new(LoadBalancerStrategy),
            StrategyKind::NodePort => Arc::new(NodePortStrategy),
        }
    }
}

impl FromStr for StrategyKind {
    type Err = Error;

    /// Accepts both the flag spelling (`node-port`) and the service type
    /// spelling (`NodePort`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "loadbalancer" => Ok(StrategyKind::LoadBalancer),
            "nodeport" => Ok(StrategyKind::NodePort),
            other => Err(Error::ConfigError(format!(
                "unknown service strategy {other:?}, expected load-balancer or node-port"
            ))),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::LoadBalancer => write!(f, "load-balancer"),
            StrategyKind::NodePort => write!(f, "node-port"),
        }
    }
}
