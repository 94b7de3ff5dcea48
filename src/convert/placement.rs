//! Placement constraints and host aliases

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, HostAlias, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
};

use crate::crd::{Constraint, Constraints};
use crate::error::{Error, Result};

pub const OS_LABEL: &str = "kubernetes.io/os";
pub const ARCH_LABEL: &str = "kubernetes.io/arch";
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

fn requirement(key: &str, constraint: &Constraint) -> Result<NodeSelectorRequirement> {
    let operator = match constraint.operator.as_str() {
        "==" => "In",
        "!=" => "NotIn",
        ">" => "Gt",
        "<" => "Lt",
        other => {
            return Err(Error::InvalidPlacement(format!(
                "unsupported operator {other:?} for {key}"
            )))
        }
    };
    Ok(NodeSelectorRequirement {
        key: key.to_string(),
        operator: operator.to_string(),
        values: Some(vec![constraint.value.clone()]),
    })
}

/// Node affinity for a service. Linux/amd64 nodes are required unless a
/// constraint on the same label says otherwise.
pub fn node_affinity(constraints: Option<&Constraints>) -> Result<NodeAffinity> {
    let mut requirements: BTreeMap<String, NodeSelectorRequirement> = BTreeMap::new();
    for (key, value) in [(OS_LABEL, "linux"), (ARCH_LABEL, "amd64")] {
        requirements.insert(
            key.to_string(),
            NodeSelectorRequirement {
                key: key.to_string(),
                operator: "In".to_string(),
                values: Some(vec![value.to_string()]),
            },
        );
    }

    if let Some(constraints) = constraints {
        let named = [
            (OS_LABEL, &constraints.operating_system),
            (ARCH_LABEL, &constraints.architecture),
            (HOSTNAME_LABEL, &constraints.hostname),
        ];
        for (key, constraint) in named {
            if let Some(constraint) = constraint {
                requirements.insert(key.to_string(), requirement(key, constraint)?);
            }
        }
        for (key, constraint) in &constraints.match_labels {
            requirements.insert(key.clone(), requirement(key, constraint)?);
        }
    }

    Ok(NodeAffinity {
        required_during_scheduling_ignored_during_execution: Some(NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Some(requirements.into_values().collect()),
                match_fields: None,
            }],
        }),
        preferred_during_scheduling_ignored_during_execution: None,
    })
}

/// Replace node affinity on an existing affinity, keeping pod (anti-)affinity.
pub fn merge_affinity(base: Option<Affinity>, node: NodeAffinity) -> Affinity {
    let mut affinity = base.unwrap_or_default();
    affinity.node_affinity = Some(node);
    affinity
}

/// `host:ip` entries grouped by IP, sorted by IP. Entries without a
/// separator are ignored.
pub fn host_aliases(extra_hosts: &[String]) -> Option<Vec<HostAlias>> {
    let mut by_ip: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for entry in extra_hosts {
        let Some((host, ip)) = entry.split_once(':') else {
            continue;
        };
        let hostnames = by_ip.entry(ip.trim().to_string()).or_default();
        let host = host.trim().to_string();
        if !hostnames.contains(&host) {
            hostnames.push(host);
        }
    }
    if by_ip.is_empty() {
        return None;
    }
    Some(
        by_ip
            .into_iter()
            .map(|(ip, hostnames)| HostAlias {
                ip: Some(ip),
                hostnames: Some(hostnames),
            })
            .collect(),
    )
}
