//! Stack status derivation from observed children

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use kube::ResourceExt;

use crate::crd::{stack_key, Stack, StackPhase, StackStatus};
use crate::stackresources::StackState;

pub const AVAILABLE_MESSAGE: &str = "Stack is started";

fn deployment_ready(d: &Deployment) -> bool {
    let desired = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = d.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
    ready == desired
}

fn stateful_set_ready(s: &StatefulSet) -> bool {
    let desired = s.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = s.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
    ready == desired
}

fn daemon_set_ready(d: &DaemonSet) -> bool {
    // a DaemonSet the controller has not looked at yet has no status
    d.status
        .as_ref()
        .is_some_and(|s| s.number_unavailable.unwrap_or(0) == 0)
}

/// Aggregate status of `stack` given its observed children.
///
/// Each declared service must have a ready workload of any kind; services
/// without one are listed in the `Progressing` message.
pub fn derive_status(stack: &Stack, observed: &StackState) -> StackStatus {
    let namespace = stack.namespace().unwrap_or_default();
    let mut waiting: Vec<&str> = stack
        .spec
        .services
        .iter()
        .filter(|service| {
            let key = stack_key(&namespace, &service.name);
            let ready = observed
                .deployments
                .get(&key)
                .map(deployment_ready)
                .or_else(|| observed.stateful_sets.get(&key).map(stateful_set_ready))
                .or_else(|| observed.daemon_sets.get(&key).map(daemon_set_ready))
                .unwrap_or(false);
            !ready
        })
        .map(|service| service.name.as_str())
        .collect();

    if waiting.is_empty() {
        return StackStatus::new(StackPhase::Available, AVAILABLE_MESSAGE);
    }
    waiting.sort_unstable();
    StackStatus::new(
        StackPhase::Progressing,
        format!("Waiting for services to be ready: {}", waiting.join(", ")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ServiceConfig, StackSpec};
    use k8s_openapi::api::apps::v1::{
        DaemonSetStatus, DeploymentSpec, DeploymentStatus, StatefulSetSpec, StatefulSetStatus,
    };
    use kube::api::ObjectMeta;

    fn meta(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        }
    }

    fn stack(names: &[&str]) -> Stack {
        let mut stack = Stack::new(
            "app",
            StackSpec {
                services: names
                    .iter()
                    .map(|n| ServiceConfig {
                        name: n.to_string(),
                        image: "nginx".to_string(),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            },
        );
        stack.metadata.namespace = Some("default".to_string());
        stack
    }

    fn deployment(name: &str, replicas: Option<i32>, ready: Option<i32>) -> Deployment {
        Deployment {
            metadata: meta(name),
            spec: Some(DeploymentSpec {
                replicas,
                ..Default::default()
            }),
            status: ready.map(|r| DeploymentStatus {
                ready_replicas: Some(r),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_unready_deployment_is_progressing() {
        let mut observed = StackState::default();
        observed.add_deployment(deployment("nginx", Some(1), None));
        let status = derive_status(&stack(&["nginx"]), &observed);
        assert_eq!(status.phase, StackPhase::Progressing);
        assert!(status.message.unwrap().contains("nginx"));

        let mut observed = StackState::default();
        observed.add_deployment(deployment("nginx", Some(1), Some(1)));
        let status = derive_status(&stack(&["nginx"]), &observed);
        assert_eq!(status, StackStatus::new(StackPhase::Available, AVAILABLE_MESSAGE));
    }

    #[test]
    fn test_default_replica_count_is_one() {
        let mut observed = StackState::default();
        observed.add_deployment(deployment("web", None, Some(1)));
        assert_eq!(
            derive_status(&stack(&["web"]), &observed).phase,
            StackPhase::Available
        );
    }

    #[test]
    fn test_missing_workload_is_not_ready() {
        let status = derive_status(&stack(&["web"]), &StackState::default());
        assert_eq!(status.phase, StackPhase::Progressing);
    }

    #[test]
    fn test_mixed_kinds() {
        let mut observed = StackState::default();
        observed.add_stateful_set(StatefulSet {
            metadata: meta("db"),
            spec: Some(StatefulSetSpec {
                replicas: Some(2),
                ..Default::default()
            }),
            status: Some(StatefulSetStatus {
                ready_replicas: Some(2),
                ..Default::default()
            }),
        });
        observed.add_daemon_set(DaemonSet {
            metadata: meta("agent"),
            status: Some(DaemonSetStatus {
                number_unavailable: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        });
        let status = derive_status(&stack(&["db", "agent"]), &observed);
        assert_eq!(
            status.message.as_deref(),
            Some("Waiting for services to be ready: agent")
        );

        observed
            .daemon_sets
            .get_mut("default/agent")
            .unwrap()
            .status
            .as_mut()
            .unwrap()
            .number_unavailable = None;
        assert_eq!(
            derive_status(&stack(&["db", "agent"]), &observed).phase,
            StackPhase::Available
        );
    }
}
