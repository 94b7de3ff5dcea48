//! In-memory view of the children of one stack

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Service;
use kube::api::ObjectMeta;
use kube::Resource;

use crate::crd::stack_key;

/// The workload and networking objects belonging to one stack, keyed by
/// `namespace/name`. Used for both the observed and the desired state.
///
/// Maps are ordered so that iteration, and everything derived from it, is
/// deterministic.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StackState {
    pub deployments: BTreeMap<String, Deployment>,
    pub stateful_sets: BTreeMap<String, StatefulSet>,
    pub daemon_sets: BTreeMap<String, DaemonSet>,
    pub services: BTreeMap<String, Service>,
}

/// Key of a child object inside a [`StackState`]
pub fn object_key(meta: &ObjectMeta) -> String {
    stack_key(
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default(),
    )
}

fn index<K: Resource>(objects: Vec<K>) -> BTreeMap<String, K> {
    objects
        .into_iter()
        .map(|o| (object_key(o.meta()), o))
        .collect()
}

impl StackState {
    pub fn new(
        deployments: Vec<Deployment>,
        stateful_sets: Vec<StatefulSet>,
        daemon_sets: Vec<DaemonSet>,
        services: Vec<Service>,
    ) -> Self {
        Self {
            deployments: index(deployments),
            stateful_sets: index(stateful_sets),
            daemon_sets: index(daemon_sets),
            services: index(services),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.deployments.is_empty()
            && self.stateful_sets.is_empty()
            && self.daemon_sets.is_empty()
            && self.services.is_empty()
    }

    pub fn add_deployment(&mut self, deployment: Deployment) {
        self.deployments
            .insert(object_key(&deployment.metadata), deployment);
    }

    pub fn add_stateful_set(&mut self, stateful_set: StatefulSet) {
        self.stateful_sets
            .insert(object_key(&stateful_set.metadata), stateful_set);
    }

    pub fn add_daemon_set(&mut self, daemon_set: DaemonSet) {
        self.daemon_sets
            .insert(object_key(&daemon_set.metadata), daemon_set);
    }

    pub fn add_service(&mut self, service: Service) {
        self.services.insert(object_key(&service.metadata), service);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(namespace: Option<&str>, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: namespace.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn test_object_key() {
        assert_eq!(object_key(&meta(Some("ns"), "web")), "ns/web");
        assert_eq!(object_key(&meta(None, "web")), "web");
    }

    #[test]
    fn test_new_indexes_by_key() {
        let state = StackState::new(
            vec![Deployment {
                metadata: meta(Some("ns"), "web"),
                ..Default::default()
            }],
            vec![],
            vec![],
            vec![
                Service {
                    metadata: meta(Some("ns"), "web"),
                    ..Default::default()
                },
                Service {
                    metadata: meta(Some("ns"), "web-published"),
                    ..Default::default()
                },
            ],
        );
        assert!(state.deployments.contains_key("ns/web"));
        assert_eq!(state.services.len(), 2);
        assert!(!state.is_empty());
        assert!(StackState::default().is_empty());
    }
}
