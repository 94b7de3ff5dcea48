//! Children index
//!
//! One watcher per child kind, across all namespaces, restricted to objects
//! carrying the stack label. Objects are bucketed by owning stack key so that
//! the observed [`StackState`] of a stack is a single map lookup.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Service;
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Resource, ResourceExt};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::convert::STACK_NAME_LABEL;
use crate::crd::stack_key;
use crate::stackresources::{object_key, StackState};

/// Number of child kinds watched by the index
pub const WATCHED_KINDS: usize = 4;

/// Read access to the observed children of a stack
pub trait ChildrenStore: Send + Sync {
    fn get_current_stack_state(&self, key: &str) -> StackState;
}

/// A watched child kind and its bucket inside [`StackState`]
pub trait Child: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static {
    fn bucket(state: &StackState) -> &BTreeMap<String, Self>;
    fn bucket_mut(state: &mut StackState) -> &mut BTreeMap<String, Self>;
}

impl Child for Deployment {
    fn bucket(state: &StackState) -> &BTreeMap<String, Self> {
        &state.deployments
    }
    fn bucket_mut(state: &mut StackState) -> &mut BTreeMap<String, Self> {
        &mut state.deployments
    }
}

impl Child for StatefulSet {
    fn bucket(state: &StackState) -> &BTreeMap<String, Self> {
        &state.stateful_sets
    }
    fn bucket_mut(state: &mut StackState) -> &mut BTreeMap<String, Self> {
        &mut state.stateful_sets
    }
}

impl Child for DaemonSet {
    fn bucket(state: &StackState) -> &BTreeMap<String, Self> {
        &state.daemon_sets
    }
    fn bucket_mut(state: &mut StackState) -> &mut BTreeMap<String, Self> {
        &mut state.daemon_sets
    }
}

impl Child for Service {
    fn bucket(state: &StackState) -> &BTreeMap<String, Self> {
        &state.services
    }
    fn bucket_mut(state: &mut StackState) -> &mut BTreeMap<String, Self> {
        &mut state.services
    }
}

/// Owning stack key of a child, `None` for objects without the stack label
pub fn owning_stack_key<K: Resource>(obj: &K) -> Option<String> {
    let stack_name = obj.labels().get(STACK_NAME_LABEL)?;
    Some(stack_key(
        &obj.namespace().unwrap_or_default(),
        stack_name,
    ))
}

#[derive(Default)]
pub struct ChildrenIndex {
    stacks: RwLock<HashMap<String, StackState>>,
    synced_kinds: AtomicUsize,
    synced: Notify,
}

impl ChildrenIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `obj`. Returns the owning stack key.
    fn apply<K: Child>(&self, obj: K) -> Option<String> {
        let key = owning_stack_key(&obj)?;
        let obj_key = object_key(obj.meta());
        let mut stacks = self.stacks.write();
        // the stack label may have changed since the last event
        for (other, state) in stacks.iter_mut() {
            if *other != key {
                K::bucket_mut(state).remove(&obj_key);
            }
        }
        stacks.retain(|_, state| !state.is_empty());
        K::bucket_mut(stacks.entry(key.clone()).or_default()).insert(obj_key, obj);
        Some(key)
    }

    fn delete<K: Child>(&self, obj: &K) -> Option<String> {
        let key = owning_stack_key(obj)?;
        let mut stacks = self.stacks.write();
        if let Some(state) = stacks.get_mut(&key) {
            K::bucket_mut(state).remove(&object_key(obj.meta()));
            if state.is_empty() {
                stacks.remove(&key);
            }
        }
        Some(key)
    }

    /// Swap the whole bucket of kind `K` for a fresh listing. Returns every
    /// stack key whose children of that kind were present before or after.
    fn replace<K: Child>(&self, objects: Vec<K>) -> BTreeSet<String> {
        let mut affected = BTreeSet::new();
        let mut stacks = self.stacks.write();
        for (key, state) in stacks.iter_mut() {
            let bucket = K::bucket_mut(state);
            if !bucket.is_empty() {
                affected.insert(key.clone());
                bucket.clear();
            }
        }
        for obj in objects {
            let Some(key) = owning_stack_key(&obj) else {
                continue;
            };
            K::bucket_mut(stacks.entry(key.clone()).or_default())
                .insert(object_key(obj.meta()), obj);
            affected.insert(key);
        }
        stacks.retain(|_, state| !state.is_empty());
        affected
    }

    /// Fold one watcher event into the index.
    ///
    /// `buffer` collects the objects of an ongoing (re)list and `synced`
    /// tracks whether this kind finished its first listing. Keys to enqueue
    /// are returned; nothing is emitted before the first listing completes.
    pub fn handle_event<K: Child>(
        &self,
        event: Event<K>,
        buffer: &mut Vec<K>,
        synced: &mut bool,
    ) -> Vec<String> {
        match event {
            Event::Init => {
                buffer.clear();
                Vec::new()
            }
            Event::InitApply(obj) => {
                buffer.push(obj);
                Vec::new()
            }
            Event::InitDone => {
                let affected = self.replace(std::mem::take(buffer));
                if *synced {
                    debug!(count = affected.len(), "Children re-listed");
                    affected.into_iter().collect()
                } else {
                    *synced = true;
                    self.mark_kind_synced();
                    Vec::new()
                }
            }
            Event::Apply(obj) => {
                let key = self.apply(obj);
                if *synced {
                    key.into_iter().collect()
                } else {
                    Vec::new()
                }
            }
            Event::Delete(obj) => {
                let key = self.delete(&obj);
                if *synced {
                    key.into_iter().collect()
                } else {
                    Vec::new()
                }
            }
        }
    }

    fn mark_kind_synced(&self) {
        if self.synced_kinds.fetch_add(1, Ordering::SeqCst) + 1 >= WATCHED_KINDS {
            info!("Children index synced");
            self.synced.notify_waiters();
        }
    }

    pub fn is_synced(&self) -> bool {
        self.synced_kinds.load(Ordering::SeqCst) >= WATCHED_KINDS
    }

    pub async fn wait_until_synced(&self) {
        loop {
            let notified = self.synced.notified();
            if self.is_synced() {
                return;
            }
            notified.await;
        }
    }

    /// Watch children of kind `K` until the event stream ends or the
    /// reconcile queue is closed.
    pub async fn watch<K>(self: Arc<Self>, api: Api<K>, reconcile_tx: mpsc::Sender<String>)
    where
        K: Child + DeserializeOwned,
    {
        let config = watcher::Config::default().labels(STACK_NAME_LABEL);
        let mut stream = watcher(api, config).default_backoff().boxed();
        let mut buffer = Vec::new();
        let mut synced = false;

        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => {
                    for key in self.handle_event(event, &mut buffer, &mut synced) {
                        if reconcile_tx.send(key).await.is_err() {
                            debug!(kind = %K::kind(&()), "Reconcile queue closed");
                            return;
                        }
                    }
                }
                Err(e) => warn!(kind = %K::kind(&()), error = %e, "Children watch error"),
            }
        }
    }
}

impl ChildrenStore for ChildrenIndex {
    fn get_current_stack_state(&self, key: &str) -> StackState {
        self.stacks.read().get(key).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn deployment(namespace: &str, name: &str, stack: Option<&str>) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: stack.map(|s| BTreeMap::from([(STACK_NAME_LABEL.to_string(), s.to_string())])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn service(namespace: &str, name: &str, stack: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([(
                    STACK_NAME_LABEL.to_string(),
                    stack.to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn sync<K: Child>(index: &ChildrenIndex, objects: Vec<K>, synced: &mut bool) -> Vec<String> {
        let mut buffer = Vec::new();
        let mut emitted = index.handle_event(Event::Init, &mut buffer, synced);
        for obj in objects {
            emitted.extend(index.handle_event(Event::InitApply(obj), &mut buffer, synced));
        }
        emitted.extend(index.handle_event(Event::InitDone, &mut buffer, synced));
        emitted
    }

    #[test]
    fn test_initial_sync_indexes_without_emitting() {
        let index = ChildrenIndex::new();
        let mut synced = false;
        let emitted = sync(
            &index,
            vec![
                deployment("ns", "web", Some("app")),
                deployment("ns", "db", Some("app")),
                deployment("other", "web", Some("app")),
                deployment("ns", "loose", None),
            ],
            &mut synced,
        );
        assert!(emitted.is_empty());
        assert!(synced);

        let state = index.get_current_stack_state("ns/app");
        assert_eq!(
            state.deployments.keys().collect::<Vec<_>>(),
            vec!["ns/db", "ns/web"]
        );
        assert_eq!(index.get_current_stack_state("other/app").deployments.len(), 1);
        assert!(index.get_current_stack_state("ns/loose").is_empty());
    }

    #[test]
    fn test_events_after_sync_emit_stack_key() {
        let index = ChildrenIndex::new();
        let mut synced = false;
        let mut buffer = Vec::new();

        // before sync: indexed, not emitted
        let early = index.handle_event(
            Event::Apply(service("ns", "web", "app")),
            &mut buffer,
            &mut synced,
        );
        assert!(early.is_empty());

        sync::<Service>(&index, vec![], &mut synced);
        assert!(index.get_current_stack_state("ns/app").is_empty());

        let emitted = index.handle_event(
            Event::Apply(service("ns", "web", "app")),
            &mut buffer,
            &mut synced,
        );
        assert_eq!(emitted, vec!["ns/app"]);
        assert_eq!(index.get_current_stack_state("ns/app").services.len(), 1);

        let emitted = index.handle_event(
            Event::Delete(service("ns", "web", "app")),
            &mut buffer,
            &mut synced,
        );
        assert_eq!(emitted, vec!["ns/app"]);
        assert!(index.get_current_stack_state("ns/app").is_empty());
    }

    #[test]
    fn test_relabel_moves_object_between_stacks() {
        let index = ChildrenIndex::new();
        let mut synced = true;
        let mut buffer = Vec::new();
        index.handle_event(
            Event::Apply(deployment("ns", "web", Some("one"))),
            &mut buffer,
            &mut synced,
        );
        index.handle_event(
            Event::Apply(deployment("ns", "web", Some("two"))),
            &mut buffer,
            &mut synced,
        );
        assert!(index.get_current_stack_state("ns/one").is_empty());
        assert_eq!(index.get_current_stack_state("ns/two").deployments.len(), 1);
    }

    #[test]
    fn test_relist_emits_old_and_new_owners() {
        let index = ChildrenIndex::new();
        let mut synced = false;
        sync(&index, vec![deployment("ns", "web", Some("gone"))], &mut synced);
        index.apply(service("ns", "web", "gone"));

        let emitted = sync(&index, vec![deployment("ns", "api", Some("new"))], &mut synced);
        assert_eq!(emitted, vec!["ns/gone", "ns/new"]);

        // services of the old stack are untouched by a deployment re-list
        let gone = index.get_current_stack_state("ns/gone");
        assert!(gone.deployments.is_empty());
        assert_eq!(gone.services.len(), 1);
    }

    #[tokio::test]
    async fn test_sync_tracking_across_kinds() {
        let index = Arc::new(ChildrenIndex::new());
        assert!(!index.is_synced());

        let waiter = {
            let index = index.clone();
            tokio::spawn(async move { index.wait_until_synced().await })
        };

        let mut flags = [false; WATCHED_KINDS];
        sync::<Deployment>(&index, vec![], &mut flags[0]);
        sync::<StatefulSet>(&index, vec![], &mut flags[1]);
        sync::<DaemonSet>(&index, vec![], &mut flags[2]);
        assert!(!index.is_synced());
        sync::<Service>(&index, vec![], &mut flags[3]);
        assert!(index.is_synced());

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
