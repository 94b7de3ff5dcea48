//! Stack listener
//!
//! Mirrors Stacks into a reflector store and turns watch events into work
//! for the reconciler: keys on the reconcile queue, last-known Stacks on the
//! deletion queue. The listener never blocks on reconciliation itself.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::{reflector, WatchStreamExt};
use kube::{Api, ResourceExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::crd::Stack;

use super::owner_cache::OwnerCache;

/// Read access to the current version of a stack
pub trait StackGetter: Send + Sync {
    fn get(&self, key: &str) -> Option<Stack>;
}

impl StackGetter for Store<Stack> {
    fn get(&self, key: &str) -> Option<Stack> {
        let object_ref = match key.split_once('/') {
            Some((namespace, name)) => ObjectRef::new(name).within(namespace),
            None => ObjectRef::new(key),
        };
        Store::get(self, &object_ref).map(|stack| stack.as_ref().clone())
    }
}

/// Work produced by one watch event
#[derive(Clone, Debug, PartialEq)]
pub enum Routed {
    Reconcile(String),
    Delete(Box<Stack>),
}

pub struct StackListener {
    owners: Arc<OwnerCache>,
    known: HashMap<String, Stack>,
    listing: BTreeSet<String>,
}

impl StackListener {
    pub fn new(owners: Arc<OwnerCache>) -> Self {
        Self {
            owners,
            known: HashMap::new(),
            listing: BTreeSet::new(),
        }
    }

    /// Remember `stack`, marking its owner dirty when the generation moved.
    fn observe(&mut self, stack: Stack) -> String {
        let key = stack.key();
        if let Some(previous) = self.known.get(&key) {
            if previous.metadata.generation != stack.metadata.generation {
                debug!(key, "Stack generation changed");
                self.owners.set_dirty(&key);
            }
        }
        self.known.insert(key.clone(), stack);
        key
    }

    /// Route one event.
    ///
    /// Keys listed during a (re)list are emitted once the listing completes,
    /// when the reflector store has them. Stacks that vanished while the
    /// watch was down are routed as deletions.
    pub fn route(&mut self, event: Event<Stack>) -> Vec<Routed> {
        match event {
            Event::Init => {
                self.listing.clear();
                Vec::new()
            }
            Event::InitApply(stack) => {
                let key = self.observe(stack);
                self.listing.insert(key);
                Vec::new()
            }
            Event::InitDone => {
                let listing = std::mem::take(&mut self.listing);
                let vanished: Vec<String> = self
                    .known
                    .keys()
                    .filter(|key| !listing.contains(*key))
                    .cloned()
                    .collect();
                let mut routed: Vec<Routed> = vanished
                    .into_iter()
                    .filter_map(|key| self.known.remove(&key))
                    .map(|stack| Routed::Delete(Box::new(stack)))
                    .collect();
                routed.extend(listing.into_iter().map(Routed::Reconcile));
                routed
            }
            Event::Apply(stack) => vec![Routed::Reconcile(self.observe(stack))],
            Event::Delete(stack) => {
                // no set_dirty: the deletion still needs the last known owner
                self.known.remove(&stack.key());
                vec![Routed::Delete(Box::new(stack))]
            }
        }
    }

    /// Watch Stacks until the stream ends or a queue is closed.
    pub async fn run(
        mut self,
        api: Api<Stack>,
        writer: reflector::store::Writer<Stack>,
        reconcile_tx: mpsc::Sender<String>,
        delete_tx: mpsc::Sender<Stack>,
    ) {
        info!("Starting Stack listener");
        let mut stream = reflector(writer, watcher(api, watcher::Config::default()))
            .default_backoff()
            .boxed();

        while let Some(event) = stream.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "Stack watch error");
                    continue;
                }
            };
            for routed in self.route(event) {
                let sent = match routed {
                    Routed::Reconcile(key) => reconcile_tx.send(key).await.is_ok(),
                    Routed::Delete(stack) => {
                        debug!(name = %stack.name_any(), "Stack deleted");
                        delete_tx.send(*stack).await.is_ok()
                    }
                };
                if !sent {
                    debug!("Reconciler queues closed, stopping Stack listener");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use kube::runtime::reflector::store::Writer;

    use super::*;
    use crate::controller::owner_cache::OwnerGetter;
    use crate::crd::StackOwner;
    use crate::error::{Error, Result};

    struct NoOwner;

    #[async_trait]
    impl OwnerGetter for NoOwner {
        async fn get_owner(&self, _stack: &Stack) -> Result<StackOwner> {
            Err(Error::ConfigError("unused".to_string()))
        }
    }

    struct FixedOwner;

    #[async_trait]
    impl OwnerGetter for FixedOwner {
        async fn get_owner(&self, _stack: &Stack) -> Result<StackOwner> {
            Ok(StackOwner::default())
        }
    }

    fn stack(name: &str, generation: i64) -> Stack {
        let mut stack = Stack::new(name, Default::default());
        stack.metadata.namespace = Some("default".to_string());
        stack.metadata.generation = Some(generation);
        stack
    }

    fn listener() -> StackListener {
        StackListener::new(Arc::new(OwnerCache::new(Arc::new(NoOwner))))
    }

    #[test]
    fn test_initial_listing_emits_on_done() {
        let mut listener = listener();
        assert!(listener.route(Event::Init).is_empty());
        assert!(listener.route(Event::InitApply(stack("b", 1))).is_empty());
        assert!(listener.route(Event::InitApply(stack("a", 1))).is_empty());
        assert_eq!(
            listener.route(Event::InitDone),
            vec![
                Routed::Reconcile("default/a".to_string()),
                Routed::Reconcile("default/b".to_string()),
            ]
        );
    }

    #[test]
    fn test_apply_and_delete() {
        let mut listener = listener();
        assert_eq!(
            listener.route(Event::Apply(stack("app", 1))),
            vec![Routed::Reconcile("default/app".to_string())]
        );
        assert_eq!(
            listener.route(Event::Delete(stack("app", 1))),
            vec![Routed::Delete(Box::new(stack("app", 1)))]
        );
        assert!(listener.known.is_empty());
    }

    #[test]
    fn test_relist_routes_vanished_stacks_as_deletions() {
        let mut listener = listener();
        listener.route(Event::Apply(stack("gone", 1)));
        listener.route(Event::Apply(stack("kept", 1)));

        listener.route(Event::Init);
        listener.route(Event::InitApply(stack("kept", 1)));
        assert_eq!(
            listener.route(Event::InitDone),
            vec![
                Routed::Delete(Box::new(stack("gone", 1))),
                Routed::Reconcile("default/kept".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_generation_change_marks_owner_dirty() {
        let owners = Arc::new(OwnerCache::new(Arc::new(FixedOwner)));
        owners.get(&stack("app", 1), false).await.unwrap();
        let mut listener = StackListener::new(owners.clone());

        listener.route(Event::Apply(stack("app", 1)));
        listener.route(Event::Apply(stack("app", 1)));
        assert!(!owners.is_dirty("default/app"));

        listener.route(Event::Apply(stack("app", 2)));
        assert!(owners.is_dirty("default/app"));

        // deletion keeps the entry for the delete path
        listener.route(Event::Delete(stack("app", 2)));
        assert!(owners.contains("default/app"));
    }

    #[test]
    fn test_store_lookup_by_key() {
        let writer: Writer<Stack> = Writer::default();
        let store = writer.as_reader();
        let mut writer = writer;
        writer.apply_watcher_event(&Event::Apply(stack("app", 1)));

        let found = StackGetter::get(&store, "default/app").unwrap();
        assert_eq!(found.name_any(), "app");
        assert!(StackGetter::get(&store, "other/app").is_none());
    }
}
