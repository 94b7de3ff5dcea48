//! Owner identity cache
//!
//! Child objects are written while impersonating the stack's owner. The owner
//! is read from the `owner` sub-resource and cached per stack key. Entries
//! are marked dirty when the stack spec changes; a dirty entry is refreshed
//! before use unless the caller accepts a possibly stale identity.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::core::Request;
use kube::{Client, Resource, ResourceExt};
use parking_lot::Mutex;
use tracing::{debug, instrument, warn};

use crate::crd::{Stack, StackOwner};
use crate::error::{Error, Result};
use crate::retry::{retry_with_backoff, Backoff};

/// Source of owner identities
#[async_trait]
pub trait OwnerGetter: Send + Sync {
    async fn get_owner(&self, stack: &Stack) -> Result<StackOwner>;
}

/// Reads `stacks/{name}/owner` through the API server
#[derive(Clone)]
pub struct KubeOwnerGetter {
    client: Client,
}

impl KubeOwnerGetter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl OwnerGetter for KubeOwnerGetter {
    async fn get_owner(&self, stack: &Stack) -> Result<StackOwner> {
        let namespace = stack.namespace();
        let request = Request::new(Stack::url_path(&(), namespace.as_deref()))
            .get_subresource("owner", &stack.name_any())
            .map_err(|e| Error::KubeError(kube::Error::BuildRequest(e)))?;
        Ok(self.client.request::<StackOwner>(request).await?)
    }
}

#[derive(Clone, Debug)]
struct Entry {
    owner: StackOwner,
    dirty: bool,
}

pub struct OwnerCache {
    getter: Arc<dyn OwnerGetter>,
    entries: Mutex<HashMap<String, Entry>>,
    backoff: Backoff,
}

impl OwnerCache {
    pub fn new(getter: Arc<dyn OwnerGetter>) -> Self {
        Self::with_backoff(getter, Backoff::default())
    }

    pub fn with_backoff(getter: Arc<dyn OwnerGetter>, backoff: Backoff) -> Self {
        Self {
            getter,
            entries: Mutex::new(HashMap::new()),
            backoff,
        }
    }

    /// Owner of `stack`.
    ///
    /// A clean cached entry is returned as is, and so is a dirty one when
    /// `accept_dirty` is set. Otherwise the owner is fetched with backoff.
    /// A not-found answer falls back to the cached entry, if any, since the
    /// stack is most likely being deleted. Failing to resolve an identity is
    /// [`Error::IdentityUnavailable`], which the caller must treat as fatal.
    #[instrument(skip(self, stack), fields(key = %stack.key()))]
    pub async fn get(&self, stack: &Stack, accept_dirty: bool) -> Result<StackOwner> {
        let key = stack.key();
        let cached = self.entries.lock().get(&key).cloned();
        if let Some(entry) = &cached {
            if !entry.dirty || accept_dirty {
                return Ok(entry.owner.clone());
            }
        }

        let has_cached = cached.is_some();
        let fetched = retry_with_backoff(
            &self.backoff,
            "get_owner",
            |e: &Error| !(has_cached && e.is_not_found()),
            || self.getter.get_owner(stack),
        )
        .await;

        match fetched {
            Ok(owner) => {
                debug!(user = ?owner.owner.username, "Resolved stack owner");
                self.entries.lock().insert(
                    key,
                    Entry {
                        owner: owner.clone(),
                        dirty: false,
                    },
                );
                Ok(owner)
            }
            Err(e) if e.is_not_found() && has_cached => {
                warn!("Owner not found, using last known identity");
                cached
                    .map(|entry| entry.owner)
                    .ok_or_else(|| Error::IdentityUnavailable(key))
            }
            Err(e) => Err(Error::IdentityUnavailable(format!("{key}: {e}"))),
        }
    }

    /// Mark the entry stale without dropping it. No-op for unknown keys.
    pub fn set_dirty(&self, key: &str) {
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.dirty = true;
        }
    }

    pub fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn is_dirty(&self, key: &str) -> bool {
        self.entries.lock().get(key).is_some_and(|entry| entry.dirty)
    }
}
