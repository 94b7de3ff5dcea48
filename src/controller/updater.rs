//! Cluster writes on behalf of a stack owner
//!
//! Children, secrets and configs are mutated through a client impersonating
//! the stack owner. Stack status is written with the operator's own identity.

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use http::{HeaderName, HeaderValue};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::convert::{selector_for_stack, EXTERNAL_LABEL};
use crate::crd::{Stack, StackOwner, StackStatus};
use crate::error::{Error, Result};
use crate::stackresources::StackStateDiff;

#[cfg(feature = "metrics")]
use super::metrics;

const FIELD_MANAGER: &str = "stack-operator";
const IMPERSONATE_EXTRA_PREFIX: &str = "Impersonate-Extra-";

/// Applies diffs and status for one stack
#[async_trait]
pub trait ResourceUpdater: Send + Sync {
    /// Apply `diff` kind by kind. Deletes go first so that recreated
    /// Services can reuse their names.
    async fn apply(&self, diff: &StackStateDiff) -> Result<()>;

    /// Write `status`, failing with a conflict when `stack` is stale
    async fn update_stack_status(&self, stack: &Stack, status: StackStatus) -> Result<Stack>;

    async fn delete_secrets_and_config_maps(&self, stack: &Stack) -> Result<()>;
}

pub trait ResourceUpdaterProvider: Send + Sync {
    fn get_updater(&self, stack: &Stack, owner: &StackOwner) -> Result<Arc<dyn ResourceUpdater>>;
}

/// Copy of `base` that impersonates `owner`: user, groups and extra fields.
/// Extra entries that are not valid header names or values are dropped.
pub fn impersonating_config(base: &kube::Config, owner: &StackOwner) -> Result<kube::Config> {
    let user = &owner.owner;
    let username = user
        .username
        .clone()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| Error::IdentityUnavailable("owner has no user name".to_string()))?;

    let mut config = base.clone();
    config.auth_info.impersonate = Some(username);
    config.auth_info.impersonate_groups = user.groups.clone().filter(|g| !g.is_empty());

    for (key, values) in user.extra.iter().flatten() {
        let Ok(name) = HeaderName::from_bytes(format!("{IMPERSONATE_EXTRA_PREFIX}{key}").as_bytes())
        else {
            warn!(key, "Skipping impersonation extra with invalid key");
            continue;
        };
        for value in values {
            match HeaderValue::from_str(value) {
                Ok(value) => config.headers.push((name.clone(), value)),
                Err(_) => warn!(key, "Skipping impersonation extra with invalid value"),
            }
        }
    }
    Ok(config)
}

/// Builds impersonating [`KubeUpdater`]s from the operator's client config
pub struct KubeUpdaterProvider {
    config: kube::Config,
    operator_client: Client,
}

impl KubeUpdaterProvider {
    pub fn new(config: kube::Config, operator_client: Client) -> Self {
        Self {
            config,
            operator_client,
        }
    }
}

impl ResourceUpdaterProvider for KubeUpdaterProvider {
    fn get_updater(&self, stack: &Stack, owner: &StackOwner) -> Result<Arc<dyn ResourceUpdater>> {
        debug!(key = %stack.key(), user = ?owner.owner.username, "Impersonating stack owner");
        let config = impersonating_config(&self.config, owner)?;
        let client = Client::try_from(config)?;
        Ok(Arc::new(KubeUpdater {
            client,
            operator_client: self.operator_client.clone(),
        }))
    }
}

pub struct KubeUpdater {
    client: Client,
    operator_client: Client,
}

fn namespaced<K>(client: &Client, obj: &K) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
{
    Api::namespaced(client.clone(), &obj.namespace().unwrap_or_default())
}

fn record(kind: &str, op: &str, count: usize) {
    #[cfg(feature = "metrics")]
    metrics::inc_applied_changes(kind, op, count);
    if count > 0 {
        debug!(kind, op, count, "Applied changes");
    }
}

impl KubeUpdater {
    async fn delete_all<K>(&self, objects: &[K]) -> Result<()>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        for obj in objects {
            let name = obj.name_any();
            match namespaced(&self.client, obj)
                .delete(&name, &DeleteParams::background())
                .await
            {
                Ok(_) => {}
                Err(kube::Error::Api(resp)) if resp.code == 404 => {
                    debug!(kind = %K::kind(&()), name, "Already deleted");
                }
                Err(e) => return Err(e.into()),
            }
        }
        record(&K::kind(&()), "delete", objects.len());
        Ok(())
    }

    async fn create_all<K>(&self, objects: &[K]) -> Result<()>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        for obj in objects {
            namespaced(&self.client, obj)
                .create(&PostParams::default(), obj)
                .await?;
        }
        record(&K::kind(&()), "create", objects.len());
        Ok(())
    }

    async fn update_all<K>(&self, objects: &[K]) -> Result<()>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        for obj in objects {
            // carries the observed resourceVersion; a stale one is a 409
            namespaced(&self.client, obj)
                .replace(&obj.name_any(), &PostParams::default(), obj)
                .await?;
        }
        record(&K::kind(&()), "update", objects.len());
        Ok(())
    }

    async fn delete_labelled<K>(
        &self,
        api: Api<K>,
        selector: &str,
        external: &BTreeSet<String>,
    ) -> Result<()>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
    {
        let params = ListParams::default().labels(selector);
        match api.delete_collection(&DeleteParams::background(), &params).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 403 => {
                debug!(kind = %K::kind(&()), "Bulk delete forbidden, deleting one by one");
            }
            Err(e) => return Err(e.into()),
        }

        let listed = api.list(&params).await?;
        for name in deletable_names(listed.items, external) {
            match api.delete(&name, &DeleteParams::background()).await {
                Ok(_) => {}
                Err(kube::Error::Api(resp)) if resp.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceUpdater for KubeUpdater {
    async fn apply(&self, diff: &StackStateDiff) -> Result<()> {
        self.delete_all(&diff.deployments_to_delete).await?;
        self.delete_all(&diff.stateful_sets_to_delete).await?;
        self.delete_all(&diff.daemon_sets_to_delete).await?;
        self.delete_all(&diff.services_to_delete).await?;

        self.create_all(&diff.deployments_to_add).await?;
        self.create_all(&diff.stateful_sets_to_add).await?;
        self.create_all(&diff.daemon_sets_to_add).await?;
        self.create_all(&diff.services_to_add).await?;

        self.update_all(&diff.deployments_to_update).await?;
        self.update_all(&diff.stateful_sets_to_update).await?;
        self.update_all(&diff.daemon_sets_to_update).await?;
        self.update_all(&diff.services_to_update).await?;
        Ok(())
    }

    #[instrument(skip(self, stack, status), fields(name = %stack.name_any(), namespace = stack.namespace(), phase = %status.phase))]
    async fn update_stack_status(&self, stack: &Stack, status: StackStatus) -> Result<Stack> {
        let api: Api<Stack> = namespaced(&self.operator_client, stack);
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": stack.resource_version() },
            "status": status,
        });
        let updated = api
            .patch_status(
                &stack.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(updated)
    }

    #[instrument(skip(self, stack), fields(name = %stack.name_any(), namespace = stack.namespace()))]
    async fn delete_secrets_and_config_maps(&self, stack: &Stack) -> Result<()> {
        let selector = owned_selector(&stack.name_any());
        let namespace = stack.namespace().unwrap_or_default();
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &namespace);

        self.delete_labelled(secrets, &selector, &external_secret_names(stack))
            .await?;
        self.delete_labelled(config_maps, &selector, &external_config_names(stack))
            .await?;
        info!("Deleted stack secrets and configs");
        Ok(())
    }
}

/// Secrets and configs owned by the stack, excluding externally managed ones
pub fn owned_selector(stack_name: &str) -> String {
    format!("{},{EXTERNAL_LABEL}!=true", selector_for_stack(stack_name))
}

pub fn external_secret_names(stack: &Stack) -> BTreeSet<String> {
    stack
        .spec
        .secrets
        .iter()
        .filter(|(_, secret)| secret.external)
        .map(|(name, _)| name.clone())
        .collect()
}

pub fn external_config_names(stack: &Stack) -> BTreeSet<String> {
    stack
        .spec
        .configs
        .iter()
        .filter(|(_, config)| config.external)
        .map(|(name, _)| name.clone())
        .collect()
}

/// Names of `objects` safe to delete one by one
pub fn deletable_names<K: Resource>(objects: Vec<K>, external: &BTreeSet<String>) -> Vec<String> {
    objects
        .into_iter()
        .filter(|obj| {
            obj.labels().get(EXTERNAL_LABEL).map(String::as_str) != Some("true")
        })
        .map(|obj| obj.name_any())
        .filter(|name| !external.contains(name))
        .collect()
}
