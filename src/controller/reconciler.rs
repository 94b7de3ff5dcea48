//! Stack reconciler
//!
//! A single loop serializes reconcile, retry and deletion events, so no two
//! passes ever run concurrently. Listeners and watchers only enqueue.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, ListParams};
use kube::runtime::reflector;
use kube::{Client, ResourceExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::convert::{stack_to_stack, ServiceStrategy};
use crate::crd::{Stack, StackPhase, StackStatus};
use crate::error::{Error, Result};
use crate::stackresources::{compute_diff, StackState};

use super::children::{Child, ChildrenIndex, ChildrenStore};
use super::listener::{StackGetter, StackListener};
#[cfg(feature = "metrics")]
use super::metrics;
use super::owner_cache::{KubeOwnerGetter, OwnerCache};
use super::queue::{retry_queue, RetryScheduler};
use super::status::derive_status;
use super::updater::{KubeUpdaterProvider, ResourceUpdater, ResourceUpdaterProvider};
use super::OperatorConfig;

/// Capacity of the reconcile and deletion queues
const QUEUE_CAPACITY: usize = 1024;

fn observe_duration(operation: &str, started: Instant) {
    let elapsed = started.elapsed().as_secs_f64();
    #[cfg(feature = "metrics")]
    metrics::observe_reconcile_duration_seconds(operation, elapsed);
    debug!(operation, elapsed, "Pass finished");
}

fn count_error(error: &Error) {
    #[cfg(feature = "metrics")]
    metrics::inc_reconcile_error(error.kind());
    #[cfg(not(feature = "metrics"))]
    let _ = error;
}

pub struct StackReconciler {
    stacks: Arc<dyn StackGetter>,
    children: Arc<dyn ChildrenStore>,
    owners: Arc<OwnerCache>,
    updaters: Arc<dyn ResourceUpdaterProvider>,
    strategy: Arc<dyn ServiceStrategy>,
    retry_delay: Duration,
}

impl StackReconciler {
    pub fn new(
        stacks: Arc<dyn StackGetter>,
        children: Arc<dyn ChildrenStore>,
        owners: Arc<OwnerCache>,
        updaters: Arc<dyn ResourceUpdaterProvider>,
        strategy: Arc<dyn ServiceStrategy>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            stacks,
            children,
            owners,
            updaters,
            strategy,
            retry_delay,
        }
    }

    /// Run the loop until `shutdown` resolves.
    ///
    /// Only [`Error::IdentityUnavailable`] ends the loop early; the host is
    /// expected to exit and be restarted with a clean cache.
    pub async fn start(
        self,
        mut reconcile_rx: mpsc::Receiver<String>,
        mut delete_rx: mpsc::Receiver<Stack>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        let (retry, mut retries) = retry_queue(self.retry_delay);
        tokio::pin!(shutdown);
        info!(strategy = ?self.strategy, "Stack reconciler started");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Stack reconciler stopping");
                    return Ok(());
                }
                Some(key) = reconcile_rx.recv() => self.reconcile(&key, &retry).await?,
                Some(key) = retries.recv() => self.reconcile(&key, &retry).await?,
                Some(stack) = delete_rx.recv() => self.delete(&stack).await?,
                else => return Ok(()),
            }
        }
    }

    #[instrument(skip(self, retry))]
    pub(super) async fn reconcile(&self, key: &str, retry: &RetryScheduler) -> Result<()> {
        let Some(stack) = self.stacks.get(key) else {
            debug!("Stack no longer exists, skipping");
            return Ok(());
        };
        if stack.is_being_deleted() {
            return self.delete(&stack).await;
        }

        let started = Instant::now();
        let result = self.reconcile_stack(&stack).await;
        observe_duration("reconcile", started);

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_conflict() => {
                info!("Conflict while reconciling, retrying later");
                #[cfg(feature = "metrics")]
                metrics::inc_reconcile_conflict();
                retry.schedule(key);
                Ok(())
            }
            Err(e @ Error::IdentityUnavailable(_)) => {
                error!(error = %e, "Cannot resolve stack owner");
                count_error(&e);
                Err(e)
            }
            Err(e) => {
                error!(error = %e, "Reconcile failed");
                count_error(&e);
                Ok(())
            }
        }
    }

    /// Build, diff, apply, then write the derived status.
    ///
    /// Build and apply errors other than conflicts become a `Failure` status.
    async fn reconcile_stack(&self, stack: &Stack) -> Result<()> {
        let key = stack.key();
        let owner = self.owners.get(stack, !stack.is_dirty()).await?;
        let updater = self.updaters.get_updater(stack, &owner)?;

        let observed = self.children.get_current_stack_state(&key);
        let status = match self.apply_desired(stack, &observed, updater.as_ref()).await {
            Ok(()) => derive_status(stack, &self.children.get_current_stack_state(&key)),
            Err(e) if e.is_conflict() => return Err(e),
            Err(e) => {
                warn!(error = %e, "Stack failed");
                count_error(&e);
                StackStatus::new(StackPhase::Failure, e.to_string())
            }
        }
        .with_observed_generation(stack.metadata.generation);

        if stack.status.as_ref() == Some(&status) {
            debug!("Status unchanged");
            return Ok(());
        }
        info!(phase = %status.phase, "Updating stack status");
        updater.update_stack_status(stack, status).await?;
        Ok(())
    }

    async fn apply_desired(
        &self,
        stack: &Stack,
        observed: &StackState,
        updater: &dyn ResourceUpdater,
    ) -> Result<()> {
        let desired = stack_to_stack(stack, self.strategy.as_ref(), observed)?;
        let diff = compute_diff(observed, &desired);
        if diff.is_empty() {
            debug!("Children up to date");
            return Ok(());
        }
        info!(changes = diff.len(), "Applying stack diff");
        updater.apply(&diff).await
    }

    /// Remove everything the stack owns.
    ///
    /// Identity problems are not fatal here: owner references let cluster
    /// garbage collection remove whatever is left.
    #[instrument(skip(self, stack), fields(name = %stack.name_any(), namespace = stack.namespace()))]
    pub(super) async fn delete(&self, stack: &Stack) -> Result<()> {
        let key = stack.key();
        let observed = self.children.get_current_stack_state(&key);
        if observed.is_empty() && !self.owners.contains(&key) {
            debug!("Nothing left to delete");
            return Ok(());
        }

        let started = Instant::now();
        let owner = match self.owners.get(stack, true).await {
            Ok(owner) => owner,
            Err(e) => {
                warn!(error = %e, "Owner unknown, leaving children to garbage collection");
                self.owners.remove(&key);
                return Ok(());
            }
        };

        let result = async {
            let updater = self.updaters.get_updater(stack, &owner)?;
            let diff = compute_diff(&observed, &StackState::default());
            info!(changes = diff.len(), "Deleting stack children");
            updater.apply(&diff).await?;
            updater.delete_secrets_and_config_maps(stack).await
        }
        .await;
        self.owners.remove(&key);
        observe_duration("delete", started);

        if let Err(e) = result {
            error!(error = %e, "Stack deletion incomplete");
            count_error(&e);
        }
        Ok(())
    }
}

fn children_api<K: Child>(client: &Client, config: &OperatorConfig) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
{
    match &config.namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    }
}

/// Wire listeners, the children index and the reconciler, then run until
/// `shutdown` resolves or identity resolution fails.
pub async fn run_controller(
    client: Client,
    kube_config: kube::Config,
    config: OperatorConfig,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let stacks: Api<Stack> = match &config.namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    };

    info!(namespace = ?config.namespace, strategy = %config.strategy, "Starting Stack controller");
    match stacks.list(&ListParams::default().limit(1)).await {
        Ok(_) => info!("Stack CRD is available"),
        Err(e) => {
            error!("Stack CRD not found. Please install the CRD first: {:?}", e);
            return Err(Error::ConfigError("Stack CRD not installed".to_string()));
        }
    }

    let (reconcile_tx, reconcile_rx) = mpsc::channel(QUEUE_CAPACITY);
    let (delete_tx, delete_rx) = mpsc::channel(QUEUE_CAPACITY);

    let owners = Arc::new(OwnerCache::new(Arc::new(KubeOwnerGetter::new(
        client.clone(),
    ))));
    let children = Arc::new(ChildrenIndex::new());
    let (store, writer) = reflector::store();

    let tasks = vec![
        tokio::spawn(children.clone().watch(
            children_api::<Deployment>(&client, &config),
            reconcile_tx.clone(),
        )),
        tokio::spawn(children.clone().watch(
            children_api::<StatefulSet>(&client, &config),
            reconcile_tx.clone(),
        )),
        tokio::spawn(children.clone().watch(
            children_api::<DaemonSet>(&client, &config),
            reconcile_tx.clone(),
        )),
        tokio::spawn(children.clone().watch(
            children_api::<Service>(&client, &config),
            reconcile_tx.clone(),
        )),
        tokio::spawn(StackListener::new(owners.clone()).run(
            stacks,
            writer,
            reconcile_tx,
            delete_tx,
        )),
    ];

    children.wait_until_synced().await;

    let reconciler = StackReconciler::new(
        Arc::new(store),
        children,
        owners,
        Arc::new(KubeUpdaterProvider::new(kube_config, client)),
        config.strategy.build(),
        config.retry_delay,
    );
    let result = reconciler.start(reconcile_rx, delete_rx, shutdown).await;

    for task in tasks {
        task.abort();
    }
    result
}
