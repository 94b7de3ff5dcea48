//! Controller module for Stack reconciliation
//!
//! Watchers feed keys into queues, a single reconciler loop drains them and
//! applies the diff between the desired and observed children of a stack.

mod children;
mod listener;
#[cfg(feature = "metrics")]
pub mod metrics;
mod owner_cache;
mod queue;
mod reconciler;
mod status;
mod updater;

use std::time::Duration;

use crate::convert::StrategyKind;

pub use children::{Child, ChildrenIndex, ChildrenStore};
pub use listener::{Routed, StackGetter, StackListener};
pub use owner_cache::{KubeOwnerGetter, OwnerCache, OwnerGetter};
pub use queue::{retry_queue, RetryReceiver, RetryScheduler};
pub use reconciler::{run_controller, StackReconciler};
pub use status::{derive_status, AVAILABLE_MESSAGE};
pub use updater::{
    impersonating_config, KubeUpdater, KubeUpdaterProvider, ResourceUpdater,
    ResourceUpdaterProvider,
};

/// Delay before a stack is reconciled again after a write conflict
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Runtime settings of the operator
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Watch a single namespace; `None` watches all of them
    pub namespace: Option<String>,
    pub strategy: StrategyKind,
    pub retry_delay: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            strategy: StrategyKind::default(),
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}
