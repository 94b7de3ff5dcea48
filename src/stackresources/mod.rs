//! Observed/desired stack state and the diff between them

mod diff;
mod state;

pub use diff::{compute_diff, StackStateDiff, INFRA_TOLERATION_PREFIX};
pub(crate) use diff::{spec_equal, PodTemplated};
pub use state::{object_key, StackState};
