//! Prometheus metrics for the stack operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports:
//! - `stack_reconcile_duration_seconds` (histogram): duration of one reconcile or delete pass, labeled by operation.
//! - `stack_reconcile_errors_total` (counter): failed passes labeled by error kind.
//! - `stack_reconcile_conflicts_total` (counter): passes rescheduled after a write conflict.
//! - `stack_applied_changes_total` (counter): objects written, labeled by kind and op.
//!
//! Counters are registered without the `_total` suffix; the encoder appends it.

use std::sync::atomic::AtomicU64;

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for reconcile duration
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OperationLabels {
    /// "reconcile" or "delete"
    pub operation: String,
}

/// Labels for reconcile error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// See [`crate::Error::kind`]
    pub kind: String,
}

/// Labels for applied changes
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ChangeLabels {
    /// Object kind, e.g. "Deployment"
    pub kind: String,
    /// "create", "update" or "delete"
    pub op: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<OperationLabels, Histogram>> =
    Lazy::new(|| {
        fn reconcile_histogram() -> Histogram {
            // 1ms .. ~32s across 16 buckets.
            Histogram::new(exponential_buckets(0.001, 2.0, 16))
        }

        Family::new_with_constructor(reconcile_histogram)
    });

pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static RECONCILE_CONFLICTS_TOTAL: Lazy<Counter<u64, AtomicU64>> = Lazy::new(Counter::default);

pub static APPLIED_CHANGES_TOTAL: Lazy<Family<ChangeLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global registry served on `/metrics`
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "stack_reconcile_duration_seconds",
        "Duration of stack reconcile and delete passes in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "stack_reconcile_errors",
        "Total number of failed stack reconcile passes",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "stack_reconcile_conflicts",
        "Total number of stack reconcile passes retried after a conflict",
        RECONCILE_CONFLICTS_TOTAL.clone(),
    );
    registry.register(
        "stack_applied_changes",
        "Total number of child objects created, updated or deleted",
        APPLIED_CHANGES_TOTAL.clone(),
    );

    registry
});

pub fn observe_reconcile_duration_seconds(operation: &str, seconds: f64) {
    let labels = OperationLabels {
        operation: operation.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

pub fn inc_reconcile_error(kind: &str) {
    let labels = ErrorLabels {
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_reconcile_conflict() {
    RECONCILE_CONFLICTS_TOTAL.inc();
}

/// Count `count` objects of `kind` written with `op`
pub fn inc_applied_changes(kind: &str, op: &str, count: usize) {
    if count == 0 {
        return;
    }
    let labels = ChangeLabels {
        kind: kind.to_string(),
        op: op.to_string(),
    };
    APPLIED_CHANGES_TOTAL
        .get_or_create(&labels)
        .inc_by(count as u64);
}
