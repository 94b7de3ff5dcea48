//! Stack Custom Resource Definition
//!
//! A Stack is a Compose application: a set of services plus the secrets and
//! configs they reference. The operator projects each Stack into Deployments,
//! StatefulSets, DaemonSets and Services.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::authentication::v1::UserInfo;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ConfigObjConfig, SecretConfig, ServiceConfig};

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "compose.docker.com",
    version = "v1alpha3",
    kind = "Stack",
    namespaced,
    status = "StackStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Message","type":"string","jsonPath":".status.message"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct StackSpec {
    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, SecretConfig>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub configs: BTreeMap<String, ConfigObjConfig>,
}

/// Lifecycle phase of a Stack
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum StackPhase {
    /// Initial phase, and whenever the spec changes
    #[default]
    ReconciliationPending,
    /// Children created, not all ready yet
    Progressing,
    /// All children ready
    Available,
    /// Conversion or apply error; the status message carries the cause
    Failure,
}

impl fmt::Display for StackPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackPhase::ReconciliationPending => write!(f, "ReconciliationPending"),
            StackPhase::Progressing => write!(f, "Progressing"),
            StackPhase::Available => write!(f, "Available"),
            StackPhase::Failure => write!(f, "Failure"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StackStatus {
    pub phase: StackPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Stack generation this status was derived from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl StackStatus {
    pub fn new(phase: StackPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: Some(message.into()),
            observed_generation: None,
        }
    }

    pub fn with_observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }
}

/// Body of the `stacks/{name}/owner` sub-resource
///
/// The API boundary records the identity of whoever created or last updated
/// the stack; child mutations are performed while impersonating it.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct StackOwner {
    #[serde(default)]
    pub owner: UserInfo,
}

/// Cache key of a stack: `namespace/name`, or bare `name` without namespace
pub fn stack_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}/{name}")
    }
}

impl Stack {
    pub fn key(&self) -> String {
        stack_key(&self.namespace().unwrap_or_default(), &self.name_any())
    }

    /// A dirty stack has not been reconciled since its last spec change, or
    /// its last reconciliation failed. Dirty stacks are always fully
    /// recomputed.
    ///
    /// A spec change is detected by the status lagging behind the stack
    /// generation, since nothing resets the phase when the spec is edited.
    pub fn is_dirty(&self) -> bool {
        let Some(status) = &self.status else {
            return true;
        };
        if self.metadata.generation.is_some()
            && status.observed_generation != self.metadata.generation
        {
            return true;
        }
        matches!(
            status.phase,
            StackPhase::ReconciliationPending | StackPhase::Failure
        )
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
