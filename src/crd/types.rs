//! Compose service types carried by a Stack
//!
//! These mirror the Compose file format closely: field names follow the
//! Compose spelling so that a converted `docker-compose.yml` maps onto a
//! `StackSpec` one to one.
//!
//! # Type Hierarchy
//!
//! - [`ServiceConfig`] - one Compose service, converted into exactly one workload
//! - [`ServicePortConfig`] / [`InternalPort`] - published and cluster-internal ports
//! - [`ServiceVolumeConfig`] - bind mounts and named (persistent) volumes
//! - [`DeployConfig`] - replicas, mode, resources, restart and update policies, placement
//! - [`SecretConfig`] / [`ConfigObjConfig`] - stack-level secret and config declarations

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A single Compose service
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ServiceConfig {
    pub name: String,

    #[serde(default)]
    pub image: String,

    /// Overrides the image entrypoint (container `command`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,

    /// Overrides the image command (container `args`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    /// Environment variables. A key present without a value cannot be
    /// resolved inside the cluster and is rejected.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, Option<String>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ServicePortConfig>,

    /// Ports exposed on the cluster-internal service
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub internal_ports: Vec<InternalPort>,

    #[serde(default)]
    pub internal_service_type: InternalServiceType,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<ServiceVolumeConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tmpfs: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<ServiceSecretConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub configs: Vec<ServiceConfigObjConfig>,

    #[serde(rename = "healthcheck", default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckConfig>,

    #[serde(default)]
    pub deploy: DeployConfig,

    /// Labels applied to the pods of this service
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// `host:ip` entries added to the pods' hosts file
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_hosts: Vec<String>,

    /// Seconds to wait after SIGTERM before the container is killed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_grace_period: Option<i64>,

    /// Numeric user id the container runs as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<i64>,

    #[serde(default)]
    pub privileged: bool,

    #[serde(default)]
    pub read_only: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cap_add: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cap_drop: Vec<String>,

    #[serde(default)]
    pub tty: bool,

    #[serde(default)]
    pub stdin_open: bool,

    /// Name of an image pull secret in the stack namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_secret: Option<String>,
}

impl ServiceConfig {
    /// True when at least one named volume needs persistent storage
    pub fn has_persistent_volume(&self) -> bool {
        self.volumes
            .iter()
            .any(|v| v.type_ == VolumeType::Volume && !v.source.is_empty())
    }

    pub fn is_global(&self) -> bool {
        self.deploy.mode.as_deref() == Some("global")
    }
}

/// A port mapping. Ports without a `published` number are exposed on a
/// cluster-assigned node port.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ServicePortConfig {
    pub target: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<i32>,

    /// `tcp` (default), `udp` or `sctp`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// A port exposed on the cluster-internal service only
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct InternalPort {
    pub port: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// How the internal (name-resolution) service is exposed
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum InternalServiceType {
    /// Headless unless internal ports are declared
    #[default]
    Auto,
    /// Always headless
    Headless,
    /// Always a cluster IP; requires internal ports
    ClusterIP,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum VolumeType {
    /// Named volume (persistent) or anonymous volume (empty source)
    #[default]
    Volume,
    /// Host path bind mount
    #[serde(alias = "mount")]
    Bind,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ServiceVolumeConfig {
    #[serde(rename = "type", default)]
    pub type_: VolumeType,

    #[serde(default)]
    pub source: String,

    pub target: String,

    #[serde(default)]
    pub read_only: bool,
}

/// Reference from a service to a stack-level secret
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ServiceSecretConfig {
    pub source: String,

    /// Mount path; defaults to `/run/secrets/<source>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<i32>,
}

/// Reference from a service to a stack-level config
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ServiceConfigObjConfig {
    pub source: String,

    /// Mount path; defaults to `/<source>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct HealthCheckConfig {
    /// `["CMD", ...]`, `["CMD-SHELL", "..."]` or `["NONE"]`
    #[serde(default)]
    pub test: Vec<String>,

    /// Seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i32>,

    /// Seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<i32>,

    /// Seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_period: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeployConfig {
    /// Empty/`replicated` or `global`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_config: Option<UpdateConfig>,

    #[serde(default)]
    pub resources: Resources,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicy>,

    #[serde(default)]
    pub placement: Placement,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct UpdateConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Resources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<Resource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservations: Option<Resource>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Resource {
    /// Decimal CPU count, e.g. `"0.5"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<String>,

    /// Bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RestartPolicy {
    /// `any`, `on-failure` or `none`
    pub condition: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Placement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Constraints>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Constraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operating_system: Option<Constraint>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<Constraint>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<Constraint>,

    /// Arbitrary node label constraints
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, Constraint>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Constraint {
    pub value: String,

    /// `==`, `!=`, `>` or `<`
    pub operator: String,
}

/// Stack-level secret declaration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SecretConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Managed outside the stack; never deleted with it
    #[serde(default)]
    pub external: bool,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Stack-level config declaration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ConfigObjConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Managed outside the stack; never deleted with it
    #[serde(default)]
    pub external: bool,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}
