//! Volumes, mounts and claim templates of a service

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, EmptyDirVolumeSource, GitRepoVolumeSource, HostPathVolumeSource,
    KeyToPath, PersistentVolumeClaim, PersistentVolumeClaimSpec, SecretVolumeSource, Volume,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;

use crate::crd::{ServiceConfig, VolumeType};
use crate::error::{Error, Result};

const DOCKER_SOCKET: &str = "/var/run/docker.sock";
const DEFAULT_CLAIM_SIZE: &str = "100Mi";
/// Key holding the payload inside stack Secrets and ConfigMaps
const FILE_KEY: &str = "file";
/// 0644, the API server default
const DEFAULT_MODE: i32 = 0o644;

/// Prefixes of auto-named volumes; anything else found on an observed pod is
/// foreign and preserved.
const MANAGED_PREFIXES: [&str; 4] = ["mount-", "tmp-", "secret-", "config-"];

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServiceVolumes {
    pub volumes: Vec<Volume>,
    pub mounts: Vec<VolumeMount>,
    /// One per distinct named volume, in declaration order
    pub claims: Vec<PersistentVolumeClaim>,
}

/// True for volume names this builder generates
pub fn is_managed_volume_name(name: &str) -> bool {
    MANAGED_PREFIXES.iter().any(|prefix| {
        name.strip_prefix(prefix)
            .is_some_and(|i| !i.is_empty() && i.bytes().all(|b| b.is_ascii_digit()))
    })
}

fn mount(name: String, target: &str, read_only: bool, sub_path: Option<&str>) -> VolumeMount {
    VolumeMount {
        name,
        mount_path: target.to_string(),
        read_only: read_only.then_some(true),
        sub_path: sub_path.map(String::from),
        ..Default::default()
    }
}

fn host_path(path: &str) -> HostPathVolumeSource {
    HostPathVolumeSource {
        path: path.to_string(),
        type_: Some(String::new()),
    }
}

fn claim(name: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(DEFAULT_CLAIM_SIZE.to_string()),
                )])),
                limits: None,
            }),
            ..Default::default()
        }),
        status: None,
    }
}

/// Resolve the volumes, tmpfs, secrets and configs of a service.
pub fn service_volumes(service: &ServiceConfig) -> Result<ServiceVolumes> {
    let mut out = ServiceVolumes::default();

    for (i, volume) in service.volumes.iter().enumerate() {
        let source = volume.source.as_str();

        if volume.type_ == VolumeType::Volume && !source.is_empty() {
            // named volume, backed by a claim template
            if !out.claims.iter().any(|c| c.metadata.name.as_deref() == Some(source)) {
                out.claims.push(claim(source));
            }
            out.mounts
                .push(mount(source.to_string(), &volume.target, volume.read_only, None));
            continue;
        }

        let name = format!("mount-{i}");
        let (vol, sub_path) = if source.is_empty() {
            (
                Volume {
                    name: name.clone(),
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    ..Default::default()
                },
                None,
            )
        } else if source == DOCKER_SOCKET {
            (
                Volume {
                    name: name.clone(),
                    host_path: Some(host_path("/var/run")),
                    ..Default::default()
                },
                Some("docker.sock"),
            )
        } else if source.ends_with(".git") {
            (
                Volume {
                    name: name.clone(),
                    git_repo: Some(GitRepoVolumeSource {
                        repository: source.to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                None,
            )
        } else if source.starts_with('/') {
            (
                Volume {
                    name: name.clone(),
                    host_path: Some(host_path(source)),
                    ..Default::default()
                },
                None,
            )
        } else {
            return Err(Error::RelativeVolumePath(source.to_string()));
        };
        out.volumes.push(vol);
        out.mounts
            .push(mount(name, &volume.target, volume.read_only, sub_path));
    }

    for (i, path) in service.tmpfs.iter().enumerate() {
        let name = format!("tmp-{i}");
        out.volumes.push(Volume {
            name: name.clone(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: Some("Memory".to_string()),
                size_limit: None,
            }),
            ..Default::default()
        });
        out.mounts.push(mount(name, path, false, None));
    }

    for (i, secret) in service.secrets.iter().enumerate() {
        let name = format!("secret-{i}");
        let target = secret
            .target
            .clone()
            .unwrap_or_else(|| format!("/run/secrets/{}", secret.source));
        out.volumes.push(Volume {
            name: name.clone(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.source.clone()),
                items: Some(vec![file_item(secret.mode)]),
                default_mode: Some(DEFAULT_MODE),
                optional: None,
            }),
            ..Default::default()
        });
        out.mounts.push(mount(name, &target, true, Some(FILE_KEY)));
    }

    for (i, config) in service.configs.iter().enumerate() {
        let name = format!("config-{i}");
        let target = config
            .target
            .clone()
            .unwrap_or_else(|| format!("/{}", config.source));
        out.volumes.push(Volume {
            name: name.clone(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(config.source.clone()),
                items: Some(vec![file_item(config.mode)]),
                default_mode: Some(DEFAULT_MODE),
                optional: None,
            }),
            ..Default::default()
        });
        out.mounts.push(mount(name, &target, true, Some(FILE_KEY)));
    }

    Ok(out)
}

fn file_item(mode: Option<i32>) -> KeyToPath {
    KeyToPath {
        key: FILE_KEY.to_string(),
        path: FILE_KEY.to_string(),
        mode,
    }
}

/// Managed volumes followed by any foreign volumes of the observed pod.
pub fn merge_volumes(managed: Vec<Volume>, observed: Option<Vec<Volume>>) -> Option<Vec<Volume>> {
    let mut volumes = managed;
    for volume in observed.unwrap_or_default() {
        if !is_managed_volume_name(&volume.name) && !volumes.iter().any(|v| v.name == volume.name)
        {
            volumes.push(volume);
        }
    }
    (!volumes.is_empty()).then_some(volumes)
}
