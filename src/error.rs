//! Error types for the stack operator

use thiserror::Error;

/// Main error type for stack reconciliation
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("stack spec is empty")]
    EmptySpec,

    #[error("service {service}: environment variable {variable} has no value")]
    UnsettableEnv { service: String, variable: String },

    #[error("unsupported restart policy {0:?}")]
    UnsupportedRestartPolicy(String),

    #[error("volume source {0:?} must be an absolute path")]
    RelativeVolumePath(String),

    #[error("service {0}: persistent volumes unsupported with global mode")]
    GlobalWithPersistentVolume(String),

    #[error("invalid quantity {value:?}: {reason}")]
    InvalidQuantity { value: String, reason: String },

    #[error("invalid port configuration: {0}")]
    InvalidPort(String),

    #[error("invalid placement: {0}")]
    InvalidPlacement(String),

    /// Owner identity could not be resolved; the process must restart.
    #[error("unable to resolve owner identity: {0}")]
    IdentityUnavailable(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    fn api_code(&self) -> Option<u16> {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => Some(resp.code),
            _ => None,
        }
    }

    /// Optimistic concurrency failure (HTTP 409)
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }

    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    pub fn is_forbidden(&self) -> bool {
        self.api_code() == Some(403)
    }

    /// Errors coming from the user's stack definition. These are surfaced as
    /// `Failure` status and are not retried until the spec changes.
    pub fn is_spec_error(&self) -> bool {
        matches!(
            self,
            Error::EmptySpec
                | Error::UnsettableEnv { .. }
                | Error::UnsupportedRestartPolicy(_)
                | Error::RelativeVolumePath(_)
                | Error::GlobalWithPersistentVolume(_)
                | Error::InvalidQuantity { .. }
                | Error::InvalidPort(_)
                | Error::InvalidPlacement(_)
        )
    }

    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => {
                resp.code == 409 || resp.code == 429 || resp.code >= 500
            }
            Error::KubeError(_) => true,
            _ => false,
        }
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) if self.is_conflict() => "conflict",
            Error::KubeError(_) => "kube",
            Error::SerializationError(_) | Error::YamlError(_) => "serialization",
            Error::ConfigError(_) => "config",
            Error::IdentityUnavailable(_) => "identity",
            _ => "spec",
        }
    }
}
