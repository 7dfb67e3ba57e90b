use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Request to the cluster did not complete within {0:?}")]
    Timeout(Duration),

    #[error("Object has no {0} set")]
    MissingObjectKey(&'static str),

    #[error("{kind} {name} is already controlled by another owner ({owner})")]
    OwnershipConflict {
        kind: String,
        name: String,
        owner: String,
    },

    #[error("Failed to resolve owner subjects: {0}")]
    SubjectResolution(String),

    #[error("Failed to make directory API call: {0}")]
    DirectoryRequest(#[from] reqwest::Error),

    #[error("The Secret {0} does not exist")]
    SecretNotFound(String),

    #[error("The Secret key {0} in {1} does not exist")]
    SecretKeyNotFound(String, String),

    #[error("The ServiceAccount {0} does not exist yet")]
    ServiceAccountNotFound(String),

    #[error("Invalid operator configuration: {0}")]
    Config(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::KubeError(_) => "KubeError",
            Error::Timeout(_) => "Timeout",
            Error::MissingObjectKey(_) => "MissingObjectKey",
            Error::OwnershipConflict { .. } => "OwnershipConflict",
            Error::SubjectResolution(_) => "SubjectResolution",
            Error::DirectoryRequest(_) => "DirectoryRequest",
            Error::SecretNotFound(_) => "SecretNotFound",
            Error::SecretKeyNotFound(_, _) => "SecretKeyNotFound",
            Error::ServiceAccountNotFound(_) => "ServiceAccountNotFound",
            Error::Config(_) => "Config",
        }
    }
}

pub mod controllers;

/// Owner identifier to RBAC subject resolution
pub mod subjects;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use controllers::State;
pub use metrics::Metrics;

/// The Sandbox CRD
pub mod resources;
