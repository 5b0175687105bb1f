//! Error types for the NVMesh operator

use thiserror::Error;

use crate::controller::database::DatabaseError;
use crate::controller::manifests::ManifestParseError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Watch stream error: {0}")]
    WatchError(#[from] kube::runtime::watcher::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Cross-field rule violated by the NVMesh spec
    #[error("{0}")]
    ValidationError(String),

    #[error("Missing {0}")]
    MissingField(String),

    #[error("Unknown action {0}")]
    UnknownAction(String),

    /// Deletion of the cluster is unsafe until the user intervenes
    #[error("{0}")]
    DeletionBlocked(String),

    #[error("Job {name} failed: {reason}")]
    JobFailed { name: String, reason: String },

    #[error("Job {0} not found")]
    JobNotFound(String),

    /// The API server does not serve this kind (e.g. a CRD that is not installed)
    #[error("No matches for kind {0}")]
    NoKindMatch(String),

    #[error(transparent)]
    ManifestParse(#[from] ManifestParseError),

    #[error("Database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

impl Error {
    fn api_error(&self) -> Option<&kube::core::ErrorResponse> {
        match self {
            Error::KubeError(kube::Error::Api(e)) => Some(e),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.api_error().map(|e| e.code == 404).unwrap_or(false)
    }

    pub fn is_already_exists(&self) -> bool {
        self.api_error()
            .map(|e| e.code == 409 && e.reason == "AlreadyExists")
            .unwrap_or(false)
    }

    pub fn is_conflict(&self) -> bool {
        self.api_error()
            .map(|e| e.code == 409 && e.reason == "Conflict")
            .unwrap_or(false)
    }

    pub fn is_no_kind_match(&self) -> bool {
        matches!(self, Error::NoKindMatch(_))
    }

    /// Transient failures that are expected to clear on their own
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(_) | Error::WatchError(_) | Error::IoError(_) => true,
            Error::DatabaseError(e) => e.is_unreachable(),
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
