//! Error types shared across the operator and the node daemon.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// HTTP request to the kubelet or a node worker failed
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Filesystem I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Invalid controller or daemon configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The snapshot selector names a kind other than Pod
    #[error("unsupported selector kind: {0}")]
    UnsupportedKind(String),

    /// The target pod has no container with the selected name
    #[error("no such container: {0}")]
    NoSuchContainer(String),

    /// The target node does not expose an InternalIP address
    #[error("no InternalIP for node {0}")]
    NodeAddressMissing(String),

    /// The kubelet checkpoint call failed or returned an unexpected body
    #[error("checkpoint failed: {0}")]
    CheckpointError(String),

    /// The checkpoint archive is unreadable or missing a dump file
    #[error("invalid checkpoint archive: {0}")]
    CheckpointArchiveError(String),

    /// The dump was produced by a high-level runtime we do not support
    #[error("unsupported high-level container runtime {0}")]
    UnsupportedRuntimeError(String),

    /// The image-push secret is missing or malformed
    #[error("credential error: {0}")]
    CredentialError(String),

    /// The output image reference does not parse
    #[error("invalid image reference: {0}")]
    InvalidReferenceError(String),

    /// Registry HEAD/push failed for a reason other than "not found"
    #[error("registry error: {0}")]
    RegistryError(String),

    /// A node worker job could not be created or polled
    #[error("worker error: {0}")]
    WorkerError(String),
}

impl Error {
    /// Whether a retry without operator intervention can succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::KubeError(_)
                | Error::HttpError(_)
                | Error::RegistryError(_)
                | Error::WorkerError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
