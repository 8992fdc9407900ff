//! Custom error types for akup.

use thiserror::Error;

/// Message returned by the API server when an update races with another writer.
const OPTIMISTIC_LOCK_MESSAGE: &str = "the object has been modified";

/// Errors that can occur during cluster upgrade and scale operations.
#[derive(Error, Debug)]
pub enum AkupError {
    #[error("[{operation}] ARM request failed with status {status}: {message}")]
    ArmApi {
        operation: String,
        status: u16,
        message: String,
    },

    #[error("Kubernetes API error: {0}")]
    KubernetesApi(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Too many requests: {0}")]
    TooManyRequests(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid version format: {0}")]
    InvalidVersion(String),

    #[error("upgrading from Kubernetes version {from} to version {to} is not supported")]
    UnsupportedUpgrade { from: String, to: String },

    #[error("{from} cannot be upgraded to {to}")]
    UpgradeNotAllowed { from: String, to: String },

    #[error("Timeout waiting for {operation}: {details}")]
    Timeout { operation: String, details: String },

    #[error("no kubernetes client")]
    NoKubernetesClient,

    #[error("more than one upgraded control plane node is not ready: {}", .0.join(", "))]
    ControlPlaneNotReady(Vec<String>),

    #[error("Invalid VM name: {0}")]
    InvalidVmName(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation cancelled by user")]
    UserCancelled,
}

impl AkupError {
    /// Map a kube-rs error onto the variants the orchestration logic branches on.
    pub fn kube(context: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => match resp.code {
                404 => AkupError::NotFound(format!("{}: {}", context, resp.message)),
                409 => AkupError::Conflict(format!("{}: {}", context, resp.message)),
                429 => AkupError::TooManyRequests(format!("{}: {}", context, resp.message)),
                _ => AkupError::KubernetesApi(format!("{}: {}", context, resp.message)),
            },
            other => AkupError::KubernetesApi(format!("{}: {}", context, other)),
        }
    }
}

fn find(err: &anyhow::Error) -> Option<&AkupError> {
    err.chain().find_map(|e| e.downcast_ref::<AkupError>())
}

/// Returns true if the error is an optimistic-lock conflict.
pub fn is_conflict(err: &anyhow::Error) -> bool {
    matches!(find(err), Some(AkupError::Conflict(_)))
        || err
            .chain()
            .any(|e| e.to_string().contains(OPTIMISTIC_LOCK_MESSAGE))
}

/// Returns true if the error means the object does not exist.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(find(err), Some(AkupError::NotFound(_)))
}

/// Returns true if the API server asked the caller to back off (e.g. a PDB blocked eviction).
pub fn is_too_many_requests(err: &anyhow::Error) -> bool {
    matches!(find(err), Some(AkupError::TooManyRequests(_)))
}
