//! Cluster client errors

use thiserror::Error;

/// Errors that can occur when reading or writing cluster objects
#[derive(Debug, Error)]
pub enum ClientError {
    /// Kubernetes API or transport error
    #[error("Kubernetes error: {0}")]
    Kube(#[source] kube::Error),

    /// The write was based on a stale resource version
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Object not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Object is missing a field the operation needs
    #[error("Invalid object: {0}")]
    InvalidObject(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    /// Whether the write lost an optimistic-concurrency race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Whether the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<kube::Error> for ClientError {
    fn from(error: kube::Error) -> Self {
        match error {
            kube::Error::Api(ae) if ae.code == 409 => Self::Conflict(ae.message.clone()),
            kube::Error::Api(ae) if ae.code == 404 => Self::NotFound(ae.message.clone()),
            other => Self::Kube(other),
        }
    }
}
