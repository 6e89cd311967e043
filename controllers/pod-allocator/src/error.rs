//! Controller-specific error types.
//!
//! This module defines the errors of the pod allocator controller that are
//! not covered by the allocator and cluster client libraries.

use cluster_client::ClientError;
use ipam::AllocatorError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the pod allocator controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Cluster read/write error
    #[error("Cluster client error: {0}")]
    Client(#[from] ClientError),

    /// Subnet or tunnel ID allocator error
    #[error("Allocator error: {0}")]
    Allocator(#[from] AllocatorError),

    /// IPAMClaim referenced by a pod could not be read
    #[error("failed to get IPAMClaim {claim}: {source}")]
    ClaimLookup {
        /// `namespace/name` of the claim
        claim: String,
        /// Underlying client error
        source: ClientError,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed pod or claim annotation
    #[error("Invalid annotation: {0}")]
    InvalidAnnotation(String),

    /// IP allocation failed
    #[error("IP allocation failed: {0}")]
    AllocationFailed(String),

    /// The pod annotation kept losing optimistic-concurrency races
    #[error("Gave up after repeated write conflicts: {0}")]
    ConflictRetriesExhausted(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// Whether the underlying cause is an address that is already in use.
    #[cfg(test)]
    pub fn is_already_allocated(&self) -> bool {
        matches!(self, Self::Allocator(e) if e.is_already_allocated())
    }
}
