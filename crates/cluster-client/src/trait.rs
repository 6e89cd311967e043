//! ClusterClient trait for mocking
//!
//! This trait abstracts the Kubernetes API access of the pod allocator. The
//! concrete `KubeClusterClient` implements it, and tests use the in-memory
//! `MockClusterClient`.

use crate::error::ClientError;
use async_trait::async_trait;
use crds::IPAMClaim;
use k8s_openapi::api::core::v1::Pod;

/// Trait for cluster API operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait]
pub trait ClusterClientTrait: Send + Sync {
    // Pods
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClientError>;
    async fn list_pods(&self) -> Result<Vec<Pod>, ClientError>;

    /// Sets one annotation on the pod.
    ///
    /// Fails with [`ClientError::Conflict`] if the pod changed since `pod` was
    /// read (its `resourceVersion` no longer matches).
    async fn update_pod_annotation(&self, pod: &Pod, key: &str, value: &str) -> Result<Pod, ClientError>;

    // IPAMClaims
    async fn get_ipam_claim(&self, namespace: &str, name: &str) -> Result<IPAMClaim, ClientError>;
    async fn list_ipam_claims(&self) -> Result<Vec<IPAMClaim>, ClientError>;

    /// Writes the addresses into the claim status.
    ///
    /// Fails with [`ClientError::Conflict`] if the claim changed since `claim`
    /// was read.
    async fn update_ipam_claim_ips(&self, claim: &IPAMClaim, ips: &[String]) -> Result<IPAMClaim, ClientError>;
}
