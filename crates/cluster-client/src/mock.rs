//! Mock ClusterClient for unit testing
//!
//! This module provides an in-memory implementation of `ClusterClientTrait`
//! that can be used in unit tests without a running API server. Pods carry a
//! resource version that is bumped on every write, so stale writes fail with
//! a conflict just like they do against the real API server.

use crate::client_trait::ClusterClientTrait;
use crate::error::ClientError;
use crds::{IPAMClaim, IPAMClaimStatus};
use k8s_openapi::api::core::v1::Pod;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type ObjectKey = (String, String);

/// Mock ClusterClient for testing
#[derive(Clone, Default)]
pub struct MockClusterClient {
    pub(crate) pods: Arc<Mutex<HashMap<ObjectKey, Pod>>>,
    pub(crate) claims: Arc<Mutex<HashMap<ObjectKey, IPAMClaim>>>,
    pub(crate) resource_version: Arc<Mutex<u64>>,
    // Failure injection
    pub(crate) pending_pod_conflicts: Arc<Mutex<u32>>,
    pub(crate) pending_claim_failures: Arc<Mutex<u32>>,
    // Write counters
    pub(crate) pod_updates: Arc<Mutex<u32>>,
    pub(crate) claim_updates: Arc<Mutex<u32>>,
}

fn key_of(namespace: Option<&str>, name: Option<&str>) -> ObjectKey {
    (
        namespace.unwrap_or_default().to_string(),
        name.unwrap_or_default().to_string(),
    )
}

impl MockClusterClient {
    /// Create a new, empty mock client
    pub fn new() -> Self {
        Self::default()
    }

    fn next_resource_version(&self) -> String {
        let mut rv = self.resource_version.lock().unwrap();
        *rv += 1;
        rv.to_string()
    }

    /// Add a pod to the mock store and return it with its resource version
    pub fn add_pod(&self, mut pod: Pod) -> Pod {
        pod.metadata.resource_version = Some(self.next_resource_version());
        let key = key_of(pod.metadata.namespace.as_deref(), pod.metadata.name.as_deref());
        self.pods.lock().unwrap().insert(key, pod.clone());
        pod
    }

    /// Remove a pod from the mock store
    pub fn remove_pod(&self, namespace: &str, name: &str) {
        self.pods
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Current stored version of a pod
    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.pods
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Add an IPAMClaim to the mock store and return it with its resource version
    pub fn add_ipam_claim(&self, mut claim: IPAMClaim) -> IPAMClaim {
        claim.metadata.resource_version = Some(self.next_resource_version());
        let key = key_of(claim.metadata.namespace.as_deref(), claim.metadata.name.as_deref());
        self.claims.lock().unwrap().insert(key, claim.clone());
        claim
    }

    /// Current stored version of an IPAMClaim
    pub fn ipam_claim(&self, namespace: &str, name: &str) -> Option<IPAMClaim> {
        self.claims
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Make the next `count` pod annotation writes lose a race against a
    /// concurrent writer
    pub fn inject_pod_conflicts(&self, count: u32) {
        *self.pending_pod_conflicts.lock().unwrap() = count;
    }

    /// Make the next `count` claim status writes fail
    pub fn fail_claim_updates(&self, count: u32) {
        *self.pending_claim_failures.lock().unwrap() = count;
    }

    /// Number of successful pod annotation writes
    pub fn pod_update_count(&self) -> u32 {
        *self.pod_updates.lock().unwrap()
    }

    /// Number of successful claim status writes
    pub fn claim_update_count(&self) -> u32 {
        *self.claim_updates.lock().unwrap()
    }

    fn take_injected(counter: &Mutex<u32>) -> bool {
        let mut pending = counter.lock().unwrap();
        if *pending == 0 {
            return false;
        }
        *pending -= 1;
        true
    }
}

#[async_trait::async_trait]
impl ClusterClientTrait for MockClusterClient {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClientError> {
        self.pod(namespace, name)
            .ok_or_else(|| ClientError::NotFound(format!("pod {namespace}/{name} not found")))
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, ClientError> {
        Ok(self.pods.lock().unwrap().values().cloned().collect())
    }

    async fn update_pod_annotation(&self, pod: &Pod, key: &str, value: &str) -> Result<Pod, ClientError> {
        let object_key = key_of(pod.metadata.namespace.as_deref(), pod.metadata.name.as_deref());

        if Self::take_injected(&self.pending_pod_conflicts) {
            // a concurrent writer got there first
            let rv = self.next_resource_version();
            if let Some(stored) = self.pods.lock().unwrap().get_mut(&object_key) {
                stored.metadata.resource_version = Some(rv);
            }
            return Err(ClientError::Conflict(format!("pod {}/{} was modified", object_key.0, object_key.1)));
        }

        let rv = self.next_resource_version();
        let mut pods = self.pods.lock().unwrap();
        let stored = pods
            .get_mut(&object_key)
            .ok_or_else(|| ClientError::NotFound(format!("pod {}/{} not found", object_key.0, object_key.1)))?;
        if stored.metadata.resource_version != pod.metadata.resource_version {
            return Err(ClientError::Conflict(format!("pod {}/{} was modified", object_key.0, object_key.1)));
        }

        stored
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), value.to_string());
        stored.metadata.resource_version = Some(rv);
        *self.pod_updates.lock().unwrap() += 1;
        Ok(stored.clone())
    }

    async fn get_ipam_claim(&self, namespace: &str, name: &str) -> Result<IPAMClaim, ClientError> {
        self.ipam_claim(namespace, name)
            .ok_or_else(|| ClientError::NotFound(format!("IPAMClaim {namespace}/{name} not found")))
    }

    async fn list_ipam_claims(&self) -> Result<Vec<IPAMClaim>, ClientError> {
        Ok(self.claims.lock().unwrap().values().cloned().collect())
    }

    async fn update_ipam_claim_ips(&self, claim: &IPAMClaim, ips: &[String]) -> Result<IPAMClaim, ClientError> {
        let object_key = key_of(claim.metadata.namespace.as_deref(), claim.metadata.name.as_deref());

        if Self::take_injected(&self.pending_claim_failures) {
            return Err(ClientError::Conflict(format!(
                "IPAMClaim {}/{} was modified",
                object_key.0, object_key.1
            )));
        }

        let rv = self.next_resource_version();
        let mut claims = self.claims.lock().unwrap();
        let stored = claims.get_mut(&object_key).ok_or_else(|| {
            ClientError::NotFound(format!("IPAMClaim {}/{} not found", object_key.0, object_key.1))
        })?;
        if stored.metadata.resource_version != claim.metadata.resource_version {
            return Err(ClientError::Conflict(format!(
                "IPAMClaim {}/{} was modified",
                object_key.0, object_key.1
            )));
        }

        stored.status = Some(IPAMClaimStatus { ips: ips.to_vec() });
        stored.metadata.resource_version = Some(rv);
        *self.claim_updates.lock().unwrap() += 1;
        Ok(stored.clone())
    }
}
