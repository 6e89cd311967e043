//! Kubernetes-backed cluster client.

use crate::client_trait::ClusterClientTrait;
use crate::error::ClientError;
use async_trait::async_trait;
use crds::IPAMClaim;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client};
use serde_json::json;
use tracing::debug;

/// Reads and writes pods and IPAMClaims through the Kubernetes API.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    namespace: Option<String>,
}

impl std::fmt::Debug for KubeClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterClient")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl KubeClusterClient {
    /// Creates a client. Listing is restricted to `namespace` when given.
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn claims(&self, namespace: &str) -> Api<IPAMClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn scoped<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

fn object_key(meta: &ObjectMeta) -> Result<(&str, &str), ClientError> {
    let name = meta
        .name
        .as_deref()
        .ok_or_else(|| ClientError::InvalidObject("object missing name".to_string()))?;
    let namespace = meta
        .namespace
        .as_deref()
        .ok_or_else(|| ClientError::InvalidObject(format!("object {name} missing namespace")))?;
    Ok((namespace, name))
}

#[async_trait]
impl ClusterClientTrait for KubeClusterClient {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClientError> {
        Ok(self.pods(namespace).get(name).await?)
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, ClientError> {
        let list = self.scoped::<Pod>().list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn update_pod_annotation(&self, pod: &Pod, key: &str, value: &str) -> Result<Pod, ClientError> {
        let (namespace, name) = object_key(&pod.metadata)?;
        let resource_version = pod.metadata.resource_version.as_deref().ok_or_else(|| {
            ClientError::InvalidObject(format!("pod {namespace}/{name} missing resourceVersion"))
        })?;

        // Carrying resourceVersion makes the API server reject stale writes with 409
        let patch = json!({
            "metadata": {
                "resourceVersion": resource_version,
                "annotations": { key: value }
            }
        });

        let pp = PatchParams::default();
        let updated = self.pods(namespace).patch(name, &pp, &Patch::Merge(&patch)).await?;
        debug!("Updated annotation {} on pod {}/{}", key, namespace, name);
        Ok(updated)
    }

    async fn get_ipam_claim(&self, namespace: &str, name: &str) -> Result<IPAMClaim, ClientError> {
        Ok(self.claims(namespace).get(name).await?)
    }

    async fn list_ipam_claims(&self) -> Result<Vec<IPAMClaim>, ClientError> {
        let list = self.scoped::<IPAMClaim>().list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn update_ipam_claim_ips(&self, claim: &IPAMClaim, ips: &[String]) -> Result<IPAMClaim, ClientError> {
        let (namespace, name) = object_key(&claim.metadata)?;
        let resource_version = claim.metadata.resource_version.as_deref().ok_or_else(|| {
            ClientError::InvalidObject(format!("IPAMClaim {namespace}/{name} missing resourceVersion"))
        })?;

        // A status written from a stale read must not replace recorded IPs
        let status_patch = json!({
            "metadata": { "resourceVersion": resource_version },
            "status": { "ips": ips }
        });

        let pp = PatchParams::default();
        let updated = self
            .claims(namespace)
            .patch_status(name, &pp, &Patch::Merge(&status_patch))
            .await?;
        debug!("Updated IPAMClaim {}/{} status with IPs {:?}", namespace, name, ips);
        Ok(updated)
    }
}
