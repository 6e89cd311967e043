//! Main controller implementation.
//!
//! This module contains the `Controller` struct that builds one allocator per
//! configured network, replays the cluster state into them and then keeps
//! them up to date from pod and IPAMClaim watch events.

use crate::annotation::ReallocatePolicy;
use crate::config::{ControllerConfig, NetInfo};
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::pod_allocator::{PodAllocator, SyncObject};
use crate::server::{self, HealthState};
use crate::watcher::Watcher;
use cluster_client::{ClusterClientTrait, KubeClusterClient};
use crds::IPAMClaim;
use ipam::SubnetAllocator;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Main controller for pod network allocation.
pub struct Controller {
    pod_watcher: JoinHandle<Result<(), ControllerError>>,
    ipam_claim_watcher: JoinHandle<Result<(), ControllerError>>,
    retry_loop: JoinHandle<()>,
    probe_server: JoinHandle<std::io::Result<()>>,
}

impl Controller {
    /// Creates a new controller instance.
    ///
    /// Returns once every network is initialized and synced.
    pub async fn new(config: ControllerConfig, networks: Vec<NetInfo>) -> Result<Self, ControllerError> {
        info!("Initializing Pod Allocator Controller");

        let metrics = Arc::new(
            Metrics::new().map_err(|e| ControllerError::InvalidConfig(format!("cannot register metrics: {e}")))?,
        );
        let health = HealthState::default();
        let probe_server = tokio::spawn(server::serve(config.probe_addr, health.clone(), Arc::clone(&metrics)));

        // Create Kubernetes client
        let kube_client = Client::try_default().await?;
        let client: Arc<dyn ClusterClientTrait> =
            Arc::new(KubeClusterClient::new(kube_client.clone(), config.namespace.clone()));

        let policy = if config.reallocate_ips {
            ReallocatePolicy::Reallocate
        } else {
            ReallocatePolicy::NoReallocate
        };
        let ip_allocator = SubnetAllocator::new();
        let allocators: Vec<PodAllocator> = networks
            .into_iter()
            .map(|net_info| {
                info!("Managing network {} ({:?})", net_info.name(), net_info.topology());
                PodAllocator::new(
                    Arc::new(net_info),
                    Arc::clone(&client),
                    ip_allocator.clone(),
                    policy,
                    Arc::clone(&metrics),
                )
            })
            .collect();
        for allocator in &allocators {
            allocator.init()?;
        }

        let objects = list_sync_objects(client.as_ref()).await?;
        for allocator in &allocators {
            allocator.sync(&objects).await?;
        }
        health.set_ready(true);
        info!("Synced {} networks from {} objects", allocators.len(), objects.len());

        let (pod_api, ipam_claim_api): (Api<Pod>, Api<IPAMClaim>) = match config.namespace.as_deref() {
            Some(ns) => (Api::namespaced(kube_client.clone(), ns), Api::namespaced(kube_client, ns)),
            None => (Api::all(kube_client.clone()), Api::all(kube_client)),
        };

        let watcher = Arc::new(Watcher::new(Arc::new(allocators)));
        let pod_watcher = {
            let watcher = Arc::clone(&watcher);
            tokio::spawn(async move { watcher.watch_pods(pod_api).await })
        };
        let ipam_claim_watcher = {
            let watcher = Arc::clone(&watcher);
            tokio::spawn(async move { watcher.watch_ipam_claims(ipam_claim_api).await })
        };
        let retry_loop = tokio::spawn(async move { watcher.run_retries().await });

        Ok(Self {
            pod_watcher,
            ipam_claim_watcher,
            retry_loop,
            probe_server,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Pod Allocator Controller running");

        // Wait for a watcher, the retry loop or the probe server to exit (they should run forever)
        tokio::select! {
            result = &mut self.pod_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("Pod watcher panicked: {}", e)))??;
            }
            result = &mut self.ipam_claim_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("IPAMClaim watcher panicked: {}", e)))??;
            }
            result = &mut self.retry_loop => {
                result.map_err(|e| ControllerError::Watch(format!("Retry loop panicked: {}", e)))?;
                return Err(ControllerError::Watch("Retry loop ended".to_string()));
            }
            result = &mut self.probe_server => {
                result.map_err(|e| ControllerError::Watch(format!("Probe server panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("Probe server error: {}", e)))?;
            }
        }

        Ok(())
    }
}

/// Lists every claim and pod for the startup replay.
async fn list_sync_objects(client: &dyn ClusterClientTrait) -> Result<Vec<SyncObject>, ControllerError> {
    let claims = client.list_ipam_claims().await?;
    let pods = client.list_pods().await?;
    info!("Listed {} IPAMClaims and {} pods for sync", claims.len(), pods.len());

    Ok(claims
        .into_iter()
        .map(SyncObject::Claim)
        .chain(pods.into_iter().map(SyncObject::Pod))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use cluster_client::MockClusterClient;

    #[tokio::test]
    async fn test_list_sync_objects_puts_claims_first() {
        let client = MockClusterClient::new();
        client.add_pod(create_test_pod("web-0", "ns1", "uid-1", Some("blue")));
        client.add_ipam_claim(create_test_claim("vm-a.net1", "ns1", "blue", &["10.0.0.5/24"]));

        let objects = list_sync_objects(&client).await.unwrap();
        assert_eq!(objects.len(), 2);
        assert!(matches!(objects[0], SyncObject::Claim(_)));
        assert!(matches!(objects[1], SyncObject::Pod(_)));
    }
}
