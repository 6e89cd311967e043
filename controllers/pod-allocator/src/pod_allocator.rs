//! Pod allocator for one network.
//!
//! Turns pod lifecycle events into allocations and releases on the network's
//! subnet and tunnel ID allocators:
//! - Unscheduled and host-networked pods are ignored
//! - Running pods get IPs, MAC and tunnel ID written into their annotation
//! - Completed and deleted pods give their resources back, once

use crate::annotation::{
    unmarshal_pod_annotation, AllocationRequest, PodAnnotationAllocator, ReallocatePolicy,
};
use crate::config::NetInfo;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::network::{
    pod_completed, pod_key, pod_nad_to_network_mapping, pod_namespace, pod_scheduled, pod_uid,
    pod_wants_host_network,
};
use crate::persistent_ips::PersistentIpsAllocator;
use crate::release_tracker::ReleaseTracker;
use cluster_client::ClusterClientTrait;
use crds::{IPAMClaim, NetworkSelectionElement};
use ipnet::IpNet;
use ipam::{IdAllocator, NamedSubnetAllocator, SubnetAllocator, MAX_LOGICAL_PORT_TUNNEL_KEY};
use k8s_openapi::api::core::v1::Pod;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Owner of the tunnel ID that is never handed out
const ZERO_ID_OWNER: &str = "zero";

/// An object replayed at startup
#[derive(Debug, Clone)]
pub enum SyncObject {
    Pod(Pod),
    Claim(IPAMClaim),
}

/// Name owning the tunnel ID of a pod attachment.
pub fn pod_id_allocation_name(nad: &str, uid: &str) -> String {
    format!("{nad}/{uid}")
}

/// Allocates pod resources on one network.
pub struct PodAllocator {
    net_info: Arc<NetInfo>,
    client: Arc<dyn ClusterClientTrait>,
    /// Set when the network requires IPAM
    ip_allocator: Option<SubnetAllocator>,
    /// Set when the network requires tunnel IDs
    id_allocator: Option<IdAllocator>,
    annotation_allocator: PodAnnotationAllocator,
    released_pods: ReleaseTracker,
    metrics: Arc<Metrics>,
}

impl PodAllocator {
    /// Creates the allocator of `net_info`.
    ///
    /// `ip_allocator` may be shared between networks, pools are keyed by
    /// network name.
    pub fn new(
        net_info: Arc<NetInfo>,
        client: Arc<dyn ClusterClientTrait>,
        ip_allocator: SubnetAllocator,
        policy: ReallocatePolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        let ip_allocator = net_info.requires_ipam().then_some(ip_allocator);
        let id_allocator = net_info
            .requires_tunnel_ids()
            .then(|| IdAllocator::new(net_info.name(), MAX_LOGICAL_PORT_TUNNEL_KEY));
        let annotation_allocator =
            PodAnnotationAllocator::new(Arc::clone(&net_info), Arc::clone(&client), policy);

        Self {
            net_info,
            client,
            ip_allocator,
            id_allocator,
            annotation_allocator,
            released_pods: ReleaseTracker::new(),
            metrics,
        }
    }

    pub fn net_info(&self) -> &NetInfo {
        &self.net_info
    }

    /// Handle on this network's pool, when the network requires IPAM.
    pub fn ip_allocator(&self) -> Option<NamedSubnetAllocator> {
        self.ip_allocator
            .as_ref()
            .map(|allocator| allocator.for_subnet(self.net_info.name()))
    }

    /// Sets up the pool and the tunnel ID namespace of the network.
    pub fn init(&self) -> Result<(), ControllerError> {
        if let Some(id_allocator) = &self.id_allocator {
            id_allocator.reserve_id(ZERO_ID_OWNER, 0)?;
        }

        if let Some(ip_allocator) = &self.ip_allocator {
            // gateways are never handed out to pods
            let mut excludes = self.net_info.exclude_subnets().to_vec();
            excludes.extend(
                self.net_info
                    .subnets()
                    .iter()
                    .filter_map(|subnet| subnet.gateway)
                    .map(IpNet::from),
            );
            ip_allocator.add_or_update_subnet(self.net_info.name(), &self.net_info.subnet_cidrs(), &excludes)?;
        }

        info!(
            "Initialized network {} (ipam: {}, tunnel ids: {})",
            self.net_info.name(),
            self.ip_allocator.is_some(),
            self.id_allocator.is_some()
        );
        Ok(())
    }

    /// Handles one pod event. `new` is `None` when the pod was deleted.
    pub async fn reconcile(&self, old: Option<&Pod>, new: Option<&Pod>) -> Result<(), ControllerError> {
        let result = self.reconcile_pod(old, new, true).await;
        if result.is_err() {
            self.metrics
                .reconcile_failures
                .with_label_values(&[self.net_info.name()])
                .inc();
        }
        self.update_in_use();
        result
    }

    /// Replays existing claims and pods without releasing anything.
    ///
    /// Claims are replayed first so that pods find their persistent IPs
    /// reserved. Pods that fail to replay are logged and skipped.
    pub async fn sync(&self, objects: &[SyncObject]) -> Result<(), ControllerError> {
        let claims: Vec<&IPAMClaim> = objects
            .iter()
            .filter_map(|object| match object {
                SyncObject::Claim(claim) if claim.spec.network == self.net_info.name() => Some(claim),
                _ => None,
            })
            .collect();
        if let Some(persistent_ips) = self.persistent_ips() {
            persistent_ips.sync(&claims)?;
        }

        for object in objects {
            if let SyncObject::Pod(pod) = object {
                if let Err(e) = self.reconcile_pod(None, Some(pod), false).await {
                    error!("Failed to sync pod {} on network {}: {}", pod_key(pod), self.net_info.name(), e);
                }
            }
        }

        self.update_in_use();
        info!(
            "Synced network {} from {} claims and {} objects",
            self.net_info.name(),
            claims.len(),
            objects.len()
        );
        Ok(())
    }

    /// Releases the IPs of a deleted IPAMClaim of this network.
    pub fn delete_claim(&self, claim: &IPAMClaim) -> Result<(), ControllerError> {
        if claim.spec.network != self.net_info.name() {
            return Ok(());
        }
        if let Some(persistent_ips) = self.persistent_ips() {
            persistent_ips.delete(claim)?;
            self.metrics
                .ips_released
                .with_label_values(&[self.net_info.name()])
                .inc_by(claim.status_ips().len() as u64);
            self.update_in_use();
        }
        Ok(())
    }

    fn persistent_ips(&self) -> Option<PersistentIpsAllocator> {
        self.ip_allocator()
            .map(|ip_allocator| PersistentIpsAllocator::new(Arc::clone(&self.client), ip_allocator))
    }

    fn update_in_use(&self) {
        if let Some(Ok(count)) = self.ip_allocator().map(|allocator| allocator.allocated_count()) {
            self.metrics
                .ips_in_use
                .with_label_values(&[self.net_info.name()])
                .set(i64::try_from(count).unwrap_or(i64::MAX));
        }
    }

    async fn reconcile_pod(
        &self,
        old: Option<&Pod>,
        new: Option<&Pod>,
        release_from_allocator: bool,
    ) -> Result<(), ControllerError> {
        let Some(pod) = new.or(old) else {
            return Ok(());
        };

        if !pod_scheduled(pod) || pod_wants_host_network(pod) {
            return Ok(());
        }

        let network_map = pod_nad_to_network_mapping(pod, &self.net_info)?;
        let pod_deleted = new.is_none();
        for (nad, network) in &network_map {
            if pod_completed(pod) || pod_deleted {
                self.release_pod_on_nad(pod, nad, network, pod_deleted, release_from_allocator)
                    .await?;
            } else {
                self.allocate_pod_on_nad(pod, nad, network).await?;
            }
        }
        Ok(())
    }

    async fn release_pod_on_nad(
        &self,
        pod: &Pod,
        nad: &str,
        network: &NetworkSelectionElement,
        pod_deleted: bool,
        release_from_allocator: bool,
    ) -> Result<(), ControllerError> {
        if self.ip_allocator.is_none() && self.id_allocator.is_none() {
            return Ok(());
        }

        // tolerate a missing or mangled annotation, there is just nothing to release
        let annotation = unmarshal_pod_annotation(pod, nad)
            .ok()
            .flatten()
            .unwrap_or_default();
        let uid = pod_uid(pod);

        let has_persistent_ips = match network.claim_reference() {
            Some(claim) => self.client.get_ipam_claim(pod_namespace(pod), claim).await.is_ok(),
            None => false,
        };

        let do_release = release_from_allocator && !self.released_pods.is_released(nad, uid);

        if do_release {
            if let Some(id_allocator) = &self.id_allocator {
                let name = pod_id_allocation_name(nad, uid);
                if id_allocator.get_id(&name).is_some() {
                    self.metrics
                        .tunnel_ids_released
                        .with_label_values(&[self.net_info.name()])
                        .inc();
                }
                id_allocator.release_id(&name);
                debug!("Released tunnel id {} of pod {} on NAD {}", annotation.tunnel_id, pod_key(pod), nad);
            }

            if let Some(ip_allocator) = self.ip_allocator().filter(|_| !has_persistent_ips) {
                ip_allocator.release_ips(&annotation.ips).map_err(|e| {
                    ControllerError::AllocationFailed(format!(
                        "failed to release IPs {:?} of pod {} on NAD {nad}: {e}",
                        annotation.ip_strings(),
                        pod_key(pod)
                    ))
                })?;
                self.metrics
                    .ips_released
                    .with_label_values(&[self.net_info.name()])
                    .inc_by(annotation.ips.len() as u64);
                debug!("Released IPs {:?} of pod {} on NAD {}", annotation.ip_strings(), pod_key(pod), nad);
            }
        }

        if pod_deleted {
            self.released_pods.unmark(nad, uid);
        } else {
            self.released_pods.mark_released(nad, uid);
        }
        Ok(())
    }

    async fn allocate_pod_on_nad(
        &self,
        pod: &Pod,
        nad: &str,
        network: &NetworkSelectionElement,
    ) -> Result<(), ControllerError> {
        let ip_allocator = self.ip_allocator();
        let id_allocator = self
            .id_allocator
            .as_ref()
            .map(|allocator| allocator.for_name(&pod_id_allocation_name(nad, pod_uid(pod))));

        let claim = match &ip_allocator {
            Some(_) => self.find_ipam_claim(pod, network).await?,
            None => None,
        };

        let outcome = self
            .annotation_allocator
            .allocate_pod_annotation(AllocationRequest {
                pod,
                nad,
                network,
                claim: claim.as_ref(),
                ip_allocator: ip_allocator.as_ref(),
                id_allocator: id_allocator.as_ref(),
            })
            .await?;

        if let (Some(claim), Some(ip_allocator)) = (&claim, ip_allocator) {
            PersistentIpsAllocator::new(Arc::clone(&self.client), ip_allocator)
                .reconcile(claim, &outcome.annotation.ip_strings())
                .await?;
        }

        let network_name = self.net_info.name();
        self.metrics
            .ips_allocated
            .with_label_values(&[network_name])
            .inc_by(outcome.new_ips as u64);
        if outcome.new_tunnel_id {
            self.metrics
                .tunnel_ids_allocated
                .with_label_values(&[network_name])
                .inc();
        }

        if outcome.updated_pod.is_some() {
            let annotation = &outcome.annotation;
            debug!(
                "Allocated IPs {:?}, MAC {}, gateways {:?}, routes {:?} and tunnel id {} for pod {} on NAD {}",
                annotation.ip_strings(),
                annotation.mac,
                annotation.gateways,
                annotation.routes,
                annotation.tunnel_id,
                pod_key(pod),
                nad
            );
        }
        Ok(())
    }

    async fn find_ipam_claim(
        &self,
        pod: &Pod,
        network: &NetworkSelectionElement,
    ) -> Result<Option<IPAMClaim>, ControllerError> {
        let Some(claim) = network.claim_reference() else {
            return Ok(None);
        };
        debug!("Looking up IPAMClaim {} of pod {}", claim, pod_key(pod));
        self.client
            .get_ipam_claim(pod_namespace(pod), claim)
            .await
            .map(Some)
            .map_err(|source| ControllerError::ClaimLookup {
                claim: format!("{}/{claim}", pod_namespace(pod)),
                source,
            })
    }
}
