//! Pod network annotation allocation.
//!
//! Computes the allocation result of one pod attachment (IPs, MAC, gateways,
//! routes and tunnel ID) and persists it into the `k8s.ovn.org/pod-networks`
//! annotation. The annotation write is the confirming step: every allocation
//! made by an attempt whose write fails is returned to the allocators before
//! the attempt ends.

use crate::backoff::FibonacciBackoff;
use crate::config::NetInfo;
use crate::error::ControllerError;
use crate::network::{pod_key, pod_name, pod_namespace, pod_uid};
use cluster_client::ClusterClientTrait;
use crds::{
    pod_networks_from_annotations, IPAMClaim, NetworkSelectionElement, PodNetworkAnnotation,
    PodRouteAnnotation, POD_NETWORKS_ANNOTATION,
};
use ipam::{AllocatorError, NamedIdAllocator, NamedSubnetAllocator};
use ipnet::IpNet;
use k8s_openapi::api::core::v1::Pod;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const MAX_CONFLICT_ATTEMPTS: u32 = 5;
const CONFLICT_BACKOFF_MIN: Duration = Duration::from_millis(50);
const CONFLICT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// First two bytes of every MAC handed out to pods
const MAC_PREFIX: [u8; 2] = [0x0a, 0x58];

/// A route of a pod interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRoute {
    pub dest: IpNet,
    pub next_hop: IpAddr,
}

/// Allocation result of one pod attachment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodAnnotation {
    pub ips: Vec<IpNet>,
    pub mac: String,
    pub gateways: Vec<IpAddr>,
    pub routes: Vec<PodRoute>,
    /// 0 when the network has no tunnel IDs
    pub tunnel_id: u32,
}

impl PodAnnotation {
    /// Parses the serialized form.
    pub fn from_wire(wire: &PodNetworkAnnotation) -> Result<Self, ControllerError> {
        let ips = parse_ip_nets(&wire.ip_addresses)?;
        let mac = if wire.mac_address.is_empty() {
            String::new()
        } else {
            format_mac(parse_mac(&wire.mac_address)?)
        };
        let gateways = wire
            .gateway_ips
            .iter()
            .map(|gateway| parse_ip(gateway))
            .collect::<Result<Vec<_>, _>>()?;
        let routes = wire
            .routes
            .iter()
            .map(|route| {
                Ok(PodRoute {
                    dest: parse_ip_net(&route.dest)?,
                    next_hop: parse_ip(&route.next_hop)?,
                })
            })
            .collect::<Result<Vec<_>, ControllerError>>()?;

        Ok(Self {
            ips,
            mac,
            gateways,
            routes,
            tunnel_id: wire.tunnel_id,
        })
    }

    pub fn to_wire(&self) -> PodNetworkAnnotation {
        PodNetworkAnnotation {
            ip_addresses: self.ip_strings(),
            mac_address: self.mac.clone(),
            gateway_ips: self.gateways.iter().map(ToString::to_string).collect(),
            routes: self
                .routes
                .iter()
                .map(|route| PodRouteAnnotation {
                    dest: route.dest.to_string(),
                    next_hop: route.next_hop.to_string(),
                })
                .collect(),
            tunnel_id: self.tunnel_id,
        }
    }

    /// Addresses in CIDR notation, as stored in annotations and claims.
    pub fn ip_strings(&self) -> Vec<String> {
        self.ips.iter().map(ToString::to_string).collect()
    }
}

fn parse_ip(value: &str) -> Result<IpAddr, ControllerError> {
    value
        .parse()
        .map_err(|e| ControllerError::InvalidAnnotation(format!("invalid IP address {value:?}: {e}")))
}

fn parse_ip_net(value: &str) -> Result<IpNet, ControllerError> {
    value
        .parse()
        .map_err(|e| ControllerError::InvalidAnnotation(format!("invalid IP network {value:?}: {e}")))
}

/// Parses addresses in CIDR notation (`192.168.1.5/24`).
pub fn parse_ip_nets(values: &[String]) -> Result<Vec<IpNet>, ControllerError> {
    values.iter().map(|value| parse_ip_net(value)).collect()
}

/// Decodes the allocation result stored on `pod` for `nad`.
pub fn unmarshal_pod_annotation(pod: &Pod, nad: &str) -> Result<Option<PodAnnotation>, ControllerError> {
    let networks = pod_networks_from_annotations(pod.metadata.annotations.as_ref())
        .map_err(|e| ControllerError::InvalidAnnotation(format!("pod {}: {e}", pod_key(pod))))?;
    networks.get(nad).map(PodAnnotation::from_wire).transpose()
}

/// Parses a colon or dash separated MAC address.
pub fn parse_mac(value: &str) -> Result<[u8; 6], ControllerError> {
    let invalid = || ControllerError::InvalidAnnotation(format!("invalid MAC address {value:?}"));

    let mut mac = [0u8; 6];
    let mut parts = value.split([':', '-']);
    for byte in &mut mac {
        let part = parts.next().filter(|part| part.len() == 2).ok_or_else(invalid)?;
        *byte = u8::from_str_radix(part, 16).map_err(|e| {
            ControllerError::InvalidAnnotation(format!("invalid MAC address {value:?}: {e}"))
        })?;
    }
    if parts.next().is_some() {
        return Err(invalid());
    }
    Ok(mac)
}

pub fn format_mac(mac: [u8; 6]) -> String {
    mac.iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// MAC of an interface owning `ip`: the prefix followed by the last four
/// bytes of the address.
pub fn ip_to_mac(ip: IpAddr) -> [u8; 6] {
    let tail = match ip {
        IpAddr::V4(v4) => v4.octets(),
        IpAddr::V6(v6) => {
            let octets = v6.octets();
            [octets[12], octets[13], octets[14], octets[15]]
        }
    };
    [MAC_PREFIX[0], MAC_PREFIX[1], tail[0], tail[1], tail[2], tail[3]]
}

/// MAC derived from the first IPv4 address, or the first address if there is
/// no IPv4 one.
pub fn derive_mac(ips: &[IpNet]) -> Option<[u8; 6]> {
    ips.iter()
        .find(|ip| ip.addr().is_ipv4())
        .or_else(|| ips.first())
        .map(|ip| ip_to_mac(ip.addr()))
}

fn random_mac() -> [u8; 6] {
    let tail: [u8; 4] = rand::random();
    [MAC_PREFIX[0], MAC_PREFIX[1], tail[0], tail[1], tail[2], tail[3]]
}

/// Gateways of the subnets holding one of `ips`.
pub fn gateways_for(net_info: &NetInfo, ips: &[IpNet]) -> Vec<IpAddr> {
    let mut gateways = Vec::new();
    for subnet in net_info.subnets() {
        let Some(gateway) = subnet.gateway else {
            continue;
        };
        if ips.iter().any(|ip| subnet.cidr.contains(&ip.addr())) && !gateways.contains(&gateway) {
            gateways.push(gateway);
        }
    }
    gateways
}

/// Configured routes of the address families present in `ips`.
///
/// Routes without a next hop go through the gateway of their family and are
/// dropped when that family has none.
pub fn routes_for(net_info: &NetInfo, ips: &[IpNet], gateways: &[IpAddr]) -> Vec<PodRoute> {
    net_info
        .routes()
        .iter()
        .filter_map(|route| {
            let ipv4 = route.dest.addr().is_ipv4();
            if !ips.iter().any(|ip| ip.addr().is_ipv4() == ipv4) {
                return None;
            }
            let next_hop = route
                .next_hop
                .or_else(|| gateways.iter().copied().find(|gateway| gateway.is_ipv4() == ipv4))?;
            Some(PodRoute {
                dest: route.dest,
                next_hop,
            })
        })
        .collect()
}

/// What to do when the annotated IPs of a pod cannot be reserved again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReallocatePolicy {
    /// Allocate fresh addresses
    Reallocate,
    /// Fail the reconcile
    NoReallocate,
}

/// One attachment to allocate for
#[derive(Debug, Clone, Copy)]
pub struct AllocationRequest<'a> {
    pub pod: &'a Pod,
    pub nad: &'a str,
    pub network: &'a NetworkSelectionElement,
    /// Claim holding persistent IPs for the attachment
    pub claim: Option<&'a IPAMClaim>,
    /// Set when the network requires IPAM
    pub ip_allocator: Option<&'a NamedSubnetAllocator>,
    /// Set when the network requires tunnel IDs
    pub id_allocator: Option<&'a NamedIdAllocator>,
}

/// Result of a successful allocation
#[derive(Debug, Clone)]
pub struct AllocationOutcome {
    /// The pod as written, `None` when the stored annotation was up to date
    pub updated_pod: Option<Pod>,
    pub annotation: PodAnnotation,
    /// Addresses taken from the pool by this allocation
    pub new_ips: usize,
    /// Whether a tunnel ID was taken by this allocation
    pub new_tunnel_id: bool,
}

/// Allocations made during one attempt, undone if the attempt fails.
#[derive(Debug, Default)]
struct Rollback {
    ips: Vec<IpNet>,
    tunnel_id: bool,
}

impl Rollback {
    fn release_ips(&mut self, ip_allocator: &NamedSubnetAllocator) {
        if self.ips.is_empty() {
            return;
        }
        if let Err(e) = ip_allocator.release_ips(&self.ips) {
            warn!("Failed to roll back IPs {:?} on {}: {}", self.ips, ip_allocator.network(), e);
        }
        self.ips.clear();
    }

    fn undo(&mut self, ip_allocator: Option<&NamedSubnetAllocator>, id_allocator: Option<&NamedIdAllocator>) {
        if let Some(ip_allocator) = ip_allocator {
            self.release_ips(ip_allocator);
        }
        if self.tunnel_id {
            if let Some(id_allocator) = id_allocator {
                id_allocator.release_id();
            }
            self.tunnel_id = false;
        }
    }
}

/// Reserves addresses a pod may already own, ignoring the ones that are
/// already allocated.
fn reserve_owned(
    ip_allocator: &NamedSubnetAllocator,
    ips: &[IpNet],
    rollback: &mut Rollback,
) -> Result<(), AllocatorError> {
    for ip in ips {
        match ip_allocator.allocate_ips(std::slice::from_ref(ip)) {
            Ok(()) => rollback.ips.push(*ip),
            Err(e) if e.is_already_allocated() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Allocates and persists pod network annotations for one network.
pub struct PodAnnotationAllocator {
    net_info: Arc<NetInfo>,
    client: Arc<dyn ClusterClientTrait>,
    policy: ReallocatePolicy,
}

impl PodAnnotationAllocator {
    pub fn new(net_info: Arc<NetInfo>, client: Arc<dyn ClusterClientTrait>, policy: ReallocatePolicy) -> Self {
        Self {
            net_info,
            client,
            policy,
        }
    }

    /// Allocates IPs, MAC and tunnel ID for the attachment and writes them
    /// into the pod annotation.
    ///
    /// A write conflict rolls the attempt back, re-reads the pod and starts
    /// over, up to a bounded number of attempts.
    pub async fn allocate_pod_annotation(
        &self,
        request: AllocationRequest<'_>,
    ) -> Result<AllocationOutcome, ControllerError> {
        let mut pod = request.pod.clone();
        let uid = pod_uid(&pod).to_string();
        let mut backoff = FibonacciBackoff::new(CONFLICT_BACKOFF_MIN, CONFLICT_BACKOFF_MAX);

        for attempt in 1..=MAX_CONFLICT_ATTEMPTS {
            let mut rollback = Rollback::default();
            let (annotation, mut networks) = match self.compute_annotation(&pod, &request, &mut rollback) {
                Ok(computed) => computed,
                Err(e) => {
                    rollback.undo(request.ip_allocator, request.id_allocator);
                    return Err(e);
                }
            };

            let wire = annotation.to_wire();
            if networks.get(request.nad) == Some(&wire) {
                debug!("Pod {} already annotated for NAD {}", pod_key(&pod), request.nad);
                return Ok(AllocationOutcome {
                    updated_pod: None,
                    annotation,
                    new_ips: rollback.ips.len(),
                    new_tunnel_id: rollback.tunnel_id,
                });
            }

            networks.insert(request.nad.to_string(), wire);
            let value = match serde_json::to_string(&networks) {
                Ok(value) => value,
                Err(e) => {
                    rollback.undo(request.ip_allocator, request.id_allocator);
                    return Err(ControllerError::InvalidAnnotation(format!(
                        "cannot encode pod networks of {}: {e}",
                        pod_key(&pod)
                    )));
                }
            };

            match self.client.update_pod_annotation(&pod, POD_NETWORKS_ANNOTATION, &value).await {
                Ok(updated) => {
                    return Ok(AllocationOutcome {
                        updated_pod: Some(updated),
                        annotation,
                        new_ips: rollback.ips.len(),
                        new_tunnel_id: rollback.tunnel_id,
                    });
                }
                Err(e) if e.is_conflict() => {
                    rollback.undo(request.ip_allocator, request.id_allocator);
                    warn!(
                        "Conflict annotating pod {} for NAD {} (attempt {}/{}): {}",
                        pod_key(&pod),
                        request.nad,
                        attempt,
                        MAX_CONFLICT_ATTEMPTS,
                        e
                    );
                    if attempt < MAX_CONFLICT_ATTEMPTS {
                        tokio::time::sleep(backoff.next_backoff()).await;
                        pod = self.refetch(&pod, &uid).await?;
                    }
                }
                Err(e) => {
                    rollback.undo(request.ip_allocator, request.id_allocator);
                    return Err(e.into());
                }
            }
        }

        Err(ControllerError::ConflictRetriesExhausted(format!(
            "pod {} NAD {}",
            pod_key(&pod),
            request.nad
        )))
    }

    async fn refetch(&self, pod: &Pod, uid: &str) -> Result<Pod, ControllerError> {
        match self.client.get_pod(pod_namespace(pod), pod_name(pod)).await {
            Ok(fresh) if pod_uid(&fresh) == uid => Ok(fresh),
            Ok(_) => Err(ControllerError::AllocationFailed(format!(
                "pod {} was recreated while allocating",
                pod_key(pod)
            ))),
            Err(e) if e.is_not_found() => Err(ControllerError::AllocationFailed(format!(
                "pod {} was deleted while allocating",
                pod_key(pod)
            ))),
            Err(e) => Err(e.into()),
        }
    }

    fn compute_annotation(
        &self,
        pod: &Pod,
        request: &AllocationRequest<'_>,
        rollback: &mut Rollback,
    ) -> Result<(PodAnnotation, BTreeMap<String, PodNetworkAnnotation>), ControllerError> {
        let networks = pod_networks_from_annotations(pod.metadata.annotations.as_ref())
            .map_err(|e| ControllerError::InvalidAnnotation(format!("pod {}: {e}", pod_key(pod))))?;
        let existing = match networks.get(request.nad).map(PodAnnotation::from_wire).transpose() {
            Ok(existing) => existing,
            Err(e) => {
                warn!("Ignoring annotation of pod {} for NAD {}: {}", pod_key(pod), request.nad, e);
                None
            }
        };

        let ips = self.allocate_ips(pod, request, existing.as_ref(), rollback)?;

        let tunnel_id = match request.id_allocator {
            Some(id_allocator) => allocate_tunnel_id(id_allocator, existing.as_ref(), rollback)?,
            None => 0,
        };

        let mac = match request.network.mac_request.as_deref() {
            Some(requested) => format_mac(parse_mac(requested)?),
            None => match derive_mac(&ips) {
                Some(mac) => format_mac(mac),
                None => existing
                    .as_ref()
                    .map(|existing| existing.mac.clone())
                    .filter(|mac| !mac.is_empty())
                    .unwrap_or_else(|| format_mac(random_mac())),
            },
        };

        let gateways = gateways_for(&self.net_info, &ips);
        let routes = routes_for(&self.net_info, &ips, &gateways);

        Ok((
            PodAnnotation {
                ips,
                mac,
                gateways,
                routes,
                tunnel_id,
            },
            networks,
        ))
    }

    fn allocate_ips(
        &self,
        pod: &Pod,
        request: &AllocationRequest<'_>,
        existing: Option<&PodAnnotation>,
        rollback: &mut Rollback,
    ) -> Result<Vec<IpNet>, ControllerError> {
        let Some(ip_allocator) = request.ip_allocator else {
            // static IPs
            return parse_ip_nets(&request.network.ip_request);
        };

        let claim_ips = match request.claim {
            Some(claim) => parse_ip_nets(claim.status_ips())?,
            None => Vec::new(),
        };
        let reuse = if claim_ips.is_empty() {
            existing.map(|existing| existing.ips.clone()).unwrap_or_default()
        } else {
            claim_ips.clone()
        };

        if !reuse.is_empty() {
            match reserve_owned(ip_allocator, &reuse, rollback) {
                Ok(()) => {
                    debug!("Reusing IPs {:?} for pod {} on NAD {}", reuse, pod_key(pod), request.nad);
                    return Ok(reuse);
                }
                Err(e) if self.policy == ReallocatePolicy::Reallocate && claim_ips.is_empty() => {
                    warn!(
                        "Cannot reuse IPs {:?} of pod {} on NAD {}: {}; allocating new ones",
                        reuse,
                        pod_key(pod),
                        request.nad,
                        e
                    );
                    rollback.release_ips(ip_allocator);
                }
                Err(e) => return Err(e.into()),
            }
        }

        if !request.network.ip_request.is_empty() {
            let requested = parse_ip_nets(&request.network.ip_request)?;
            ip_allocator.allocate_ips(&requested)?;
            rollback.ips.extend(requested.iter().copied());
            return Ok(requested);
        }

        let ips = ip_allocator.allocate_next_ips()?;
        rollback.ips.extend(ips.iter().copied());
        Ok(ips)
    }
}

fn allocate_tunnel_id(
    id_allocator: &NamedIdAllocator,
    existing: Option<&PodAnnotation>,
    rollback: &mut Rollback,
) -> Result<u32, ControllerError> {
    let held = id_allocator.get_id().is_some();
    let id = match existing.map(|existing| existing.tunnel_id).filter(|id| *id != 0) {
        Some(id) => {
            id_allocator.reserve_id(id)?;
            id
        }
        None => id_allocator.allocate_id()?,
    };
    if !held {
        rollback.tunnel_id = true;
    }
    Ok(id)
}
