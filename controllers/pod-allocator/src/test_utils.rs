//! Test utilities for unit testing the allocator
//!
//! This module provides helpers for creating test data and setting up test scenarios.

use crate::annotation::{unmarshal_pod_annotation, PodAnnotation, ReallocatePolicy};
use crate::config::{NetInfo, NetworkSpec, SubnetSpec, Topology};
use crate::metrics::Metrics;
use crate::pod_allocator::PodAllocator;
use cluster_client::MockClusterClient;
use crds::{IPAMClaim, IPAMClaimSpec, IPAMClaimStatus, NETWORK_ATTACHMENT_ANNOTATION};
use ipam::SubnetAllocator;
use k8s_openapi::api::core::v1::{Pod, PodSpec, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Helper to create a scheduled, running test pod
pub fn create_test_pod(name: &str, namespace: &str, uid: &str, networks: Option<&str>) -> Pod {
    let annotations = networks.map(|networks| {
        BTreeMap::from([(NETWORK_ATTACHMENT_ANNOTATION.to_string(), networks.to_string())])
    });
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(uid.to_string()),
            annotations,
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some("node-1".to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        }),
    }
}

pub fn set_pod_phase(pod: &mut Pod, phase: &str) {
    pod.status.get_or_insert_with(Default::default).phase = Some(phase.to_string());
}

/// Helper to create test network spec (interconnected layer2)
pub fn create_test_network_spec(name: &str, subnets: &[&str], nads: &[&str]) -> NetworkSpec {
    NetworkSpec {
        name: name.to_string(),
        topology: Topology::Layer2,
        interconnect: true,
        nads: nads.iter().map(ToString::to_string).collect(),
        subnets: subnets
            .iter()
            .map(|cidr| SubnetSpec {
                cidr: (*cidr).to_string(),
                gateway: None,
            })
            .collect(),
        exclude_subnets: Vec::new(),
        routes: Vec::new(),
    }
}

pub fn create_test_net_info(name: &str, subnets: &[&str], nads: &[&str]) -> NetInfo {
    NetInfo::from_spec(&create_test_network_spec(name, subnets, nads)).unwrap()
}

/// Helper to create test IPAMClaim with the given status IPs
pub fn create_test_claim(name: &str, namespace: &str, network: &str, ips: &[&str]) -> IPAMClaim {
    IPAMClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: IPAMClaimSpec {
            network: network.to_string(),
            interface: "net1".to_string(),
        },
        status: Some(IPAMClaimStatus {
            ips: ips.iter().map(ToString::to_string).collect(),
        }),
    }
}

/// Builds an initialized allocator backed by the mock client
pub fn create_test_pod_allocator(net_info: NetInfo, client: &MockClusterClient) -> PodAllocator {
    create_test_pod_allocator_with_policy(net_info, client, ReallocatePolicy::NoReallocate)
}

pub fn create_test_pod_allocator_with_policy(
    net_info: NetInfo,
    client: &MockClusterClient,
    policy: ReallocatePolicy,
) -> PodAllocator {
    let allocator = PodAllocator::new(
        Arc::new(net_info),
        Arc::new(client.clone()),
        SubnetAllocator::new(),
        policy,
        Arc::new(Metrics::new().unwrap()),
    );
    allocator.init().unwrap();
    allocator
}

/// Annotation currently stored on a pod of the mock client
pub fn stored_pod_annotation(client: &MockClusterClient, namespace: &str, name: &str, nad: &str) -> Option<PodAnnotation> {
    let pod = client.pod(namespace, name)?;
    unmarshal_pod_annotation(&pod, nad).unwrap()
}

/// Number of allocated addresses of the allocator's network
pub fn ips_in_use(allocator: &PodAllocator) -> usize {
    allocator.ip_allocator().unwrap().allocated_count().unwrap()
}
