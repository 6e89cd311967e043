//! Pod network annotation
//!
//! The allocation result of every network attachment of a pod, stored as a
//! JSON map keyed by NAD (`namespace/name`) in the `k8s.ovn.org/pod-networks`
//! annotation and consumed by the dataplane.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Annotation holding the allocation results of a pod
pub const POD_NETWORKS_ANNOTATION: &str = "k8s.ovn.org/pod-networks";

/// Allocation result for one network attachment, as serialized.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct PodNetworkAnnotation {
    /// Allocated addresses in CIDR notation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addresses: Vec<String>,

    /// Interface MAC address
    pub mac_address: String,

    /// Default gateways, one per address family at most
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gateway_ips: Vec<String>,

    /// Extra routes for the interface
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<PodRouteAnnotation>,

    /// Tunnel key of the logical port (0 when not allocated)
    #[serde(default, skip_serializing_if = "is_zero")]
    pub tunnel_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodRouteAnnotation {
    /// Destination in CIDR notation
    pub dest: String,

    /// Next hop address
    pub next_hop: String,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

/// Decodes the pod networks annotation out of a pod's annotations.
///
/// A missing annotation decodes to an empty map.
pub fn pod_networks_from_annotations(
    annotations: Option<&BTreeMap<String, String>>,
) -> Result<BTreeMap<String, PodNetworkAnnotation>, serde_json::Error> {
    match annotations.and_then(|a| a.get(POD_NETWORKS_ANNOTATION)) {
        Some(value) => serde_json::from_str(value),
        None => Ok(BTreeMap::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_wire_format() {
        let value = r#"{"ns1/blue":{"ip_addresses":["10.0.0.5/24"],"mac_address":"0a:58:0a:00:00:05","gateway_ips":["10.0.0.1"],"routes":[{"dest":"10.96.0.0/16","nextHop":"10.0.0.1"}],"tunnel_id":7}}"#;
        let annotations = BTreeMap::from([(POD_NETWORKS_ANNOTATION.to_string(), value.to_string())]);

        let networks = pod_networks_from_annotations(Some(&annotations)).unwrap();
        let blue = &networks["ns1/blue"];
        assert_eq!(blue.ip_addresses, vec!["10.0.0.5/24".to_string()]);
        assert_eq!(blue.routes[0].next_hop, "10.0.0.1");
        assert_eq!(blue.tunnel_id, 7);
    }

    #[test]
    fn test_missing_annotation_is_empty() {
        assert!(pod_networks_from_annotations(None).unwrap().is_empty());
        assert!(pod_networks_from_annotations(Some(&BTreeMap::new())).unwrap().is_empty());
    }

    #[test]
    fn test_zero_tunnel_id_is_omitted() {
        let annotation = PodNetworkAnnotation {
            mac_address: "0a:58:00:00:00:01".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_string(&annotation).unwrap();
        assert_eq!(json, r#"{"mac_address":"0a:58:00:00:00:01"}"#);
    }
}
