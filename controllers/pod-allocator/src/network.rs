//! Pod state and network attachment helpers.

use crate::config::NetInfo;
use crate::error::ControllerError;
use crds::{parse_network_selection, NetworkSelectionElement, NETWORK_ATTACHMENT_ANNOTATION};
use k8s_openapi::api::core::v1::Pod;
use std::collections::BTreeMap;

/// A pod is scheduled once it has been bound to a node.
pub fn pod_scheduled(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.node_name.as_deref())
        .is_some_and(|node| !node.is_empty())
}

pub fn pod_wants_host_network(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.host_network)
        .unwrap_or(false)
}

/// A pod is completed once all its containers terminated for good.
pub fn pod_completed(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|status| status.phase.as_deref()),
        Some("Succeeded" | "Failed")
    )
}

pub fn pod_uid(pod: &Pod) -> &str {
    pod.metadata.uid.as_deref().unwrap_or_default()
}

pub fn pod_namespace(pod: &Pod) -> &str {
    pod.metadata.namespace.as_deref().unwrap_or_default()
}

pub fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or_default()
}

/// `namespace/name` of a pod, for logging.
pub fn pod_key(pod: &Pod) -> String {
    format!("{}/{}", pod_namespace(pod), pod_name(pod))
}

/// Maps every NAD of `net_info` the pod attaches to onto its selection element.
///
/// An empty map means the pod is not on the network.
pub fn pod_nad_to_network_mapping(
    pod: &Pod,
    net_info: &NetInfo,
) -> Result<BTreeMap<String, NetworkSelectionElement>, ControllerError> {
    let Some(value) = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(NETWORK_ATTACHMENT_ANNOTATION))
    else {
        return Ok(BTreeMap::new());
    };

    let elements = parse_network_selection(value, pod_namespace(pod)).map_err(|e| {
        ControllerError::InvalidAnnotation(format!("pod {}: {e}", pod_key(pod)))
    })?;

    let mut mapping = BTreeMap::new();
    for element in elements {
        let nad = element.nad_name();
        if !net_info.has_nad(&nad) {
            continue;
        }
        if mapping.contains_key(&nad) {
            return Err(ControllerError::InvalidAnnotation(format!(
                "pod {} attaches NAD {nad} more than once",
                pod_key(pod)
            )));
        }
        mapping.insert(nad, element);
    }
    Ok(mapping)
}

/// Whether any attachment of the pod names `claim` as its IPAMClaim.
///
/// Pods with a malformed selection annotation reference nothing.
pub fn pod_references_claim(pod: &Pod, claim: &str) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(NETWORK_ATTACHMENT_ANNOTATION))
        .and_then(|value| parse_network_selection(value, pod_namespace(pod)).ok())
        .is_some_and(|elements| elements.iter().any(|element| element.claim_reference() == Some(claim)))
}
