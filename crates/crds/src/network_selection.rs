//! Network selection annotation
//!
//! Pods request attachments to secondary networks through the
//! `k8s.v1.cni.cncf.io/networks` annotation, either as a JSON list of
//! selection elements or in the short `[namespace/]name[@interface]` form.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Annotation holding the requested network attachments of a pod
pub const NETWORK_ATTACHMENT_ANNOTATION: &str = "k8s.v1.cni.cncf.io/networks";

/// One requested network attachment.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct NetworkSelectionElement {
    /// Name of the NetworkAttachmentDefinition
    pub name: String,

    /// Namespace of the NetworkAttachmentDefinition (defaults to the pod namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Static IP requests in CIDR notation
    #[serde(rename = "ips", default, skip_serializing_if = "Vec::is_empty")]
    pub ip_request: Vec<String>,

    /// Requested MAC address
    #[serde(rename = "mac", default, skip_serializing_if = "Option::is_none")]
    pub mac_request: Option<String>,

    /// Interface name inside the pod
    #[serde(rename = "interface", default, skip_serializing_if = "Option::is_none")]
    pub interface_request: Option<String>,

    /// Name of the IPAMClaim holding persistent IPs for this attachment
    #[serde(rename = "ipam-claim-reference", default, skip_serializing_if = "Option::is_none")]
    pub ipam_claim_reference: Option<String>,
}

impl NetworkSelectionElement {
    /// NAD key (`namespace/name`) of this attachment.
    pub fn nad_name(&self) -> String {
        format!("{}/{}", self.namespace.as_deref().unwrap_or_default(), self.name)
    }

    /// Claim name, if the attachment asks for persistent IPs.
    pub fn claim_reference(&self) -> Option<&str> {
        self.ipam_claim_reference.as_deref().filter(|c| !c.is_empty())
    }
}

/// Errors parsing the network selection annotation
#[derive(Debug, Error)]
pub enum NetworkSelectionError {
    /// The JSON form could not be decoded
    #[error("invalid network selection JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// An entry of the short form is malformed
    #[error("invalid network selection entry {0:?}")]
    InvalidEntry(String),
}

/// Parses the value of [`NETWORK_ATTACHMENT_ANNOTATION`].
///
/// Elements without a namespace get `default_namespace`.
pub fn parse_network_selection(
    value: &str,
    default_namespace: &str,
) -> Result<Vec<NetworkSelectionElement>, NetworkSelectionError> {
    let value = value.trim();
    let mut elements = if value.starts_with('[') {
        serde_json::from_str::<Vec<NetworkSelectionElement>>(value)?
    } else {
        value
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(parse_short_entry)
            .collect::<Result<Vec<_>, _>>()?
    };

    for element in &mut elements {
        if element.name.is_empty() {
            return Err(NetworkSelectionError::InvalidEntry(value.to_string()));
        }
        if element.namespace.as_deref().is_none_or(str::is_empty) {
            element.namespace = Some(default_namespace.to_string());
        }
    }
    Ok(elements)
}

fn parse_short_entry(entry: &str) -> Result<NetworkSelectionElement, NetworkSelectionError> {
    let invalid = || NetworkSelectionError::InvalidEntry(entry.to_string());

    let (reference, interface) = match entry.split_once('@') {
        Some((reference, interface)) if !interface.is_empty() && !interface.contains('@') => {
            (reference, Some(interface.to_string()))
        }
        Some(_) => return Err(invalid()),
        None => (entry, None),
    };
    let (namespace, name) = match reference.split_once('/') {
        Some((namespace, name)) if !namespace.is_empty() && !name.contains('/') => {
            (Some(namespace.to_string()), name)
        }
        Some(_) => return Err(invalid()),
        None => (None, reference),
    };
    if name.is_empty() {
        return Err(invalid());
    }

    Ok(NetworkSelectionElement {
        name: name.to_string(),
        namespace,
        interface_request: interface,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_form() {
        let elements = parse_network_selection("blue, tenants/red@net1", "ns1").unwrap();
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0].nad_name(), "ns1/blue");
        assert_eq!(elements[0].interface_request, None);
        assert_eq!(elements[1].nad_name(), "tenants/red");
        assert_eq!(elements[1].interface_request.as_deref(), Some("net1"));
    }

    #[test]
    fn test_json_form() {
        let value = r#"[{"name":"blue","ips":["10.0.0.5/24"],"mac":"0a:58:0a:00:00:05","ipam-claim-reference":"vm-a.net1"}]"#;
        let elements = parse_network_selection(value, "ns1").unwrap();
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].nad_name(), "ns1/blue");
        assert_eq!(elements[0].ip_request, vec!["10.0.0.5/24".to_string()]);
        assert_eq!(elements[0].mac_request.as_deref(), Some("0a:58:0a:00:00:05"));
        assert_eq!(elements[0].claim_reference(), Some("vm-a.net1"));
    }

    #[test]
    fn test_empty_claim_reference_is_ignored() {
        let value = r#"[{"name":"blue","ipam-claim-reference":""}]"#;
        let elements = parse_network_selection(value, "ns1").unwrap();
        assert_eq!(elements[0].claim_reference(), None);
    }

    #[test]
    fn test_malformed_entries() {
        assert!(parse_network_selection("a/b/c", "ns1").is_err());
        assert!(parse_network_selection("blue@", "ns1").is_err());
        assert!(parse_network_selection("/blue", "ns1").is_err());
        assert!(parse_network_selection("[{\"name\": 5}]", "ns1").is_err());
        assert!(parse_network_selection("[{\"name\": \"\"}]", "ns1").is_err());
    }
}
