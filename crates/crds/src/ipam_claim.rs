//! IPAMClaim CRD
//!
//! Promises a stable set of IP addresses to a pod interface across pod
//! re-creation.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[kube(
    group = "k8s.cni.cncf.io",
    version = "v1alpha1",
    kind = "IPAMClaim",
    namespaced,
    status = "IPAMClaimStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct IPAMClaimSpec {
    /// Name of the network the claim applies to
    pub network: String,

    /// Pod interface the addresses are bound to
    pub interface: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IPAMClaimStatus {
    /// Addresses in CIDR notation (e.g. "192.168.1.5/24")
    ///
    /// Written once, never overwritten afterwards.
    #[serde(default)]
    pub ips: Vec<String>,
}

impl IPAMClaim {
    /// Addresses recorded in the claim status, empty if none were written yet.
    pub fn status_ips(&self) -> &[String] {
        self.status.as_ref().map(|s| s.ips.as_slice()).unwrap_or_default()
    }
}
