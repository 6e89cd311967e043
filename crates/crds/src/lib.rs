//! Pod network API types
//!
//! Kubernetes custom resources and annotation formats shared by the pod
//! allocator and its collaborators.

pub mod ipam_claim;
pub mod network_selection;
pub mod pod_networks;

pub use ipam_claim::*;
pub use network_selection::*;
pub use pod_networks::*;
