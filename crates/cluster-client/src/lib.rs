//! Cluster API client
//!
//! The persisted-write and lookup side of the pod allocator: reading pods and
//! IPAMClaims, writing pod annotations with optimistic concurrency and
//! writing IPAMClaim status.
//!
//! # Example
//!
//! ```no_run
//! use cluster_client::{ClusterClientTrait, KubeClusterClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = KubeClusterClient::new(kube::Client::try_default().await?, None);
//!
//! let pod = client.get_pod("default", "web-0").await?;
//! match client.update_pod_annotation(&pod, "example.com/key", "value").await {
//!     Err(e) if e.is_conflict() => { /* re-read and retry */ }
//!     other => { other?; }
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
#[path = "trait.rs"]
pub mod client_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::KubeClusterClient;
pub use client_trait::ClusterClientTrait;
pub use error::ClientError;
#[cfg(feature = "test-util")]
pub use mock::MockClusterClient;
