//! Pod network allocators
//!
//! In-memory allocators for the scarce, cluster-wide resources handed out to
//! pods attached to overlay networks.
//!
//! # Example
//!
//! ```
//! use ipam::{IdAllocator, SubnetAllocator};
//!
//! # fn example() -> Result<(), ipam::AllocatorError> {
//! let subnets = SubnetAllocator::new();
//! subnets.add_or_update_subnet("blue", &["10.0.0.0/24".parse().unwrap()], &[])?;
//! let ips = subnets.allocate_next_ips("blue")?;
//! assert_eq!(ips.len(), 1);
//!
//! let ids = IdAllocator::new("blue", ipam::MAX_LOGICAL_PORT_TUNNEL_KEY);
//! ids.reserve_id("zero", 0)?;
//! assert_eq!(ids.allocate_id("blue/pod-a")?, 1);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```
//!
//! # Features
//!
//! - **Subnet Pools**: per-network CIDR ranges (dual-stack), exclusion ranges,
//!   next-fit allocation and explicit reservation
//! - **Tunnel IDs**: bounded integer namespace keyed by owner name
//! - **Idempotent Release**: releasing something that is not allocated is a no-op

pub mod error;
pub mod id;
pub mod subnet;
pub mod sync;

pub use error::AllocatorError;
pub use id::{IdAllocator, NamedIdAllocator, MAX_LOGICAL_PORT_TUNNEL_KEY};
pub use subnet::{NamedSubnetAllocator, SubnetAllocator};
