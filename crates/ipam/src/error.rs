//! Allocator errors

use ipnet::IpNet;
use std::net::IpAddr;
use thiserror::Error;

/// Errors that can occur when allocating addresses or tunnel IDs
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocatorError {
    /// No pool has been configured for the network
    #[error("subnet for network {0} not found")]
    SubnetNotFound(String),

    /// Every usable address of a range is allocated or excluded
    #[error("no free addresses left in range {range} of network {network}")]
    PoolExhausted {
        /// Network owning the pool
        network: String,
        /// Range that ran out of addresses
        range: IpNet,
    },

    /// The address is already held by this allocator
    #[error("address {0} is already allocated")]
    AlreadyAllocated(IpAddr),

    /// The address is not a usable address of any configured range
    #[error("address {address} is not within any usable range of network {network}")]
    OutOfRange {
        /// Network owning the pool
        network: String,
        /// Offending address
        address: IpAddr,
    },

    /// The address lies inside an exclusion range
    #[error("address {0} is excluded from allocation")]
    Excluded(IpAddr),

    /// Pool definition rejected (configuration error)
    #[error("invalid range for network {network}: {reason}")]
    InvalidRange {
        /// Network owning the pool
        network: String,
        /// What was wrong with the definition
        reason: String,
    },

    /// Every ID of the namespace is reserved
    #[error("no free ids left in id allocator {0}")]
    IdsExhausted(String),

    /// The ID belongs to another owner, or the owner already holds another ID
    #[error("id {id} conflicts with the reservation held by {owner}")]
    IdAlreadyReserved {
        /// Requested ID
        id: u32,
        /// Owner of the conflicting reservation
        owner: String,
    },

    /// The ID is larger than the namespace allows
    #[error("id {id} is out of range [0, {max}]")]
    IdOutOfRange {
        /// Requested ID
        id: u32,
        /// Largest valid ID
        max: u32,
    },
}

impl AllocatorError {
    /// Whether the error only says the address is already taken.
    ///
    /// Replay and reuse paths treat this as benign.
    #[must_use]
    pub fn is_already_allocated(&self) -> bool {
        matches!(self, Self::AlreadyAllocated(_))
    }

    /// Whether the error reports an exhausted pool or ID namespace.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. } | Self::IdsExhausted(_))
    }
}
