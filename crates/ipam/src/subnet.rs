//! Subnet pool allocator.
//!
//! Each network owns one pool made of one or more CIDR ranges (typically one
//! IPv4 and one IPv6 range for dual-stack networks) plus a set of excluded
//! sub-ranges. Pools of different networks are locked independently.
//!
//! Allocation is next-fit: every range keeps a cursor just past the last
//! address it handed out and scans forward from there, wrapping once.
//! Excluded blocks are skipped in a single step, so a scan never visits more
//! than `allocated + exclusions + 1` candidates.

use crate::error::AllocatorError;
use crate::sync::{lock, read, write};
use ipnet::IpNet;
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

/// Allocator of IP addresses within per-network subnet pools.
///
/// Cloning is cheap and yields a handle to the same pools.
#[derive(Debug, Clone, Default)]
pub struct SubnetAllocator {
    pools: Arc<RwLock<HashMap<String, Arc<Mutex<SubnetPool>>>>>,
}

impl SubnetAllocator {
    /// Creates an allocator without any pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a handle bound to the pool of `network`.
    #[must_use]
    pub fn for_subnet(&self, network: &str) -> NamedSubnetAllocator {
        NamedSubnetAllocator {
            network: network.to_string(),
            allocator: self.clone(),
        }
    }

    /// Creates the pool of `network` or merges a new definition into it.
    ///
    /// Ranges already present keep their allocations. A range can only be
    /// dropped while none of its addresses are allocated, and exclusions must
    /// lie inside a range without covering an allocated address. Reapplying
    /// the same definition is a no-op.
    pub fn add_or_update_subnet(
        &self,
        network: &str,
        subnets: &[IpNet],
        excludes: &[IpNet],
    ) -> Result<(), AllocatorError> {
        if let Some(pool) = self.pool(network) {
            return lock(&pool).update(subnets, excludes);
        }

        let mut fresh = SubnetPool::new(network);
        fresh.update(subnets, excludes)?;

        let mut pools = write(&self.pools);
        match pools.entry(network.to_string()) {
            Entry::Occupied(existing) => lock(existing.get()).update(subnets, excludes),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(fresh)));
                Ok(())
            }
        }
    }

    /// Allocates the next free address from every range of `network`.
    ///
    /// Either one address per range is returned or nothing is allocated.
    pub fn allocate_next_ips(&self, network: &str) -> Result<Vec<IpNet>, AllocatorError> {
        let pool = self.require_pool(network)?;
        let ips = lock(&pool).allocate_next()?;
        debug!("Allocated next IPs {:?} on network {}", ips, network);
        Ok(ips)
    }

    /// Reserves the given addresses on `network`, all or nothing.
    pub fn allocate_ips(&self, network: &str, ips: &[IpNet]) -> Result<(), AllocatorError> {
        let pool = self.require_pool(network)?;
        lock(&pool).reserve(ips)
    }

    /// Returns addresses to the free set of `network`.
    ///
    /// Addresses that are not allocated are ignored.
    pub fn release_ips(&self, network: &str, ips: &[IpNet]) -> Result<(), AllocatorError> {
        let pool = self.require_pool(network)?;
        lock(&pool).release(ips);
        Ok(())
    }

    /// Number of addresses currently allocated on `network`.
    pub fn allocated_count(&self, network: &str) -> Result<usize, AllocatorError> {
        let pool = self.require_pool(network)?;
        let count = lock(&pool).ranges.iter().map(|r| r.allocated.len()).sum();
        Ok(count)
    }

    fn pool(&self, network: &str) -> Option<Arc<Mutex<SubnetPool>>> {
        read(&self.pools).get(network).map(Arc::clone)
    }

    fn require_pool(&self, network: &str) -> Result<Arc<Mutex<SubnetPool>>, AllocatorError> {
        self.pool(network)
            .ok_or_else(|| AllocatorError::SubnetNotFound(network.to_string()))
    }
}

/// A [`SubnetAllocator`] bound to a single network.
#[derive(Debug, Clone)]
pub struct NamedSubnetAllocator {
    network: String,
    allocator: SubnetAllocator,
}

impl NamedSubnetAllocator {
    /// Network this handle operates on.
    #[must_use]
    pub fn network(&self) -> &str {
        &self.network
    }

    /// See [`SubnetAllocator::allocate_next_ips`].
    pub fn allocate_next_ips(&self) -> Result<Vec<IpNet>, AllocatorError> {
        self.allocator.allocate_next_ips(&self.network)
    }

    /// See [`SubnetAllocator::allocate_ips`].
    pub fn allocate_ips(&self, ips: &[IpNet]) -> Result<(), AllocatorError> {
        self.allocator.allocate_ips(&self.network, ips)
    }

    /// See [`SubnetAllocator::release_ips`].
    pub fn release_ips(&self, ips: &[IpNet]) -> Result<(), AllocatorError> {
        self.allocator.release_ips(&self.network, ips)
    }

    /// See [`SubnetAllocator::allocated_count`].
    pub fn allocated_count(&self) -> Result<usize, AllocatorError> {
        self.allocator.allocated_count(&self.network)
    }
}

#[derive(Debug)]
struct SubnetPool {
    network: String,
    ranges: Vec<Range>,
}

impl SubnetPool {
    fn new(network: &str) -> Self {
        Self {
            network: network.to_string(),
            ranges: Vec::new(),
        }
    }

    fn invalid(&self, reason: String) -> AllocatorError {
        AllocatorError::InvalidRange {
            network: self.network.clone(),
            reason,
        }
    }

    fn update(&mut self, subnets: &[IpNet], excludes: &[IpNet]) -> Result<(), AllocatorError> {
        let mut wanted: Vec<IpNet> = Vec::with_capacity(subnets.len());
        for subnet in subnets.iter().map(IpNet::trunc) {
            if !wanted.contains(&subnet) {
                wanted.push(subnet);
            }
        }

        for exclude in excludes {
            if !wanted.iter().any(|subnet| subnet.contains(exclude)) {
                return Err(self.invalid(format!("exclude subnet {exclude} is not within any subnet")));
            }
        }

        for range in &self.ranges {
            if !wanted.contains(&range.net) {
                if !range.allocated.is_empty() {
                    return Err(self.invalid(format!(
                        "cannot remove subnet {} with {} allocated addresses",
                        range.net,
                        range.allocated.len()
                    )));
                }
                continue;
            }
            let blocks = exclusion_blocks(range.net, range.first, range.last, excludes);
            if let Some(offset) = range.allocated.iter().find(|o| block_end(&blocks, **o).is_some()) {
                return Err(self.invalid(format!(
                    "exclusion covers allocated address {}",
                    range.addr(*offset)
                )));
            }
        }

        let mut ranges = Vec::with_capacity(wanted.len());
        for net in wanted {
            let mut range = match self.ranges.iter().position(|r| r.net == net) {
                Some(index) => self.ranges.swap_remove(index),
                None => Range::new(net),
            };
            range.excluded = exclusion_blocks(range.net, range.first, range.last, excludes);
            ranges.push(range);
        }

        self.ranges = ranges;
        Ok(())
    }

    fn allocate_next(&mut self) -> Result<Vec<IpNet>, AllocatorError> {
        let mut taken: Vec<(usize, u128)> = Vec::with_capacity(self.ranges.len());
        for index in 0..self.ranges.len() {
            if let Some(offset) = self.ranges[index].allocate_next() {
                taken.push((index, offset));
                continue;
            }
            for (undo, offset) in taken {
                self.ranges[undo].allocated.remove(&offset);
            }
            return Err(AllocatorError::PoolExhausted {
                network: self.network.clone(),
                range: self.ranges[index].net,
            });
        }

        taken
            .into_iter()
            .map(|(index, offset)| self.ranges[index].ipnet(offset))
            .collect()
    }

    fn reserve(&mut self, ips: &[IpNet]) -> Result<(), AllocatorError> {
        let mut taken: Vec<(usize, u128)> = Vec::with_capacity(ips.len());
        for ip in ips {
            match self.reserve_one(ip.addr()) {
                Ok(slot) => taken.push(slot),
                Err(e) => {
                    for (index, offset) in taken {
                        self.ranges[index].allocated.remove(&offset);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn reserve_one(&mut self, address: IpAddr) -> Result<(usize, u128), AllocatorError> {
        let index = self
            .ranges
            .iter()
            .position(|r| r.net.contains(&address))
            .ok_or_else(|| AllocatorError::OutOfRange {
                network: self.network.clone(),
                address,
            })?;
        let range = &mut self.ranges[index];
        let offset = to_u128(address);
        if offset < range.first || offset > range.last {
            return Err(AllocatorError::OutOfRange {
                network: self.network.clone(),
                address,
            });
        }
        if range.excluded_end(offset).is_some() {
            return Err(AllocatorError::Excluded(address));
        }
        if !range.allocated.insert(offset) {
            return Err(AllocatorError::AlreadyAllocated(address));
        }
        Ok((index, offset))
    }

    fn release(&mut self, ips: &[IpNet]) {
        for ip in ips {
            let address = ip.addr();
            if let Some(range) = self.ranges.iter_mut().find(|r| r.net.contains(&address)) {
                range.allocated.remove(&to_u128(address));
            }
        }
    }
}

/// One CIDR range of a pool. Addresses are handled as integers.
#[derive(Debug)]
struct Range {
    net: IpNet,
    /// First usable address
    first: u128,
    /// Last usable address (inclusive)
    last: u128,
    cursor: u128,
    /// Sorted, disjoint, inclusive excluded blocks clipped to `[first, last]`
    excluded: Vec<(u128, u128)>,
    allocated: BTreeSet<u128>,
}

impl Range {
    fn new(net: IpNet) -> Self {
        let network = to_u128(net.network());
        let broadcast = to_u128(net.broadcast());
        let (first, last) = match net {
            IpNet::V4(v4) if v4.prefix_len() < 31 => (network + 1, broadcast - 1),
            IpNet::V6(v6) if v6.prefix_len() < 128 => (network + 1, broadcast),
            _ => (network, broadcast),
        };
        Self {
            net,
            first,
            last,
            cursor: first,
            excluded: Vec::new(),
            allocated: BTreeSet::new(),
        }
    }

    /// End of the excluded block containing `offset`, if any.
    fn excluded_end(&self, offset: u128) -> Option<u128> {
        block_end(&self.excluded, offset)
    }

    fn step(&self, offset: u128) -> u128 {
        if offset >= self.last { self.first } else { offset + 1 }
    }

    fn allocate_next(&mut self) -> Option<u128> {
        if self.first > self.last {
            return None;
        }
        let size = (self.last - self.first).saturating_add(1);
        let mut candidate = self.cursor.clamp(self.first, self.last);
        let mut scanned: u128 = 0;

        while scanned < size {
            if let Some(end) = self.excluded_end(candidate) {
                scanned = scanned.saturating_add(end - candidate + 1);
                candidate = self.step(end);
                continue;
            }
            if self.allocated.insert(candidate) {
                self.cursor = self.step(candidate);
                return Some(candidate);
            }
            scanned += 1;
            candidate = self.step(candidate);
        }
        None
    }

    fn addr(&self, offset: u128) -> IpAddr {
        match self.net {
            IpNet::V4(_) => IpAddr::V4(Ipv4Addr::from(u32::try_from(offset).unwrap_or(u32::MAX))),
            IpNet::V6(_) => IpAddr::V6(Ipv6Addr::from(offset)),
        }
    }

    fn ipnet(&self, offset: u128) -> Result<IpNet, AllocatorError> {
        IpNet::new(self.addr(offset), self.net.prefix_len()).map_err(|e| AllocatorError::InvalidRange {
            network: self.net.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Merged inclusive blocks of `excludes` that fall inside `net`, clipped to
/// the usable span `[first, last]`.
fn exclusion_blocks(net: IpNet, first: u128, last: u128, excludes: &[IpNet]) -> Vec<(u128, u128)> {
    let mut blocks: Vec<(u128, u128)> = excludes
        .iter()
        .filter(|e| net.contains(*e))
        .map(|e| (to_u128(e.network()).max(first), to_u128(e.broadcast()).min(last)))
        .filter(|(start, end)| start <= end)
        .collect();
    blocks.sort_unstable();

    let mut merged: Vec<(u128, u128)> = Vec::with_capacity(blocks.len());
    for (start, end) in blocks {
        match merged.last_mut() {
            Some(last) if start <= last.1.saturating_add(1) => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

fn block_end(blocks: &[(u128, u128)], offset: u128) -> Option<u128> {
    let index = blocks.partition_point(|(start, _)| *start <= offset);
    let (_, end) = *blocks.get(index.checked_sub(1)?)?;
    (offset <= end).then_some(end)
}

fn to_u128(address: IpAddr) -> u128 {
    match address {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn nets(list: &[&str]) -> Vec<IpNet> {
        list.iter().map(|s| net(s)).collect()
    }

    fn allocator_with(subnets: &[&str], excludes: &[&str]) -> SubnetAllocator {
        let allocator = SubnetAllocator::new();
        allocator
            .add_or_update_subnet("blue", &nets(subnets), &nets(excludes))
            .unwrap();
        allocator
    }

    #[test]
    fn test_slash_30_exhausts_after_two_addresses() {
        let allocator = allocator_with(&["10.0.0.0/30"], &[]);

        let first = allocator.allocate_next_ips("blue").unwrap();
        let second = allocator.allocate_next_ips("blue").unwrap();
        assert_eq!(first, nets(&["10.0.0.1/30"]));
        assert_eq!(second, nets(&["10.0.0.2/30"]));

        let third = allocator.allocate_next_ips("blue");
        assert!(matches!(third, Err(AllocatorError::PoolExhausted { .. })));
        assert!(third.unwrap_err().is_exhausted());

        allocator.release_ips("blue", &first).unwrap();
        assert_eq!(allocator.allocate_next_ips("blue").unwrap(), first);
        assert_eq!(allocator.allocated_count("blue").unwrap(), 2);
    }

    #[test]
    fn test_slash_31_and_slash_32_use_every_address() {
        let allocator = allocator_with(&["10.0.0.0/31"], &[]);
        assert_eq!(allocator.allocate_next_ips("blue").unwrap(), nets(&["10.0.0.0/31"]));
        assert_eq!(allocator.allocate_next_ips("blue").unwrap(), nets(&["10.0.0.1/31"]));
        assert!(allocator.allocate_next_ips("blue").is_err());

        let allocator = allocator_with(&["10.0.0.7/32"], &[]);
        assert_eq!(allocator.allocate_next_ips("blue").unwrap(), nets(&["10.0.0.7/32"]));
    }

    #[test]
    fn test_dual_stack_allocates_one_address_per_range() {
        let allocator = allocator_with(&["192.168.200.0/24", "fd10::/64"], &[]);
        let ips = allocator.allocate_next_ips("blue").unwrap();
        assert_eq!(ips, nets(&["192.168.200.1/24", "fd10::1/64"]));
        assert_eq!(allocator.allocated_count("blue").unwrap(), 2);
    }

    #[test]
    fn test_dual_stack_exhaustion_rolls_back_other_family() {
        let allocator = allocator_with(&["fd10::/64", "10.0.0.0/30"], &[]);
        allocator.allocate_next_ips("blue").unwrap();
        allocator.allocate_next_ips("blue").unwrap();

        assert!(allocator.allocate_next_ips("blue").is_err());
        assert_eq!(allocator.allocated_count("blue").unwrap(), 4);
    }

    #[test]
    fn test_exclusions_are_skipped() {
        let allocator = allocator_with(&["10.0.0.0/29"], &["10.0.0.0/30", "10.0.0.5/32"]);
        assert_eq!(allocator.allocate_next_ips("blue").unwrap(), nets(&["10.0.0.4/29"]));
        assert_eq!(allocator.allocate_next_ips("blue").unwrap(), nets(&["10.0.0.6/29"]));
        assert!(allocator.allocate_next_ips("blue").is_err());
    }

    #[test]
    fn test_reserve_outside_ranges_or_inside_exclusion_fails() {
        let allocator = allocator_with(&["10.0.0.0/24"], &["10.0.0.128/25"]);

        let outside = allocator.allocate_ips("blue", &nets(&["10.0.1.5/24"]));
        assert!(matches!(outside, Err(AllocatorError::OutOfRange { .. })));

        let broadcast = allocator.allocate_ips("blue", &nets(&["10.0.0.255/24"]));
        assert!(broadcast.is_err());

        let excluded = allocator.allocate_ips("blue", &nets(&["10.0.0.200/24"]));
        assert_eq!(excluded, Err(AllocatorError::Excluded("10.0.0.200".parse().unwrap())));

        assert_eq!(allocator.allocated_count("blue").unwrap(), 0);
    }

    #[test]
    fn test_reserve_twice_reports_already_allocated() {
        let allocator = allocator_with(&["10.0.0.0/24"], &[]);
        allocator.allocate_ips("blue", &nets(&["10.0.0.5/24"])).unwrap();

        let again = allocator.allocate_ips("blue", &nets(&["10.0.0.5/24"])).unwrap_err();
        assert!(again.is_already_allocated());
    }

    #[test]
    fn test_reserve_is_all_or_nothing() {
        let allocator = allocator_with(&["10.0.0.0/24"], &[]);
        allocator.allocate_ips("blue", &nets(&["10.0.0.6/24"])).unwrap();

        let result = allocator.allocate_ips("blue", &nets(&["10.0.0.5/24", "10.0.0.6/24"]));
        assert!(result.is_err());
        assert_eq!(allocator.allocated_count("blue").unwrap(), 1);
    }

    #[test]
    fn test_allocate_next_skips_reserved_addresses() {
        let allocator = allocator_with(&["10.0.0.0/24"], &[]);
        allocator.allocate_ips("blue", &nets(&["10.0.0.1/24", "10.0.0.2/24"])).unwrap();
        assert_eq!(allocator.allocate_next_ips("blue").unwrap(), nets(&["10.0.0.3/24"]));
    }

    #[test]
    fn test_release_of_unallocated_address_is_noop() {
        let allocator = allocator_with(&["10.0.0.0/24"], &[]);
        assert!(allocator.release_ips("blue", &nets(&["10.0.0.9/24", "172.16.0.1/16"])).is_ok());
        assert_eq!(allocator.allocated_count("blue").unwrap(), 0);
    }

    #[test]
    fn test_unknown_network() {
        let allocator = SubnetAllocator::new();
        assert_eq!(
            allocator.allocate_next_ips("red"),
            Err(AllocatorError::SubnetNotFound("red".to_string()))
        );
    }

    #[test]
    fn test_exclusion_outside_ranges_is_invalid() {
        let allocator = SubnetAllocator::new();
        let result = allocator.add_or_update_subnet("blue", &nets(&["10.0.0.0/24"]), &nets(&["10.0.1.0/28"]));
        assert!(matches!(result, Err(AllocatorError::InvalidRange { .. })));
        assert!(allocator.allocate_next_ips("blue").is_err());
    }

    #[test]
    fn test_update_is_idempotent_and_keeps_allocations() {
        let allocator = allocator_with(&["10.0.0.0/24"], &[]);
        allocator.allocate_ips("blue", &nets(&["10.0.0.5/24"])).unwrap();

        allocator.add_or_update_subnet("blue", &nets(&["10.0.0.0/24"]), &[]).unwrap();
        allocator
            .add_or_update_subnet("blue", &nets(&["10.0.0.0/24", "10.1.0.0/24"]), &[])
            .unwrap();

        assert_eq!(allocator.allocated_count("blue").unwrap(), 1);
        assert!(allocator.allocate_ips("blue", &nets(&["10.0.0.5/24"])).unwrap_err().is_already_allocated());
    }

    #[test]
    fn test_update_never_drops_allocated_addresses() {
        let allocator = allocator_with(&["10.0.0.0/24", "10.1.0.0/24"], &[]);
        allocator.allocate_ips("blue", &nets(&["10.1.0.5/24"])).unwrap();

        let shrink = allocator.add_or_update_subnet("blue", &nets(&["10.0.0.0/24"]), &[]);
        assert!(matches!(shrink, Err(AllocatorError::InvalidRange { .. })));

        let cover = allocator.add_or_update_subnet(
            "blue",
            &nets(&["10.0.0.0/24", "10.1.0.0/24"]),
            &nets(&["10.1.0.0/28"]),
        );
        assert!(matches!(cover, Err(AllocatorError::InvalidRange { .. })));
        assert_eq!(allocator.allocated_count("blue").unwrap(), 1);

        allocator.release_ips("blue", &nets(&["10.1.0.5/24"])).unwrap();
        allocator.add_or_update_subnet("blue", &nets(&["10.0.0.0/24"]), &[]).unwrap();
    }

    #[test]
    fn test_networks_are_independent() {
        let allocator = allocator_with(&["10.0.0.0/30"], &[]);
        allocator
            .add_or_update_subnet("red", &nets(&["10.0.0.0/30"]), &[])
            .unwrap();

        assert_eq!(allocator.allocate_next_ips("blue").unwrap(), nets(&["10.0.0.1/30"]));
        assert_eq!(allocator.allocate_next_ips("red").unwrap(), nets(&["10.0.0.1/30"]));
    }

    #[test]
    fn test_large_ipv6_exclusion_is_jumped_in_one_step() {
        let allocator = allocator_with(&["fd10::/64"], &["fd10::/65"]);
        assert_eq!(
            allocator.allocate_next_ips("blue").unwrap(),
            nets(&["fd10::8000:0:0:0/64"])
        );
    }

    #[test]
    fn test_named_allocator_shares_state() {
        let allocator = allocator_with(&["10.0.0.0/24"], &[]);
        let named = allocator.for_subnet("blue");
        assert_eq!(named.network(), "blue");

        let ips = named.allocate_next_ips().unwrap();
        assert_eq!(allocator.allocated_count("blue").unwrap(), 1);
        named.release_ips(&ips).unwrap();
        assert_eq!(named.allocated_count().unwrap(), 0);
    }
}
