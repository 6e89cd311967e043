//! Tunnel ID allocator.
//!
//! Hands out integers from `[0, max_id]` to owners identified by name. An
//! owner holds at most one ID at a time.

use crate::error::AllocatorError;
use crate::sync::lock;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Largest tunnel key usable by a logical switch port.
pub const MAX_LOGICAL_PORT_TUNNEL_KEY: u32 = 32767;

/// Allocator of integer IDs keyed by owner name.
///
/// Cloning is cheap and yields a handle to the same namespace.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    name: String,
    max_id: u32,
    state: Arc<Mutex<IdState>>,
}

#[derive(Debug, Default)]
struct IdState {
    by_owner: HashMap<String, u32>,
    owners: BTreeMap<u32, String>,
    cursor: u32,
}

impl IdAllocator {
    /// Creates an empty namespace of IDs `[0, max_id]`.
    #[must_use]
    pub fn new(name: &str, max_id: u32) -> Self {
        Self {
            name: name.to_string(),
            max_id,
            state: Arc::new(Mutex::new(IdState::default())),
        }
    }

    /// Returns a handle bound to one owner.
    #[must_use]
    pub fn for_name(&self, owner: &str) -> NamedIdAllocator {
        NamedIdAllocator {
            owner: owner.to_string(),
            allocator: self.clone(),
        }
    }

    /// Allocates an ID for `owner`, or returns the one it already holds.
    pub fn allocate_id(&self, owner: &str) -> Result<u32, AllocatorError> {
        let mut state = lock(&self.state);
        if let Some(id) = state.by_owner.get(owner) {
            return Ok(*id);
        }

        let span = u64::from(self.max_id) + 1;
        let mut candidate = state.cursor.min(self.max_id);
        for _ in 0..span {
            if !state.owners.contains_key(&candidate) {
                state.owners.insert(candidate, owner.to_string());
                state.by_owner.insert(owner.to_string(), candidate);
                state.cursor = if candidate >= self.max_id { 0 } else { candidate + 1 };
                debug!("Allocated id {} to {} in {}", candidate, owner, self.name);
                return Ok(candidate);
            }
            candidate = if candidate >= self.max_id { 0 } else { candidate + 1 };
        }
        Err(AllocatorError::IdsExhausted(self.name.clone()))
    }

    /// Reserves a specific ID for `owner`.
    ///
    /// Succeeds when `owner` already holds `id`.
    pub fn reserve_id(&self, owner: &str, id: u32) -> Result<(), AllocatorError> {
        if id > self.max_id {
            return Err(AllocatorError::IdOutOfRange { id, max: self.max_id });
        }

        let mut state = lock(&self.state);
        match state.by_owner.get(owner) {
            Some(held) if *held == id => return Ok(()),
            Some(_) => {
                return Err(AllocatorError::IdAlreadyReserved {
                    id,
                    owner: owner.to_string(),
                });
            }
            None => {}
        }
        if let Some(holder) = state.owners.get(&id) {
            return Err(AllocatorError::IdAlreadyReserved {
                id,
                owner: holder.clone(),
            });
        }

        state.owners.insert(id, owner.to_string());
        state.by_owner.insert(owner.to_string(), id);
        Ok(())
    }

    /// Releases the ID held by `owner`. Unknown owners are ignored.
    pub fn release_id(&self, owner: &str) {
        let mut state = lock(&self.state);
        if let Some(id) = state.by_owner.remove(owner) {
            state.owners.remove(&id);
            debug!("Released id {} of {} in {}", id, owner, self.name);
        }
    }

    /// ID currently held by `owner`.
    #[must_use]
    pub fn get_id(&self, owner: &str) -> Option<u32> {
        lock(&self.state).by_owner.get(owner).copied()
    }

    /// Number of reserved IDs, including sentinel reservations.
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        lock(&self.state).owners.len()
    }
}

/// An [`IdAllocator`] bound to a single owner.
#[derive(Debug, Clone)]
pub struct NamedIdAllocator {
    owner: String,
    allocator: IdAllocator,
}

impl NamedIdAllocator {
    /// Owner this handle operates on.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// See [`IdAllocator::allocate_id`].
    pub fn allocate_id(&self) -> Result<u32, AllocatorError> {
        self.allocator.allocate_id(&self.owner)
    }

    /// See [`IdAllocator::reserve_id`].
    pub fn reserve_id(&self, id: u32) -> Result<(), AllocatorError> {
        self.allocator.reserve_id(&self.owner, id)
    }

    /// See [`IdAllocator::release_id`].
    pub fn release_id(&self) {
        self.allocator.release_id(&self.owner);
    }

    /// See [`IdAllocator::get_id`].
    #[must_use]
    pub fn get_id(&self) -> Option<u32> {
        self.allocator.get_id(&self.owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator_with_zero_reserved(max_id: u32) -> IdAllocator {
        let allocator = IdAllocator::new("blue", max_id);
        allocator.reserve_id("zero", 0).unwrap();
        allocator
    }

    #[test]
    fn test_zero_is_never_handed_out() {
        let allocator = allocator_with_zero_reserved(3);
        assert_eq!(allocator.allocate_id("a").unwrap(), 1);
        assert_eq!(allocator.allocate_id("b").unwrap(), 2);
        assert_eq!(allocator.allocate_id("c").unwrap(), 3);
        assert_eq!(
            allocator.allocate_id("d"),
            Err(AllocatorError::IdsExhausted("blue".to_string()))
        );
    }

    #[test]
    fn test_allocate_is_idempotent_per_owner() {
        let allocator = allocator_with_zero_reserved(10);
        let first = allocator.allocate_id("a").unwrap();
        assert_eq!(allocator.allocate_id("a").unwrap(), first);
        assert_eq!(allocator.allocated_count(), 2);
    }

    #[test]
    fn test_release_returns_id_to_the_namespace() {
        let allocator = allocator_with_zero_reserved(2);
        let a = allocator.allocate_id("a").unwrap();
        allocator.allocate_id("b").unwrap();
        allocator.release_id("a");

        assert_eq!(allocator.allocate_id("c").unwrap(), a);
        assert_eq!(allocator.get_id("a"), None);
    }

    #[test]
    fn test_release_unknown_owner_is_noop() {
        let allocator = allocator_with_zero_reserved(2);
        allocator.release_id("ghost");
        assert_eq!(allocator.allocated_count(), 1);
    }

    #[test]
    fn test_reserve_conflicts() {
        let allocator = allocator_with_zero_reserved(10);
        allocator.reserve_id("a", 5).unwrap();
        allocator.reserve_id("a", 5).unwrap();

        assert!(matches!(
            allocator.reserve_id("b", 5),
            Err(AllocatorError::IdAlreadyReserved { id: 5, .. })
        ));
        assert!(matches!(
            allocator.reserve_id("a", 6),
            Err(AllocatorError::IdAlreadyReserved { id: 6, .. })
        ));
        assert_eq!(
            allocator.reserve_id("c", 11),
            Err(AllocatorError::IdOutOfRange { id: 11, max: 10 })
        );
    }

    #[test]
    fn test_allocate_skips_reserved_ids() {
        let allocator = allocator_with_zero_reserved(10);
        allocator.reserve_id("x", 1).unwrap();
        allocator.reserve_id("y", 2).unwrap();
        assert_eq!(allocator.allocate_id("a").unwrap(), 3);
    }

    #[test]
    fn test_named_allocator() {
        let allocator = allocator_with_zero_reserved(10);
        let named = allocator.for_name("blue/uid-1");
        assert_eq!(named.owner(), "blue/uid-1");

        let id = named.allocate_id().unwrap();
        assert_eq!(named.get_id(), Some(id));
        named.reserve_id(id).unwrap();
        named.release_id();
        assert_eq!(allocator.get_id("blue/uid-1"), None);
    }
}
