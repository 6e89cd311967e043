//! Release bookkeeping.
//!
//! Remembers which (NAD, pod UID) pairs already had their resources returned
//! to the allocators while the pod object still exists, so that a completed
//! pod and its later deletion release the same resources only once.

use ipam::sync::lock;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Released pods per NAD.
#[derive(Debug, Default)]
pub struct ReleaseTracker {
    released: Mutex<HashMap<String, HashSet<String>>>,
}

impl ReleaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_released(&self, nad: &str, uid: &str) {
        let mut released = lock(&self.released);
        released
            .entry(nad.to_string())
            .or_default()
            .insert(uid.to_string());
    }

    /// Forgets a pod. Empty per-NAD sets are dropped.
    pub fn unmark(&self, nad: &str, uid: &str) {
        let mut released = lock(&self.released);
        if let Some(uids) = released.get_mut(nad) {
            uids.remove(uid);
            if uids.is_empty() {
                released.remove(nad);
            }
        }
    }

    pub fn is_released(&self, nad: &str, uid: &str) -> bool {
        let released = lock(&self.released);
        released.get(nad).is_some_and(|uids| uids.contains(uid))
    }

    /// Number of NADs with at least one released pod.
    #[cfg(test)]
    pub fn tracked_nads(&self) -> usize {
        lock(&self.released).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_unmark() {
        let tracker = ReleaseTracker::new();
        assert!(!tracker.is_released("ns1/blue", "uid-1"));

        tracker.mark_released("ns1/blue", "uid-1");
        assert!(tracker.is_released("ns1/blue", "uid-1"));
        assert!(!tracker.is_released("ns1/red", "uid-1"));
        assert!(!tracker.is_released("ns1/blue", "uid-2"));

        tracker.unmark("ns1/blue", "uid-1");
        assert!(!tracker.is_released("ns1/blue", "uid-1"));
    }

    #[test]
    fn test_mark_again_after_unmark() {
        let tracker = ReleaseTracker::new();
        tracker.mark_released("ns1/blue", "uid-1");
        tracker.unmark("ns1/blue", "uid-1");
        tracker.mark_released("ns1/blue", "uid-1");
        assert!(tracker.is_released("ns1/blue", "uid-1"));
    }

    #[test]
    fn test_poisoned_lock_is_recovered() {
        let tracker = std::sync::Arc::new(ReleaseTracker::new());
        let holder = std::sync::Arc::clone(&tracker);
        let result = std::thread::spawn(move || {
            let _guard = lock(&holder.released);
            panic!("panicked while holding the lock");
        })
        .join();
        assert!(result.is_err());
        assert!(tracker.released.is_poisoned());

        tracker.mark_released("ns1/blue", "uid-1");
        assert!(tracker.is_released("ns1/blue", "uid-1"));
    }

    #[test]
    fn test_empty_sets_are_pruned() {
        let tracker = ReleaseTracker::new();
        tracker.mark_released("ns1/blue", "uid-1");
        tracker.mark_released("ns1/blue", "uid-2");
        tracker.mark_released("ns1/red", "uid-1");
        assert_eq!(tracker.tracked_nads(), 2);

        tracker.unmark("ns1/blue", "uid-1");
        assert_eq!(tracker.tracked_nads(), 2);
        tracker.unmark("ns1/blue", "uid-2");
        tracker.unmark("ns1/red", "uid-1");
        assert_eq!(tracker.tracked_nads(), 0);

        // unknown entries are ignored
        tracker.unmark("ns1/green", "uid-9");
        assert_eq!(tracker.tracked_nads(), 0);
    }
}
