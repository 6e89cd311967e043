//! Kubernetes resource watchers.
//!
//! Turns pod and IPAMClaim watch events into calls on the per-network
//! allocators. Pods are remembered by UID so that every event can be handed
//! over as an old/new pair, and so that pods which vanished while the watch
//! was down are released once the relist completes.
//!
//! A failed reconcile is queued per network and pod and retried with
//! Fibonacci backoff until it succeeds or a newer event supersedes it. An
//! IPAMClaim showing up retries the pods waiting on it right away.

use crate::backoff::FibonacciBackoff;
use crate::error::ControllerError;
use crate::network::{pod_key, pod_namespace, pod_references_claim, pod_uid};
use crate::pod_allocator::PodAllocator;
use crds::IPAMClaim;
use futures::StreamExt;
use ipam::sync::lock;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube_runtime::{watcher, WatchStreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const RETRY_BACKOFF_MIN: Duration = Duration::from_millis(500);
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(60);
const RETRY_TICK: Duration = Duration::from_secs(1);

/// Allocator index and pod UID
type RetryKey = (usize, String);

/// A reconcile waiting to be retried.
struct PendingReconcile {
    old: Option<Pod>,
    new: Option<Pod>,
    backoff: FibonacciBackoff,
    due: Instant,
}

/// Watches pods and IPAMClaims and feeds the allocators.
pub struct Watcher {
    allocators: Arc<Vec<PodAllocator>>,
    /// Last seen version of every live pod, by UID
    pods: Mutex<HashMap<String, Pod>>,
    /// UIDs listed since the last `Init`, while a relist is in progress
    relisted: Mutex<Option<HashSet<String>>>,
    pending: Mutex<HashMap<RetryKey, PendingReconcile>>,
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(allocators: Arc<Vec<PodAllocator>>) -> Self {
        Self {
            allocators,
            pods: Mutex::new(HashMap::new()),
            relisted: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Starts watching pods.
    pub async fn watch_pods(&self, api: Api<Pod>) -> Result<(), ControllerError> {
        info!("Starting Pod watcher");

        let mut stream = Box::pin(watcher(api, watcher::Config::default()).default_backoff());
        while let Some(result) = stream.next().await {
            match result {
                Ok(event) => self.handle_pod_event(event).await,
                Err(e) => warn!("Pod watch error: {}", e),
            }
        }

        Err(ControllerError::Watch("Pod watch stream ended".to_string()))
    }

    /// Starts watching IPAMClaim resources.
    pub async fn watch_ipam_claims(&self, api: Api<IPAMClaim>) -> Result<(), ControllerError> {
        info!("Starting IPAMClaim watcher");

        let mut stream = Box::pin(watcher(api, watcher::Config::default()).default_backoff());
        while let Some(result) = stream.next().await {
            match result {
                Ok(event) => self.handle_claim_event(&event).await,
                Err(e) => warn!("IPAMClaim watch error: {}", e),
            }
        }

        Err(ControllerError::Watch("IPAMClaim watch stream ended".to_string()))
    }

    /// Retries failed reconciles as they come due.
    pub async fn run_retries(&self) {
        let mut interval = tokio::time::interval(RETRY_TICK);
        loop {
            interval.tick().await;
            self.retry_due(Instant::now()).await;
        }
    }

    pub async fn handle_pod_event(&self, event: watcher::Event<Pod>) {
        match event {
            watcher::Event::Apply(pod) => {
                let old = self.remember(&pod);
                self.reconcile(old.as_ref(), Some(&pod)).await;
            }
            watcher::Event::InitApply(pod) => {
                if let Some(seen) = lock(&self.relisted).as_mut() {
                    seen.insert(pod_uid(&pod).to_string());
                }
                let old = self.remember(&pod);
                self.reconcile(old.as_ref(), Some(&pod)).await;
            }
            watcher::Event::Delete(pod) => {
                info!("Pod deleted: {}", pod_key(&pod));
                self.forget(&pod);
                self.reconcile(Some(&pod), None).await;
            }
            watcher::Event::Init => {
                debug!("Pod watcher (re)listing");
                *lock(&self.relisted) = Some(HashSet::new());
            }
            watcher::Event::InitDone => {
                let gone = self.take_unlisted();
                for pod in &gone {
                    info!("Pod {} disappeared while the watch was down", pod_key(pod));
                    self.reconcile(Some(pod), None).await;
                }
                info!("Pod watcher initialization complete ({} pods gone)", gone.len());
            }
        }
    }

    pub async fn handle_claim_event(&self, event: &watcher::Event<IPAMClaim>) {
        match event {
            watcher::Event::Delete(claim) => {
                let name = claim.metadata.name.as_deref().unwrap_or("<unknown>");
                info!("IPAMClaim deleted: {}", name);
                for allocator in self.allocators.iter() {
                    if let Err(e) = allocator.delete_claim(claim) {
                        error!(
                            "Failed to release IPs of IPAMClaim {} on network {}: {}",
                            name,
                            allocator.net_info().name(),
                            e
                        );
                    }
                }
            }
            watcher::Event::Apply(claim) | watcher::Event::InitApply(claim) => {
                debug!("IPAMClaim applied: {}", claim.metadata.name.as_deref().unwrap_or("<unknown>"));
                let now = Instant::now();
                if self.wake_claim_waiters(claim, now) > 0 {
                    self.retry_due(now).await;
                }
            }
            watcher::Event::Init | watcher::Event::InitDone => {}
        }
    }

    /// Reruns every queued reconcile due at `now`.
    ///
    /// Allocation retries use the latest known version of the pod and are
    /// dropped once the pod is gone.
    pub async fn retry_due(&self, now: Instant) {
        let due: Vec<(RetryKey, PendingReconcile)> = {
            let mut pending = lock(&self.pending);
            let keys: Vec<RetryKey> = pending
                .iter()
                .filter(|(_, retry)| retry.due <= now)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| pending.remove(&key).map(|retry| (key, retry)))
                .collect()
        };

        for ((index, uid), mut retry) in due {
            let Some(allocator) = self.allocators.get(index) else {
                continue;
            };
            if retry.new.is_some() {
                match lock(&self.pods).get(&uid) {
                    Some(latest) => retry.new = Some(latest.clone()),
                    None => {
                        debug!("Dropping retry of pod {} which is gone", uid);
                        continue;
                    }
                }
            }

            let Some(pod) = retry.new.as_ref().or(retry.old.as_ref()) else {
                continue;
            };
            let key = pod_key(pod);
            match allocator.reconcile(retry.old.as_ref(), retry.new.as_ref()).await {
                Ok(()) => info!("Reconciled pod {} on network {} on retry", key, allocator.net_info().name()),
                Err(e) => {
                    let delay = retry.backoff.next_backoff();
                    retry.due = Instant::now() + delay;
                    warn!(
                        "Retry of pod {} on network {} failed: {}; next attempt in {:?}",
                        key,
                        allocator.net_info().name(),
                        e,
                        delay
                    );
                    // a newer event may have queued its own attempt meanwhile
                    lock(&self.pending).entry((index, uid)).or_insert(retry);
                }
            }
        }
    }

    /// Number of reconciles waiting for a retry.
    #[cfg(test)]
    pub fn pending_retries(&self) -> usize {
        lock(&self.pending).len()
    }

    fn remember(&self, pod: &Pod) -> Option<Pod> {
        lock(&self.pods).insert(pod_uid(pod).to_string(), pod.clone())
    }

    fn forget(&self, pod: &Pod) -> Option<Pod> {
        lock(&self.pods).remove(pod_uid(pod))
    }

    /// Ends a relist and removes the cached pods it did not list.
    fn take_unlisted(&self) -> Vec<Pod> {
        let Some(seen) = lock(&self.relisted).take() else {
            return Vec::new();
        };
        let mut pods = lock(&self.pods);
        let gone: Vec<String> = pods.keys().filter(|uid| !seen.contains(*uid)).cloned().collect();
        gone.iter().filter_map(|uid| pods.remove(uid)).collect()
    }

    /// Makes queued pods referencing `claim` due at `now`.
    fn wake_claim_waiters(&self, claim: &IPAMClaim, now: Instant) -> usize {
        let namespace = claim.metadata.namespace.as_deref().unwrap_or_default();
        let name = claim.metadata.name.as_deref().unwrap_or_default();

        let mut woken = 0;
        for retry in lock(&self.pending).values_mut() {
            let Some(pod) = &retry.new else {
                continue;
            };
            if pod_namespace(pod) == namespace && pod_references_claim(pod, name) {
                retry.due = now;
                woken += 1;
            }
        }
        woken
    }

    async fn reconcile(&self, old: Option<&Pod>, new: Option<&Pod>) {
        let Some(pod) = new.or(old) else {
            return;
        };
        for (index, allocator) in self.allocators.iter().enumerate() {
            let key = (index, pod_uid(pod).to_string());
            match allocator.reconcile(old, new).await {
                Ok(()) => {
                    lock(&self.pending).remove(&key);
                }
                Err(e) => {
                    let mut pending = lock(&self.pending);
                    let retry = pending.entry(key).or_insert_with(|| PendingReconcile {
                        old: None,
                        new: None,
                        backoff: FibonacciBackoff::new(RETRY_BACKOFF_MIN, RETRY_BACKOFF_MAX),
                        due: Instant::now(),
                    });
                    retry.old = old.cloned();
                    retry.new = new.cloned();
                    let delay = retry.backoff.next_backoff();
                    retry.due = Instant::now() + delay;
                    warn!(
                        "Failed to reconcile pod {} on network {}: {}; retrying in {:?}",
                        pod_key(pod),
                        allocator.net_info().name(),
                        e,
                        delay
                    );
                }
            }
        }
    }
}
