//! Persistent IPs bridge.
//!
//! Keeps `IPAMClaim` objects and the IP allocator in step: the first
//! addresses allocated for a claim are written into its status and never
//! overwritten, and the status addresses stay reserved until the claim is
//! deleted.

use crate::annotation::parse_ip_nets;
use crate::error::ControllerError;
use cluster_client::ClusterClientTrait;
use crds::IPAMClaim;
use ipam::NamedSubnetAllocator;
use std::sync::Arc;
use tracing::{debug, info};

/// Reconciles IPAMClaims of one network with its IP allocator.
pub struct PersistentIpsAllocator {
    client: Arc<dyn ClusterClientTrait>,
    ip_allocator: NamedSubnetAllocator,
}

fn claim_key(claim: &IPAMClaim) -> String {
    format!(
        "{}/{}",
        claim.metadata.namespace.as_deref().unwrap_or_default(),
        claim.metadata.name.as_deref().unwrap_or_default()
    )
}

impl PersistentIpsAllocator {
    pub fn new(client: Arc<dyn ClusterClientTrait>, ip_allocator: NamedSubnetAllocator) -> Self {
        Self { client, ip_allocator }
    }

    /// Records `ips` in the claim status unless it already holds addresses.
    pub async fn reconcile(&self, claim: &IPAMClaim, ips: &[String]) -> Result<(), ControllerError> {
        if !claim.status_ips().is_empty() {
            debug!("IPAMClaim {} already holds {:?}", claim_key(claim), claim.status_ips());
            return Ok(());
        }

        self.client.update_ipam_claim_ips(claim, ips).await.map_err(|e| {
            ControllerError::AllocationFailed(format!(
                "failed to update IPAMClaim {} with IPs {}: {e}",
                claim_key(claim),
                ips.join(",")
            ))
        })?;
        info!("IPAMClaim {} now holds {:?}", claim_key(claim), ips);
        Ok(())
    }

    /// Returns the claim's addresses to the pool.
    pub fn delete(&self, claim: &IPAMClaim) -> Result<(), ControllerError> {
        let ips = parse_ip_nets(claim.status_ips())?;
        self.ip_allocator.release_ips(&ips)?;
        debug!("Released persistent IPs {:?} of IPAMClaim {}", ips, claim_key(claim));
        Ok(())
    }

    /// Reserves the addresses of every claim.
    ///
    /// All claims are parsed before anything is reserved. Addresses that are
    /// already allocated are skipped.
    pub fn sync(&self, claims: &[&IPAMClaim]) -> Result<(), ControllerError> {
        let mut ips = Vec::new();
        for claim in claims {
            ips.extend(parse_ip_nets(claim.status_ips())?);
        }

        for ip in &ips {
            match self.ip_allocator.allocate_ips(std::slice::from_ref(ip)) {
                Ok(()) => {}
                Err(e) if e.is_already_allocated() => {
                    debug!("Persistent IP {} already reserved on {}", ip, self.ip_allocator.network());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use cluster_client::MockClusterClient;
    use ipam::{AllocatorError, SubnetAllocator};

    fn setup(client: &MockClusterClient) -> (PersistentIpsAllocator, NamedSubnetAllocator) {
        let allocator = SubnetAllocator::new();
        allocator
            .add_or_update_subnet("blue", &["192.168.1.0/24".parse().unwrap()], &[])
            .unwrap();
        let named = allocator.for_subnet("blue");
        (PersistentIpsAllocator::new(Arc::new(client.clone()), named.clone()), named)
    }

    #[tokio::test]
    async fn test_reconcile_writes_empty_status() {
        let client = MockClusterClient::new();
        let claim = client.add_ipam_claim(create_test_claim("vm-a.net1", "ns1", "blue", &[]));
        let (persistent_ips, _) = setup(&client);

        persistent_ips
            .reconcile(&claim, &["192.168.1.5/24".to_string()])
            .await
            .unwrap();

        let stored = client.ipam_claim("ns1", "vm-a.net1").unwrap();
        assert_eq!(stored.status_ips(), ["192.168.1.5/24".to_string()]);
        assert_eq!(client.claim_update_count(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_never_overwrites_status() {
        let client = MockClusterClient::new();
        let claim = client.add_ipam_claim(create_test_claim("vm-a.net1", "ns1", "blue", &["192.168.1.5/24"]));
        let (persistent_ips, _) = setup(&client);

        persistent_ips
            .reconcile(&claim, &["192.168.1.9/24".to_string()])
            .await
            .unwrap();

        let stored = client.ipam_claim("ns1", "vm-a.net1").unwrap();
        assert_eq!(stored.status_ips(), ["192.168.1.5/24".to_string()]);
        assert_eq!(client.claim_update_count(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_from_stale_claim_keeps_recorded_ips() {
        let client = MockClusterClient::new();
        let stale = client.add_ipam_claim(create_test_claim("vm-a.net1", "ns1", "blue", &[]));
        let (persistent_ips, _) = setup(&client);

        persistent_ips
            .reconcile(&stale, &["192.168.1.5/24".to_string()])
            .await
            .unwrap();
        // a second writer still holding the empty-status copy
        let result = persistent_ips.reconcile(&stale, &["192.168.1.9/24".to_string()]).await;
        assert!(matches!(result, Err(ControllerError::AllocationFailed(_))));

        let stored = client.ipam_claim("ns1", "vm-a.net1").unwrap();
        assert_eq!(stored.status_ips(), ["192.168.1.5/24".to_string()]);
        assert_eq!(client.claim_update_count(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_propagates_write_failure() {
        let client = MockClusterClient::new();
        let claim = client.add_ipam_claim(create_test_claim("vm-a.net1", "ns1", "blue", &[]));
        client.fail_claim_updates(1);
        let (persistent_ips, _) = setup(&client);

        let result = persistent_ips.reconcile(&claim, &["192.168.1.5/24".to_string()]).await;
        assert!(matches!(result, Err(ControllerError::AllocationFailed(_))));
    }

    #[test]
    fn test_delete_releases_claim_ips() {
        let client = MockClusterClient::new();
        let (persistent_ips, named) = setup(&client);
        let claim = create_test_claim("vm-a.net1", "ns1", "blue", &["192.168.1.5/24"]);

        persistent_ips.sync(&[&claim]).unwrap();
        assert_eq!(named.allocated_count().unwrap(), 1);

        persistent_ips.delete(&claim).unwrap();
        assert_eq!(named.allocated_count().unwrap(), 0);

        // a second delete is harmless
        persistent_ips.delete(&claim).unwrap();
    }

    #[test]
    fn test_sync_tolerates_overlapping_claims() {
        let client = MockClusterClient::new();
        let (persistent_ips, named) = setup(&client);
        let first = create_test_claim("vm-a.net1", "ns1", "blue", &["192.168.1.5/24", "192.168.1.6/24"]);
        let second = create_test_claim("vm-b.net1", "ns1", "blue", &["192.168.1.6/24"]);

        persistent_ips.sync(&[&first, &second]).unwrap();
        assert_eq!(named.allocated_count().unwrap(), 2);

        // replaying the same claims again is also fine
        persistent_ips.sync(&[&first, &second]).unwrap();
        assert_eq!(named.allocated_count().unwrap(), 2);
    }

    #[test]
    fn test_sync_fails_on_address_outside_the_pool() {
        let client = MockClusterClient::new();
        let (persistent_ips, _) = setup(&client);
        let claim = create_test_claim("vm-a.net1", "ns1", "blue", &["10.0.0.5/24"]);

        let result = persistent_ips.sync(&[&claim]);
        assert!(matches!(
            result,
            Err(ControllerError::Allocator(AllocatorError::OutOfRange { .. }))
        ));
    }

    #[test]
    fn test_sync_parses_everything_first() {
        let client = MockClusterClient::new();
        let (persistent_ips, named) = setup(&client);
        let good = create_test_claim("vm-a.net1", "ns1", "blue", &["192.168.1.5/24"]);
        let bad = create_test_claim("vm-b.net1", "ns1", "blue", &["not-an-ip"]);

        assert!(persistent_ips.sync(&[&good, &bad]).is_err());
        assert_eq!(named.allocated_count().unwrap(), 0);
    }
}
