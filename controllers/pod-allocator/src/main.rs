//! Pod Allocator Controller
//!
//! Allocates IP addresses, MAC addresses and tunnel IDs to pods attached to
//! secondary networks, and keeps IPAMClaim objects in step with the addresses
//! they pin.
//!
//! On startup every configured network is initialized, existing claims and
//! pods are replayed into the allocators, and then pod and IPAMClaim events
//! are reconciled as they arrive.

mod annotation;
mod backoff;
mod config;
mod controller;
mod error;
mod metrics;
mod network;
mod persistent_ips;
mod pod_allocator;
mod release_tracker;
mod server;
mod watcher;

#[cfg(test)]
mod test_utils;

use anyhow::{Context, Result};
use config::ControllerConfig;
use controller::Controller;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("rustls crypto provider was already installed");
    }

    info!("Starting Pod Allocator Controller");

    // Load configuration from environment variables
    let config = ControllerConfig::from_env()?;
    let networks = config::load_network_config(&config.network_config_path)
        .with_context(|| format!("loading {}", config.network_config_path.display()))?;

    info!("Configuration:");
    info!("  Network config: {}", config.network_config_path.display());
    info!("  Networks: {}", networks.len());
    info!("  Namespace: {}", config.namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Reallocate IPs: {}", config.reallocate_ips);
    info!("  Probe address: {}", config.probe_addr);

    // Initialize and run controller
    let controller = Controller::new(config, networks).await?;
    controller.run().await?;

    Ok(())
}
