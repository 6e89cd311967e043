//! Prometheus metrics of the allocator.

use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

/// Allocation counters, labelled by network.
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    pub ips_allocated: IntCounterVec,
    pub ips_released: IntCounterVec,
    pub ips_in_use: IntGaugeVec,
    pub tunnel_ids_allocated: IntCounterVec,
    pub tunnel_ids_released: IntCounterVec,
    pub reconcile_failures: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounterVec, prometheus::Error> {
            let counter = IntCounterVec::new(Opts::new(name, help), &["network"])?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };
        let ips_allocated = counter("pod_allocator_ips_allocated_total", "IP addresses taken from the pool")?;
        let ips_released = counter("pod_allocator_ips_released_total", "IP addresses returned to the pool")?;
        let tunnel_ids_allocated = counter("pod_allocator_tunnel_ids_allocated_total", "Tunnel IDs handed out")?;
        let tunnel_ids_released = counter("pod_allocator_tunnel_ids_released_total", "Tunnel IDs returned")?;
        let reconcile_failures = counter("pod_allocator_reconcile_failures_total", "Failed pod reconciles")?;

        let ips_in_use = IntGaugeVec::new(
            Opts::new("pod_allocator_ips_in_use", "IP addresses currently allocated"),
            &["network"],
        )?;
        registry.register(Box::new(ips_in_use.clone()))?;

        Ok(Self {
            registry,
            ips_allocated,
            ips_released,
            ips_in_use,
            tunnel_ids_allocated,
            tunnel_ids_released,
            reconcile_failures,
        })
    }

    /// Renders all metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_labelled_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.ips_allocated.with_label_values(&["blue"]).inc_by(2);
        metrics.ips_in_use.with_label_values(&["blue"]).set(2);

        let text = metrics.encode().unwrap();
        assert!(text.contains("pod_allocator_ips_allocated_total{network=\"blue\"} 2"));
        assert!(text.contains("pod_allocator_ips_in_use{network=\"blue\"} 2"));
    }

    #[test]
    fn test_registries_are_independent() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();
        first.reconcile_failures.with_label_values(&["blue"]).inc();

        assert!(!second.encode().unwrap().contains("network=\"blue\""));
    }
}
