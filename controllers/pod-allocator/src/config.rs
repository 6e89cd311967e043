//! Controller configuration.
//!
//! Process settings come from environment variables; the networks the
//! controller allocates for are described in a YAML file:
//!
//! ```yaml
//! networks:
//!   - name: tenant-blue
//!     topology: layer2
//!     interconnect: true
//!     nads: ["ns1/blue"]
//!     subnets:
//!       - cidr: 10.128.0.0/24
//!         gateway: 10.128.0.1
//!     excludeSubnets: ["10.128.0.0/29"]
//!     routes:
//!       - dest: 10.96.0.0/16
//! ```

use crate::error::ControllerError;
use ipnet::IpNet;
use serde::Deserialize;
use std::collections::{BTreeSet, HashSet};
use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

const DEFAULT_NETWORK_CONFIG: &str = "/etc/pod-allocator/networks.yaml";
const DEFAULT_PROBE_ADDR: &str = "0.0.0.0:8080";

/// Settings read from the environment at startup.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Path of the network configuration YAML (`NETWORK_CONFIG`)
    pub network_config_path: PathBuf,
    /// Namespace to watch, all namespaces when unset (`WATCH_NAMESPACE`)
    pub namespace: Option<String>,
    /// Pick fresh addresses when annotated ones cannot be reused (`REALLOCATE_IPS`)
    pub reallocate_ips: bool,
    /// Listen address of the probe/metrics server (`PROBE_ADDR`)
    pub probe_addr: SocketAddr,
}

impl ControllerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ControllerError> {
        let network_config_path = env::var("NETWORK_CONFIG")
            .unwrap_or_else(|_| DEFAULT_NETWORK_CONFIG.to_string())
            .into();
        let namespace = env::var("WATCH_NAMESPACE").ok().filter(|ns| !ns.is_empty());
        let reallocate_ips = match env::var("REALLOCATE_IPS") {
            Ok(value) => parse_bool(&value).ok_or_else(|| {
                ControllerError::InvalidConfig(format!("REALLOCATE_IPS must be a boolean, got {value:?}"))
            })?,
            Err(_) => false,
        };
        let probe_addr = env::var("PROBE_ADDR")
            .unwrap_or_else(|_| DEFAULT_PROBE_ADDR.to_string());
        let probe_addr = probe_addr.parse().map_err(|e| {
            ControllerError::InvalidConfig(format!("PROBE_ADDR {probe_addr:?} is not a socket address: {e}"))
        })?;

        Ok(Self {
            network_config_path,
            namespace,
            reallocate_ips,
            probe_addr,
        })
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" | "" => Some(false),
        _ => None,
    }
}

/// Logical topology of a network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    Layer2,
    Layer3,
    Localnet,
}

/// Network configuration file
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfigFile {
    #[serde(default)]
    pub networks: Vec<NetworkSpec>,
}

/// One network as written in the configuration file
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    pub name: String,
    pub topology: Topology,
    #[serde(default)]
    pub interconnect: bool,
    /// NAD keys (`namespace/name`) attaching pods to this network
    #[serde(default)]
    pub nads: Vec<String>,
    #[serde(default)]
    pub subnets: Vec<SubnetSpec>,
    #[serde(default)]
    pub exclude_subnets: Vec<String>,
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubnetSpec {
    pub cidr: String,
    #[serde(default)]
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    pub dest: String,
    #[serde(default)]
    pub next_hop: Option<String>,
}

/// A subnet of a network with its optional gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    pub cidr: IpNet,
    pub gateway: Option<IpAddr>,
}

/// A route handed to pods of a network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub dest: IpNet,
    pub next_hop: Option<IpAddr>,
}

/// Validated description of one network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInfo {
    name: String,
    topology: Topology,
    interconnect: bool,
    nads: BTreeSet<String>,
    subnets: Vec<Subnet>,
    exclude_subnets: Vec<IpNet>,
    routes: Vec<Route>,
}

impl NetInfo {
    /// Validates a network as written in the configuration file.
    pub fn from_spec(spec: &NetworkSpec) -> Result<Self, ControllerError> {
        if spec.name.is_empty() {
            return Err(ControllerError::InvalidConfig("network without a name".to_string()));
        }
        let invalid = |what: &str, value: &str, reason: String| {
            ControllerError::InvalidConfig(format!("network {}: invalid {what} {value:?}: {reason}", spec.name))
        };

        let mut subnets = Vec::with_capacity(spec.subnets.len());
        for subnet in &spec.subnets {
            let cidr = subnet
                .cidr
                .parse::<IpNet>()
                .map_err(|e| invalid("subnet", &subnet.cidr, e.to_string()))?
                .trunc();
            let gateway = match &subnet.gateway {
                Some(gateway) => {
                    let address = gateway
                        .parse::<IpAddr>()
                        .map_err(|e| invalid("gateway", gateway, e.to_string()))?;
                    if !cidr.contains(&address) {
                        return Err(invalid("gateway", gateway, format!("not inside {cidr}")));
                    }
                    Some(address)
                }
                None => None,
            };
            subnets.push(Subnet { cidr, gateway });
        }

        let exclude_subnets = spec
            .exclude_subnets
            .iter()
            .map(|exclude| {
                exclude
                    .parse::<IpNet>()
                    .map(|net| net.trunc())
                    .map_err(|e| invalid("excluded subnet", exclude, e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let routes = spec
            .routes
            .iter()
            .map(|route| {
                let dest = route
                    .dest
                    .parse::<IpNet>()
                    .map_err(|e| invalid("route destination", &route.dest, e.to_string()))?
                    .trunc();
                let next_hop = route
                    .next_hop
                    .as_deref()
                    .map(|hop| hop.parse::<IpAddr>().map_err(|e| invalid("next hop", hop, e.to_string())))
                    .transpose()?;
                if let Some(hop) = next_hop {
                    if hop.is_ipv4() != dest.addr().is_ipv4() {
                        return Err(invalid("next hop", &hop.to_string(), format!("address family differs from {dest}")));
                    }
                }
                Ok(Route { dest, next_hop })
            })
            .collect::<Result<Vec<_>, ControllerError>>()?;

        let mut nads = BTreeSet::new();
        for nad in &spec.nads {
            match nad.split_once('/') {
                Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() && !name.contains('/') => {}
                _ => return Err(invalid("NAD", nad, "expected namespace/name".to_string())),
            }
            nads.insert(nad.clone());
        }

        Ok(Self {
            name: spec.name.clone(),
            topology: spec.topology,
            interconnect: spec.interconnect,
            nads,
            subnets,
            exclude_subnets,
            routes,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Whether the controller manages IPs for this network.
    pub fn requires_ipam(&self) -> bool {
        !self.subnets.is_empty()
    }

    /// Whether attachments get a tunnel ID (interconnected layer2 networks).
    pub fn requires_tunnel_ids(&self) -> bool {
        self.topology == Topology::Layer2 && self.interconnect
    }

    /// Whether `nad` (`namespace/name`) attaches pods to this network.
    pub fn has_nad(&self, nad: &str) -> bool {
        self.nads.contains(nad)
    }

    pub fn subnets(&self) -> &[Subnet] {
        &self.subnets
    }

    pub fn subnet_cidrs(&self) -> Vec<IpNet> {
        self.subnets.iter().map(|s| s.cidr).collect()
    }

    pub fn exclude_subnets(&self) -> &[IpNet] {
        &self.exclude_subnets
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}

/// Parses and validates the network configuration YAML.
pub fn parse_network_config(yaml: &str) -> Result<Vec<NetInfo>, ControllerError> {
    let file: NetworkConfigFile = serde_yaml::from_str(yaml)
        .map_err(|e| ControllerError::InvalidConfig(format!("malformed network configuration: {e}")))?;

    let mut names = HashSet::new();
    let mut nad_owners: HashSet<&str> = HashSet::new();
    for spec in &file.networks {
        if !names.insert(spec.name.as_str()) {
            return Err(ControllerError::InvalidConfig(format!("duplicate network {}", spec.name)));
        }
        for nad in &spec.nads {
            if !nad_owners.insert(nad.as_str()) {
                return Err(ControllerError::InvalidConfig(format!(
                    "NAD {nad} belongs to more than one network"
                )));
            }
        }
    }

    file.networks.iter().map(NetInfo::from_spec).collect()
}

/// Reads the network configuration file at `path`.
pub fn load_network_config(path: &Path) -> Result<Vec<NetInfo>, ControllerError> {
    let yaml = std::fs::read_to_string(path).map_err(|e| {
        ControllerError::InvalidConfig(format!("cannot read network configuration {}: {e}", path.display()))
    })?;
    parse_network_config(&yaml)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
networks:
  - name: blue
    topology: layer2
    interconnect: true
    nads: ["ns1/blue"]
    subnets:
      - cidr: 10.128.0.0/24
        gateway: 10.128.0.1
      - cidr: fd00:10::/64
    excludeSubnets: ["10.128.0.0/29"]
    routes:
      - dest: 10.96.0.0/16
      - dest: 192.168.0.0/16
        nextHop: 10.128.0.254
  - name: red
    topology: localnet
    nads: ["ns1/red", "ns2/red"]
"#;

    #[test]
    fn test_parse_network_config() {
        let networks = parse_network_config(CONFIG).unwrap();
        assert_eq!(networks.len(), 2);

        let blue = &networks[0];
        assert_eq!(blue.name(), "blue");
        assert!(blue.requires_ipam());
        assert!(blue.requires_tunnel_ids());
        assert!(blue.has_nad("ns1/blue"));
        assert!(!blue.has_nad("ns1/red"));
        assert_eq!(blue.subnets().len(), 2);
        assert_eq!(blue.subnets()[0].gateway, Some("10.128.0.1".parse().unwrap()));
        assert_eq!(blue.exclude_subnets(), &["10.128.0.0/29".parse::<IpNet>().unwrap()]);
        assert_eq!(blue.routes()[1].next_hop, Some("10.128.0.254".parse().unwrap()));

        let red = &networks[1];
        assert_eq!(red.topology(), Topology::Localnet);
        assert!(!red.requires_ipam());
        assert!(!red.requires_tunnel_ids());
    }

    #[test]
    fn test_layer2_without_interconnect_has_no_tunnel_ids() {
        let yaml = "networks:\n  - name: blue\n    topology: layer2\n";
        let networks = parse_network_config(yaml).unwrap();
        assert!(!networks[0].requires_tunnel_ids());
    }

    #[test]
    fn test_gateway_outside_subnet_is_rejected() {
        let yaml = r#"
networks:
  - name: blue
    topology: layer2
    subnets:
      - cidr: 10.128.0.0/24
        gateway: 10.129.0.1
"#;
        assert!(matches!(parse_network_config(yaml), Err(ControllerError::InvalidConfig(_))));
    }

    #[test]
    fn test_duplicate_names_and_nads_are_rejected() {
        let duplicate_name = "networks:\n  - {name: a, topology: layer2}\n  - {name: a, topology: layer3}\n";
        assert!(parse_network_config(duplicate_name).is_err());

        let shared_nad = "networks:\n  - {name: a, topology: layer2, nads: [ns/x]}\n  - {name: b, topology: layer2, nads: [ns/x]}\n";
        assert!(parse_network_config(shared_nad).is_err());
    }

    #[test]
    fn test_malformed_values_are_rejected() {
        let bad_cidr = "networks:\n  - {name: a, topology: layer2, subnets: [{cidr: 10.0.0.0/33}]}\n";
        assert!(parse_network_config(bad_cidr).is_err());

        let bad_nad = "networks:\n  - {name: a, topology: layer2, nads: [blue]}\n";
        assert!(parse_network_config(bad_nad).is_err());

        let bad_topology = "networks:\n  - {name: a, topology: mesh}\n";
        assert!(parse_network_config(bad_topology).is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
