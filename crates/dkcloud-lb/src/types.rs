//! Domain types shared by the engine components

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::identity::BalancerIdentity;

/// Transport protocol of an exposed Service port
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PortProtocol {
    /// TCP
    #[default]
    Tcp,
    /// UDP
    Udp,
    /// SCTP
    Sctp,
}

impl PortProtocol {
    /// Parse the Kubernetes spelling (`TCP`, `UDP`, `SCTP`); absent means TCP
    pub fn from_kubernetes(value: Option<&str>) -> Option<Self> {
        match value {
            None | Some("TCP") => Some(PortProtocol::Tcp),
            Some("UDP") => Some(PortProtocol::Udp),
            Some("SCTP") => Some(PortProtocol::Sctp),
            Some(_) => None,
        }
    }
}

impl fmt::Display for PortProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PortProtocol::Tcp => "TCP",
            PortProtocol::Udp => "UDP",
            PortProtocol::Sctp => "SCTP",
        })
    }
}

/// One exposed port: public listen port to per-node target port
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortBinding {
    /// Port the balancer listens on
    pub listen_port: u16,
    /// Port the traffic is forwarded to on each node
    pub target_port: u16,
    /// Transport protocol
    pub protocol: PortProtocol,
}

impl PortBinding {
    /// A TCP binding
    pub fn tcp(listen_port: u16, target_port: u16) -> Self {
        Self {
            listen_port,
            target_port,
            protocol: PortProtocol::Tcp,
        }
    }

    /// Pair every backend address with this binding's target port
    pub fn targets<'a>(&'a self, addresses: &'a [String]) -> impl Iterator<Item = TargetEndpoint> + 'a {
        addresses.iter().map(move |address| TargetEndpoint {
            address: address.clone(),
            port: self.target_port,
        })
    }
}

/// A backend the balancer forwards to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetEndpoint {
    /// Externally routable node address
    pub address: String,
    /// Target port on that node
    pub port: u16,
}

impl fmt::Display for TargetEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Kind of a node address, as reported by the node status
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum AddressKind {
    /// Routable from outside the cluster
    ExternalIP,
    /// Routable inside the cluster network only
    InternalIP,
    /// DNS name of the node
    Hostname,
    /// Any other kind
    Other(String),
}

impl AddressKind {
    /// Parse the Kubernetes spelling of an address type
    pub fn parse(value: &str) -> Self {
        match value {
            "ExternalIP" => AddressKind::ExternalIP,
            "InternalIP" => AddressKind::InternalIP,
            "Hostname" => AddressKind::Hostname,
            other => AddressKind::Other(other.to_string()),
        }
    }

    /// Kubernetes spelling of the address type
    pub fn as_str(&self) -> &str {
        match self {
            AddressKind::ExternalIP => "ExternalIP",
            AddressKind::InternalIP => "InternalIP",
            AddressKind::Hostname => "Hostname",
            AddressKind::Other(other) => other,
        }
    }
}

/// One address of one node
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NodeAddress {
    /// Address type
    #[serde(rename = "type")]
    pub kind: AddressKind,
    /// The address itself
    pub address: String,
}

impl NodeAddress {
    /// An external IP address
    pub fn external(address: impl Into<String>) -> Self {
        Self {
            kind: AddressKind::ExternalIP,
            address: address.into(),
        }
    }
}

/// External addresses in input order, without duplicates
pub fn external_addresses<'a>(addresses: impl IntoIterator<Item = &'a NodeAddress>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for addr in addresses {
        if addr.kind == AddressKind::ExternalIP && !out.contains(&addr.address) {
            out.push(addr.address.clone());
        }
    }
    out
}

/// Capacity class of a backing instance, chosen by connection limit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapacityTier {
    /// Up to 1000 connections, 1 core
    Small,
    /// Up to 10000 connections, 2 cores
    Medium,
    /// More than 10000 connections, 4 cores
    Large,
}

impl CapacityTier {
    /// Tier serving the given connection limit
    pub fn for_connection_limit(limit: u32) -> Self {
        if limit <= 1000 {
            CapacityTier::Small
        } else if limit <= 10000 {
            CapacityTier::Medium
        } else {
            CapacityTier::Large
        }
    }

    /// Store package identifier
    pub fn package_id(&self) -> &'static str {
        match self {
            CapacityTier::Small => "89833c1dfa7010",
            CapacityTier::Medium => "e991abd8ef15c7",
            CapacityTier::Large => "9559dbb4b71c45",
        }
    }

    /// Number of cores, and so of balancer processes
    pub fn cores(&self) -> u32 {
        match self {
            CapacityTier::Small => 1,
            CapacityTier::Medium => 2,
            CapacityTier::Large => 4,
        }
    }
}

/// Lifecycle state of a backing instance
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceState {
    /// Created but not yet booted
    Provisioning,
    /// Booted
    Ready,
}

/// One network interface of a backing instance
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetworkInterface {
    /// Addresses assigned to the interface
    pub addresses: Vec<String>,
}

/// A remote compute instance as reported by the store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackingInstance {
    /// Store identifier
    pub id: String,
    /// Hostname the instance was created with
    pub hostname: String,
    /// Lifecycle state
    pub state: InstanceState,
    /// Network interfaces, in store order
    pub network_interfaces: Vec<NetworkInterface>,
    /// Package (capacity class) identifier
    pub package_id: Option<String>,
    /// Location identifier
    pub location_id: Option<String>,
}

impl BackingInstance {
    /// All addresses across all interfaces, in store order
    pub fn addresses(&self) -> Vec<String> {
        self.network_interfaces
            .iter()
            .flat_map(|nic| nic.addresses.iter().cloned())
            .collect()
    }

    /// First address of the first interface, used for SSH
    pub fn primary_address(&self) -> Option<&str> {
        self.network_interfaces
            .iter()
            .flat_map(|nic| nic.addresses.iter())
            .map(String::as_str)
            .next()
    }
}

/// What the caller gets back from Exists and Ensure
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadBalancerStatus {
    /// Reachable addresses of the balancer
    pub ingress: Vec<String>,
}

/// Desired state of one balancer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BalancerRequest {
    /// Who the balancer belongs to
    pub identity: BalancerIdentity,
    /// Raw policy hints
    pub annotations: BTreeMap<String, String>,
    /// Exposed ports, in Service order
    pub ports: Vec<PortBinding>,
    /// Addresses of every node backing the Service
    pub node_addresses: Vec<NodeAddress>,
}

impl BalancerRequest {
    /// A request with default options
    pub fn new(identity: BalancerIdentity) -> Self {
        Self {
            identity,
            annotations: BTreeMap::new(),
            ports: Vec::new(),
            node_addresses: Vec::new(),
        }
    }

    /// Add a port binding
    pub fn with_port(mut self, port: PortBinding) -> Self {
        self.ports.push(port);
        self
    }

    /// Add an externally routable node address
    pub fn with_node(mut self, address: impl Into<String>) -> Self {
        self.node_addresses.push(NodeAddress::external(address));
        self
    }

    /// Set a policy hint
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Externally routable backend addresses
    pub fn backends(&self) -> Vec<String> {
        external_addresses(&self.node_addresses)
    }
}
