use super::address::NodeAddress;
use super::network::{AddressFamily, NetworkAddress};
use crate::constants::{DEFAULT_SWARM_SIZE, ROUTING_MATURE_NODES};

/// Engine-wide settings.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Local node address; random when absent.
    pub node_address: Option<NodeAddress>,
    pub families: Vec<AddressFamily>,
    /// Obfuscate headers of outgoing packets.
    pub obfuscate: bool,
    /// Built-in seed nodes, the discovery source of last resort.
    pub seed_nodes: Vec<NetworkAddress>,
    /// Live nodes a routing table needs before it counts as mature.
    pub routing_mature_nodes: usize,
    /// Our UDP port as advertised in node descriptors.
    pub udp_port: u16,
    pub tcp_port: u16,
    pub app_port: u16,
    /// Name under which routing bootstrap lists are persisted, per family.
    pub bootstrap_name: Option<String>,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            node_address: None,
            families: AddressFamily::ALL.to_vec(),
            obfuscate: false,
            seed_nodes: Vec::new(),
            routing_mature_nodes: ROUTING_MATURE_NODES,
            udp_port: 0,
            tcp_port: 0,
            app_port: 0,
            bootstrap_name: None,
        }
    }
}

impl DhtConfig {
    pub fn has_family(&self, family: AddressFamily) -> bool {
        self.families.contains(&family)
    }
}

/// Per-swarm settings.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    pub expected_size: usize,
    /// Shared secret of a private swarm.
    pub secret: Option<[u8; 32]>,
    /// Bootstrap resource name; the hex target when absent.
    pub bootstrap_name: Option<String>,
    pub persist: bool,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            expected_size: DEFAULT_SWARM_SIZE,
            secret: None,
            bootstrap_name: None,
            persist: true,
        }
    }
}

impl SwarmConfig {
    pub fn private(secret: [u8; 32]) -> Self {
        Self {
            secret: Some(secret),
            ..Default::default()
        }
    }

    pub fn with_expected_size(mut self, expected_size: usize) -> Self {
        self.expected_size = expected_size.max(1);
        self
    }

    pub(crate) fn bootstrap_name(&self, target: &NodeAddress) -> String {
        self.bootstrap_name
            .clone()
            .unwrap_or_else(|| format!("swarm-{}", target))
    }
}
