use super::address::NodeAddress;
use super::network::{AddressFamily, NetworkAddress};

/// Callbacks from the engine to higher layers.
///
/// Invoked from whichever thread drove the change (tick or packet handler),
/// never while a transaction or routing lock is held.
pub trait DhtEvents: Send + Sync {
    /// A swarm crossed the mature/immature boundary.
    fn on_swarm_changed(&self, _target: &NodeAddress, _mature: bool) {}

    /// A peer was admitted to a swarm's peer set.
    fn on_peer_joined(&self, _target: &NodeAddress, _peer: &NodeAddress, _addr: &NetworkAddress) {}

    /// A peer left a swarm's peer set, by timeout, eviction or leaving signal.
    fn on_peer_dropped(&self, _target: &NodeAddress, _peer: &NodeAddress) {}

    /// A routing table became mature or lost maturity.
    fn on_connectivity_changed(&self, _family: AddressFamily, _connected: bool) {}
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

impl DhtEvents for NoopEvents {}
