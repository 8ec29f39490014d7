//! Swarm membership on top of the routing layer.
//!
//! A swarm is the set of nodes interested in one target address. Two flavors
//! share the machinery in [`base`]:
//!
//! - [`JoinSwarm`] keeps directed relations. Forward peers are the ones we
//!   query and announce ourselves to; backward peers query us and announce
//!   themselves with a token we issued.
//! - [`ConnSwarm`] only wants connectivity: a flat peer set, refreshed by
//!   periodic `get_peers`.
//!
//! Both publish their live peers through a lock-free output list, so readers
//! never contend with protocol updates.

mod base;
mod conn;
mod join;
mod output;
mod peer;
mod recent;

#[cfg(test)]
mod tests;

pub use conn::ConnSwarm;
pub use join::JoinSwarm;
pub use peer::{SwarmPeerView, SwarmRole};

pub(crate) use base::{ServeOutcome, SwarmEvent, SwarmHost};
#[cfg(test)]
pub(crate) use base::private_sequence_number;

use std::sync::Arc;

use crate::dht::address::NodeAddress;
use crate::dht::message::{Outbound, Query, Reply};
use crate::dht::network::NetworkAddress;
use crate::dht::Tick;

/// What the engine drives on every swarm, whatever its flavor.
pub(crate) trait SwarmProtocol: Send + Sync {
    fn target(&self) -> &NodeAddress;

    /// Whether queries for this swarm must pass the sequence-number check.
    fn is_private(&self) -> bool;

    fn tick(&self, now: Tick, host: &dyn SwarmHost, out: &mut Vec<Outbound>) -> Vec<SwarmEvent>;

    /// A reply to one of our `get_peers` or `announce_peer` queries. False
    /// when a member reply failed the private-swarm check.
    fn on_reply(
        &self,
        reply: &Reply,
        from: NetworkAddress,
        latency: u32,
        now: Tick,
        host: &dyn SwarmHost,
        out: &mut Vec<Outbound>,
    ) -> (bool, Vec<SwarmEvent>);

    /// A `get_peers` for our target from another node.
    fn on_get_peers(
        &self,
        query: &Query,
        from: NetworkAddress,
        now: Tick,
        host: &dyn SwarmHost,
    ) -> (ServeOutcome, Vec<SwarmEvent>);

    /// An `announce_peer` whose token already checked out. False when the
    /// private-swarm check refused it.
    fn on_announce(&self, query: &Query, from: NetworkAddress, now: Tick) -> (bool, Vec<SwarmEvent>);

    fn stop(&self, now: Tick, host: &dyn SwarmHost, out: &mut Vec<Outbound>) -> Vec<SwarmEvent>;

    fn peers(&self) -> Arc<Vec<SwarmPeerView>>;

    fn is_mature(&self) -> bool;
}
