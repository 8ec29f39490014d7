//! Tick-driven Kademlia DHT with swarm membership.
//!
//! The engine never owns a socket or a timer. The embedding process hands it
//! datagrams through [`DhtEngine::handle_packet`], advances the clock through
//! [`DhtEngine::tick`], and supplies a [`Transport`] for outbound packets.
//! [`DhtServer`] is a ready-made tokio adapter doing exactly that over UDP.
//!
//! | Part | Role |
//! |------|------|
//! | [`RoutingTable`] | One per address family, snapshot-isolated, rebuilt on tick |
//! | [`FindNodeProtocol`] | Iterative lookup of one address |
//! | [`JoinSwarm`] | Forward + backward swarm membership with announce tokens |
//! | [`ConnSwarm`] | Flat, connectivity-only swarm membership |
//! | [`PeerRegistry`] | Generational slot map of live transactions |
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use swarmdht::dht::{DhtConfig, DhtEngine, NodeAddress, SwarmConfig, Transport, SendFlags};
//! use std::net::SocketAddr;
//!
//! struct Discard;
//!
//! impl Transport for Discard {
//!     fn send(&self, _buf: &[u8], _dest: SocketAddr, _flags: SendFlags) -> bool {
//!         true
//!     }
//! }
//!
//! let engine = DhtEngine::new(DhtConfig::default(), Arc::new(Discard));
//! let target = NodeAddress::from_content(b"my-swarm");
//! engine.join_swarm(target, SwarmConfig::default(), 0).unwrap();
//!
//! for now in 1..10 {
//!     engine.tick(now);
//! }
//! assert!(engine.swarm_peers(&target).is_empty());
//! ```

/// Discrete time unit driving every timer in the engine.
pub type Tick = u64;

mod address;
mod announce_store;
mod bootstrap;
mod config;
mod discovered;
mod dispatch;
mod engine;
mod error;
mod events;
mod find_node;
mod message;
mod network;
pub mod node_id_security;
mod obfuscate;
mod public_ip;
mod registry;
mod routing;
mod server;
mod stats;
mod swarm;
mod template;

pub use address::{NodeAddress, ADDRESS_BITS};
pub use announce_store::AnnounceStore;
pub use bootstrap::{BootstrapEntry, BootstrapStore, FileBootstrapStore, MemoryBootstrapStore};
pub use config::{DhtConfig, SwarmConfig};
pub use discovered::{DiscoveredNode, DiscoveryKind};
pub use dispatch::{PacketDispatcher, PacketHandler};
pub use engine::{DhtEngine, SendFlags, Transport};
pub use error::DhtError;
pub use events::{DhtEvents, NoopEvents};
pub use find_node::FindNodeProtocol;
pub use message::{
    decode, encode_error, encode_query, encode_reply, Body, CompactNode, CompactPeer,
    ErrorReply, Fields, Message, NodeDescriptor, Query, Reply, Tid, Token, TransactionInfo,
    TxnType, Verb, FLAG_FIREWALLED, FLAG_FORWARD, FLAG_LEAVING, FLAG_MEMBER, FLAG_PRIVATE,
};
pub use network::{AddressFamily, CloakKey, CompactAddress, NetworkAddress};
pub use obfuscate::{deobfuscate, obfuscate, random_seed};
pub use public_ip::{PublicIpVotes, RttSample, RttSamples};
pub use registry::{PeerRegistry, TxnId};
pub use routing::{RoutingNode, RoutingSnapshot, RoutingTable};
pub use server::DhtServer;
pub use stats::{DhtStats, StatsSnapshot};
pub use swarm::{ConnSwarm, JoinSwarm, SwarmPeerView, SwarmRole};

#[cfg(test)]
mod tests;
