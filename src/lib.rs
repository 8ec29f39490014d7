//! swarmdht - A tick-driven Kademlia DHT with swarm membership
//!
//! The engine speaks a compact bencode dialect of the BEP-5 DHT protocol and
//! adds swarms: groups of nodes that gather around a 160-bit target address
//! and keep each other alive, optionally gated by a shared secret.
//!
//! # Modules
//!
//! - [`bencode`] - Allocation-free bencode reading and writing
//! - [`constants`] - Wire limits, timers and tuning parameters
//! - [`dht`] - Routing, lookups, swarms and the UDP server

pub mod bencode;
pub mod constants;
pub mod dht;

pub use bencode::BencodeError;
pub use dht::{
    ConnSwarm, DhtConfig, DhtEngine, DhtError, DhtEvents, DhtServer, FindNodeProtocol,
    JoinSwarm, NetworkAddress, NodeAddress, RoutingTable, SwarmConfig, SwarmPeerView, Transport,
};
