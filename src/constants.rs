//! Protocol constants and tuning parameters.
//!
//! Every timer in the crate is expressed in ticks. The owning process advances
//! the tick on a fixed cadence; the reference deployment uses 100 ms per tick,
//! and the comments below quote wall-clock equivalents for that cadence.

use crate::dht::Tick;

// ============================================================================
// Clock
// ============================================================================

/// Wall-clock length of one tick in the reference deployment (milliseconds).
pub const TICK_MILLIS: u64 = 100;

/// Ticks per second at the reference cadence.
pub const TICKS_PER_SECOND: Tick = 1000 / TICK_MILLIS;

/// Datagrams the UDP server buffers between the engine and the socket.
pub const OUTBOUND_QUEUE_SIZE: usize = 1024;

// ============================================================================
// Wire format
// ============================================================================

/// Length of a node address in bytes.
pub const ADDRESS_LEN: usize = 20;

/// Length of our packed transaction id.
pub const TRANSACTION_ID_LEN: usize = 9;

/// Longest transaction id accepted from a foreign query.
pub const MAX_FOREIGN_TRANSACTION_ID_LEN: usize = 20;

/// Length of the node descriptor field.
pub const DESCRIPTOR_LEN: usize = 12;

/// Compact IPv4 address + port.
pub const COMPACT_V4_LEN: usize = 6;

/// Compact IPv6 address + port.
pub const COMPACT_V6_LEN: usize = 18;

/// Compact node: id + IPv4 address + port.
pub const COMPACT_NODE_V4_LEN: usize = ADDRESS_LEN + COMPACT_V4_LEN;

/// Compact node: id + IPv6 address + port.
pub const COMPACT_NODE_V6_LEN: usize = ADDRESS_LEN + COMPACT_V6_LEN;

/// Compact swarm peer: id + address + cloaked alternate address (IPv4).
pub const COMPACT_PEER_V4_LEN: usize = ADDRESS_LEN + 2 * COMPACT_V4_LEN;

/// Compact swarm peer: id + address + cloaked alternate address (IPv6).
pub const COMPACT_PEER_V6_LEN: usize = ADDRESS_LEN + 2 * COMPACT_V6_LEN;

/// Largest announce token carried on the wire.
pub const MAX_TOKEN_LEN: usize = 20;

/// Largest version tag carried on the wire.
pub const MAX_VERSION_LEN: usize = 8;

/// Version tag we put on every message.
pub const VERSION_TAG: &[u8; 4] = b"SD01";

/// Protocol version advertised in the node descriptor.
pub const PROTOCOL_VERSION: u16 = 1;

/// Largest datagram we encode (fits a 1500-byte MTU with IPv6 + UDP headers).
pub const MAX_PACKET_SIZE: usize = 1440;

/// Most compact nodes carried per family in one reply.
pub const MAX_REPLY_NODES: usize = 8;

/// Most swarm peers carried per family in one reply.
pub const MAX_REPLY_PEERS: usize = 16;

/// Longest decimal length prefix we accept ("65535:").
pub const MAX_LENGTH_DIGITS: usize = 5;

/// Number of leading bytes XORed by header obfuscation.
pub const OBFUSCATED_HEADER_LEN: usize = 16;

/// Error code for a rejected announce token (BEP-5).
pub const ERROR_INVALID_TOKEN: i64 = 203;

// ============================================================================
// Engine cadence
// ============================================================================

/// Anti-spoof transaction token rotation (5 min).
pub const TOKEN_ROTATION_TICKS: Tick = 3000;

/// Announce token secret rotation (5 min).
pub const ANNOUNCE_SECRET_ROTATION_TICKS: Tick = 3000;

/// Routing rebuild cadence once the table is mature (10 s).
pub const REBUILD_INTERVAL_TICKS: Tick = 100;

/// Routing rebuild cadence while any transaction is immature (1 s).
pub const REBUILD_BUSY_INTERVAL_TICKS: Tick = 10;

/// Lower bound on rebuild cadence while the table is immature (500 ms).
pub const REBUILD_MIN_INTERVAL_TICKS: Tick = 5;

/// Find-self cadence once the table is mature (1 min).
pub const FIND_SELF_INTERVAL_TICKS: Tick = 600;

/// Find-self cadence while immature (2 s).
pub const FIND_SELF_IMMATURE_TICKS: Tick = 20;

/// Number of closest nodes asked by a find-self round.
pub const FIND_SELF_FANOUT: usize = 3;

/// Seed-list contact cadence while the table is empty (5 s).
pub const SEED_RETRY_TICKS: Tick = 50;

/// Bootstrap list persistence cadence (10 min).
pub const BOOTSTRAP_SAVE_TICKS: Tick = 6000;

/// Number of entries in a persisted routing bootstrap list.
pub const BOOTSTRAP_LIST_LEN: usize = 32;

/// Registry garbage collection cadence (1 s).
pub const REGISTRY_GC_TICKS: Tick = 10;

// ============================================================================
// Routing table
// ============================================================================

/// Nodes per bucket.
pub const BUCKET_SIZE: usize = 8;

/// Number of materialized buckets; deeper prefixes fold into the last one.
pub const MATERIALIZED_BUCKETS: usize = 40;

/// A bucket never drops a silent node if that would leave fewer than this
/// many members (about 70% of capacity).
pub const BUCKET_SHORTAGE_COUNT: usize = 6;

/// Silence after which a node is a zombie (3 min).
pub const ZOMBIE_TICKS: Tick = 1800;

/// Silence after which a node may be evicted on rebuild (10 min).
pub const HARD_TIMEOUT_TICKS: Tick = 6000;

/// A node silent this long gets pinged on the next rebuild (1 min).
pub const PING_INTERVAL_TICKS: Tick = 600;

/// Minimum spacing between two pings to the same node (10 s).
pub const PING_RETRY_TICKS: Tick = 100;

/// Most pings emitted by one rebuild pass.
pub const MAX_PINGS_PER_REBUILD: usize = 16;

/// Non-zombie, latency-known nodes needed for a mature table.
pub const ROUTING_MATURE_NODES: usize = 8;

/// A node slower than this multiple of the table average is "slow".
pub const SLOW_LATENCY_FACTOR: u32 = 3;

/// Latency floor used by the slow-node bar (ticks).
pub const SLOW_LATENCY_FLOOR: u32 = 5;

/// Eviction score weight per tick of silence.
pub const EVICT_SILENCE_WEIGHT: u64 = 1;

/// Eviction score weight per tick of latency above the bar.
pub const EVICT_LATENCY_WEIGHT: u64 = 40;

/// Capacity of the discovered-node queue.
pub const DISCOVERED_QUEUE_CAPACITY: usize = 1024;

// ============================================================================
// Transactions
// ============================================================================

/// Maximum concurrently live transactions of one kind.
pub const MAX_TRANSACTIONS: usize = 1024;

/// Ticks a released transaction slot stays unusable (3 s).
pub const TRANSACTION_GRACE_TICKS: Tick = 30;

/// Latency assumed for a peer that has never answered (500 ms).
pub const DEFAULT_LATENCY_TICKS: u32 = 5;

/// Reply deadline = latency times this factor, clamped below.
pub const REPLY_TIMEOUT_FACTOR: u32 = 4;

/// Shortest reply deadline (1 s).
pub const MIN_REPLY_TIMEOUT_TICKS: Tick = 10;

/// Longest reply deadline (10 s).
pub const MAX_REPLY_TIMEOUT_TICKS: Tick = 100;

/// Missed replies after which a find-node entry is evicted.
pub const MAX_MISSED_REPLIES: u8 = 3;

// ============================================================================
// Find node
// ============================================================================

/// Capacity of the found and potential proximity queues.
pub const PROXIMITY_QUEUE_SIZE: usize = 8;

/// Refresh interval = latency times this factor while converging.
pub const FIND_REFRESH_FACTOR: u32 = 20;

/// Shortest refresh interval for a found node (2 s).
pub const FIND_REFRESH_MIN_TICKS: Tick = 20;

/// Longest refresh interval for a found node while converging (30 s).
pub const FIND_REFRESH_MAX_TICKS: Tick = 300;

/// Refresh interval for non-target nodes once mature (1 min).
pub const FIND_MATURE_REFRESH_TICKS: Tick = 600;

// ============================================================================
// Swarms
// ============================================================================

/// Expected swarm size when the caller does not choose one.
pub const DEFAULT_SWARM_SIZE: usize = 8;

/// Peer capacity as a multiple of the expected swarm size.
pub const SWARM_CAPACITY_FACTOR: usize = 2;

/// Number of forward peers always chosen by latency.
pub const FORWARD_FASTEST: usize = 2;

/// Re-announcement cadence once mature (30 s).
pub const ANNOUNCE_INTERVAL_TICKS: Tick = 300;

/// Re-announcement cadence while immature (5 s).
pub const ANNOUNCE_IMMATURE_TICKS: Tick = 50;

/// Closest nodes that receive a re-announcement.
pub const ANNOUNCE_FANOUT: usize = 4;

/// Forward peer refresh = latency times this factor, clamped.
pub const FORWARD_REFRESH_FACTOR: u32 = 30;

/// Shortest forward peer refresh (5 s).
pub const FORWARD_REFRESH_MIN_TICKS: Tick = 50;

/// Longest forward peer refresh (1 min).
pub const FORWARD_REFRESH_MAX_TICKS: Tick = 600;

/// Forward set recomputation cadence (10 s).
pub const FORWARD_RECOMPUTE_TICKS: Tick = 100;

/// Backward peers must query us at least this often to count as established (2 min).
pub const BACKWARD_TTL_TICKS: Tick = 1200;

/// Backward peers silent for this multiple of their TTL are dropped.
pub const BACKWARD_STABILITY_FACTOR: Tick = 2;

/// How long a dropped backward peer stays on the reject list (5 min).
pub const REJECT_TICKS: Tick = 3000;

/// Active discovery cadence while a swarm has no peers (2 s).
pub const DISCOVERY_INTERVAL_TICKS: Tick = 20;

/// Contacts made by one discovery step.
pub const DISCOVERY_FANOUT: usize = 8;

/// Recent-host de-duplication window (30 s).
pub const RECENT_HOST_TICKS: Tick = 300;

/// Recent-host de-duplication capacity.
pub const RECENT_HOST_CAPACITY: usize = 256;

/// Recent-host garbage collection cadence (10 s).
pub const RECENT_HOST_GC_TICKS: Tick = 100;

/// Swarm bootstrap persistence cadence (10 min).
pub const SWARM_SAVE_TICKS: Tick = 6000;

// ============================================================================
// Announce store
// ============================================================================

/// Lifetime of a stored announcement (30 min).
pub const ANNOUNCE_LIFETIME_TICKS: Tick = 18000;

/// Most announced peers kept per target.
pub const MAX_ANNOUNCED_PER_TARGET: usize = 64;

/// Most targets tracked by the announce store.
pub const MAX_ANNOUNCE_TARGETS: usize = 4096;

// ============================================================================
// Public address and RTT sampling
// ============================================================================

/// Public-IP vote window.
pub const PUBLIC_IP_SAMPLES: usize = 32;

/// Vote weight of a reply from an IP-restriction-verified node.
pub const VERIFIED_VOTE_WEIGHT: u32 = 2;

/// Round-trip samples retained for network-time estimation.
pub const RTT_SAMPLES: usize = 64;
