use std::cmp::Reverse;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace};

use super::address::{NodeAddress, ADDRESS_BITS};
use super::bootstrap::BootstrapEntry;
use super::discovered::{DiscoveredNode, DiscoveredQueue, DiscoveryKind};
use super::network::{AddressFamily, NetworkAddress};
use super::Tick;
use crate::constants::{
    BOOTSTRAP_LIST_LEN, BUCKET_SHORTAGE_COUNT, BUCKET_SIZE, DEFAULT_LATENCY_TICKS,
    DISCOVERED_QUEUE_CAPACITY, EVICT_LATENCY_WEIGHT, EVICT_SILENCE_WEIGHT, HARD_TIMEOUT_TICKS,
    MATERIALIZED_BUCKETS, MAX_MISSED_REPLIES, MAX_PINGS_PER_REBUILD, PING_INTERVAL_TICKS,
    PING_RETRY_TICKS, REBUILD_BUSY_INTERVAL_TICKS, REBUILD_INTERVAL_TICKS,
    REBUILD_MIN_INTERVAL_TICKS, SLOW_LATENCY_FACTOR, SLOW_LATENCY_FLOOR, ZOMBIE_TICKS,
};

/// Bucket of `address` relative to `own`: shared prefix bits, folded into the
/// last materialized bucket.
pub(crate) fn bucket_index(own: &NodeAddress, address: &NodeAddress) -> usize {
    (own.bit_match(address) as usize).min(MATERIALIZED_BUCKETS - 1)
}

/// A node as the routing table knows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingNode {
    pub address: NodeAddress,
    pub endpoint: NetworkAddress,
    pub last_recv: Option<Tick>,
    pub last_sent: Option<Tick>,
    pub discovered: Tick,
    /// Smoothed round trip in ticks.
    pub latency: Option<u32>,
    /// Pings sent since the last reply.
    pub missed: u8,
}

impl RoutingNode {
    fn from_discovery(d: &DiscoveredNode, now: Tick) -> Self {
        let proven = d.kind != DiscoveryKind::Introduced;
        Self {
            address: d.address,
            endpoint: d.endpoint,
            last_recv: proven.then_some(now),
            last_sent: None,
            discovered: now,
            latency: d.latency,
            missed: 0,
        }
    }

    /// Ticks since we last heard from the node (or learned of it).
    pub fn silence(&self, now: Tick) -> Tick {
        now.saturating_sub(self.last_recv.unwrap_or(self.discovered))
    }

    pub fn is_zombie(&self, now: Tick) -> bool {
        self.silence(now) >= ZOMBIE_TICKS || self.missed >= MAX_MISSED_REPLIES
    }

    fn is_hard_timed_out(&self, now: Tick) -> bool {
        self.silence(now) >= HARD_TIMEOUT_TICKS
    }

    fn is_slow(&self, bar: u32) -> bool {
        self.latency.is_some_and(|l| l > bar)
    }

    /// Zombie or consistently slower than `bar`.
    pub fn is_replaceable(&self, now: Tick, bar: u32) -> bool {
        self.is_zombie(now) || self.is_slow(bar)
    }

    fn eviction_score(&self, now: Tick, bar: u32) -> u64 {
        let over_bar = self.latency.unwrap_or(0).saturating_sub(bar) as u64;
        self.silence(now) * EVICT_SILENCE_WEIGHT + over_bar * EVICT_LATENCY_WEIGHT
    }

    fn record_reply(&mut self, now: Tick, sample: Option<u32>) {
        self.last_recv = Some(now);
        self.missed = 0;
        if let Some(sample) = sample {
            self.latency = Some(match self.latency {
                Some(old) => (old * 3 + sample + 2) / 4,
                None => sample,
            });
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Bucket {
    nodes: Vec<RoutingNode>,
    bad_count: usize,
}

impl Bucket {
    fn position(&self, address: &NodeAddress) -> Option<usize> {
        self.nodes.iter().position(|n| n.address == *address)
    }

    fn worst(&self, mut eligible: impl FnMut(&RoutingNode) -> bool, now: Tick, bar: u32) -> Option<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| eligible(*n))
            .max_by_key(|(i, n)| (n.eviction_score(now, bar), Reverse(*i)))
            .map(|(i, _)| i)
    }
}

/// One immutable version of a routing table.
///
/// Readers hold an `Arc` to a snapshot for as long as they like; the rebuild
/// pass produces a new snapshot instead of touching this one.
#[derive(Debug, Clone)]
pub struct RoutingSnapshot {
    own: NodeAddress,
    family: AddressFamily,
    buckets: Vec<Bucket>,
    /// (bucket, offset) of every node, sorted by node address.
    index: Vec<(u8, u8)>,
    average_latency: u32,
}

impl RoutingSnapshot {
    pub fn new(own: NodeAddress, family: AddressFamily) -> Self {
        Self {
            own,
            family,
            buckets: vec![Bucket::default(); MATERIALIZED_BUCKETS],
            index: Vec::new(),
            average_latency: DEFAULT_LATENCY_TICKS,
        }
    }

    pub fn own_address(&self) -> &NodeAddress {
        &self.own
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    fn node(&self, slot: (u8, u8)) -> &RoutingNode {
        &self.buckets[slot.0 as usize].nodes[slot.1 as usize]
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// All nodes in address order.
    pub fn nodes(&self) -> impl Iterator<Item = &RoutingNode> {
        self.index.iter().map(move |&slot| self.node(slot))
    }

    pub fn get(&self, address: &NodeAddress) -> Option<&RoutingNode> {
        let bucket = &self.buckets[bucket_index(&self.own, address)];
        bucket.nodes.iter().find(|n| n.address == *address)
    }

    pub fn bucket_len(&self, bucket: usize) -> usize {
        self.buckets.get(bucket).map_or(0, |b| b.nodes.len())
    }

    /// Whether `bucket` would take a new node (room left, or a bad member).
    pub fn bucket_accepts(&self, bucket: usize) -> bool {
        self.buckets
            .get(bucket)
            .is_some_and(|b| b.nodes.len() < BUCKET_SIZE || b.bad_count > 0)
    }

    pub fn average_latency(&self) -> u32 {
        self.average_latency
    }

    /// Latency above which a node counts as slow.
    pub fn latency_bar(&self) -> u32 {
        (self.average_latency * SLOW_LATENCY_FACTOR).max(SLOW_LATENCY_FLOOR)
    }

    /// Non-zombie nodes with a measured latency.
    pub fn live_count(&self, now: Tick) -> usize {
        self.nodes()
            .filter(|n| n.latency.is_some() && !n.is_zombie(now))
            .count()
    }

    pub fn is_mature(&self, now: Tick, threshold: usize) -> bool {
        self.live_count(now) >= threshold
    }

    /// The `n` non-zombie nodes closest to `target`, nearest first.
    ///
    /// Walks outward from `target`'s position in the sorted index until `n`
    /// candidates are found, then widens to the address prefix range that any
    /// closer node must fall in and sorts that range by distance.
    pub fn closest_nodes(&self, target: &NodeAddress, n: usize, now: Tick) -> Vec<RoutingNode> {
        if n == 0 || self.index.is_empty() {
            return Vec::new();
        }

        let total = self.index.len();
        let lower = self
            .index
            .partition_point(|&slot| self.node(slot).address < *target);
        let (mut below, mut above) = (lower, lower);
        let mut from_above = true;
        let mut picked = Vec::with_capacity(n);

        while picked.len() < n && (below > 0 || above < total) {
            let take_above = if below == 0 {
                true
            } else if above >= total {
                false
            } else {
                from_above
            };
            from_above = !from_above;

            let node = if take_above {
                above += 1;
                self.node(self.index[above - 1])
            } else {
                below -= 1;
                self.node(self.index[below])
            };
            if !node.is_zombie(now) {
                picked.push(*node);
            }
        }

        if picked.len() == n {
            let farthest = picked
                .iter()
                .map(|node| node.address.distance(target))
                .max()
                .unwrap_or(NodeAddress::ZERO);
            let shared = farthest.bit_match(&NodeAddress::ZERO).min(ADDRESS_BITS);
            let (low, high) = target.prefix_range(shared);
            let start = self.index.partition_point(|&slot| self.node(slot).address < low);
            let end = self.index.partition_point(|&slot| self.node(slot).address <= high);
            picked = self.index[start..end]
                .iter()
                .map(|&slot| *self.node(slot))
                .filter(|node| !node.is_zombie(now))
                .collect();
        }

        picked.sort_by(|a, b| target.cmp_distance(&a.address, &b.address));
        picked.truncate(n);
        picked
    }

    /// Builds the next table version from this one and a batch of discoveries.
    ///
    /// Hard-timed-out nodes are dropped unless that would leave their bucket
    /// short. Discoveries update known nodes in place or fill free slots; a
    /// full bucket gives up its worst replaceable member, and only a node that
    /// has proven itself may displace a merely slow one.
    pub fn rebuild(&self, discovered: &[DiscoveredNode], now: Tick) -> RoutingSnapshot {
        let bar = self.latency_bar();
        let mut next = self.clone();

        for bucket in &mut next.buckets {
            while bucket.nodes.len() > BUCKET_SHORTAGE_COUNT {
                match bucket.worst(|n| n.is_hard_timed_out(now), now, bar) {
                    Some(i) => {
                        bucket.nodes.remove(i);
                    }
                    None => break,
                }
            }
        }

        for d in discovered {
            next.apply(d, now, bar);
        }

        next.finish(now);
        next
    }

    fn apply(&mut self, d: &DiscoveredNode, now: Tick, bar: u32) {
        if d.address == self.own
            || d.endpoint.family() != Some(self.family)
            || d.endpoint.port() == 0
        {
            return;
        }

        let b = bucket_index(&self.own, &d.address);
        let bucket = &mut self.buckets[b];

        if let Some(pos) = bucket.position(&d.address) {
            let node = &mut bucket.nodes[pos];
            match d.kind {
                DiscoveryKind::Replied => {
                    if node.endpoint != d.endpoint {
                        node.endpoint = d.endpoint;
                        node.latency = None;
                    }
                    node.record_reply(now, d.latency);
                }
                DiscoveryKind::Queried if node.endpoint == d.endpoint => {
                    node.last_recv = Some(now);
                }
                DiscoveryKind::Queried | DiscoveryKind::Introduced => {}
            }
            return;
        }

        let node = RoutingNode::from_discovery(d, now);
        if bucket.nodes.len() < BUCKET_SIZE {
            bucket.nodes.push(node);
            return;
        }

        let victim = if d.kind == DiscoveryKind::Introduced {
            bucket.worst(|n| n.is_zombie(now), now, bar)
        } else {
            bucket.worst(|n| n.is_replaceable(now, bar), now, bar)
        };
        if let Some(i) = victim {
            trace!(
                "Bucket {} replaces {:?} with {:?}",
                b,
                bucket.nodes[i].address,
                node.address
            );
            bucket.nodes[i] = node;
        }
    }

    fn finish(&mut self, now: Tick) {
        let (sum, count) = self
            .buckets
            .iter()
            .flat_map(|b| b.nodes.iter())
            .filter_map(|n| n.latency)
            .fold((0u64, 0u64), |(s, c), l| (s + l as u64, c + 1));
        self.average_latency = if count == 0 {
            DEFAULT_LATENCY_TICKS
        } else {
            (sum / count) as u32
        };

        let bar = self.latency_bar();
        for bucket in &mut self.buckets {
            bucket.bad_count = bucket
                .nodes
                .iter()
                .filter(|n| n.is_replaceable(now, bar))
                .count();
        }

        self.index.clear();
        for (b, bucket) in self.buckets.iter().enumerate() {
            for offset in 0..bucket.nodes.len() {
                self.index.push((b as u8, offset as u8));
            }
        }
        let buckets = &self.buckets;
        self.index
            .sort_by_key(|&(b, o)| buckets[b as usize].nodes[o as usize].address);

        debug_assert!(self.check_invariants());
    }

    /// Marks nodes due for a liveness ping as pinged and returns them.
    pub(crate) fn schedule_pings(&mut self, now: Tick, limit: usize) -> Vec<(NodeAddress, NetworkAddress)> {
        let mut pings = Vec::new();
        'buckets: for bucket in &mut self.buckets {
            for node in &mut bucket.nodes {
                if pings.len() >= limit {
                    break 'buckets;
                }
                let due = match (node.last_sent, node.last_recv) {
                    (None, None) => true,
                    (sent, _) => {
                        node.silence(now) >= PING_INTERVAL_TICKS
                            && sent.map_or(true, |s| now.saturating_sub(s) >= PING_RETRY_TICKS)
                    }
                };
                if !due {
                    continue;
                }
                if let Some(sent) = node.last_sent {
                    if node.last_recv.map_or(true, |r| r < sent) {
                        node.missed = node.missed.saturating_add(1);
                    }
                }
                node.last_sent = Some(now);
                pings.push((node.address, node.endpoint));
            }
        }
        pings
    }

    /// Scores live nodes for persistence: fast first, and addresses already
    /// in `old` get a head start. Old entries fill any remaining room.
    pub fn bootstrap_list(&self, old: &[BootstrapEntry], now: Tick) -> Vec<BootstrapEntry> {
        let mut scored: Vec<(u64, NetworkAddress)> = self
            .nodes()
            .filter(|n| !n.is_zombie(now))
            .filter_map(|n| {
                let latency = n.latency? as u64 * 4 + 1;
                let seen = old.iter().any(|e| e.address == n.endpoint);
                Some((if seen { latency / 2 } else { latency }, n.endpoint))
            })
            .collect();
        scored.sort();

        let mut out: Vec<BootstrapEntry> = Vec::with_capacity(BOOTSTRAP_LIST_LEN);
        for (_, endpoint) in scored {
            if out.len() >= BOOTSTRAP_LIST_LEN {
                break;
            }
            if !out.iter().any(|e| e.address == endpoint) {
                let alternate = old
                    .iter()
                    .find(|e| e.address == endpoint)
                    .map_or(NetworkAddress::Empty, |e| e.alternate);
                out.push(BootstrapEntry::with_alternate(endpoint, alternate));
            }
        }
        for entry in old {
            if out.len() >= BOOTSTRAP_LIST_LEN {
                break;
            }
            if !out.iter().any(|e| e.address == entry.address) {
                out.push(*entry);
            }
        }
        out
    }

    /// Structural consistency of buckets and sorted index.
    pub fn check_invariants(&self) -> bool {
        let total: usize = self.buckets.iter().map(|b| b.nodes.len()).sum();
        if total != self.index.len() {
            return false;
        }
        for (b, bucket) in self.buckets.iter().enumerate() {
            if bucket.nodes.len() > BUCKET_SIZE {
                return false;
            }
            if bucket
                .nodes
                .iter()
                .any(|n| bucket_index(&self.own, &n.address) != b || n.address == self.own)
            {
                return false;
            }
        }
        self.index.iter().all(|&(b, o)| {
            (b as usize) < self.buckets.len() && (o as usize) < self.buckets[b as usize].nodes.len()
        }) && self
            .index
            .windows(2)
            .all(|w| self.node(w[0]).address < self.node(w[1]).address)
    }
}

/// What a refresh pass produced.
#[derive(Debug, Default)]
pub struct RefreshOutcome {
    /// Nodes to ping now.
    pub pings: Vec<(NodeAddress, NetworkAddress)>,
    /// New connectivity state, if it flipped.
    pub connectivity: Option<bool>,
}

#[derive(Debug, Default)]
struct RebuildState {
    last_rebuild: Option<Tick>,
    mature: bool,
}

/// The routing table of one address family.
pub struct RoutingTable {
    family: AddressFamily,
    own: NodeAddress,
    snapshot: RwLock<Arc<RoutingSnapshot>>,
    discovered: DiscoveredQueue,
    state: Mutex<RebuildState>,
    mature_nodes: usize,
}

impl RoutingTable {
    pub fn new(own: NodeAddress, family: AddressFamily, mature_nodes: usize) -> Self {
        Self {
            family,
            own,
            snapshot: RwLock::new(Arc::new(RoutingSnapshot::new(own, family))),
            discovered: DiscoveredQueue::new(DISCOVERED_QUEUE_CAPACITY),
            state: Mutex::new(RebuildState::default()),
            mature_nodes,
        }
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    pub fn closest_nodes(&self, target: &NodeAddress, n: usize, now: Tick) -> Vec<RoutingNode> {
        self.snapshot().closest_nodes(target, n, now)
    }

    pub fn node_count(&self) -> usize {
        self.snapshot().len()
    }

    /// Connectivity state as of the last rebuild.
    pub fn is_mature(&self) -> bool {
        self.state.lock().mature
    }

    /// Queues an observation for the next rebuild.
    ///
    /// Returns false when the queue is full and the observation is dropped.
    pub fn observe(
        &self,
        address: NodeAddress,
        endpoint: NetworkAddress,
        latency: Option<u32>,
        kind: DiscoveryKind,
    ) -> bool {
        if address == self.own || endpoint.family() != Some(self.family) {
            return true;
        }
        self.discovered.push(DiscoveredNode {
            address,
            endpoint,
            latency,
            kind,
            bucket: bucket_index(&self.own, &address),
        })
    }

    pub fn pending(&self) -> usize {
        self.discovered.len()
    }

    /// Rebuilds if the rate limit allows.
    ///
    /// An empty table rebuilds every [`REBUILD_MIN_INTERVAL_TICKS`]; an
    /// immature table, or one serving an immature transaction (`busy`), every
    /// [`REBUILD_BUSY_INTERVAL_TICKS`]. Returns `None` when no rebuild ran,
    /// including when another thread is already rebuilding.
    pub fn refresh(&self, now: Tick, busy: bool) -> Option<RefreshOutcome> {
        let mut state = self.state.try_lock()?;
        let current = self.snapshot();

        let interval = if current.is_empty() {
            REBUILD_MIN_INTERVAL_TICKS
        } else if busy || !state.mature {
            REBUILD_BUSY_INTERVAL_TICKS
        } else {
            REBUILD_INTERVAL_TICKS
        };
        if let Some(last) = state.last_rebuild {
            if now.saturating_sub(last) < interval {
                return None;
            }
        }
        state.last_rebuild = Some(now);

        let discovered = self.discovered.drain();
        let mut next = current.rebuild(&discovered, now);
        let pings = next.schedule_pings(now, MAX_PINGS_PER_REBUILD);
        let mature = next.is_mature(now, self.mature_nodes);
        let count = next.len();
        *self.snapshot.write() = Arc::new(next);

        if !discovered.is_empty() {
            debug!(
                "Rebuilt {} routing table: {} discoveries, {} nodes",
                self.family,
                discovered.len(),
                count
            );
        }

        let connectivity = if mature != state.mature {
            state.mature = mature;
            info!(
                "{} routing table is now {}",
                self.family,
                if mature { "mature" } else { "immature" }
            );
            Some(mature)
        } else {
            None
        };

        Some(RefreshOutcome {
            pings,
            connectivity,
        })
    }

    pub fn bootstrap_list(&self, old: &[BootstrapEntry], now: Tick) -> Vec<BootstrapEntry> {
        self.snapshot().bootstrap_list(old, now)
    }
}
