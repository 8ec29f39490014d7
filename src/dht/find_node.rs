use parking_lot::Mutex;
use tracing::{debug, trace};

use super::address::NodeAddress;
use super::message::{CompactNode, Outbound, Query, TxnType};
use super::network::NetworkAddress;
use super::registry::TxnId;
use super::routing::RoutingNode;
use super::Tick;
use crate::constants::{
    DEFAULT_LATENCY_TICKS, FIND_MATURE_REFRESH_TICKS, FIND_REFRESH_FACTOR, FIND_REFRESH_MAX_TICKS,
    FIND_REFRESH_MIN_TICKS, MAX_MISSED_REPLIES, MAX_REPLY_TIMEOUT_TICKS, MIN_REPLY_TIMEOUT_TICKS,
    PROXIMITY_QUEUE_SIZE, REPLY_TIMEOUT_FACTOR,
};

/// How long to wait for a reply from a node with the given latency.
pub(crate) fn reply_timeout(latency: Option<u32>) -> Tick {
    let latency = latency.unwrap_or(DEFAULT_LATENCY_TICKS) as Tick;
    (latency * REPLY_TIMEOUT_FACTOR as Tick).clamp(MIN_REPLY_TIMEOUT_TICKS, MAX_REPLY_TIMEOUT_TICKS)
}

/// A node tracked by a proximity queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Candidate {
    pub address: NodeAddress,
    pub endpoint: NetworkAddress,
    pub latency: Option<u32>,
    pub last_sent: Option<Tick>,
    pub last_recv: Option<Tick>,
    pub missed: u8,
}

impl Candidate {
    pub(crate) fn new(address: NodeAddress, endpoint: NetworkAddress, latency: Option<u32>) -> Self {
        Self {
            address,
            endpoint,
            latency,
            last_sent: None,
            last_recv: None,
            missed: 0,
        }
    }

    /// A query is outstanding and its reply is overdue.
    pub(crate) fn is_overdue(&self, now: Tick) -> bool {
        match self.last_sent {
            Some(sent) => {
                self.last_recv.map_or(true, |r| r < sent)
                    && now.saturating_sub(sent) > reply_timeout(self.latency)
            }
            None => false,
        }
    }

    pub(crate) fn awaiting_reply(&self) -> bool {
        matches!((self.last_sent, self.last_recv), (Some(s), r) if r.map_or(true, |r| r < s))
    }
}

/// Bounded list of candidates kept sorted by distance to a target.
#[derive(Debug, Clone)]
pub(crate) struct ProximityQueue {
    target: NodeAddress,
    entries: Vec<Candidate>,
    capacity: usize,
}

impl ProximityQueue {
    pub(crate) fn new(target: NodeAddress, capacity: usize) -> Self {
        Self {
            target,
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Inserts in distance order. Fails for duplicates, and when the queue is
    /// full and `candidate` is no closer than the farthest entry.
    pub(crate) fn insert(&mut self, candidate: Candidate) -> bool {
        if self.contains(&candidate.address) {
            return false;
        }
        let pos = self.entries.partition_point(|e| {
            self.target.cmp_distance(&e.address, &candidate.address) == std::cmp::Ordering::Less
        });
        if pos >= self.capacity {
            return false;
        }
        self.entries.insert(pos, candidate);
        self.entries.truncate(self.capacity);
        true
    }

    pub(crate) fn contains(&self, address: &NodeAddress) -> bool {
        self.entries.iter().any(|e| e.address == *address)
    }

    pub(crate) fn get_mut(&mut self, address: &NodeAddress) -> Option<&mut Candidate> {
        self.entries.iter_mut().find(|e| e.address == *address)
    }

    pub(crate) fn remove(&mut self, address: &NodeAddress) -> Option<Candidate> {
        let pos = self.entries.iter().position(|e| e.address == *address)?;
        Some(self.entries.remove(pos))
    }

    pub(crate) fn retain(&mut self, f: impl FnMut(&Candidate) -> bool) {
        self.entries.retain(f);
    }

    pub(crate) fn closest(&self) -> Option<&Candidate> {
        self.entries.first()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.entries.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Candidate> {
        self.entries.iter_mut()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct FindState {
    /// Nodes that answered us.
    found: ProximityQueue,
    /// Nodes we were told about but have not heard from.
    potential: ProximityQueue,
    mature: bool,
}

/// Iterative lookup of one address.
///
/// Keeps the closest nodes that answered (`found`) and the closest ones we
/// were only told about (`potential`). Each tick re-queries whoever is due,
/// drops whoever stopped answering, and promotes potential nodes that reply.
/// The lookup is mature once the target itself answers; a plain lookup keeps
/// refreshing after that so churn of the target is noticed.
pub struct FindNodeProtocol {
    id: TxnId,
    target: NodeAddress,
    own: NodeAddress,
    state: Mutex<FindState>,
}

impl FindNodeProtocol {
    pub(crate) fn new(id: TxnId, target: NodeAddress, own: NodeAddress) -> Self {
        Self {
            id,
            target,
            own,
            state: Mutex::new(FindState {
                found: ProximityQueue::new(target, PROXIMITY_QUEUE_SIZE),
                potential: ProximityQueue::new(target, PROXIMITY_QUEUE_SIZE),
                mature: false,
            }),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn target(&self) -> &NodeAddress {
        &self.target
    }

    pub fn is_mature(&self) -> bool {
        self.state.lock().mature
    }

    /// XOR distance in bits from the target to the closest node that answered.
    pub fn closest_distance_bits(&self) -> Option<u32> {
        let state = self.state.lock();
        state
            .found
            .closest()
            .map(|c| c.address.distance_bits(&self.target))
    }

    /// Nodes that answered, nearest first.
    pub fn found_nodes(&self) -> Vec<CompactNode> {
        self.state
            .lock()
            .found
            .iter()
            .map(|c| CompactNode {
                address: c.address,
                endpoint: c.endpoint,
            })
            .collect()
    }

    fn refresh_interval(&self, candidate: &Candidate, mature: bool) -> Tick {
        if mature && candidate.address != self.target {
            return FIND_MATURE_REFRESH_TICKS;
        }
        let latency = candidate.latency.unwrap_or(DEFAULT_LATENCY_TICKS) as Tick;
        (latency * FIND_REFRESH_FACTOR as Tick).clamp(FIND_REFRESH_MIN_TICKS, FIND_REFRESH_MAX_TICKS)
    }

    fn query(&self, dest: NetworkAddress) -> Outbound {
        Outbound {
            dest,
            query: Query::find_node(self.own, self.target),
            txn_type: TxnType::FindNode,
            seq: self.id.raw(),
            droppable: false,
        }
    }

    /// Periodic work. `seeds` is asked for routing candidates only when both
    /// queues have run dry.
    pub(crate) fn tick(
        &self,
        now: Tick,
        seeds: impl FnOnce() -> Vec<RoutingNode>,
        out: &mut Vec<Outbound>,
    ) -> Option<bool> {
        let mut state = self.state.lock();

        if state.found.is_empty() && state.potential.is_empty() {
            for node in seeds() {
                if node.address != self.own {
                    state
                        .potential
                        .insert(Candidate::new(node.address, node.endpoint, node.latency));
                }
            }
        }

        let st = &mut *state;
        for queue in [&mut st.found, &mut st.potential] {
            for c in queue.iter_mut() {
                if c.is_overdue(now) {
                    c.missed = c.missed.saturating_add(1);
                    c.last_recv = None;
                    c.last_sent = None;
                }
            }
            queue.retain(|c| c.missed < MAX_MISSED_REPLIES);
        }

        let mature = state.mature;
        let mut sends = Vec::new();
        for c in state.found.iter_mut() {
            let due = c.last_sent.map_or(true, |s| {
                !c.awaiting_reply() && now.saturating_sub(s) >= self.refresh_interval(c, mature)
            });
            if due {
                c.last_sent = Some(now);
                sends.push(c.endpoint);
            }
        }
        for c in state.potential.iter_mut() {
            if c.last_sent.is_none() {
                c.last_sent = Some(now);
                sends.push(c.endpoint);
            }
        }
        for dest in sends {
            trace!("find_node {:?} -> {}", self.target, dest);
            out.push(self.query(dest));
        }

        self.update_maturity(&mut state)
    }

    /// A reply to one of our find_node queries.
    pub(crate) fn on_reply(
        &self,
        sender: NodeAddress,
        endpoint: NetworkAddress,
        latency: u32,
        nodes: &[&CompactNode],
        now: Tick,
        out: &mut Vec<Outbound>,
    ) -> Option<bool> {
        let mut state = self.state.lock();

        let promoted = state.potential.remove(&sender);
        match state.found.get_mut(&sender) {
            Some(c) => {
                c.endpoint = endpoint;
                c.latency = Some(latency);
                c.last_recv = Some(now);
                c.missed = 0;
            }
            None => {
                let mut c = promoted.unwrap_or_else(|| Candidate::new(sender, endpoint, None));
                c.endpoint = endpoint;
                c.latency = Some(latency);
                c.last_sent = c.last_sent.or(Some(now));
                c.last_recv = Some(now);
                c.missed = 0;
                state.found.insert(c);
            }
        }

        for node in nodes {
            if node.address == self.own
                || state.found.contains(&node.address)
                || state.potential.contains(&node.address)
            {
                continue;
            }
            let mut c = Candidate::new(node.address, node.endpoint, None);
            // Nodes at distance zero are queried straight away.
            if node.address == self.target {
                c.last_sent = Some(now);
                out.push(self.query(node.endpoint));
            }
            state.potential.insert(c);
        }

        self.update_maturity(&mut state)
    }

    fn update_maturity(&self, state: &mut FindState) -> Option<bool> {
        let mature = state
            .found
            .closest()
            .is_some_and(|c| c.address == self.target);
        if mature != state.mature {
            state.mature = mature;
            debug!(
                "find_node {:?} is now {}",
                self.target,
                if mature { "mature" } else { "searching" }
            );
            return Some(mature);
        }
        None
    }
}
