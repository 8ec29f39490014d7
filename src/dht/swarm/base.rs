use std::net::IpAddr;

use sha1::{Digest, Sha1};
use sha2::Sha256;
use tracing::{debug, info, trace, warn};

use super::output::OutputPeers;
use super::peer::{SwarmPeer, SwarmPeerView, SwarmRole};
use super::recent::RecentSet;
use crate::constants::{
    ANNOUNCE_FANOUT, ANNOUNCE_IMMATURE_TICKS, ANNOUNCE_INTERVAL_TICKS, BOOTSTRAP_LIST_LEN,
    DISCOVERY_FANOUT, DISCOVERY_INTERVAL_TICKS, MAX_REPLY_PEERS, RECENT_HOST_CAPACITY,
    RECENT_HOST_GC_TICKS, RECENT_HOST_TICKS, REJECT_TICKS, SWARM_CAPACITY_FACTOR,
    SWARM_SAVE_TICKS,
};
use crate::dht::address::NodeAddress;
use crate::dht::bootstrap::{BootstrapEntry, BootstrapStore};
use crate::dht::config::SwarmConfig;
use crate::dht::find_node::reply_timeout;
use crate::dht::message::{
    CompactPeer, NodeDescriptor, Outbound, Query, Reply, Token, TxnType, FLAG_FORWARD,
    FLAG_LEAVING, FLAG_MEMBER, FLAG_PRIVATE,
};
use crate::dht::network::{AddressFamily, CloakKey, CompactAddress, NetworkAddress};
use crate::dht::node_id_security::is_ip_restricted;
use crate::dht::registry::TxnId;
use crate::dht::routing::RoutingNode;
use crate::dht::Tick;

/// What a swarm needs from the engine that runs it.
pub(crate) trait SwarmHost {
    fn own_address(&self) -> NodeAddress;

    fn closest_nodes(&self, target: &NodeAddress, n: usize, now: Tick) -> Vec<RoutingNode>;

    fn seed_nodes(&self) -> &[NetworkAddress];

    fn bootstrap_store(&self) -> Option<&dyn BootstrapStore>;

    fn has_family(&self, family: AddressFamily) -> bool;

    /// Our address as others see it, per the public-IP vote.
    fn external_ip(&self, family: AddressFamily) -> Option<IpAddr>;

    /// Our externally observed endpoint in `family`, if known. Peers behind
    /// the same NAT see a different address than everyone else.
    fn alternate_address(&self, family: AddressFamily) -> NetworkAddress;

    fn descriptor(&self, flags: u16, swarm_size: u16) -> NodeDescriptor;
}

/// Membership changes, reported once the swarm lock is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SwarmEvent {
    Joined(NodeAddress, NetworkAddress),
    Dropped(NodeAddress),
    Changed(bool),
}

/// How a member answers a `get_peers`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ServeOutcome {
    /// Private-swarm check failed: no state change, no reply.
    Rejected,
    /// Leaving signal processed; nothing to answer.
    Silent,
    Serve {
        peers: Vec<CompactPeer>,
        wants_nodes: bool,
        psn: Option<u32>,
        private: bool,
    },
}

/// Private sequence number: a one-way function of the swarm secret and the
/// sender's external IP.
pub(crate) fn private_sequence_number(secret: &[u8; 32], ip: IpAddr) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    match ip {
        IpAddr::V4(v4) => hasher.update(v4.octets()),
        IpAddr::V6(v6) => hasher.update(v6.octets()),
    }
    let digest = hasher.finalize();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Byte-wise L1 distance between salted hashes of `target` and `peer`.
///
/// The salt is local and random, so a remote node cannot pick an address
/// that ranks well here.
pub(crate) fn secure_distance(salt: &[u8; 20], target: &NodeAddress, peer: &NodeAddress) -> u32 {
    let digest = |a: &NodeAddress| {
        let mut hasher = Sha1::new();
        hasher.update(a.as_bytes());
        hasher.update(salt);
        hasher.finalize()
    };
    let (t, p) = (digest(target), digest(peer));
    t.iter()
        .zip(p.iter())
        .map(|(a, b)| (*a as i32 - *b as i32).unsigned_abs())
        .sum()
}

/// A contact with a swarm peer, from a query it sent or a reply to ours.
#[derive(Debug, Clone)]
pub(crate) struct Contact {
    pub address: NodeAddress,
    pub endpoint: NetworkAddress,
    pub alternate: NetworkAddress,
    pub role: SwarmRole,
    /// Measured round trip, for replies.
    pub latency: Option<u32>,
    pub is_query: bool,
    pub announced: bool,
    pub token: Option<Token>,
}

impl Contact {
    pub(crate) fn new(address: NodeAddress, endpoint: NetworkAddress, role: SwarmRole) -> Self {
        Self {
            address,
            endpoint,
            alternate: NetworkAddress::Empty,
            role,
            latency: None,
            is_query: false,
            announced: false,
            token: None,
        }
    }
}

/// State and machinery shared by both swarm flavors.
pub(crate) struct SwarmCore {
    pub id: TxnId,
    pub target: NodeAddress,
    pub txn_type: TxnType,
    pub config: SwarmConfig,
    pub cloak: CloakKey,
    pub salt: [u8; 20],
    pub peers: Vec<SwarmPeer>,
    pub recent: RecentSet<NetworkAddress>,
    pub rejected: RecentSet<NodeAddress>,
    pub mature: bool,
    pub last_discovery: Option<Tick>,
    pub last_announce: Option<Tick>,
    pub last_save: Tick,
    pub last_gc: Tick,
    /// Loaded lazily on the first discovery pass.
    pub bootstrap: Option<Vec<BootstrapEntry>>,
    pub events: Vec<SwarmEvent>,
    pub dirty: bool,
}

impl SwarmCore {
    pub(crate) fn new(
        id: TxnId,
        target: NodeAddress,
        txn_type: TxnType,
        config: SwarmConfig,
        now: Tick,
    ) -> Self {
        let cloak = CloakKey::derive(&target, config.secret.as_ref());
        Self {
            id,
            target,
            txn_type,
            cloak,
            salt: rand::random(),
            config,
            peers: Vec::new(),
            recent: RecentSet::new(RECENT_HOST_CAPACITY, RECENT_HOST_TICKS),
            rejected: RecentSet::new(RECENT_HOST_CAPACITY, REJECT_TICKS),
            mature: false,
            last_discovery: None,
            last_announce: None,
            last_save: now,
            last_gc: now,
            bootstrap: None,
            events: Vec::new(),
            dirty: true,
        }
    }

    pub(crate) fn expected(&self) -> usize {
        self.config.expected_size.max(1)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.expected() * SWARM_CAPACITY_FACTOR
    }

    pub(crate) fn is_private(&self) -> bool {
        self.config.secret.is_some()
    }

    /// The sequence number we attach when talking from `family`.
    pub(crate) fn own_psn(&self, host: &dyn SwarmHost, family: AddressFamily) -> Option<u32> {
        let secret = self.config.secret.as_ref()?;
        host.external_ip(family)
            .map(|ip| private_sequence_number(secret, ip))
    }

    /// Checks a packet's sequence number against its source address.
    /// Public swarms accept everything.
    pub(crate) fn check_private(&self, psn: Option<u32>, from: &NetworkAddress) -> bool {
        let Some(secret) = self.config.secret.as_ref() else {
            return true;
        };
        match (psn, from.ip()) {
            (Some(psn), Some(ip)) => psn == private_sequence_number(secret, ip),
            _ => false,
        }
    }

    pub(crate) fn decloak(&self, cloaked: Option<&CompactAddress>) -> NetworkAddress {
        cloaked
            .and_then(|c| self.cloak.decloak(c.as_slice()).ok())
            .unwrap_or_default()
    }

    fn cloaked_alternate(&self, host: &dyn SwarmHost, family: AddressFamily) -> Option<CompactAddress> {
        let alternate = host.alternate_address(family);
        if alternate.family() != Some(family) {
            return None;
        }
        let mut out = CompactAddress::new(family);
        self.cloak.cloak(&alternate, family, out.as_mut_slice());
        Some(out)
    }

    fn descriptor(&self, host: &dyn SwarmHost, extra: u16) -> NodeDescriptor {
        let mut flags = FLAG_MEMBER | extra;
        if self.is_private() {
            flags |= FLAG_PRIVATE;
        }
        host.descriptor(flags, self.expected().min(u16::MAX as usize) as u16)
    }

    /// A member `get_peers` toward `dest`.
    pub(crate) fn query(&self, dest: NetworkAddress, extra_flags: u16, host: &dyn SwarmHost) -> Option<Outbound> {
        let family = dest.family()?;
        if !host.has_family(family) {
            return None;
        }
        let query = Query::get_peers(host.own_address(), self.target)
            .with_descriptor(self.descriptor(host, extra_flags))
            .with_psn(self.own_psn(host, family))
            .with_cloaked(self.cloaked_alternate(host, family));
        Some(Outbound {
            dest,
            query,
            txn_type: self.txn_type,
            seq: self.id.raw(),
            droppable: extra_flags & FLAG_LEAVING != 0,
        })
    }

    pub(crate) fn announce(&self, dest: NetworkAddress, token: Token, host: &dyn SwarmHost) -> Option<Outbound> {
        let family = dest.family()?;
        let descriptor = self.descriptor(host, 0);
        let query = Query::announce_peer(host.own_address(), self.target, token, descriptor.udp_port)
            .with_descriptor(descriptor)
            .with_psn(self.own_psn(host, family))
            .with_cloaked(self.cloaked_alternate(host, family));
        Some(Outbound {
            dest,
            query,
            txn_type: self.txn_type,
            seq: self.id.raw(),
            droppable: false,
        })
    }

    fn push_query(&mut self, dest: NetworkAddress, host: &dyn SwarmHost, out: &mut Vec<Outbound>) -> bool {
        match self.query(dest, 0, host) {
            Some(q) => {
                out.push(q);
                true
            }
            None => false,
        }
    }

    /// Records a contact with a peer in `contact.role`.
    ///
    /// Returns false when the contact was refused (rejected peer, or no room).
    pub(crate) fn on_contact(&mut self, contact: Contact, now: Tick) -> bool {
        if contact.endpoint.is_empty() {
            return false;
        }
        if self.rejected.contains(&contact.address, now) {
            trace!("Swarm {:?} ignores rejected peer {:?}", self.target, contact.address);
            return false;
        }

        let verified = contact
            .endpoint
            .ip()
            .is_some_and(|ip| is_ip_restricted(&contact.address, ip));
        let family = contact.endpoint.family();

        if let Some(peer) = self.peers.iter_mut().find(|p| {
            p.role == contact.role && p.address == contact.address && p.endpoint == contact.endpoint
        }) {
            Self::refresh(peer, &contact, now);
            self.dirty = true;
            return true;
        }

        let insecure = self.peers.iter().position(|p| {
            p.role == contact.role
                && p.address == contact.address
                && p.endpoint.family() == family
                && !p.verified
        });
        if let (true, Some(i)) = (verified, insecure) {
            debug!(
                "Swarm {:?}: verified {:?} at {} replaces {}",
                self.target, contact.address, contact.endpoint, self.peers[i].endpoint
            );
            let mut peer = SwarmPeer::new(contact.address, contact.endpoint, contact.role, true, now);
            Self::refresh(&mut peer, &contact, now);
            self.peers[i] = peer;
            let mut index = 0;
            self.peers.retain(|p| {
                let keep = index == i
                    || !(p.role == contact.role
                        && p.address == contact.address
                        && p.endpoint.family() == family
                        && !p.verified);
                index += 1;
                keep
            });
            self.dirty = true;
            return true;
        }

        if self.peers.len() >= self.capacity() {
            return false;
        }

        let mut peer = SwarmPeer::new(contact.address, contact.endpoint, contact.role, verified, now);
        Self::refresh(&mut peer, &contact, now);
        debug!(
            "Swarm {:?} added {:?} peer {:?} at {}",
            self.target, contact.role, contact.address, contact.endpoint
        );
        self.events
            .push(SwarmEvent::Joined(contact.address, contact.endpoint));
        self.peers.push(peer);
        self.dirty = true;
        true
    }

    fn refresh(peer: &mut SwarmPeer, contact: &Contact, now: Tick) {
        match contact.latency {
            Some(latency) => peer.record_reply(now, latency),
            None => peer.last_recv = now,
        }
        if contact.is_query {
            peer.last_query_recv = Some(now);
        }
        if contact.announced {
            peer.announced = true;
        }
        if !contact.alternate.is_empty() {
            peer.alternate = contact.alternate;
        }
        if contact.token.is_some() {
            peer.token = contact.token;
        }
    }

    /// Removes peers matching `pred`, optionally rejecting them for a while.
    pub(crate) fn drop_where(&mut self, now: Tick, reject: bool, mut pred: impl FnMut(&SwarmPeer) -> bool) -> usize {
        let before = self.peers.len();
        let mut dropped = Vec::new();
        self.peers.retain(|p| {
            if pred(p) {
                dropped.push(p.address);
                false
            } else {
                true
            }
        });
        for address in &dropped {
            if reject {
                self.rejected.insert(*address, now);
            }
            if !self.peers.iter().any(|p| p.address == *address) {
                self.events.push(SwarmEvent::Dropped(*address));
            }
        }
        if !dropped.is_empty() {
            self.dirty = true;
        }
        before - self.peers.len()
    }

    /// A peer said it is leaving.
    ///
    /// The FORWARD flag says which of our roles the sender held: it treated
    /// us as forward, so it was our backward peer, and vice versa. That role
    /// is removed outright; the other role only if its stored endpoint is the
    /// one the signal came from.
    pub(crate) fn on_leaving(&mut self, sender: NodeAddress, from: NetworkAddress, sender_forward: bool, now: Tick) {
        let signalled = if sender_forward {
            SwarmRole::Backward
        } else {
            SwarmRole::Forward
        };
        let removed = self.drop_where(now, false, |p| {
            p.address == sender
                && (p.role == signalled || p.role == SwarmRole::Flat || p.endpoint == from)
        });
        if removed > 0 {
            info!("Swarm {:?}: peer {:?} left", self.target, sender);
        }
    }

    /// Marks peers whose outstanding query went unanswered.
    pub(crate) fn expire_queries(&mut self, now: Tick, role: SwarmRole) {
        for peer in self.peers.iter_mut().filter(|p| p.role == role) {
            if let Some(sent) = peer.last_sent {
                if peer.last_recv < sent && now.saturating_sub(sent) > reply_timeout(peer.latency) {
                    peer.missed = peer.missed.saturating_add(1);
                    peer.last_sent = None;
                    self.dirty = true;
                }
            }
        }
    }

    /// Queries every peer in `role` whose refresh interval elapsed.
    pub(crate) fn refresh_peers(
        &mut self,
        now: Tick,
        role: SwarmRole,
        flags: u16,
        host: &dyn SwarmHost,
        out: &mut Vec<Outbound>,
    ) {
        let mut due = Vec::new();
        for peer in self.peers.iter_mut().filter(|p| p.role == role) {
            let waiting = peer.last_sent.is_some_and(|s| peer.last_recv < s);
            let elapsed = peer
                .last_sent
                .map_or(true, |s| now.saturating_sub(s) >= peer.refresh_interval());
            if !waiting && elapsed {
                peer.last_sent = Some(now);
                due.push(peer.endpoint);
            }
        }
        for dest in due {
            if let Some(q) = self.query(dest, flags, host) {
                out.push(q);
            }
        }
    }

    /// Contacts new hosts while the swarm is short of peers: the persisted
    /// bootstrap list, then the routing table's nodes closest to the target,
    /// and the built-in seeds only when neither yielded anyone.
    pub(crate) fn discover(&mut self, now: Tick, host: &dyn SwarmHost, out: &mut Vec<Outbound>) {
        if self
            .last_discovery
            .is_some_and(|t| now.saturating_sub(t) < DISCOVERY_INTERVAL_TICKS)
        {
            return;
        }
        self.last_discovery = Some(now);

        if self.bootstrap.is_none() {
            let loaded = match host.bootstrap_store() {
                Some(store) if self.config.persist => {
                    let name = self.config.bootstrap_name(&self.target);
                    store.load(&name).unwrap_or_else(|e| {
                        warn!("Failed to load bootstrap list {}: {}", name, e);
                        Vec::new()
                    })
                }
                _ => Vec::new(),
            };
            if !loaded.is_empty() {
                debug!("Swarm {:?} loaded {} bootstrap entries", self.target, loaded.len());
            }
            self.bootstrap = Some(loaded);
        }

        let mut budget = DISCOVERY_FANOUT;
        let entries: Vec<NetworkAddress> = self
            .bootstrap
            .iter()
            .flatten()
            .flat_map(|e| [e.address, e.alternate])
            .filter(|a| !a.is_empty())
            .collect();
        for address in entries {
            if budget == 0 {
                break;
            }
            if self.recent.admit(address, now) && self.push_query(address, host, out) {
                budget -= 1;
            }
        }

        for node in host.closest_nodes(&self.target, DISCOVERY_FANOUT, now) {
            if budget == 0 {
                break;
            }
            if self.recent.admit(node.endpoint, now) && self.push_query(node.endpoint, host, out) {
                budget -= 1;
            }
        }

        if budget == DISCOVERY_FANOUT {
            let seeds = host.seed_nodes().to_vec();
            for seed in seeds {
                if budget == 0 {
                    break;
                }
                if self.recent.admit(seed, now) && self.push_query(seed, host, out) {
                    budget -= 1;
                }
            }
        }
    }

    /// Periodically queries the nodes closest to the target so that they
    /// hand out tokens, which we answer with an announcement.
    pub(crate) fn announce_cycle(&mut self, now: Tick, host: &dyn SwarmHost, out: &mut Vec<Outbound>) {
        let interval = if self.mature {
            ANNOUNCE_INTERVAL_TICKS
        } else {
            ANNOUNCE_IMMATURE_TICKS
        };
        if self
            .last_announce
            .is_some_and(|t| now.saturating_sub(t) < interval)
        {
            return;
        }
        self.last_announce = Some(now);

        for node in host.closest_nodes(&self.target, ANNOUNCE_FANOUT, now) {
            self.push_query(node.endpoint, host, out);
        }
    }

    /// Follows up a reply's relayed peers and, while short of peers, its nodes.
    pub(crate) fn follow_reply(&mut self, reply: &Reply, now: Tick, host: &dyn SwarmHost, out: &mut Vec<Outbound>, short: bool) {
        let own = host.own_address();
        let mut budget = DISCOVERY_FANOUT;
        for peer in reply.all_peers() {
            if budget == 0 {
                break;
            }
            if peer.address == own || self.peers.iter().any(|p| p.address == peer.address) {
                continue;
            }
            if self.recent.admit(peer.endpoint, now) && self.push_query(peer.endpoint, host, out) {
                budget -= 1;
            }
        }
        if !short {
            return;
        }
        for node in reply.all_nodes() {
            if budget == 0 {
                break;
            }
            if node.address == own {
                continue;
            }
            if self.recent.admit(node.endpoint, now) && self.push_query(node.endpoint, host, out) {
                budget -= 1;
            }
        }
    }

    /// Good peers other than `requester`, as relayed to a third party.
    pub(crate) fn serve_peers(&self, requester: &NodeAddress, now: Tick) -> Vec<CompactPeer> {
        let mut v4 = 0;
        let mut v6 = 0;
        let mut peers = Vec::new();
        for peer in self.peers.iter().filter(|p| p.is_good(now) && p.address != *requester) {
            let Some(family) = peer.endpoint.family() else {
                continue;
            };
            let count = match family {
                AddressFamily::V4 => &mut v4,
                AddressFamily::V6 => &mut v6,
            };
            if *count >= MAX_REPLY_PEERS || peers.iter().any(|p: &CompactPeer| p.address == peer.address && p.endpoint.family() == Some(family)) {
                continue;
            }
            *count += 1;
            let mut cloaked_alternate = CompactAddress::new(family);
            if peer.alternate.family() == Some(family) {
                self.cloak
                    .cloak(&peer.alternate, family, cloaked_alternate.as_mut_slice());
            }
            peers.push(CompactPeer {
                address: peer.address,
                endpoint: peer.endpoint,
                cloaked_alternate,
            });
        }
        peers
    }

    pub(crate) fn serve(&self, requester: &NodeAddress, from: &NetworkAddress, now: Tick, host: &dyn SwarmHost, good: usize) -> ServeOutcome {
        let psn = from.family().and_then(|f| self.own_psn(host, f));
        ServeOutcome::Serve {
            peers: self.serve_peers(requester, now),
            wants_nodes: good < self.expected(),
            psn,
            private: self.is_private(),
        }
    }

    /// Records the new maturity and queues a change event if it flipped.
    pub(crate) fn set_mature(&mut self, mature: bool) {
        if mature != self.mature {
            self.mature = mature;
            info!(
                "Swarm {:?} is now {}",
                self.target,
                if mature { "mature" } else { "immature" }
            );
            self.events.push(SwarmEvent::Changed(mature));
        }
    }

    pub(crate) fn collect_garbage(&mut self, now: Tick) {
        if now.saturating_sub(self.last_gc) < RECENT_HOST_GC_TICKS {
            return;
        }
        self.last_gc = now;
        self.recent.collect_garbage(now);
        self.rejected.collect_garbage(now);
    }

    /// Persists the good peers, merged with what was loaded.
    pub(crate) fn save(&mut self, now: Tick, host: &dyn SwarmHost, force: bool) {
        if !self.config.persist || (!force && now.saturating_sub(self.last_save) < SWARM_SAVE_TICKS) {
            return;
        }
        self.last_save = now;
        let Some(store) = host.bootstrap_store() else {
            return;
        };

        let mut entries: Vec<BootstrapEntry> = Vec::new();
        for peer in self.peers.iter().filter(|p| p.is_good(now)) {
            if !entries.iter().any(|e| e.address == peer.endpoint) {
                entries.push(BootstrapEntry::with_alternate(peer.endpoint, peer.alternate));
            }
        }
        for entry in self.bootstrap.iter().flatten() {
            if entries.len() >= BOOTSTRAP_LIST_LEN {
                break;
            }
            if !entries.iter().any(|e| e.address == entry.address) {
                entries.push(*entry);
            }
        }
        entries.truncate(BOOTSTRAP_LIST_LEN);
        if entries.is_empty() {
            return;
        }

        let name = self.config.bootstrap_name(&self.target);
        if let Err(e) = store.save(&name, &entries) {
            warn!("Failed to save bootstrap list {}: {}", name, e);
        }
    }

    /// Sends the leaving signal to every peer and forgets them.
    pub(crate) fn leave(&mut self, now: Tick, host: &dyn SwarmHost, out: &mut Vec<Outbound>) {
        self.save(now, host, true);
        let targets: Vec<(NetworkAddress, u16)> = self
            .peers
            .iter()
            .map(|p| {
                let flags = if p.role == SwarmRole::Forward {
                    FLAG_LEAVING | FLAG_FORWARD
                } else {
                    FLAG_LEAVING
                };
                (p.endpoint, flags)
            })
            .collect();
        for (dest, flags) in targets {
            if let Some(q) = self.query(dest, flags, host) {
                out.push(q);
            }
        }
        self.drop_where(now, false, |_| true);
        self.set_mature(false);
    }

    pub(crate) fn publish(&mut self, output: &OutputPeers, now: Tick) {
        // Liveness also lapses with time alone.
        let good = self.peers.iter().filter(|p| p.is_good(now)).count();
        if self.dirty || good != output.current().len() {
            self.dirty = false;
            output.mark_dirty();
        }
        let peers = &self.peers;
        output.publish(|views: &mut Vec<SwarmPeerView>| {
            views.extend(peers.iter().filter(|p| p.is_good(now)).map(|p| p.view()));
        });
    }

    pub(crate) fn take_events(&mut self) -> Vec<SwarmEvent> {
        std::mem::take(&mut self.events)
    }
}
