use std::net::{IpAddr, SocketAddr};
use std::ops::BitOr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use sha1::{Digest, Sha1};
use tracing::{debug, info, trace, warn};

use super::address::NodeAddress;
use super::announce_store::AnnounceStore;
use super::bootstrap::BootstrapStore;
use super::config::{DhtConfig, SwarmConfig};
use super::discovered::DiscoveryKind;
use super::error::DhtError;
use super::events::{DhtEvents, NoopEvents};
use super::find_node::FindNodeProtocol;
use super::message::{
    decode, encode_error, encode_query, encode_reply, Body, CompactNode, CompactPeer,
    NodeDescriptor, Outbound, Query, Reply, Tid, Token, TransactionInfo, TxnType, Verb,
    FLAG_FIREWALLED, FLAG_LEAVING, FLAG_MEMBER, FLAG_PRIVATE,
};
use super::network::{AddressFamily, CompactAddress, NetworkAddress};
use super::node_id_security::is_ip_restricted;
use super::obfuscate::{deobfuscate, obfuscate, random_seed};
use super::public_ip::{PublicIpVotes, RttSample, RttSamples};
use super::registry::{PeerRegistry, TxnId};
use super::routing::{RoutingNode, RoutingTable};
use super::stats::DhtStats;
use super::swarm::{
    ConnSwarm, JoinSwarm, ServeOutcome, SwarmEvent, SwarmHost, SwarmPeerView, SwarmProtocol,
};
use super::template::MessageTemplate;
use super::Tick;
use crate::constants::{
    ANNOUNCE_SECRET_ROTATION_TICKS, BOOTSTRAP_SAVE_TICKS, ERROR_INVALID_TOKEN, FIND_SELF_FANOUT,
    FIND_SELF_IMMATURE_TICKS, FIND_SELF_INTERVAL_TICKS, MAX_PACKET_SIZE, MAX_REPLY_NODES,
    MAX_REPLY_PEERS, PROTOCOL_VERSION, PROXIMITY_QUEUE_SIZE, RECENT_HOST_GC_TICKS,
    REGISTRY_GC_TICKS, SEED_RETRY_TICKS, TOKEN_ROTATION_TICKS,
};

/// Per-send flags handed to the [`Transport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendFlags(u8);

impl SendFlags {
    pub const NONE: SendFlags = SendFlags(0);
    /// Fire and forget; the transport must not queue or retry.
    pub const DROPPABLE: SendFlags = SendFlags(1);
    /// The header was obfuscated.
    pub const OBFUSCATE: SendFlags = SendFlags(2);

    pub fn contains(self, other: SendFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for SendFlags {
    type Output = SendFlags;

    fn bitor(self, rhs: SendFlags) -> SendFlags {
        SendFlags(self.0 | rhs.0)
    }
}

/// Where outbound datagrams go. The engine never owns a socket.
pub trait Transport: Send + Sync {
    /// Returns false if the datagram could not be handed to the network.
    fn send(&self, buf: &[u8], dest: SocketAddr, flags: SendFlags) -> bool;
}

/// Two random bytes stamped into every transaction id; replies echoing
/// neither the current nor the previous value are spoofed.
struct SpoofTokens {
    current: [u8; 2],
    previous: [u8; 2],
    rotated_at: Tick,
}

/// Secrets behind announce tokens, as in BEP-5.
struct TokenSecrets {
    current: [u8; 16],
    previous: [u8; 16],
    rotated_at: Tick,
}

impl TokenSecrets {
    fn new() -> Self {
        Self {
            current: rand::random(),
            previous: rand::random(),
            rotated_at: 0,
        }
    }

    fn rotate(&mut self, now: Tick) {
        self.previous = self.current;
        self.current = rand::random();
        self.rotated_at = now;
    }
}

fn announce_token(secret: &[u8; 16], ip: IpAddr) -> Option<Token> {
    let mut hasher = Sha1::new();
    hasher.update(secret);
    match ip {
        IpAddr::V4(v4) => hasher.update(v4.octets()),
        IpAddr::V6(v6) => hasher.update(v6.octets()),
    }
    let digest = hasher.finalize();
    Token::from_slice(&digest[..8])
}

struct Templates {
    ping: Option<MessageTemplate>,
    find_self: Option<MessageTemplate>,
}

#[derive(Clone, Copy)]
enum Canned {
    Ping,
    FindSelf,
}

#[derive(Default)]
struct Timers {
    loaded_bootstrap: bool,
    last_find_self: [Option<Tick>; 2],
    last_seed: [Option<Tick>; 2],
    last_save: Tick,
    last_registry_gc: Tick,
    last_store_gc: Tick,
}

type Packet = [u8; MAX_PACKET_SIZE + 1];

/// The DHT core: routing tables, transactions and packet handling.
///
/// Driven entirely from outside: [`tick`](Self::tick) advances the clock and
/// runs periodic work, [`handle_packet`](Self::handle_packet) feeds inbound
/// datagrams. Both may be called from any thread; transactions serialize
/// their own state behind their own locks.
pub struct DhtEngine {
    config: DhtConfig,
    own: NodeAddress,
    transport: Arc<dyn Transport>,
    stats: Arc<DhtStats>,
    events: Arc<dyn DhtEvents>,
    bootstrap_store: Option<Arc<dyn BootstrapStore>>,
    tables: Vec<RoutingTable>,
    announce_store: AnnounceStore,
    public_ip: PublicIpVotes,
    rtt: RttSamples,
    spoof: RwLock<SpoofTokens>,
    secrets: RwLock<TokenSecrets>,
    templates: Mutex<Templates>,
    timers: Mutex<Timers>,
    /// Serializes transaction creation across the three registries.
    creating: Mutex<()>,
    finds: PeerRegistry<FindNodeProtocol>,
    joins: PeerRegistry<JoinSwarm>,
    conns: PeerRegistry<ConnSwarm>,
}

impl DhtEngine {
    pub fn new(config: DhtConfig, transport: Arc<dyn Transport>) -> Self {
        let own = config.node_address.unwrap_or_else(NodeAddress::generate);
        let mut tables: Vec<RoutingTable> = Vec::new();
        for family in AddressFamily::ALL {
            if config.has_family(family) {
                tables.push(RoutingTable::new(own, family, config.routing_mature_nodes));
            }
        }

        let template = |query: Query| match MessageTemplate::new(&query, TxnType::Routing) {
            Ok(t) => Some(t),
            Err(e) => {
                warn!("Failed to precompute {:?} message: {}", query.verb, e);
                None
            }
        };
        let templates = Templates {
            ping: template(Query::ping(own)),
            find_self: template(Query::find_node(own, own)),
        };

        info!(
            "DHT engine created with id {} ({} families)",
            own,
            tables.len()
        );

        Self {
            own,
            transport,
            stats: DhtStats::new(),
            events: Arc::new(NoopEvents),
            bootstrap_store: None,
            tables,
            announce_store: AnnounceStore::new(),
            public_ip: PublicIpVotes::new(),
            rtt: RttSamples::new(),
            spoof: RwLock::new(SpoofTokens {
                current: rand::random(),
                previous: rand::random(),
                rotated_at: 0,
            }),
            secrets: RwLock::new(TokenSecrets::new()),
            templates: Mutex::new(templates),
            timers: Mutex::new(Timers::default()),
            creating: Mutex::new(()),
            finds: PeerRegistry::new(),
            joins: PeerRegistry::new(),
            conns: PeerRegistry::new(),
            config,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn DhtEvents>) -> Self {
        self.events = events;
        self
    }

    pub fn with_bootstrap_store(mut self, store: Arc<dyn BootstrapStore>) -> Self {
        self.bootstrap_store = Some(store);
        self
    }

    pub fn with_stats(mut self, stats: Arc<DhtStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn own_address(&self) -> &NodeAddress {
        &self.own
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<DhtStats> {
        &self.stats
    }

    pub fn routing_table(&self, family: AddressFamily) -> Option<&RoutingTable> {
        self.tables.iter().find(|t| t.family() == family)
    }

    pub fn announce_store(&self) -> &AnnounceStore {
        &self.announce_store
    }

    pub fn public_ip(&self) -> &PublicIpVotes {
        &self.public_ip
    }

    pub fn rtt_samples(&self) -> &RttSamples {
        &self.rtt
    }

    /// Pins our external address instead of trusting votes.
    pub fn set_external_address(&self, ip: IpAddr) {
        self.public_ip.set_external(ip);
    }

    pub fn external_address(&self, family: AddressFamily) -> Option<IpAddr> {
        self.public_ip.external_ip(family)
    }

    /// Pings `endpoint`; it enters the routing table once it answers.
    ///
    /// Returns whether the transport took the ping.
    pub fn add_node(&self, endpoint: NetworkAddress, now: Tick) -> Result<bool, DhtError> {
        let family = endpoint
            .family()
            .ok_or_else(|| DhtError::InvalidAddress(endpoint.to_string()))?;
        if self.routing_table(family).is_none() {
            return Err(DhtError::FamilyDisabled);
        }
        Ok(self.send_outbound(
            Outbound {
                dest: endpoint,
                query: Query::ping(self.own),
                txn_type: TxnType::Routing,
                seq: 0,
                droppable: true,
            },
            now,
        ))
    }

    /// Nodes closest to `target` across every family, nearest first.
    pub fn closest_nodes(&self, target: &NodeAddress, n: usize, now: Tick) -> Vec<RoutingNode> {
        let mut nodes: Vec<RoutingNode> = self
            .tables
            .iter()
            .flat_map(|t| t.closest_nodes(target, n, now))
            .collect();
        nodes.sort_by(|a, b| target.cmp_distance(&a.address, &b.address));
        nodes.truncate(n);
        nodes
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    fn target_busy(&self, target: &NodeAddress, except: TxnType) -> bool {
        (except != TxnType::FindNode && self.finds.by_target(target).is_some())
            || (except != TxnType::JoinSwarm && self.joins.by_target(target).is_some())
            || (except != TxnType::ConnSwarm && self.conns.by_target(target).is_some())
    }

    /// Starts (or returns the running) lookup of `target`.
    pub fn find_node(&self, target: NodeAddress, now: Tick) -> Result<TxnId, DhtError> {
        let _guard = self.creating.lock();
        if self.target_busy(&target, TxnType::FindNode) {
            return Err(DhtError::TargetBusy);
        }
        let (id, lookup, created) = self
            .finds
            .get_or_create(target, |id| FindNodeProtocol::new(id, target, self.own))?;
        if created {
            debug!("Started find_node {:?} as {:?}", target, id);
            let mut out = Vec::new();
            lookup.tick(now, || self.closest_nodes(&target, PROXIMITY_QUEUE_SIZE, now), &mut out);
            self.send_all(out, now);
        }
        Ok(id)
    }

    pub fn lookup(&self, target: &NodeAddress) -> Option<Arc<FindNodeProtocol>> {
        self.finds.by_target(target).map(|(_, lookup)| lookup)
    }

    pub fn stop_find_node(&self, target: &NodeAddress, now: Tick) -> bool {
        match self.finds.by_target(target) {
            Some((id, _)) => self.finds.remove(id, now).is_some(),
            None => false,
        }
    }

    /// Joins the swarm around `target` with forward and backward peers.
    pub fn join_swarm(&self, target: NodeAddress, config: SwarmConfig, now: Tick) -> Result<TxnId, DhtError> {
        let _guard = self.creating.lock();
        if self.target_busy(&target, TxnType::JoinSwarm) {
            return Err(DhtError::TargetBusy);
        }
        let (id, swarm, created) = self
            .joins
            .get_or_create(target, |id| JoinSwarm::new(id, target, self.own, config, now))?;
        if created {
            info!("Joined swarm {:?} as {:?}", target, id);
            self.drive_swarm(&*swarm, now);
        }
        Ok(id)
    }

    /// Joins the swarm around `target` for connectivity only.
    pub fn conn_swarm(&self, target: NodeAddress, config: SwarmConfig, now: Tick) -> Result<TxnId, DhtError> {
        let _guard = self.creating.lock();
        if self.target_busy(&target, TxnType::ConnSwarm) {
            return Err(DhtError::TargetBusy);
        }
        let (id, swarm, created) = self
            .conns
            .get_or_create(target, |id| ConnSwarm::new(id, target, config, now))?;
        if created {
            info!("Connecting to swarm {:?} as {:?}", target, id);
            self.drive_swarm(&*swarm, now);
        }
        Ok(id)
    }

    /// Leaves the swarm around `target`, telling every peer.
    pub fn stop_swarm(&self, target: &NodeAddress, now: Tick) -> bool {
        let Some(swarm) = self.swarm_for(target) else {
            return false;
        };
        let mut out = Vec::new();
        let events = swarm.stop(now, self, &mut out);
        let removed = match self.joins.by_target(target) {
            Some((id, _)) => self.joins.remove(id, now).is_some(),
            None => match self.conns.by_target(target) {
                Some((id, _)) => self.conns.remove(id, now).is_some(),
                None => false,
            },
        };
        self.emit(target, events);
        self.send_all(out, now);
        info!("Left swarm {:?}", target);
        removed
    }

    /// Live peers of the swarm around `target`; empty when not a member.
    pub fn swarm_peers(&self, target: &NodeAddress) -> Arc<Vec<SwarmPeerView>> {
        self.swarm_for(target)
            .map(|s| s.peers())
            .unwrap_or_default()
    }

    pub fn is_swarm_mature(&self, target: &NodeAddress) -> bool {
        self.swarm_for(target).is_some_and(|s| s.is_mature())
    }

    fn swarm_for(&self, target: &NodeAddress) -> Option<Arc<dyn SwarmProtocol>> {
        if let Some((_, swarm)) = self.joins.by_target(target) {
            let swarm: Arc<dyn SwarmProtocol> = swarm;
            return Some(swarm);
        }
        self.conns.by_target(target).map(|(_, swarm)| {
            let swarm: Arc<dyn SwarmProtocol> = swarm;
            swarm
        })
    }

    fn swarm_by_id(&self, txn_type: TxnType, id: TxnId) -> Option<Arc<dyn SwarmProtocol>> {
        match txn_type {
            TxnType::JoinSwarm => self.joins.by_id(id).map(|s| {
                let s: Arc<dyn SwarmProtocol> = s;
                s
            }),
            TxnType::ConnSwarm => self.conns.by_id(id).map(|s| {
                let s: Arc<dyn SwarmProtocol> = s;
                s
            }),
            _ => None,
        }
    }

    fn drive_swarm(&self, swarm: &dyn SwarmProtocol, now: Tick) {
        let mut out = Vec::new();
        let events = swarm.tick(now, self, &mut out);
        self.emit(swarm.target(), events);
        self.send_all(out, now);
    }

    fn emit(&self, target: &NodeAddress, events: Vec<SwarmEvent>) {
        for event in events {
            match event {
                SwarmEvent::Joined(peer, addr) => self.events.on_peer_joined(target, &peer, &addr),
                SwarmEvent::Dropped(peer) => self.events.on_peer_dropped(target, &peer),
                SwarmEvent::Changed(mature) => self.events.on_swarm_changed(target, mature),
            }
        }
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    /// Runs every periodic task due at `now`.
    pub fn tick(&self, now: Tick) {
        self.rotate_secrets(now);
        self.refresh_templates(now);
        self.load_bootstrap(now);

        let busy = self.finds.all().iter().any(|(_, f)| !f.is_mature())
            || self.joins.all().iter().any(|(_, s)| !s.is_mature())
            || self.conns.all().iter().any(|(_, s)| !s.is_mature());

        for table in &self.tables {
            let Some(outcome) = table.refresh(now, busy) else {
                continue;
            };
            for (_, endpoint) in outcome.pings {
                self.send_ping(endpoint, now);
            }
            if let Some(connected) = outcome.connectivity {
                self.events.on_connectivity_changed(table.family(), connected);
            }
        }

        self.find_self(now);
        self.save_bootstrap(now);

        let mut out = Vec::new();
        for (_, lookup) in self.finds.all() {
            let target = *lookup.target();
            let flipped = lookup.tick(now, || self.closest_nodes(&target, PROXIMITY_QUEUE_SIZE, now), &mut out);
            if flipped == Some(true) {
                info!("find_node {:?} reached its target", target);
            }
        }
        self.send_all(out, now);

        for (_, swarm) in self.joins.all() {
            self.drive_swarm(&*swarm, now);
        }
        for (_, swarm) in self.conns.all() {
            self.drive_swarm(&*swarm, now);
        }

        self.collect_garbage(now);
    }

    fn rotate_secrets(&self, now: Tick) {
        {
            let mut spoof = self.spoof.write();
            if now.saturating_sub(spoof.rotated_at) >= TOKEN_ROTATION_TICKS {
                spoof.previous = spoof.current;
                spoof.current = rand::random();
                spoof.rotated_at = now;
                trace!("Rotated transaction token");
            }
        }
        let mut secrets = self.secrets.write();
        if now.saturating_sub(secrets.rotated_at) >= ANNOUNCE_SECRET_ROTATION_TICKS {
            secrets.rotate(now);
            debug!("DHT token secret rotated");
        }
    }

    fn refresh_templates(&self, now: Tick) {
        let token = self.spoof.read().current;
        let mut guard = self.templates.lock();
        let templates = &mut *guard;
        for template in [&mut templates.ping, &mut templates.find_self].into_iter().flatten() {
            template.refresh(token, 0, now);
        }
    }

    /// Pings the persisted routing bootstrap lists once, on the first tick.
    fn load_bootstrap(&self, now: Tick) {
        {
            let mut timers = self.timers.lock();
            if timers.loaded_bootstrap {
                return;
            }
            timers.loaded_bootstrap = true;
            timers.last_save = now;
        }
        let (Some(store), Some(name)) = (&self.bootstrap_store, &self.config.bootstrap_name) else {
            return;
        };
        for table in &self.tables {
            let name = format!("{}-{}", name, table.family());
            match store.load(&name) {
                Ok(entries) => {
                    debug!("Loaded {} routing bootstrap entries from {}", entries.len(), name);
                    for entry in entries {
                        if entry.address.family() == Some(table.family()) {
                            self.send_ping(entry.address, now);
                        }
                    }
                }
                Err(e) => warn!("Failed to load bootstrap list {}: {}", name, e),
            }
        }
    }

    fn save_bootstrap(&self, now: Tick) {
        {
            let mut timers = self.timers.lock();
            if now.saturating_sub(timers.last_save) < BOOTSTRAP_SAVE_TICKS {
                return;
            }
            timers.last_save = now;
        }
        let (Some(store), Some(name)) = (&self.bootstrap_store, &self.config.bootstrap_name) else {
            return;
        };
        for table in &self.tables {
            let name = format!("{}-{}", name, table.family());
            let old = store.load(&name).unwrap_or_default();
            let list = table.bootstrap_list(&old, now);
            if list.is_empty() {
                continue;
            }
            if let Err(e) = store.save(&name, &list) {
                warn!("Failed to save bootstrap list {}: {}", name, e);
            }
        }
    }

    /// Looks up our own address: toward the closest known nodes, or the
    /// seeds while a table is empty.
    fn find_self(&self, now: Tick) {
        let mut dests = Vec::new();
        {
            let mut timers = self.timers.lock();
            for table in &self.tables {
                let i = table.family().index();
                if table.node_count() == 0 {
                    if timers.last_seed[i].is_some_and(|t| now.saturating_sub(t) < SEED_RETRY_TICKS) {
                        continue;
                    }
                    timers.last_seed[i] = Some(now);
                    dests.extend(
                        self.config
                            .seed_nodes
                            .iter()
                            .filter(|s| s.family() == Some(table.family()))
                            .copied(),
                    );
                    continue;
                }
                let interval = if table.is_mature() {
                    FIND_SELF_INTERVAL_TICKS
                } else {
                    FIND_SELF_IMMATURE_TICKS
                };
                if timers.last_find_self[i].is_some_and(|t| now.saturating_sub(t) < interval) {
                    continue;
                }
                timers.last_find_self[i] = Some(now);
                dests.extend(
                    table
                        .closest_nodes(&self.own, FIND_SELF_FANOUT, now)
                        .into_iter()
                        .map(|n| n.endpoint),
                );
            }
        }
        for dest in dests {
            self.send_find_self(dest, now);
        }
    }

    fn collect_garbage(&self, now: Tick) {
        let (registries, store) = {
            let mut timers = self.timers.lock();
            let registries = now.saturating_sub(timers.last_registry_gc) >= REGISTRY_GC_TICKS;
            if registries {
                timers.last_registry_gc = now;
            }
            let store = now.saturating_sub(timers.last_store_gc) >= RECENT_HOST_GC_TICKS;
            if store {
                timers.last_store_gc = now;
            }
            (registries, store)
        };
        if registries {
            self.finds.collect_garbage(now);
            self.joins.collect_garbage(now);
            self.conns.collect_garbage(now);
        }
        if store {
            self.announce_store.collect_garbage(now);
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Handles one inbound datagram. Returns false when it did not decode.
    pub fn handle_packet(&self, data: &[u8], from: SocketAddr, now: Tick) -> bool {
        self.stats.packet_in();

        let mut plain: Packet = [0u8; MAX_PACKET_SIZE + 1];
        let decoded = match data.first() {
            Some(b'd') => decode(data).or_else(|e| match deobfuscate(data, &mut plain) {
                Some(n) => decode(&plain[..n]).map_err(|_| e),
                None => Err(e),
            }),
            _ => match deobfuscate(data, &mut plain) {
                Some(n) => decode(&plain[..n]),
                None => Err(DhtError::InvalidMessage("empty datagram")),
            },
        };
        let msg = match decoded {
            Ok(msg) => msg,
            Err(e) => {
                self.stats.corrupted();
                debug!("Dropping corrupted packet from {}: {}", from, e);
                return false;
            }
        };

        let from = NetworkAddress::from(from);
        match from.family() {
            Some(family) if self.routing_table(family).is_some() => {}
            _ => {
                trace!("Ignoring packet from disabled family: {}", from);
                return true;
            }
        }

        let info = msg.transaction_info();
        match msg.body {
            Body::Query(query) => self.handle_query(&msg.tid, query, from, now),
            Body::Reply(reply) => self.handle_reply(info, &reply, from, now),
            Body::Error(error) => {
                debug!(
                    "Error {} from {}: {}",
                    error.code,
                    from,
                    String::from_utf8_lossy(&error.message)
                );
            }
        }
        true
    }

    fn observe(&self, address: NodeAddress, endpoint: NetworkAddress, latency: Option<u32>, kind: DiscoveryKind) {
        let Some(table) = endpoint.family().and_then(|f| self.routing_table(f)) else {
            return;
        };
        if !table.observe(address, endpoint, latency, kind) {
            self.stats.queue_drop();
        }
    }

    fn handle_query(&self, tid: &Tid, query: Query, from: NetworkAddress, now: Tick) {
        if query.sender == self.own {
            self.stats.protocol_violation();
            debug!("Query from {} claims our own id", from);
            return;
        }
        trace!("{:?} query from {}", query.verb, from);

        // Senders to a private swarm of ours are only learned once they pass
        // its sequence-number check.
        let gated = matches!(query.verb, Verb::GetPeers | Verb::AnnouncePeer)
            && query
                .target
                .and_then(|t| self.swarm_for(&t))
                .is_some_and(|swarm| swarm.is_private());
        let learn = !query.descriptor.is_some_and(|d| d.has(FLAG_FIREWALLED));
        if learn && !gated {
            self.observe(query.sender, from, None, DiscoveryKind::Queried);
        }

        let mut reply = Reply::new(self.own, from);
        let answer = match query.verb {
            Verb::Ping => true,
            Verb::FindNode => {
                if let Some(target) = query.target {
                    reply.push_nodes(self.closest_compact(&target, now));
                }
                true
            }
            Verb::GetPeers => self.answer_get_peers(&query, from, now, &mut reply),
            Verb::AnnouncePeer => self.answer_announce(tid, &query, from, now),
        };
        if answer {
            if learn && gated {
                self.observe(query.sender, from, None, DiscoveryKind::Queried);
            }
            self.send_reply(tid, &reply, from);
        }
    }

    fn closest_compact(&self, target: &NodeAddress, now: Tick) -> Vec<CompactNode> {
        self.tables
            .iter()
            .flat_map(|t| t.closest_nodes(target, MAX_REPLY_NODES, now))
            .map(|n| CompactNode {
                address: n.address,
                endpoint: n.endpoint,
            })
            .collect()
    }

    fn answer_get_peers(&self, query: &Query, from: NetworkAddress, now: Tick, reply: &mut Reply) -> bool {
        let Some(target) = query.target else {
            return false;
        };
        if let Some(ip) = from.ip() {
            reply.token = announce_token(&self.secrets.read().current, ip);
        }

        let mut wants_nodes = true;
        match self.swarm_for(&target) {
            Some(swarm) => {
                let (outcome, events) = swarm.on_get_peers(query, from, now, self);
                self.emit(&target, events);
                match outcome {
                    ServeOutcome::Rejected => {
                        self.stats.private_rejected();
                        debug!("get_peers from {} failed the private check for {:?}", from, target);
                        return false;
                    }
                    ServeOutcome::Silent => return false,
                    ServeOutcome::Serve {
                        peers,
                        wants_nodes: wants,
                        psn,
                        private,
                    } => {
                        for peer in peers {
                            reply.push_peer(peer);
                        }
                        wants_nodes = wants;
                        reply.psn = psn;
                        let flags = if private { FLAG_MEMBER | FLAG_PRIVATE } else { FLAG_MEMBER };
                        reply.descriptor = Some(self.descriptor(flags, 0));
                    }
                }
            }
            None => {
                if query.descriptor.is_some_and(|d| d.has(FLAG_LEAVING)) {
                    return false;
                }
                for peer in self.announce_store.get(&target, now, MAX_REPLY_PEERS * 2) {
                    if peer.address != query.sender {
                        reply.push_peer(peer);
                    }
                }
            }
        }
        if wants_nodes {
            reply.push_nodes(self.closest_compact(&target, now));
        }
        true
    }

    fn validate_token(&self, ip: IpAddr, token: &Token) -> bool {
        let secrets = self.secrets.read();
        announce_token(&secrets.current, ip) == Some(*token)
            || announce_token(&secrets.previous, ip) == Some(*token)
    }

    fn answer_announce(&self, tid: &Tid, query: &Query, from: NetworkAddress, now: Tick) -> bool {
        let (Some(target), Some(token), Some(ip), Some(family)) =
            (query.target, query.token, from.ip(), from.family())
        else {
            self.stats.protocol_violation();
            return false;
        };
        if !self.validate_token(ip, &token) {
            debug!("Rejecting announce_peer from {} - invalid token", from);
            let mut buf: Packet = [0u8; MAX_PACKET_SIZE + 1];
            match encode_error(&mut buf[..MAX_PACKET_SIZE], tid.as_slice(), ERROR_INVALID_TOKEN, b"Invalid token") {
                Ok(len) => {
                    self.send_raw(&mut buf, len, from, SendFlags::DROPPABLE);
                }
                Err(e) => debug!("Failed to encode error reply: {}", e),
            }
            return false;
        }

        match self.swarm_for(&target) {
            Some(swarm) => {
                let (accepted, events) = swarm.on_announce(query, from, now);
                self.emit(&target, events);
                if !accepted {
                    self.stats.private_rejected();
                    return false;
                }
            }
            None => {
                let cloaked_alternate = query
                    .cloaked
                    .filter(|c| c.family() == family)
                    .unwrap_or_else(|| CompactAddress::new(family));
                let peer = CompactPeer {
                    address: query.sender,
                    endpoint: from,
                    cloaked_alternate,
                };
                if !self.announce_store.add(target, peer, now) {
                    debug!("Announce store full, dropping {} for {:?}", from, target);
                }
            }
        }
        true
    }

    fn is_current_token(&self, token: [u8; 2]) -> bool {
        let spoof = self.spoof.read();
        token == spoof.current || token == spoof.previous
    }

    fn handle_reply(&self, info: Option<TransactionInfo>, reply: &Reply, from: NetworkAddress, now: Tick) {
        let Some(info) = info else {
            self.stats.stale_reply();
            trace!("Reply from {} with a foreign transaction id", from);
            return;
        };
        if !self.is_current_token(info.token) {
            self.stats.spoofed_reply();
            debug!("Dropping reply from {} with a stale or forged token", from);
            return;
        }
        if reply.sender == self.own {
            self.stats.protocol_violation();
            debug!("Reply from {} claims our own id", from);
            return;
        }

        let latency = info.latency(now);
        self.observe(reply.sender, from, Some(latency), DiscoveryKind::Replied);
        for node in reply.all_nodes() {
            if node.address != self.own {
                self.observe(node.address, node.endpoint, None, DiscoveryKind::Introduced);
            }
        }
        if let Some(ip) = from.ip() {
            if !reply.requester.is_empty() {
                let verified = is_ip_restricted(&reply.sender, ip);
                self.public_ip.add(ip, &reply.requester, verified);
            }
        }
        self.rtt.push(RttSample {
            peer: from,
            rtt: latency,
            at: now,
        });

        let mut out = Vec::new();
        let routed = self.route_reply(&info, reply, from, latency, now, &mut out);
        self.send_all(out, now);
        match routed {
            Ok(()) => {}
            Err(e @ DhtError::UnknownTransaction(_)) => {
                self.stats.stale_reply();
                trace!("Reply from {}: {}", from, e);
            }
            Err(e) => {
                if matches!(e, DhtError::PrivateSwarmRejected) {
                    self.stats.private_rejected();
                }
                debug!("Dropping reply from {}: {}", from, e);
            }
        }
    }

    /// Hands a reply to the transaction its id names.
    fn route_reply(
        &self,
        info: &TransactionInfo,
        reply: &Reply,
        from: NetworkAddress,
        latency: u32,
        now: Tick,
        out: &mut Vec<Outbound>,
    ) -> Result<(), DhtError> {
        let id = TxnId::from_raw(info.seq);
        match info.txn_type {
            TxnType::Routing => Ok(()),
            TxnType::FindNode => {
                let lookup = self.finds.by_id(id).ok_or(DhtError::UnknownTransaction(id))?;
                let nodes: Vec<&CompactNode> = reply.all_nodes().collect();
                if lookup.on_reply(reply.sender, from, latency, &nodes, now, out) == Some(true) {
                    info!("find_node {:?} reached its target", lookup.target());
                }
                Ok(())
            }
            TxnType::JoinSwarm | TxnType::ConnSwarm => {
                let swarm = self
                    .swarm_by_id(info.txn_type, id)
                    .ok_or(DhtError::UnknownTransaction(id))?;
                let (accepted, events) = swarm.on_reply(reply, from, latency, now, self, out);
                self.emit(swarm.target(), events);
                if accepted {
                    Ok(())
                } else {
                    Err(DhtError::PrivateSwarmRejected)
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    fn descriptor(&self, flags: u16, swarm_size: u16) -> NodeDescriptor {
        NodeDescriptor {
            flags,
            udp_port: self.config.udp_port,
            tcp_port: self.config.tcp_port,
            app_port: self.config.app_port,
            swarm_size,
            version: PROTOCOL_VERSION,
        }
    }

    fn send_all(&self, out: Vec<Outbound>, now: Tick) {
        for outbound in out {
            self.send_outbound(outbound, now);
        }
    }

    fn send_outbound(&self, outbound: Outbound, now: Tick) -> bool {
        let token = self.spoof.read().current;
        let info = TransactionInfo::new(token, outbound.query.verb, outbound.txn_type, outbound.seq, now);
        let mut buf: Packet = [0u8; MAX_PACKET_SIZE + 1];
        match encode_query(&mut buf[..MAX_PACKET_SIZE], &info.pack(), &outbound.query) {
            Ok(len) => {
                let flags = if outbound.droppable {
                    SendFlags::DROPPABLE
                } else {
                    SendFlags::NONE
                };
                self.send_raw(&mut buf, len, outbound.dest, flags)
            }
            Err(e) => {
                debug!("Failed to encode {:?} for {}: {}", outbound.query.verb, outbound.dest, e);
                false
            }
        }
    }

    fn send_reply(&self, tid: &Tid, reply: &Reply, dest: NetworkAddress) {
        let mut buf: Packet = [0u8; MAX_PACKET_SIZE + 1];
        match encode_reply(&mut buf[..MAX_PACKET_SIZE], tid.as_slice(), reply) {
            Ok(len) => {
                self.send_raw(&mut buf, len, dest, SendFlags::DROPPABLE);
            }
            Err(e) => debug!("Failed to encode reply for {}: {}", dest, e),
        }
    }

    fn send_template(&self, which: Canned, dest: NetworkAddress, flags: SendFlags) -> bool {
        let mut buf: Packet = [0u8; MAX_PACKET_SIZE + 1];
        let len = {
            let templates = self.templates.lock();
            let template = match which {
                Canned::Ping => templates.ping.as_ref(),
                Canned::FindSelf => templates.find_self.as_ref(),
            };
            match template {
                Some(template) => {
                    let bytes = template.as_bytes();
                    buf[..bytes.len()].copy_from_slice(bytes);
                    bytes.len()
                }
                None => return false,
            }
        };
        self.send_raw(&mut buf, len, dest, flags)
    }

    fn send_ping(&self, dest: NetworkAddress, now: Tick) -> bool {
        self.send_template(Canned::Ping, dest, SendFlags::DROPPABLE)
            || self.send_outbound(
                Outbound {
                    dest,
                    query: Query::ping(self.own),
                    txn_type: TxnType::Routing,
                    seq: 0,
                    droppable: true,
                },
                now,
            )
    }

    fn send_find_self(&self, dest: NetworkAddress, now: Tick) -> bool {
        self.send_template(Canned::FindSelf, dest, SendFlags::NONE)
            || self.send_outbound(
                Outbound {
                    dest,
                    query: Query::find_node(self.own, self.own),
                    txn_type: TxnType::Routing,
                    seq: 0,
                    droppable: false,
                },
                now,
            )
    }

    fn send_raw(&self, buf: &mut Packet, len: usize, dest: NetworkAddress, mut flags: SendFlags) -> bool {
        let Some(addr) = dest.to_socket_addr() else {
            return false;
        };
        let mut len = len;
        if self.config.obfuscate {
            if let Some(n) = obfuscate(&mut buf[..], len, random_seed()) {
                len = n;
                flags = flags | SendFlags::OBFUSCATE;
            }
        }
        if self.transport.send(&buf[..len], addr, flags) {
            self.stats.packet_out();
            true
        } else {
            self.stats.send_failure();
            if !flags.contains(SendFlags::DROPPABLE) {
                debug!("Failed to send {} bytes to {}", len, addr);
            }
            false
        }
    }
}

impl SwarmHost for DhtEngine {
    fn own_address(&self) -> NodeAddress {
        self.own
    }

    fn closest_nodes(&self, target: &NodeAddress, n: usize, now: Tick) -> Vec<RoutingNode> {
        DhtEngine::closest_nodes(self, target, n, now)
    }

    fn seed_nodes(&self) -> &[NetworkAddress] {
        &self.config.seed_nodes
    }

    fn bootstrap_store(&self) -> Option<&dyn BootstrapStore> {
        self.bootstrap_store.as_deref()
    }

    fn has_family(&self, family: AddressFamily) -> bool {
        self.routing_table(family).is_some()
    }

    fn external_ip(&self, family: AddressFamily) -> Option<IpAddr> {
        self.public_ip.external_ip(family)
    }

    fn alternate_address(&self, family: AddressFamily) -> NetworkAddress {
        match self.public_ip.external_ip(family) {
            Some(ip) if self.config.udp_port != 0 => {
                NetworkAddress::from(SocketAddr::new(ip, self.config.udp_port))
            }
            _ => NetworkAddress::Empty,
        }
    }

    fn descriptor(&self, flags: u16, swarm_size: u16) -> NodeDescriptor {
        DhtEngine::descriptor(self, flags, swarm_size)
    }
}
