use std::net::IpAddr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::base::{private_sequence_number, ServeOutcome, SwarmEvent, SwarmHost};
use super::{ConnSwarm, JoinSwarm, SwarmProtocol, SwarmRole};
use crate::constants::BACKWARD_TTL_TICKS;
use crate::dht::address::NodeAddress;
use crate::dht::bootstrap::{BootstrapEntry, BootstrapStore, MemoryBootstrapStore};
use crate::dht::config::SwarmConfig;
use crate::dht::message::{
    NodeDescriptor, Outbound, Query, Reply, Token, Verb, FLAG_FORWARD, FLAG_LEAVING, FLAG_MEMBER,
};
use crate::dht::network::{AddressFamily, NetworkAddress};
use crate::dht::node_id_security::generate_restricted_address;
use crate::dht::registry::TxnId;
use crate::dht::routing::RoutingNode;
use crate::dht::Tick;

struct FakeHost {
    own: NodeAddress,
    routers: Vec<RoutingNode>,
    seeds: Vec<NetworkAddress>,
    store: MemoryBootstrapStore,
    external: Option<IpAddr>,
}

impl FakeHost {
    fn new() -> Self {
        Self {
            own: NodeAddress([0xee; 20]),
            routers: Vec::new(),
            seeds: Vec::new(),
            store: MemoryBootstrapStore::new(),
            external: None,
        }
    }
}

impl SwarmHost for FakeHost {
    fn own_address(&self) -> NodeAddress {
        self.own
    }

    fn closest_nodes(&self, _target: &NodeAddress, n: usize, _now: Tick) -> Vec<RoutingNode> {
        self.routers.iter().take(n).copied().collect()
    }

    fn seed_nodes(&self) -> &[NetworkAddress] {
        &self.seeds
    }

    fn bootstrap_store(&self) -> Option<&dyn BootstrapStore> {
        Some(&self.store)
    }

    fn has_family(&self, _family: AddressFamily) -> bool {
        true
    }

    fn external_ip(&self, _family: AddressFamily) -> Option<IpAddr> {
        self.external
    }

    fn alternate_address(&self, _family: AddressFamily) -> NetworkAddress {
        NetworkAddress::Empty
    }

    fn descriptor(&self, flags: u16, swarm_size: u16) -> NodeDescriptor {
        let mut d = NodeDescriptor::new(flags, 6881);
        d.swarm_size = swarm_size;
        d
    }
}

fn target() -> NodeAddress {
    NodeAddress([0x42; 20])
}

fn ep(i: u8) -> NetworkAddress {
    format!("10.0.0.{}:6881", i).parse().unwrap()
}

fn peer(i: u8) -> NodeAddress {
    NodeAddress([i; 20])
}

fn router(i: u8) -> RoutingNode {
    RoutingNode {
        address: peer(i),
        endpoint: ep(i),
        last_recv: Some(0),
        last_sent: None,
        discovered: 0,
        latency: Some(3),
        missed: 0,
    }
}

fn token() -> Token {
    Token::from_slice(b"tok").unwrap()
}

fn member_reply(i: u8) -> Reply {
    let mut reply = Reply::new(peer(i), NetworkAddress::Empty);
    reply.descriptor = Some(NodeDescriptor::new(FLAG_MEMBER, 6881));
    reply.token = Some(token());
    reply
}

fn member_query(i: u8) -> Query {
    Query::get_peers(peer(i), target()).with_descriptor(NodeDescriptor::new(FLAG_MEMBER, 6881))
}

fn member_announce(i: u8) -> Query {
    Query::announce_peer(peer(i), target(), token(), 6881)
        .with_descriptor(NodeDescriptor::new(FLAG_MEMBER, 6881))
}

fn join(expected: usize) -> JoinSwarm {
    let config = SwarmConfig::default().with_expected_size(expected);
    JoinSwarm::new(TxnId::from_raw(1), target(), NodeAddress([0xee; 20]), config, 0)
}

fn dests(out: &[Outbound]) -> Vec<NetworkAddress> {
    out.iter().map(|o| o.dest).collect()
}

#[test]
fn test_join_matures_with_both_directions() {
    let host = FakeHost::new();
    let swarm = join(4);
    let mut out = Vec::new();

    for i in 1..=3 {
        swarm.on_reply(&member_reply(i), ep(i), 4, 10, &host, &mut out);
    }
    assert_eq!(swarm.forward_count(), 3);
    assert!(!swarm.is_mature());

    // Forward peers that handed out a token get one announcement each.
    let announced: Vec<_> = out.iter().filter(|o| o.query.verb == Verb::AnnouncePeer).collect();
    assert_eq!(announced.len(), 3);

    for i in 11..=13 {
        swarm.on_get_peers(&member_query(i), ep(i), 20, &host);
    }
    assert_eq!(swarm.established_count(20), 0);
    let mut events = Vec::new();
    for i in 11..=13 {
        let (accepted, ev) = swarm.on_announce(&member_announce(i), ep(i), 30);
        assert!(accepted);
        events.extend(ev);
    }
    assert_eq!(swarm.established_count(30), 3);
    assert!(swarm.is_mature());
    assert!(events.contains(&SwarmEvent::Changed(true)));
    assert_eq!(swarm.peers().len(), 6);
    assert_eq!(swarm.peers()[0].role, SwarmRole::Forward);
}

#[test]
fn test_join_goes_immature_when_peers_fall_silent() {
    let host = FakeHost::new();
    let swarm = join(2);
    let mut out = Vec::new();
    for i in 1..=2 {
        swarm.on_reply(&member_reply(i), ep(i), 4, 0, &host, &mut out);
        swarm.on_get_peers(&member_query(10 + i), ep(10 + i), 0, &host);
        swarm.on_announce(&member_announce(10 + i), ep(10 + i), 0);
    }
    assert!(swarm.is_mature());

    let events = swarm.tick(BACKWARD_TTL_TICKS + 1, &host, &mut out);
    assert!(!swarm.is_mature());
    assert!(events.contains(&SwarmEvent::Changed(false)));
}

#[test]
fn test_maturity_tracks_counts_under_churn() {
    let host = FakeHost::new();
    let expected = 4;
    let swarm = join(expected);
    let mut rng = StdRng::seed_from_u64(7);
    let mut out = Vec::new();
    let mut now: Tick = 0;
    let mut mature = false;

    for _ in 0..600 {
        now += rng.random_range(1..40);
        let i: u8 = rng.random_range(1..16);
        let events = match rng.random_range(0..5) {
            0 => swarm.on_reply(&member_reply(i), ep(i), rng.random_range(1..20), now, &host, &mut out).1,
            1 => swarm.on_get_peers(&member_query(i), ep(i), now, &host).1,
            2 => swarm.on_announce(&member_announce(i), ep(i), now).1,
            3 => {
                let leaving = member_query(i)
                    .with_descriptor(NodeDescriptor::new(FLAG_MEMBER | FLAG_LEAVING, 6881));
                swarm.on_get_peers(&leaving, ep(i), now, &host).1
            }
            _ => swarm.tick(now, &host, &mut out),
        };
        out.clear();

        for event in events {
            if let SwarmEvent::Changed(m) = event {
                assert_ne!(m, mature, "maturity change reported without a flip");
                mature = m;
            }
        }
        let n = expected;
        let computed = swarm.forward_count() * 2 > n && swarm.established_count(now) * 2 > n;
        assert_eq!(swarm.is_mature(), computed);
        assert_eq!(swarm.is_mature(), mature);
        assert!(swarm.peers().len() <= expected * 2);
    }
}

#[test]
fn test_private_swarm_rejects_wrong_sequence_number() {
    let secret = [9u8; 32];
    let mut host = FakeHost::new();
    host.external = Some("10.0.0.99".parse().unwrap());
    let config = SwarmConfig::private(secret).with_expected_size(4);
    let swarm = JoinSwarm::new(TxnId::from_raw(1), target(), host.own, config, 0);

    let wrong = member_query(1).with_psn(Some(12345));
    let (outcome, events) = swarm.on_get_peers(&wrong, ep(1), 0, &host);
    assert_eq!(outcome, ServeOutcome::Rejected);
    assert!(events.is_empty());

    let missing = member_query(1);
    assert_eq!(swarm.on_get_peers(&missing, ep(1), 0, &host).0, ServeOutcome::Rejected);

    let ip = ep(1).ip().unwrap();
    let right = member_query(1).with_psn(Some(private_sequence_number(&secret, ip)));
    match swarm.on_get_peers(&right, ep(1), 0, &host).0 {
        ServeOutcome::Serve { psn, private, .. } => {
            assert!(private);
            let own_ip = host.external.unwrap();
            assert_eq!(psn, Some(private_sequence_number(&secret, own_ip)));
        }
        other => panic!("unexpected {:?}", other),
    }

    // A member reply with a bogus number changes nothing.
    let mut reply = member_reply(2);
    reply.psn = Some(1);
    let (accepted, _) = swarm.on_reply(&reply, ep(2), 3, 0, &host, &mut Vec::new());
    assert!(!accepted);
    assert_eq!(swarm.forward_count(), 0);
}

#[test]
fn test_leaving_with_forward_flag_drops_backward_peer() {
    let host = FakeHost::new();
    let swarm = join(4);
    let mut out = Vec::new();

    swarm.on_reply(&member_reply(1), ep(1), 4, 0, &host, &mut out);
    swarm.on_get_peers(&member_query(1), ep(1), 0, &host);
    swarm.on_announce(&member_announce(1), ep(1), 0);
    assert_eq!(swarm.forward_count(), 1);
    assert_eq!(swarm.established_count(0), 1);

    // Peer 1 signals from another endpoint that it is leaving its forward
    // relation with us: only our backward entry goes.
    let leaving = Query::get_peers(peer(1), target())
        .with_descriptor(NodeDescriptor::new(FLAG_MEMBER | FLAG_LEAVING | FLAG_FORWARD, 6881));
    let (outcome, _) = swarm.on_get_peers(&leaving, ep(77), 1, &host);
    assert_eq!(outcome, ServeOutcome::Silent);
    assert_eq!(swarm.established_count(1), 0);
    assert_eq!(swarm.forward_count(), 1);

    // Without the flag, from the stored endpoint: the forward entry goes too.
    let leaving = Query::get_peers(peer(1), target())
        .with_descriptor(NodeDescriptor::new(FLAG_MEMBER | FLAG_LEAVING, 6881));
    let (_, events) = swarm.on_get_peers(&leaving, ep(1), 2, &host);
    assert_eq!(swarm.forward_count(), 0);
    assert!(events.contains(&SwarmEvent::Dropped(peer(1))));
}

#[test]
fn test_discovery_prefers_bootstrap_then_routing_then_seeds() {
    let mut host = FakeHost::new();
    host.seeds = vec![ep(200)];
    let swarm = join(4);
    let name = SwarmConfig::default().bootstrap_name(&target());
    host.store
        .save(&name, &[BootstrapEntry::with_alternate(ep(50), ep(51))])
        .unwrap();
    host.routers = vec![router(60)];

    let mut out = Vec::new();
    swarm.tick(1, &host, &mut out);
    let sent = dests(&out);
    assert!(sent.contains(&ep(50)));
    assert!(sent.contains(&ep(51)));
    assert!(sent.contains(&ep(60)));
    assert!(!sent.contains(&ep(200)));
    assert!(out.iter().all(|o| o.query.descriptor.is_some_and(|d| d.has(FLAG_MEMBER))));

    // Nothing else to go on: seeds are the last resort.
    let mut host = FakeHost::new();
    host.seeds = vec![ep(200)];
    let swarm = join(4);
    let mut out = Vec::new();
    swarm.tick(1, &host, &mut out);
    assert_eq!(dests(&out), vec![ep(200)]);

    // Recently contacted hosts are not asked again within the window.
    let mut out = Vec::new();
    swarm.tick(100, &host, &mut out);
    assert!(out.is_empty());
}

#[test]
fn test_verified_contact_replaces_unverified_duplicate() {
    let host = FakeHost::new();
    let swarm = join(4);
    let public: IpAddr = "203.0.113.5".parse().unwrap();
    let address = generate_restricted_address(public);
    let mut out = Vec::new();

    let mut reply = member_reply(0);
    reply.sender = address;
    let spoofed: NetworkAddress = "198.51.100.9:6881".parse().unwrap();
    swarm.on_reply(&reply, spoofed, 4, 0, &host, &mut out);
    assert!(!swarm.peers()[0].verified);

    let genuine: NetworkAddress = "203.0.113.5:6881".parse().unwrap();
    swarm.on_reply(&reply, genuine, 4, 1, &host, &mut out);
    let peers = swarm.peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].endpoint, genuine);
    assert!(peers[0].verified);
}

#[test]
fn test_serve_excludes_requester_and_cloaks_alternates() {
    let host = FakeHost::new();
    let swarm = join(4);
    let mut out = Vec::new();
    for i in 1..=2 {
        swarm.on_reply(&member_reply(i), ep(i), 4, 0, &host, &mut out);
    }

    match swarm.on_get_peers(&member_query(1), ep(1), 1, &host).0 {
        ServeOutcome::Serve { peers, wants_nodes, psn, private } => {
            assert_eq!(peers.len(), 1);
            assert_eq!(peers[0].address, peer(2));
            assert_eq!(peers[0].endpoint, ep(2));
            assert!(wants_nodes);
            assert_eq!(psn, None);
            assert!(!private);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_conn_swarm_matures_on_flat_peers() {
    let host = FakeHost::new();
    let config = SwarmConfig::default().with_expected_size(4);
    let swarm = ConnSwarm::new(TxnId::from_raw(2), target(), config, 0);
    let mut out = Vec::new();

    for i in 1..=2 {
        swarm.on_reply(&member_reply(i), ep(i), 4, 0, &host, &mut out);
    }
    assert!(!swarm.is_mature());
    let (_, events) = swarm.on_reply(&member_reply(3), ep(3), 4, 0, &host, &mut out);
    assert!(swarm.is_mature());
    assert!(events.contains(&SwarmEvent::Changed(true)));
    assert!(swarm.peers().iter().all(|p| p.role == SwarmRole::Flat));

    // Members are not announced to; only routers get announcements.
    assert!(out.iter().all(|o| o.query.verb != Verb::AnnouncePeer));
    let mut router_reply = Reply::new(peer(90), NetworkAddress::Empty);
    router_reply.token = Some(token());
    swarm.on_reply(&router_reply, ep(90), 4, 1, &host, &mut out);
    assert!(out
        .iter()
        .any(|o| o.query.verb == Verb::AnnouncePeer && o.dest == ep(90)));
}

#[test]
fn test_stop_sends_leaving_to_every_peer() {
    let host = FakeHost::new();
    let swarm = join(4);
    let mut out = Vec::new();
    swarm.on_reply(&member_reply(1), ep(1), 4, 0, &host, &mut out);
    swarm.on_get_peers(&member_query(2), ep(2), 0, &host);

    let mut out = Vec::new();
    swarm.stop(1, &host, &mut out);
    assert_eq!(out.len(), 2);
    for o in &out {
        let d = o.query.descriptor.unwrap();
        assert!(d.has(FLAG_LEAVING));
        assert!(o.droppable);
        assert_eq!(d.has(FLAG_FORWARD), o.dest == ep(1));
    }
    assert!(swarm.peers().is_empty());
}
