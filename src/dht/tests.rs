use super::*;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::constants::{BUCKET_SIZE, ERROR_INVALID_TOKEN, MAX_PACKET_SIZE, ZOMBIE_TICKS};
use routing::bucket_index;
use swarm::private_sequence_number;

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn net(s: &str) -> NetworkAddress {
    s.parse().unwrap()
}

fn v4_only() -> DhtConfig {
    DhtConfig {
        families: vec![AddressFamily::V4],
        udp_port: 6881,
        ..DhtConfig::default()
    }
}

fn encode_q(tid: &[u8], query: &Query) -> Vec<u8> {
    let mut buf = [0u8; MAX_PACKET_SIZE];
    let len = encode_query(&mut buf, tid, query).unwrap();
    buf[..len].to_vec()
}

// ----------------------------------------------------------------------
// Wire format
// ----------------------------------------------------------------------

#[test]
fn test_query_roundtrip_keeps_every_field() {
    let token = Token::from_slice(b"12345678").unwrap();
    let mut cloaked = CompactAddress::new(AddressFamily::V4);
    cloaked.as_mut_slice().copy_from_slice(&[1, 2, 3, 4, 5, 6]);
    let query = Query::announce_peer(NodeAddress([1; 20]), NodeAddress([2; 20]), token, 6881)
        .with_descriptor(NodeDescriptor::new(FLAG_MEMBER | FLAG_PRIVATE, 6881))
        .with_psn(Some(0xdead_beef))
        .with_cloaked(Some(cloaked));

    let data = encode_q(b"tx", &query);
    let msg = decode(&data).unwrap();
    assert_eq!(msg.tid.as_slice(), b"tx");
    assert_eq!(msg.version.unwrap().as_slice(), b"SD01");
    assert!(msg.fields.contains(Fields::PSN));
    assert!(msg.fields.contains(Fields::CLOAK));
    assert_eq!(msg.body, Body::Query(query));

    let find = Query::find_node(NodeAddress([1; 20]), NodeAddress([3; 20]));
    let msg = decode(&encode_q(b"f", &find)).unwrap();
    assert!(msg.fields.contains(Fields::TARGET));
    assert!(!msg.fields.contains(Fields::INFO_HASH));
    assert_eq!(msg.body, Body::Query(find));
}

#[test]
fn test_reply_roundtrip_splits_families() {
    let mut reply = Reply::new(NodeAddress([9; 20]), net("192.0.2.1:4000"));
    reply.push_nodes([
        CompactNode {
            address: NodeAddress([1; 20]),
            endpoint: net("10.0.0.1:6881"),
        },
        CompactNode {
            address: NodeAddress([2; 20]),
            endpoint: net("[2001:db8::1]:6881"),
        },
    ]);
    reply.push_peer(CompactPeer {
        address: NodeAddress([3; 20]),
        endpoint: net("10.0.0.3:6881"),
        cloaked_alternate: CompactAddress::new(AddressFamily::V4),
    });
    reply.token = Token::from_slice(b"tok");
    reply.psn = Some(7);
    reply.descriptor = Some(NodeDescriptor::new(FLAG_MEMBER, 6881));
    assert_eq!(reply.nodes.len(), 1);
    assert_eq!(reply.nodes6.len(), 1);

    let mut buf = [0u8; MAX_PACKET_SIZE];
    let len = encode_reply(&mut buf, b"rr", &reply).unwrap();
    let msg = decode(&buf[..len]).unwrap();
    assert_eq!(msg.body, Body::Reply(reply));
}

#[test]
fn test_error_roundtrip() {
    let mut buf = [0u8; 128];
    let len = encode_error(&mut buf, b"e1", ERROR_INVALID_TOKEN, b"Invalid token").unwrap();
    match decode(&buf[..len]).unwrap().body {
        Body::Error(e) => {
            assert_eq!(e.code, ERROR_INVALID_TOKEN);
            assert_eq!(&e.message[..], b"Invalid token");
        }
        other => panic!("unexpected {:?}", other),
    }
}

fn assert_every_prefix_rejected(data: &[u8]) {
    for cut in 0..data.len() {
        assert!(decode(&data[..cut]).is_err(), "prefix of {} bytes decoded", cut);
    }
    assert!(decode(data).is_ok());
}

#[test]
fn test_every_truncation_is_rejected() {
    let mut buf = [0u8; MAX_PACKET_SIZE];

    let mut reply = Reply::new(NodeAddress([4; 20]), net("192.0.2.7:1234"));
    reply.push_nodes([
        CompactNode {
            address: NodeAddress([5; 20]),
            endpoint: net("10.1.2.3:6881"),
        },
        CompactNode {
            address: NodeAddress([6; 20]),
            endpoint: net("[2001:db8::6]:6881"),
        },
    ]);
    reply.token = Token::from_slice(b"abcd");
    let len = encode_reply(&mut buf, b"xy", &reply).unwrap();
    assert_every_prefix_rejected(&buf[..len]);

    let mut cloaked = CompactAddress::new(AddressFamily::V4);
    cloaked.as_mut_slice().copy_from_slice(&[9, 8, 7, 6, 5, 4]);
    let mut peers = Reply::new(NodeAddress([7; 20]), net("[2001:db8::7]:4000"));
    peers.push_peer(CompactPeer {
        address: NodeAddress([8; 20]),
        endpoint: net("10.0.0.8:6881"),
        cloaked_alternate: cloaked,
    });
    peers.push_peer(CompactPeer {
        address: NodeAddress([9; 20]),
        endpoint: net("[2001:db8::9]:6881"),
        cloaked_alternate: CompactAddress::new(AddressFamily::V6),
    });
    peers.psn = Some(0x0102_0304);
    peers.descriptor = Some(NodeDescriptor::new(FLAG_MEMBER | FLAG_PRIVATE, 6881));
    assert_eq!(peers.peers.len(), 1);
    assert_eq!(peers.peers6.len(), 1);
    let len = encode_reply(&mut buf, b"pp", &peers).unwrap();
    assert_every_prefix_rejected(&buf[..len]);

    let token = Token::from_slice(b"12345678").unwrap();
    let announce = Query::announce_peer(NodeAddress([1; 20]), NodeAddress([2; 20]), token, 6881)
        .with_descriptor(NodeDescriptor::new(FLAG_MEMBER | FLAG_PRIVATE, 6881))
        .with_psn(Some(0xdead_beef))
        .with_cloaked(Some(cloaked));
    assert_every_prefix_rejected(&encode_q(b"an", &announce));

    let find = Query::find_node(NodeAddress([1; 20]), NodeAddress([3; 20]));
    assert_every_prefix_rejected(&encode_q(b"fn", &find));

    let get = Query::get_peers(NodeAddress([1; 20]), NodeAddress([3; 20]));
    assert_every_prefix_rejected(&encode_q(b"gp", &get));

    assert_every_prefix_rejected(&encode_q(b"pi", &Query::ping(NodeAddress([1; 20]))));

    let len = encode_error(&mut buf, b"er", ERROR_INVALID_TOKEN, b"Invalid token").unwrap();
    assert_every_prefix_rejected(&buf[..len]);
}

#[test]
fn test_garbage_is_rejected() {
    assert!(decode(b"d1:te").is_err());
    assert!(decode(&[0u8; 13]).is_err());
    assert!(decode(b"d1:t2:xy1:y1:qe").is_err());
    assert!(decode(b"le").is_err());
}

#[test]
fn test_encode_reports_small_buffer() {
    let query = Query::find_node(NodeAddress([1; 20]), NodeAddress([2; 20]));
    let mut buf = [0u8; 16];
    assert!(matches!(
        encode_query(&mut buf, b"aa", &query),
        Err(DhtError::BufferTooSmall)
    ));
}

#[test]
fn test_transaction_info_packs_into_nine_bytes() {
    let info = TransactionInfo::new([0xab, 0xcd], Verb::GetPeers, TxnType::JoinSwarm, 513, 70);
    let packed = info.pack();
    assert_eq!(packed.len(), 9);
    assert_eq!(TransactionInfo::unpack(&packed), Some(info));
    assert_eq!(info.latency(75), 5);
    assert_eq!(TransactionInfo::unpack(&packed[..8]), None);
}

// ----------------------------------------------------------------------
// Routing
// ----------------------------------------------------------------------

fn discovered(own: &NodeAddress, address: NodeAddress, endpoint: NetworkAddress, kind: DiscoveryKind) -> DiscoveredNode {
    DiscoveredNode {
        address,
        endpoint,
        latency: (kind == DiscoveryKind::Replied).then_some(3),
        kind,
        bucket: bucket_index(own, &address),
    }
}

fn random_snapshot(rng: &mut StdRng, own: NodeAddress, count: usize, now: Tick) -> RoutingSnapshot {
    let batch: Vec<DiscoveredNode> = (0..count)
        .map(|i| {
            let address = NodeAddress(rng.random());
            let endpoint = net(&format!("10.{}.{}.1:6881", i / 200, i % 200));
            discovered(&own, address, endpoint, DiscoveryKind::Replied)
        })
        .collect();
    RoutingSnapshot::new(own, AddressFamily::V4).rebuild(&batch, now)
}

#[test]
fn test_closest_nodes_matches_brute_force() {
    let mut rng = StdRng::seed_from_u64(11);
    let own = NodeAddress(rng.random());
    let table = random_snapshot(&mut rng, own, 400, 1);
    assert!(table.check_invariants());
    for b in 0..40 {
        assert!(table.bucket_len(b) <= BUCKET_SIZE);
    }

    for _ in 0..20 {
        let target = NodeAddress(rng.random());
        let got = table.closest_nodes(&target, 8, 1);

        let mut all: Vec<NodeAddress> = table.nodes().map(|n| n.address).collect();
        all.sort_by(|a, b| target.cmp_distance(a, b));
        all.truncate(8);

        let got: Vec<NodeAddress> = got.iter().map(|n| n.address).collect();
        assert_eq!(got, all);
    }
    assert!(table.closest_nodes(&own, 0, 1).is_empty());
}

#[test]
fn test_rebuild_without_news_is_stable() {
    let mut rng = StdRng::seed_from_u64(5);
    let own = NodeAddress(rng.random());
    let table = random_snapshot(&mut rng, own, 120, 1);

    // Mixed latencies and unproven introductions, so bad counts and the
    // average are not trivial.
    let batch: Vec<DiscoveredNode> = (0..60)
        .map(|i| {
            let kind = if i % 3 == 0 {
                DiscoveryKind::Introduced
            } else {
                DiscoveryKind::Replied
            };
            let mut d = discovered(&own, NodeAddress(rng.random()), net(&format!("10.9.{}.1:6881", i)), kind);
            if kind == DiscoveryKind::Replied {
                d.latency = Some(rng.random_range(1..200));
            }
            d
        })
        .collect();
    let table = table.rebuild(&batch, 2);

    let once = table.rebuild(&[], 3);
    let twice = once.rebuild(&[], 4);

    let nodes = |t: &RoutingSnapshot| {
        let mut all: Vec<RoutingNode> = t.nodes().copied().collect();
        all.sort_by_key(|n| n.address);
        all
    };
    assert_eq!(nodes(&once), nodes(&twice));
    assert_eq!(nodes(&table), nodes(&once));
    assert_eq!(once.average_latency(), twice.average_latency());
    assert_eq!(once.latency_bar(), twice.latency_bar());
    for b in 0..40 {
        assert_eq!(once.bucket_len(b), twice.bucket_len(b));
        assert_eq!(once.bucket_accepts(b), twice.bucket_accepts(b), "bucket {}", b);
    }
    assert!(twice.check_invariants());
}

#[test]
fn test_full_bucket_evicts_only_replaceable_nodes() {
    let own = NodeAddress::ZERO;
    // Top bit set: every one of these lands in bucket 0.
    let far = |i: u8| {
        let mut a = [0u8; 20];
        a[0] = 0x80 | i;
        NodeAddress(a)
    };
    let ep = |i: u8| net(&format!("10.0.0.{}:6881", i + 1));

    let batch: Vec<_> = (0..8)
        .map(|i| discovered(&own, far(i), ep(i), DiscoveryKind::Replied))
        .collect();
    let table = RoutingSnapshot::new(own, AddressFamily::V4).rebuild(&batch, 100);
    assert_eq!(table.bucket_len(0), BUCKET_SIZE);

    // Everyone but node 3 checks in again; node 3 has gone silent.
    let now = 100 + ZOMBIE_TICKS;
    let mut batch: Vec<_> = (0..8)
        .filter(|&i| i != 3)
        .map(|i| discovered(&own, far(i), ep(i), DiscoveryKind::Replied))
        .collect();
    batch.push(discovered(&own, far(20), ep(20), DiscoveryKind::Replied));
    batch.push(discovered(&own, far(21), ep(21), DiscoveryKind::Introduced));
    let table = table.rebuild(&batch, now);

    assert_eq!(table.bucket_len(0), BUCKET_SIZE);
    assert!(table.get(&far(20)).is_some());
    assert!(table.get(&far(3)).is_none());
    // An introduction alone cannot push out a healthy node.
    assert!(table.get(&far(21)).is_none());
    assert!(table.check_invariants());
}

#[test]
fn test_own_and_foreign_family_are_ignored() {
    let own = NodeAddress([1; 20]);
    let batch = vec![
        discovered(&own, own, net("10.0.0.1:6881"), DiscoveryKind::Replied),
        discovered(&own, NodeAddress([2; 20]), net("[2001:db8::2]:6881"), DiscoveryKind::Replied),
        discovered(&own, NodeAddress([3; 20]), net("10.0.0.3:6881"), DiscoveryKind::Replied),
    ];
    let table = RoutingSnapshot::new(own, AddressFamily::V4).rebuild(&batch, 1);
    assert_eq!(table.len(), 1);
}

// ----------------------------------------------------------------------
// Engine
// ----------------------------------------------------------------------

#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
}

impl Recorder {
    fn take(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl Transport for Recorder {
    fn send(&self, buf: &[u8], dest: SocketAddr, _flags: SendFlags) -> bool {
        self.sent.lock().push((buf.to_vec(), dest));
        true
    }
}

fn recorded_engine(config: DhtConfig) -> (DhtEngine, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let engine = DhtEngine::new(config, recorder.clone());
    (engine, recorder)
}

fn only_reply(sent: &[(Vec<u8>, SocketAddr)]) -> Reply {
    assert_eq!(sent.len(), 1, "expected exactly one datagram");
    match decode(&sent[0].0).unwrap().body {
        Body::Reply(reply) => reply,
        other => panic!("expected a reply, got {:?}", other),
    }
}

#[test]
fn test_announce_needs_a_valid_token() {
    let (engine, recorder) = recorded_engine(v4_only());
    let target = NodeAddress([0x33; 20]);
    let x = NodeAddress([0x44; 20]);
    let from = addr("10.0.0.4:7000");

    engine.handle_packet(&encode_q(b"g1", &Query::get_peers(x, target)), from, 1);
    let reply = only_reply(&recorder.take());
    assert_eq!(reply.requester, NetworkAddress::from(from));
    let token = reply.token.unwrap();

    let bogus = Token::from_slice(b"nope").unwrap();
    engine.handle_packet(&encode_q(b"a0", &Query::announce_peer(x, target, bogus, 7000)), from, 2);
    let sent = recorder.take();
    match decode(&sent[0].0).unwrap().body {
        Body::Error(e) => assert_eq!(e.code, ERROR_INVALID_TOKEN),
        other => panic!("expected an error, got {:?}", other),
    }
    assert!(engine.announce_store().get(&target, 2, 8).is_empty());

    engine.handle_packet(&encode_q(b"a1", &Query::announce_peer(x, target, token, 7000)), from, 3);
    only_reply(&recorder.take());
    let stored = engine.announce_store().get(&target, 3, 8);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].address, x);

    // Another node asking for the target now learns about x.
    let y = NodeAddress([0x55; 20]);
    engine.handle_packet(&encode_q(b"g2", &Query::get_peers(y, target)), addr("10.0.0.5:7000"), 4);
    let reply = only_reply(&recorder.take());
    assert_eq!(reply.peers.len(), 1);
    assert_eq!(reply.peers[0].endpoint, NetworkAddress::from(from));
}

#[test]
fn test_private_swarm_ignores_wrong_sequence_number() {
    let secret = [7u8; 32];
    let (engine, recorder) = recorded_engine(v4_only());
    let target = NodeAddress([0x66; 20]);
    engine
        .join_swarm(target, SwarmConfig::private(secret).with_expected_size(4), 0)
        .unwrap();
    recorder.take();

    let member = NodeAddress([0x77; 20]);
    let from = addr("10.0.0.7:6881");
    let descriptor = NodeDescriptor::new(FLAG_MEMBER | FLAG_PRIVATE, 6881);

    let wrong = Query::get_peers(member, target)
        .with_descriptor(descriptor)
        .with_psn(Some(1));
    assert!(engine.handle_packet(&encode_q(b"p0", &wrong), from, 1));
    assert!(recorder.take().is_empty());
    assert_eq!(engine.stats().snapshot().private_rejected, 1);
    assert!(engine.swarm_peers(&target).is_empty());
    let table = engine.routing_table(AddressFamily::V4).unwrap();
    assert_eq!(table.pending(), 0);

    let psn = private_sequence_number(&secret, from.ip());
    let right = Query::get_peers(member, target)
        .with_descriptor(descriptor)
        .with_psn(Some(psn));
    engine.handle_packet(&encode_q(b"p1", &right), from, 2);
    let reply = only_reply(&recorder.take());
    let d = reply.descriptor.unwrap();
    assert!(d.has(FLAG_MEMBER) && d.has(FLAG_PRIVATE));
    assert_eq!(table.pending(), 1);
    // Backward peers only count once they announce.
    assert!(engine.swarm_peers(&target).is_empty());

    let announce = Query::announce_peer(member, target, reply.token.unwrap(), 6881)
        .with_descriptor(descriptor)
        .with_psn(Some(psn));
    engine.handle_packet(&encode_q(b"p2", &announce), from, 3);
    only_reply(&recorder.take());
    assert_eq!(engine.swarm_peers(&target).len(), 1);
    assert_eq!(engine.stats().snapshot().private_rejected, 1);
}

#[test]
fn test_spoofed_and_stale_replies_are_counted() {
    let (engine, recorder) = recorded_engine(v4_only());
    let peer = net("10.0.0.9:6881");
    assert!(engine.add_node(peer, 1).unwrap());
    let sent = recorder.take();
    let info = decode(&sent[0].0).unwrap().transaction_info().unwrap();
    assert_eq!(info.verb, Verb::Ping);

    let responder = NodeAddress([0x99; 20]);
    let reply_with = |tid: &[u8], sender: NodeAddress| {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let len = encode_reply(&mut buf, tid, &Reply::new(sender, peer)).unwrap();
        buf[..len].to_vec()
    };

    let forged = TransactionInfo {
        token: [info.token[0] ^ 0xff, info.token[1] ^ 0x5a],
        ..info
    };
    engine.handle_packet(&reply_with(&forged.pack(), responder), addr("10.0.0.9:6881"), 2);
    assert_eq!(engine.stats().snapshot().spoofed_replies, 1);

    let unknown = TransactionInfo::new(info.token, Verb::FindNode, TxnType::FindNode, 4242, 1);
    engine.handle_packet(&reply_with(&unknown.pack(), responder), addr("10.0.0.9:6881"), 2);
    assert_eq!(engine.stats().snapshot().stale_replies, 1);

    engine.handle_packet(&reply_with(&info.pack(), *engine.own_address()), addr("10.0.0.9:6881"), 2);
    assert_eq!(engine.stats().snapshot().protocol_violations, 1);

    engine.handle_packet(b"d1:te", addr("10.0.0.9:6881"), 2);
    assert_eq!(engine.stats().snapshot().corrupted, 1);
}

#[test]
fn test_one_transaction_per_target() {
    let (engine, _recorder) = recorded_engine(v4_only());
    let target = NodeAddress([0x12; 20]);
    let id = engine.find_node(target, 0).unwrap();
    assert_eq!(engine.find_node(target, 1).unwrap(), id);
    assert!(matches!(
        engine.join_swarm(target, SwarmConfig::default(), 1),
        Err(DhtError::TargetBusy)
    ));
    assert!(engine.stop_find_node(&target, 2));
    assert!(engine.lookup(&target).is_none());
    engine.conn_swarm(target, SwarmConfig::default(), 3).unwrap();
    assert!(engine.stop_swarm(&target, 4));
    assert!(!engine.is_swarm_mature(&target));
}

#[test]
fn test_first_tick_pings_bootstrap_list() {
    let store = Arc::new(MemoryBootstrapStore::new());
    store
        .save("net-ipv4", &[BootstrapEntry::new(net("10.9.9.9:6881"))])
        .unwrap();
    let config = DhtConfig {
        bootstrap_name: Some("net".to_string()),
        ..v4_only()
    };
    let (engine, recorder) = recorded_engine(config);
    let engine = engine.with_bootstrap_store(store);

    engine.tick(1);
    let sent = recorder.take();
    assert!(sent.iter().any(|(_, dest)| *dest == addr("10.9.9.9:6881")));

    engine.tick(2);
    assert!(!recorder
        .take()
        .iter()
        .any(|(_, dest)| *dest == addr("10.9.9.9:6881")));
}

#[test]
fn test_obfuscated_engines_understand_each_other() {
    let config = DhtConfig {
        obfuscate: true,
        ..v4_only()
    };
    let (a, a_out) = recorded_engine(config.clone());
    let (b, b_out) = recorded_engine(config);

    a.add_node(net("10.0.0.2:6881"), 1).unwrap();
    let (ping, _) = a_out.take().remove(0);
    assert!(decode(&ping).is_err());

    assert!(b.handle_packet(&ping, addr("10.0.0.1:6881"), 1));
    let (reply, _) = b_out.take().remove(0);
    assert!(a.handle_packet(&reply, addr("10.0.0.2:6881"), 2));
    assert_eq!(a.stats().snapshot().corrupted, 0);
    assert_eq!(a.rtt_samples().samples().len(), 1);
}

#[test]
fn test_plain_engine_reads_every_obfuscated_seed() {
    let (engine, recorder) = recorded_engine(v4_only());
    let ping = encode_q(b"ob", &Query::ping(NodeAddress([0x21; 20])));

    // Seed 0 leaves the leading `d` in place; others move it.
    for seed in [0u8, random_seed()] {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        buf[..ping.len()].copy_from_slice(&ping);
        let len = obfuscate(&mut buf, ping.len(), seed).unwrap();
        assert_eq!(buf[0] == b'd', seed == 0);

        assert!(engine.handle_packet(&buf[..len], addr("10.0.0.21:6881"), 1));
        only_reply(&recorder.take());
    }
    assert_eq!(engine.stats().snapshot().corrupted, 0);
}

#[test]
fn test_bootstrap_file_roundtrip() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = FileBootstrapStore::new(dir.path());
    assert!(store.load("missing").unwrap().is_empty());

    let entries = vec![
        BootstrapEntry::new(net("10.0.0.1:6881")),
        BootstrapEntry::with_alternate(net("[2001:db8::5]:6881"), net("[2001:db8::6]:6882")),
    ];
    store.save("swarm-a", &entries).unwrap();
    assert_eq!(store.load("swarm-a").unwrap(), entries);
    assert!(store.path_for("swarm-a").exists());
}

// ----------------------------------------------------------------------
// Simulated network
// ----------------------------------------------------------------------

#[derive(Default)]
struct SimNetwork {
    queue: Mutex<VecDeque<(SocketAddr, SocketAddr, Vec<u8>)>>,
    nodes: Mutex<HashMap<SocketAddr, Arc<DhtEngine>>>,
}

struct SimTransport {
    network: Arc<SimNetwork>,
    local: SocketAddr,
}

impl Transport for SimTransport {
    fn send(&self, buf: &[u8], dest: SocketAddr, _flags: SendFlags) -> bool {
        self.network
            .queue
            .lock()
            .push_back((self.local, dest, buf.to_vec()));
        true
    }
}

impl SimNetwork {
    fn spawn(self: &Arc<Self>, local: SocketAddr, config: DhtConfig) -> Arc<DhtEngine> {
        let transport = Arc::new(SimTransport {
            network: Arc::clone(self),
            local,
        });
        let engine = Arc::new(DhtEngine::new(config, transport));
        self.nodes.lock().insert(local, Arc::clone(&engine));
        engine
    }

    fn deliver(&self, now: Tick) {
        for _ in 0..100_000 {
            let next = self.queue.lock().pop_front();
            let Some((src, dst, data)) = next else {
                return;
            };
            let engine = self.nodes.lock().get(&dst).cloned();
            if let Some(engine) = engine {
                engine.handle_packet(&data, src, now);
            }
        }
    }

    fn run(&self, engines: &[Arc<DhtEngine>], ticks: std::ops::Range<Tick>) {
        for now in ticks {
            for engine in engines {
                engine.tick(now);
            }
            self.deliver(now);
        }
    }
}

#[test]
fn test_simulated_network_converges() {
    let network = Arc::new(SimNetwork::default());
    let endpoints: Vec<SocketAddr> = (1..=12).map(|i| addr(&format!("10.0.1.{}:6881", i))).collect();
    let engines: Vec<Arc<DhtEngine>> = endpoints
        .iter()
        .map(|&ep| network.spawn(ep, v4_only()))
        .collect();

    for engine in &engines[1..] {
        engine.add_node(NetworkAddress::from(endpoints[0]), 0).unwrap();
    }
    network.deliver(0);
    network.run(&engines, 1..400);

    for engine in &engines {
        let table = engine.routing_table(AddressFamily::V4).unwrap();
        assert!(table.node_count() >= 5, "only {} nodes known", table.node_count());
        assert!(table.snapshot().check_invariants());
    }

    let seeker = &engines[11];
    let target = *engines[3].own_address();
    seeker.find_node(target, 400).unwrap();
    network.run(&engines, 400..500);

    let lookup = seeker.lookup(&target).unwrap();
    assert!(lookup.found_nodes().iter().any(|n| n.address == target));
    assert_eq!(lookup.closest_distance_bits(), Some(0));
}

#[test]
fn test_simulated_swarm_members_find_each_other() {
    let network = Arc::new(SimNetwork::default());
    let endpoints: Vec<SocketAddr> = (1..=10).map(|i| addr(&format!("10.0.2.{}:6881", i))).collect();
    let engines: Vec<Arc<DhtEngine>> = endpoints
        .iter()
        .map(|&ep| network.spawn(ep, v4_only()))
        .collect();
    for engine in &engines[1..] {
        engine.add_node(NetworkAddress::from(endpoints[0]), 0).unwrap();
    }
    network.deliver(0);
    network.run(&engines, 1..200);

    let target = NodeAddress::from_content(b"sim-swarm");
    let members = [2usize, 5, 8];
    for &i in &members {
        engines[i]
            .join_swarm(target, SwarmConfig::default().with_expected_size(2), 200)
            .unwrap();
    }
    network.run(&engines, 200..800);

    for &i in &members {
        let peers = engines[i].swarm_peers(&target);
        let ips: Vec<IpAddr> = peers.iter().filter_map(|p| p.endpoint.ip()).collect();
        assert!(!ips.is_empty(), "member {} found nobody", i);
        for ip in ips {
            let index = endpoints.iter().position(|e| e.ip() == ip).unwrap();
            assert!(members.contains(&index), "non-member {} listed as a peer", index);
        }
    }
}
