//! Query and reply messages and their bencode-lite wire form.
//!
//! Decoding walks the datagram once with a bounded [`Reader`], dispatching
//! directly on key bytes. Keys we do not know are skipped only if they hold a
//! string or an integer; a list or dictionary anywhere we do not expect one
//! makes the whole packet corrupted.
//!
//! Our own transaction ids are 9 bytes: the rotating anti-spoof token, the
//! verb, the transaction type, a sequence number naming the transaction, and
//! the low 24 bits of the send tick. A reply echoes them back, which gives the
//! engine both routing and a latency sample for free.

use super::address::NodeAddress;
use super::error::DhtError;
use super::network::{AddressFamily, CompactAddress, NetworkAddress};
use super::Tick;
use crate::bencode::{BencodeError, Reader, Writer};
use crate::constants::{
    ADDRESS_LEN, COMPACT_NODE_V4_LEN, COMPACT_NODE_V6_LEN, COMPACT_PEER_V4_LEN,
    COMPACT_PEER_V6_LEN, COMPACT_V4_LEN, COMPACT_V6_LEN, DESCRIPTOR_LEN,
    MAX_FOREIGN_TRANSACTION_ID_LEN, MAX_REPLY_NODES, MAX_REPLY_PEERS, MAX_TOKEN_LEN,
    MAX_VERSION_LEN, PROTOCOL_VERSION, TRANSACTION_ID_LEN, VERSION_TAG,
};
use bytes::Bytes;

const TICK_MASK: u64 = 0x00ff_ffff;
const MAX_ERROR_MESSAGE_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Verb {
    Ping = 1,
    FindNode = 2,
    GetPeers = 3,
    AnnouncePeer = 4,
}

impl Verb {
    pub fn name(self) -> &'static [u8] {
        match self {
            Verb::Ping => b"ping",
            Verb::FindNode => b"find_node",
            Verb::GetPeers => b"get_peers",
            Verb::AnnouncePeer => b"announce_peer",
        }
    }

    pub fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"ping" => Some(Verb::Ping),
            b"find_node" => Some(Verb::FindNode),
            b"get_peers" => Some(Verb::GetPeers),
            b"announce_peer" => Some(Verb::AnnouncePeer),
            _ => None,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Verb::Ping),
            2 => Some(Verb::FindNode),
            3 => Some(Verb::GetPeers),
            4 => Some(Verb::AnnouncePeer),
            _ => None,
        }
    }
}

/// Which kind of transaction sent a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TxnType {
    Routing = 0,
    FindNode = 1,
    JoinSwarm = 2,
    ConnSwarm = 3,
}

impl TxnType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(TxnType::Routing),
            1 => Some(TxnType::FindNode),
            2 => Some(TxnType::JoinSwarm),
            3 => Some(TxnType::ConnSwarm),
            _ => None,
        }
    }
}

/// Fields packed into our 9-byte transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionInfo {
    pub token: [u8; 2],
    pub verb: Verb,
    pub txn_type: TxnType,
    pub seq: u16,
    /// Low 24 bits of the tick the query was sent at.
    pub sent_tick: u32,
}

impl TransactionInfo {
    pub fn new(token: [u8; 2], verb: Verb, txn_type: TxnType, seq: u16, now: Tick) -> Self {
        Self {
            token,
            verb,
            txn_type,
            seq,
            sent_tick: (now & TICK_MASK) as u32,
        }
    }

    pub fn pack(&self) -> [u8; TRANSACTION_ID_LEN] {
        let mut out = [0u8; TRANSACTION_ID_LEN];
        out[..2].copy_from_slice(&self.token);
        out[2] = self.verb as u8;
        out[3] = self.txn_type as u8;
        out[4..6].copy_from_slice(&self.seq.to_be_bytes());
        out[6..9].copy_from_slice(&self.sent_tick.to_be_bytes()[1..]);
        out
    }

    pub fn unpack(raw: &[u8]) -> Option<Self> {
        if raw.len() != TRANSACTION_ID_LEN {
            return None;
        }
        Some(Self {
            token: [raw[0], raw[1]],
            verb: Verb::from_u8(raw[2])?,
            txn_type: TxnType::from_u8(raw[3])?,
            seq: u16::from_be_bytes([raw[4], raw[5]]),
            sent_tick: u32::from_be_bytes([0, raw[6], raw[7], raw[8]]),
        })
    }

    /// Round trip in ticks; a send tick "in the future" clamps to zero.
    pub fn latency(&self, now: Tick) -> u32 {
        let elapsed = (now & TICK_MASK).wrapping_sub(self.sent_tick as u64) & TICK_MASK;
        if elapsed > TICK_MASK / 2 {
            0
        } else {
            elapsed as u32
        }
    }
}

/// Descriptor flag: the sender is leaving the swarm.
pub const FLAG_LEAVING: u16 = 0x0001;
/// Descriptor flag: the sender is a member of the queried swarm.
pub const FLAG_MEMBER: u16 = 0x0002;
/// Descriptor flag: the swarm is private.
pub const FLAG_PRIVATE: u16 = 0x0004;
/// Descriptor flag: the sender treats the recipient as a forward peer.
pub const FLAG_FORWARD: u16 = 0x0008;
/// Descriptor flag: the sender believes it cannot accept unsolicited packets.
pub const FLAG_FIREWALLED: u16 = 0x0010;

/// The 12-byte node descriptor: how to reach the sender and what it wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeDescriptor {
    pub flags: u16,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub app_port: u16,
    pub swarm_size: u16,
    pub version: u16,
}

impl NodeDescriptor {
    pub fn new(flags: u16, udp_port: u16) -> Self {
        Self {
            flags,
            udp_port,
            version: PROTOCOL_VERSION,
            ..Default::default()
        }
    }

    pub fn has(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    pub fn to_bytes(&self) -> [u8; DESCRIPTOR_LEN] {
        let mut out = [0u8; DESCRIPTOR_LEN];
        for (i, v) in [
            self.flags,
            self.udp_port,
            self.tcp_port,
            self.app_port,
            self.swarm_size,
            self.version,
        ]
        .iter()
        .enumerate()
        {
            out[i * 2..i * 2 + 2].copy_from_slice(&v.to_be_bytes());
        }
        out
    }

    pub fn from_bytes(raw: &[u8; DESCRIPTOR_LEN]) -> Self {
        let word = |i: usize| u16::from_be_bytes([raw[i * 2], raw[i * 2 + 1]]);
        Self {
            flags: word(0),
            udp_port: word(1),
            tcp_port: word(2),
            app_port: word(3),
            swarm_size: word(4),
            version: word(5),
        }
    }
}

/// A short opaque byte string held inline (announce tokens, transaction ids, version tags).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShortBytes<const N: usize> {
    bytes: [u8; N],
    len: u8,
}

impl<const N: usize> ShortBytes<N> {
    pub fn from_slice(data: &[u8]) -> Option<Self> {
        if data.len() > N {
            return None;
        }
        let mut bytes = [0u8; N];
        bytes[..data.len()].copy_from_slice(data);
        Some(Self {
            bytes,
            len: data.len() as u8,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<const N: usize> std::fmt::Debug for ShortBytes<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.as_slice() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

pub type Token = ShortBytes<MAX_TOKEN_LEN>;
pub type Tid = ShortBytes<MAX_FOREIGN_TRANSACTION_ID_LEN>;
pub type VersionTag = ShortBytes<MAX_VERSION_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactNode {
    pub address: NodeAddress,
    pub endpoint: NetworkAddress,
}

/// A swarm peer as relayed to a third party.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactPeer {
    pub address: NodeAddress,
    pub endpoint: NetworkAddress,
    /// Alternate address, still cloaked with the swarm's key.
    pub cloaked_alternate: CompactAddress,
}

/// Bitmask of the fields a decoded message actually carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Fields(u32);

impl Fields {
    pub const TID: Fields = Fields(1 << 0);
    pub const VERSION: Fields = Fields(1 << 1);
    pub const ID: Fields = Fields(1 << 2);
    pub const TARGET: Fields = Fields(1 << 3);
    pub const INFO_HASH: Fields = Fields(1 << 4);
    pub const TOKEN: Fields = Fields(1 << 5);
    pub const PORT: Fields = Fields(1 << 6);
    pub const DESCRIPTOR: Fields = Fields(1 << 7);
    pub const PSN: Fields = Fields(1 << 8);
    pub const CLOAK: Fields = Fields(1 << 9);
    pub const IP: Fields = Fields(1 << 10);
    pub const NODES: Fields = Fields(1 << 11);
    pub const NODES6: Fields = Fields(1 << 12);
    pub const PEERS: Fields = Fields(1 << 13);
    pub const PEERS6: Fields = Fields(1 << 14);
    pub const ERROR: Fields = Fields(1 << 15);

    pub fn contains(self, other: Fields) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Fields) {
        self.0 |= other.0;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub verb: Verb,
    pub sender: NodeAddress,
    /// `target` for find_node, `info_hash` for get_peers / announce_peer.
    pub target: Option<NodeAddress>,
    pub token: Option<Token>,
    pub port: Option<u16>,
    pub descriptor: Option<NodeDescriptor>,
    pub psn: Option<u32>,
    pub cloaked: Option<CompactAddress>,
}

impl Query {
    fn new(verb: Verb, sender: NodeAddress, target: Option<NodeAddress>) -> Self {
        Self {
            verb,
            sender,
            target,
            token: None,
            port: None,
            descriptor: None,
            psn: None,
            cloaked: None,
        }
    }

    pub fn ping(sender: NodeAddress) -> Self {
        Self::new(Verb::Ping, sender, None)
    }

    pub fn find_node(sender: NodeAddress, target: NodeAddress) -> Self {
        Self::new(Verb::FindNode, sender, Some(target))
    }

    pub fn get_peers(sender: NodeAddress, info_hash: NodeAddress) -> Self {
        Self::new(Verb::GetPeers, sender, Some(info_hash))
    }

    pub fn announce_peer(sender: NodeAddress, info_hash: NodeAddress, token: Token, port: u16) -> Self {
        let mut q = Self::new(Verb::AnnouncePeer, sender, Some(info_hash));
        q.token = Some(token);
        q.port = Some(port);
        q
    }

    pub fn with_descriptor(mut self, descriptor: NodeDescriptor) -> Self {
        self.descriptor = Some(descriptor);
        self
    }

    pub fn with_psn(mut self, psn: Option<u32>) -> Self {
        self.psn = psn;
        self
    }

    pub fn with_cloaked(mut self, cloaked: Option<CompactAddress>) -> Self {
        self.cloaked = cloaked;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reply {
    pub sender: NodeAddress,
    /// The requester's address as the responder observed it.
    pub requester: NetworkAddress,
    pub descriptor: Option<NodeDescriptor>,
    pub nodes: Vec<CompactNode>,
    pub nodes6: Vec<CompactNode>,
    pub peers: Vec<CompactPeer>,
    pub peers6: Vec<CompactPeer>,
    pub token: Option<Token>,
    pub psn: Option<u32>,
}

impl Reply {
    pub fn new(sender: NodeAddress, requester: NetworkAddress) -> Self {
        Self {
            sender,
            requester,
            ..Default::default()
        }
    }

    /// Files `nodes` under the v4 or v6 list by endpoint family.
    pub fn push_nodes(&mut self, nodes: impl IntoIterator<Item = CompactNode>) {
        for node in nodes {
            match node.endpoint.family() {
                Some(AddressFamily::V4) => self.nodes.push(node),
                Some(AddressFamily::V6) => self.nodes6.push(node),
                None => {}
            }
        }
    }

    pub fn push_peer(&mut self, peer: CompactPeer) {
        match peer.endpoint.family() {
            Some(AddressFamily::V4) => self.peers.push(peer),
            Some(AddressFamily::V6) => self.peers6.push(peer),
            None => {}
        }
    }

    pub fn all_nodes(&self) -> impl Iterator<Item = &CompactNode> {
        self.nodes.iter().chain(self.nodes6.iter())
    }

    pub fn all_peers(&self) -> impl Iterator<Item = &CompactPeer> {
        self.peers.iter().chain(self.peers6.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReply {
    pub code: i64,
    pub message: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Query(Query),
    Reply(Reply),
    Error(ErrorReply),
}

/// A decoded datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub tid: Tid,
    pub version: Option<VersionTag>,
    pub fields: Fields,
    pub body: Body,
}

impl Message {
    /// Our packed transaction info, if the id has our shape.
    pub fn transaction_info(&self) -> Option<TransactionInfo> {
        TransactionInfo::unpack(self.tid.as_slice())
    }
}

/// Everything an argument or result dictionary may carry.
#[derive(Default)]
struct RawFields {
    id: Option<NodeAddress>,
    target: Option<NodeAddress>,
    info_hash: Option<NodeAddress>,
    token: Option<Token>,
    port: Option<u16>,
    descriptor: Option<NodeDescriptor>,
    psn: Option<u32>,
    cloaked: Option<CompactAddress>,
    ip: Option<NetworkAddress>,
    nodes: Vec<CompactNode>,
    nodes6: Vec<CompactNode>,
    peers: Vec<CompactPeer>,
    peers6: Vec<CompactPeer>,
}

/// Decodes one datagram.
///
/// Any structural problem, out-of-bounds length or missing required field is
/// an error; the caller treats every error as a corrupted packet.
pub fn decode(data: &[u8]) -> Result<Message, DhtError> {
    let mut reader = Reader::new(data);
    let mut fields = Fields::default();

    let mut kind: Option<u8> = None;
    let mut query_name: Option<&[u8]> = None;
    let mut tid: Option<Tid> = None;
    let mut version: Option<VersionTag> = None;
    let mut args: Option<RawFields> = None;
    let mut results: Option<RawFields> = None;
    let mut error: Option<ErrorReply> = None;

    reader.expect(b'd')?;
    while !reader.end_of_container()? {
        let key = reader.read_bytes()?;
        match key {
            b"a" => args = Some(decode_fields(&mut reader, &mut fields)?),
            b"r" => results = Some(decode_fields(&mut reader, &mut fields)?),
            b"e" => {
                error = Some(decode_error(&mut reader)?);
                fields.insert(Fields::ERROR);
            }
            b"q" => query_name = Some(reader.read_bytes()?),
            b"t" => {
                tid = Some(
                    Tid::from_slice(reader.read_bytes()?)
                        .ok_or(DhtError::InvalidMessage("transaction id too long"))?,
                );
                fields.insert(Fields::TID);
            }
            b"v" => {
                version = Some(
                    VersionTag::from_slice(reader.read_bytes()?)
                        .ok_or(DhtError::InvalidMessage("version too long"))?,
                );
                fields.insert(Fields::VERSION);
            }
            b"y" => {
                let y = reader.read_bytes()?;
                if y.len() != 1 {
                    return Err(DhtError::InvalidMessage("bad message type"));
                }
                kind = Some(y[0]);
            }
            _ => reader.skip_scalar()?,
        }
    }
    reader.finish()?;

    let tid = tid.ok_or(DhtError::InvalidMessage("missing transaction id"))?;

    let body = match kind {
        Some(b'q') => {
            let verb = query_name
                .and_then(Verb::from_name)
                .ok_or(DhtError::InvalidMessage("unknown query"))?;
            let args = args.ok_or(DhtError::InvalidMessage("missing query args"))?;
            Body::Query(build_query(verb, args)?)
        }
        Some(b'r') => {
            let results = results.ok_or(DhtError::InvalidMessage("missing results"))?;
            Body::Reply(build_reply(results)?)
        }
        Some(b'e') => Body::Error(error.ok_or(DhtError::InvalidMessage("missing error list"))?),
        _ => return Err(DhtError::InvalidMessage("unknown message type")),
    };

    Ok(Message {
        tid,
        version,
        fields,
        body,
    })
}

fn build_query(verb: Verb, raw: RawFields) -> Result<Query, DhtError> {
    let sender = raw.id.ok_or(DhtError::InvalidMessage("missing id"))?;
    let target = match verb {
        Verb::Ping => None,
        Verb::FindNode => Some(raw.target.ok_or(DhtError::InvalidMessage("missing target"))?),
        Verb::GetPeers | Verb::AnnouncePeer => Some(
            raw.info_hash
                .ok_or(DhtError::InvalidMessage("missing info_hash"))?,
        ),
    };
    if verb == Verb::AnnouncePeer && raw.token.is_none() {
        return Err(DhtError::InvalidMessage("missing token"));
    }

    Ok(Query {
        verb,
        sender,
        target,
        token: raw.token,
        port: raw.port,
        descriptor: raw.descriptor,
        psn: raw.psn,
        cloaked: raw.cloaked,
    })
}

fn build_reply(raw: RawFields) -> Result<Reply, DhtError> {
    let sender = raw.id.ok_or(DhtError::InvalidMessage("missing id"))?;
    Ok(Reply {
        sender,
        requester: raw.ip.unwrap_or_default(),
        descriptor: raw.descriptor,
        nodes: raw.nodes,
        nodes6: raw.nodes6,
        peers: raw.peers,
        peers6: raw.peers6,
        token: raw.token,
        psn: raw.psn,
    })
}

fn decode_fields(reader: &mut Reader<'_>, fields: &mut Fields) -> Result<RawFields, DhtError> {
    let mut raw = RawFields::default();

    reader.expect(b'd')?;
    while !reader.end_of_container()? {
        let key = reader.read_bytes()?;
        match key {
            b"cl" => {
                raw.cloaked = Some(CompactAddress::from_slice(reader.read_bytes()?)?);
                fields.insert(Fields::CLOAK);
            }
            b"id" => {
                raw.id = Some(NodeAddress(reader.read_fixed::<ADDRESS_LEN>()?));
                fields.insert(Fields::ID);
            }
            b"info_hash" => {
                raw.info_hash = Some(NodeAddress(reader.read_fixed::<ADDRESS_LEN>()?));
                fields.insert(Fields::INFO_HASH);
            }
            b"ip" => {
                raw.ip = Some(NetworkAddress::from_compact(reader.read_bytes()?)?);
                fields.insert(Fields::IP);
            }
            b"n" => {
                let bytes = reader.read_fixed::<DESCRIPTOR_LEN>()?;
                raw.descriptor = Some(NodeDescriptor::from_bytes(&bytes));
                fields.insert(Fields::DESCRIPTOR);
            }
            b"nodes" => {
                raw.nodes = decode_nodes(reader.read_bytes()?, COMPACT_NODE_V4_LEN)?;
                fields.insert(Fields::NODES);
            }
            b"nodes6" => {
                raw.nodes6 = decode_nodes(reader.read_bytes()?, COMPACT_NODE_V6_LEN)?;
                fields.insert(Fields::NODES6);
            }
            b"peers" => {
                raw.peers = decode_peers(reader.read_bytes()?, COMPACT_V4_LEN)?;
                fields.insert(Fields::PEERS);
            }
            b"peers6" => {
                raw.peers6 = decode_peers(reader.read_bytes()?, COMPACT_V6_LEN)?;
                fields.insert(Fields::PEERS6);
            }
            b"port" => {
                let port = reader.read_integer()?;
                raw.port = Some(
                    u16::try_from(port).map_err(|_| DhtError::InvalidMessage("port out of range"))?,
                );
                fields.insert(Fields::PORT);
            }
            b"ps" => {
                raw.psn = Some(u32::from_be_bytes(reader.read_fixed::<4>()?));
                fields.insert(Fields::PSN);
            }
            b"target" => {
                raw.target = Some(NodeAddress(reader.read_fixed::<ADDRESS_LEN>()?));
                fields.insert(Fields::TARGET);
            }
            b"token" => {
                raw.token = Some(
                    Token::from_slice(reader.read_bytes()?)
                        .ok_or(DhtError::InvalidMessage("token too long"))?,
                );
                fields.insert(Fields::TOKEN);
            }
            _ => reader.skip_scalar()?,
        }
    }

    Ok(raw)
}

fn decode_nodes(data: &[u8], record: usize) -> Result<Vec<CompactNode>, DhtError> {
    if data.len() % record != 0 {
        return Err(DhtError::InvalidMessage("ragged node list"));
    }
    let mut nodes = Vec::with_capacity(data.len() / record);
    for chunk in data.chunks_exact(record) {
        let address = NodeAddress::from_bytes(&chunk[..ADDRESS_LEN])?;
        let endpoint = NetworkAddress::from_compact(&chunk[ADDRESS_LEN..])?;
        if endpoint.is_empty() || endpoint.port() == 0 {
            continue;
        }
        nodes.push(CompactNode { address, endpoint });
    }
    Ok(nodes)
}

fn decode_peers(data: &[u8], compact: usize) -> Result<Vec<CompactPeer>, DhtError> {
    let record = ADDRESS_LEN + 2 * compact;
    debug_assert!(record == COMPACT_PEER_V4_LEN || record == COMPACT_PEER_V6_LEN);
    if data.len() % record != 0 {
        return Err(DhtError::InvalidMessage("ragged peer list"));
    }
    let mut peers = Vec::with_capacity(data.len() / record);
    for chunk in data.chunks_exact(record) {
        let address = NodeAddress::from_bytes(&chunk[..ADDRESS_LEN])?;
        let endpoint = NetworkAddress::from_compact(&chunk[ADDRESS_LEN..ADDRESS_LEN + compact])?;
        let cloaked_alternate = CompactAddress::from_slice(&chunk[ADDRESS_LEN + compact..])?;
        if endpoint.is_empty() || endpoint.port() == 0 {
            continue;
        }
        peers.push(CompactPeer {
            address,
            endpoint,
            cloaked_alternate,
        });
    }
    Ok(peers)
}

fn decode_error(reader: &mut Reader<'_>) -> Result<ErrorReply, DhtError> {
    reader.expect(b'l')?;
    let code = reader.read_integer()?;
    let message = reader.read_bytes()?;
    if message.len() > MAX_ERROR_MESSAGE_LEN {
        return Err(DhtError::InvalidMessage("error message too long"));
    }
    if !reader.end_of_container()? {
        return Err(DhtError::InvalidMessage("trailing error fields"));
    }
    Ok(ErrorReply {
        code,
        message: Bytes::copy_from_slice(message),
    })
}

fn too_small(e: BencodeError) -> DhtError {
    match e {
        BencodeError::BufferTooSmall => DhtError::BufferTooSmall,
        other => DhtError::Corrupted(other),
    }
}

/// Encodes a query into `buf`, returning the encoded length.
pub fn encode_query(buf: &mut [u8], tid: &[u8], query: &Query) -> Result<usize, DhtError> {
    encode_query_at(buf, tid, query).map(|(len, _)| len)
}

/// Like [`encode_query`], also returning the offset of the transaction id
/// bytes so a template can rewrite them in place.
pub(crate) fn encode_query_at(
    buf: &mut [u8],
    tid: &[u8],
    query: &Query,
) -> Result<(usize, usize), DhtError> {
    let mut w = Writer::new(buf);
    let tid_offset = write_query(&mut w, tid, query).map_err(too_small)?;
    Ok((w.position(), tid_offset))
}

fn write_query(w: &mut Writer<'_>, tid: &[u8], q: &Query) -> Result<usize, BencodeError> {
    w.begin_dict()?;

    w.put_key(b"a")?;
    w.begin_dict()?;
    if let Some(cloaked) = &q.cloaked {
        w.put_key_bytes(b"cl", cloaked.as_slice())?;
    }
    w.put_key_bytes(b"id", q.sender.as_bytes())?;
    if let Some(target) = &q.target {
        if q.verb != Verb::FindNode {
            w.put_key_bytes(b"info_hash", target.as_bytes())?;
        }
    }
    if let Some(descriptor) = &q.descriptor {
        w.put_key_bytes(b"n", &descriptor.to_bytes())?;
    }
    if let Some(port) = q.port {
        w.put_key_integer(b"port", port as i64)?;
    }
    if let Some(psn) = q.psn {
        w.put_key_bytes(b"ps", &psn.to_be_bytes())?;
    }
    if let Some(target) = &q.target {
        if q.verb == Verb::FindNode {
            w.put_key_bytes(b"target", target.as_bytes())?;
        }
    }
    if let Some(token) = &q.token {
        w.put_key_bytes(b"token", token.as_slice())?;
    }
    w.end()?;

    w.put_key_bytes(b"q", q.verb.name())?;
    let tid_offset = write_trailer(w, tid, b"q")?;
    Ok(tid_offset)
}

/// Writes `t`, `v` and `y` and closes the top-level dict; returns the tid offset.
fn write_trailer(w: &mut Writer<'_>, tid: &[u8], kind: &[u8]) -> Result<usize, BencodeError> {
    w.put_key(b"t")?;
    w.put_string_header(tid.len())?;
    let tid_offset = w.position();
    w.put_raw(tid)?;
    w.put_key_bytes(b"v", VERSION_TAG)?;
    w.put_key_bytes(b"y", kind)?;
    w.end()?;
    Ok(tid_offset)
}

/// Encodes a reply into `buf`, returning the encoded length.
///
/// Node and peer lists beyond the per-reply caps are silently truncated.
pub fn encode_reply(buf: &mut [u8], tid: &[u8], reply: &Reply) -> Result<usize, DhtError> {
    let mut w = Writer::new(buf);
    write_reply(&mut w, tid, reply).map_err(too_small)?;
    Ok(w.position())
}

fn write_reply(w: &mut Writer<'_>, tid: &[u8], r: &Reply) -> Result<(), BencodeError> {
    w.begin_dict()?;

    w.put_key(b"r")?;
    w.begin_dict()?;
    w.put_key_bytes(b"id", r.sender.as_bytes())?;
    if let Some(ip) = r.requester.to_compact() {
        w.put_key_bytes(b"ip", ip.as_slice())?;
    }
    if let Some(descriptor) = &r.descriptor {
        w.put_key_bytes(b"n", &descriptor.to_bytes())?;
    }
    if !r.nodes.is_empty() {
        w.put_key(b"nodes")?;
        write_nodes(w, &r.nodes, AddressFamily::V4)?;
    }
    if !r.nodes6.is_empty() {
        w.put_key(b"nodes6")?;
        write_nodes(w, &r.nodes6, AddressFamily::V6)?;
    }
    if !r.peers.is_empty() {
        w.put_key(b"peers")?;
        write_peers(w, &r.peers, AddressFamily::V4)?;
    }
    if !r.peers6.is_empty() {
        w.put_key(b"peers6")?;
        write_peers(w, &r.peers6, AddressFamily::V6)?;
    }
    if let Some(psn) = r.psn {
        w.put_key_bytes(b"ps", &psn.to_be_bytes())?;
    }
    if let Some(token) = &r.token {
        w.put_key_bytes(b"token", token.as_slice())?;
    }
    w.end()?;

    write_trailer(w, tid, b"r")?;
    Ok(())
}

fn write_nodes(
    w: &mut Writer<'_>,
    nodes: &[CompactNode],
    family: AddressFamily,
) -> Result<(), BencodeError> {
    let count = nodes.len().min(MAX_REPLY_NODES);
    w.put_string_header(count * (ADDRESS_LEN + family.compact_len()))?;
    let mut compact = CompactAddress::new(family);
    for node in &nodes[..count] {
        w.put_raw(node.address.as_bytes())?;
        node.endpoint.write_compact(family, compact.as_mut_slice());
        w.put_raw(compact.as_slice())?;
    }
    Ok(())
}

fn write_peers(
    w: &mut Writer<'_>,
    peers: &[CompactPeer],
    family: AddressFamily,
) -> Result<(), BencodeError> {
    let count = peers.len().min(MAX_REPLY_PEERS);
    w.put_string_header(count * (ADDRESS_LEN + 2 * family.compact_len()))?;
    let mut compact = CompactAddress::new(family);
    for peer in &peers[..count] {
        w.put_raw(peer.address.as_bytes())?;
        peer.endpoint.write_compact(family, compact.as_mut_slice());
        w.put_raw(compact.as_slice())?;
        if peer.cloaked_alternate.family() == family {
            w.put_raw(peer.cloaked_alternate.as_slice())?;
        } else {
            w.put_raw(CompactAddress::new(family).as_slice())?;
        }
    }
    Ok(())
}

/// Encodes an error reply into `buf`, returning the encoded length.
pub fn encode_error(buf: &mut [u8], tid: &[u8], code: i64, message: &[u8]) -> Result<usize, DhtError> {
    let mut w = Writer::new(buf);
    let result: Result<(), BencodeError> = (|| {
        w.begin_dict()?;
        w.put_key(b"e")?;
        w.begin_list()?;
        w.put_integer(code)?;
        w.put_bytes(message)?;
        w.end()?;
        write_trailer(&mut w, tid, b"e")?;
        Ok(())
    })();
    result.map_err(too_small)?;
    Ok(w.position())
}

/// A query a transaction wants sent; the engine stamps the transaction id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Outbound {
    pub dest: NetworkAddress,
    pub query: Query,
    pub txn_type: TxnType,
    pub seq: u16,
    /// Fire-and-forget; nobody waits for the reply.
    pub droppable: bool,
}
