use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::base::{secure_distance, Contact, ServeOutcome, SwarmCore, SwarmEvent, SwarmHost};
use super::output::OutputPeers;
use super::peer::{SwarmPeer, SwarmPeerView, SwarmRole};
use super::SwarmProtocol;
use crate::constants::{FORWARD_FASTEST, FORWARD_RECOMPUTE_TICKS};
use crate::dht::address::NodeAddress;
use crate::dht::config::SwarmConfig;
use crate::dht::message::{
    Outbound, Query, Reply, TxnType, FLAG_FORWARD, FLAG_LEAVING, FLAG_MEMBER,
};
use crate::dht::network::NetworkAddress;
use crate::dht::registry::TxnId;
use crate::dht::Tick;

struct JoinState {
    core: SwarmCore,
    last_recompute: Tick,
}

/// Membership with directed relations.
///
/// We query our forward peers and announce ourselves to them; backward peers
/// query us and announce themselves with a token we issued. A backward peer
/// counts once it is established: announced, and still querying within its
/// TTL. The swarm is mature when more than half the expected size is
/// reachable in each direction.
pub struct JoinSwarm {
    private: bool,
    target: NodeAddress,
    own: NodeAddress,
    state: Mutex<JoinState>,
    output: OutputPeers,
}

impl JoinSwarm {
    pub(crate) fn new(id: TxnId, target: NodeAddress, own: NodeAddress, config: SwarmConfig, now: Tick) -> Self {
        Self {
            private: config.secret.is_some(),
            target,
            own,
            state: Mutex::new(JoinState {
                core: SwarmCore::new(id, target, TxnType::JoinSwarm, config, now),
                last_recompute: now,
            }),
            output: OutputPeers::new(),
        }
    }

    pub fn target(&self) -> &NodeAddress {
        &self.target
    }

    pub fn is_mature(&self) -> bool {
        self.state.lock().core.mature
    }

    /// Live peers, forward ones first in rank order.
    pub fn peers(&self) -> Arc<Vec<SwarmPeerView>> {
        self.output.current()
    }

    /// Forward peers that have answered and are not missing replies.
    pub fn forward_count(&self) -> usize {
        forward_count(&self.state.lock().core)
    }

    pub fn established_count(&self, now: Tick) -> usize {
        established_count(&self.state.lock().core, now)
    }

    fn finish(&self, core: &mut SwarmCore, now: Tick) -> Vec<SwarmEvent> {
        let n = core.expected();
        let mature = forward_count(core) * 2 > n && established_count(core, now) * 2 > n;
        core.set_mature(mature);
        core.publish(&self.output, now);
        core.take_events()
    }
}

fn forward_count(core: &SwarmCore) -> usize {
    core.peers
        .iter()
        .filter(|p| p.role == SwarmRole::Forward && p.latency.is_some() && p.missed == 0)
        .count()
}

fn established_count(core: &SwarmCore, now: Tick) -> usize {
    core.peers
        .iter()
        .filter(|p| p.role == SwarmRole::Backward && p.is_established(now))
        .count()
}

/// Announces ourselves to forward peers that handed us a token.
fn announce_pending(core: &mut SwarmCore, host: &dyn SwarmHost, out: &mut Vec<Outbound>) {
    let mut pending = Vec::new();
    for peer in core.peers.iter_mut() {
        if peer.role != SwarmRole::Forward || peer.announced {
            continue;
        }
        if let Some(token) = peer.token {
            peer.announced = true;
            pending.push((peer.endpoint, token));
        }
    }
    for (dest, token) in pending {
        trace!("Swarm {:?}: announcing to forward peer {}", core.target, dest);
        if let Some(a) = core.announce(dest, token, host) {
            out.push(a);
        }
    }
}

/// Reorders the peer list and trims forward peers to the expected size.
///
/// Forward: the fastest few by latency, then the rest by salted distance to
/// the target with ring offset from our address as the tiebreak. Backward:
/// established first, then the same distance order.
fn recompute(core: &mut SwarmCore, own: &NodeAddress, now: Tick) {
    let expected = core.expected();
    let salt = core.salt;
    let target = core.target;
    let rank = |p: &SwarmPeer| (secure_distance(&salt, &target, &p.address), p.address.ring_offset(own));

    let (mut forward, mut backward): (Vec<SwarmPeer>, Vec<SwarmPeer>) = core
        .peers
        .drain(..)
        .partition(|p| p.role == SwarmRole::Forward);

    forward.sort_by_key(|p| p.latency.unwrap_or(u32::MAX));
    let mut rest = forward.split_off(forward.len().min(FORWARD_FASTEST));
    rest.sort_by_cached_key(rank);
    forward.extend(rest);
    let dropped = if forward.len() > expected {
        forward.split_off(expected)
    } else {
        Vec::new()
    };

    backward.sort_by_cached_key(|p| (!p.is_established(now), rank(p)));

    core.peers = forward;
    core.peers.extend(backward);
    for peer in dropped {
        debug!("Swarm {:?}: forward peer {:?} ranked out", target, peer.address);
        if !core.peers.iter().any(|p| p.address == peer.address) {
            core.events.push(SwarmEvent::Dropped(peer.address));
        }
    }
    core.dirty = true;
}

impl SwarmProtocol for JoinSwarm {
    fn is_private(&self) -> bool {
        self.private
    }

    fn target(&self) -> &NodeAddress {
        &self.target
    }

    fn tick(&self, now: Tick, host: &dyn SwarmHost, out: &mut Vec<Outbound>) -> Vec<SwarmEvent> {
        let mut state = self.state.lock();
        let st = &mut *state;
        let core = &mut st.core;

        core.collect_garbage(now);
        core.expire_queries(now, SwarmRole::Forward);
        core.drop_where(now, false, |p| p.role == SwarmRole::Forward && p.is_stale(now));
        core.drop_where(now, true, |p| p.role == SwarmRole::Backward && p.is_stale(now));

        if now.saturating_sub(st.last_recompute) >= FORWARD_RECOMPUTE_TICKS {
            st.last_recompute = now;
            recompute(core, &self.own, now);
        }

        core.refresh_peers(now, SwarmRole::Forward, FLAG_FORWARD, host, out);

        let previous = core.last_announce;
        core.announce_cycle(now, host, out);
        if core.last_announce != previous {
            // Tokens expire; announce again on the next reply.
            for peer in core.peers.iter_mut().filter(|p| p.role == SwarmRole::Forward) {
                peer.announced = false;
            }
        }
        announce_pending(core, host, out);

        if !core.mature {
            core.discover(now, host, out);
        }
        core.save(now, host, false);

        self.finish(core, now)
    }

    fn on_reply(
        &self,
        reply: &Reply,
        from: NetworkAddress,
        latency: u32,
        now: Tick,
        host: &dyn SwarmHost,
        out: &mut Vec<Outbound>,
    ) -> (bool, Vec<SwarmEvent>) {
        let mut state = self.state.lock();
        let core = &mut state.core;

        let member = reply.descriptor.is_some_and(|d| d.has(FLAG_MEMBER));
        if member {
            if !core.check_private(reply.psn, &from) {
                debug!("Swarm {:?}: member reply from {} failed the private check", self.target, from);
                return (false, Vec::new());
            }
            let mut contact = Contact::new(reply.sender, from, SwarmRole::Forward);
            contact.latency = Some(latency);
            contact.token = reply.token;
            core.on_contact(contact, now);
            announce_pending(core, host, out);
        } else if let Some(token) = reply.token {
            if let Some(a) = core.announce(from, token, host) {
                out.push(a);
            }
        }

        let short = !core.mature;
        core.follow_reply(reply, now, host, out, short);
        (true, self.finish(core, now))
    }

    fn on_get_peers(
        &self,
        query: &Query,
        from: NetworkAddress,
        now: Tick,
        host: &dyn SwarmHost,
    ) -> (ServeOutcome, Vec<SwarmEvent>) {
        let mut state = self.state.lock();
        let core = &mut state.core;

        if !core.check_private(query.psn, &from) {
            return (ServeOutcome::Rejected, Vec::new());
        }
        let descriptor = query.descriptor.unwrap_or_default();
        if descriptor.has(FLAG_LEAVING) {
            core.on_leaving(query.sender, from, descriptor.has(FLAG_FORWARD), now);
            return (ServeOutcome::Silent, self.finish(core, now));
        }
        if descriptor.has(FLAG_MEMBER) {
            let mut contact = Contact::new(query.sender, from, SwarmRole::Backward);
            contact.is_query = true;
            contact.alternate = core.decloak(query.cloaked.as_ref());
            core.on_contact(contact, now);
        }

        let good = core.peers.iter().filter(|p| p.is_good(now)).count();
        let outcome = core.serve(&query.sender, &from, now, host, good);
        (outcome, self.finish(core, now))
    }

    fn on_announce(&self, query: &Query, from: NetworkAddress, now: Tick) -> (bool, Vec<SwarmEvent>) {
        let mut state = self.state.lock();
        let core = &mut state.core;

        if !core.check_private(query.psn, &from) {
            return (false, Vec::new());
        }
        let mut contact = Contact::new(query.sender, from, SwarmRole::Backward);
        contact.is_query = true;
        contact.announced = true;
        contact.alternate = core.decloak(query.cloaked.as_ref());
        core.on_contact(contact, now);
        (true, self.finish(core, now))
    }

    fn stop(&self, now: Tick, host: &dyn SwarmHost, out: &mut Vec<Outbound>) -> Vec<SwarmEvent> {
        let mut state = self.state.lock();
        let core = &mut state.core;
        core.leave(now, host, out);
        self.finish(core, now)
    }

    fn peers(&self) -> Arc<Vec<SwarmPeerView>> {
        JoinSwarm::peers(self)
    }

    fn is_mature(&self) -> bool {
        JoinSwarm::is_mature(self)
    }
}
