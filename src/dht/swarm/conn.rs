use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::base::{Contact, ServeOutcome, SwarmCore, SwarmEvent, SwarmHost};
use super::output::OutputPeers;
use super::peer::{SwarmPeerView, SwarmRole};
use super::SwarmProtocol;
use crate::dht::address::NodeAddress;
use crate::dht::config::SwarmConfig;
use crate::dht::message::{Outbound, Query, Reply, TxnType, FLAG_FORWARD, FLAG_LEAVING, FLAG_MEMBER};
use crate::dht::network::NetworkAddress;
use crate::dht::registry::TxnId;
use crate::dht::Tick;

/// Membership for connectivity only: a flat peer set kept alive with
/// periodic `get_peers`, without the announce handshake between members.
pub struct ConnSwarm {
    private: bool,
    target: NodeAddress,
    core: Mutex<SwarmCore>,
    output: OutputPeers,
}

impl ConnSwarm {
    pub(crate) fn new(id: TxnId, target: NodeAddress, config: SwarmConfig, now: Tick) -> Self {
        Self {
            private: config.secret.is_some(),
            target,
            core: Mutex::new(SwarmCore::new(id, target, TxnType::ConnSwarm, config, now)),
            output: OutputPeers::new(),
        }
    }

    pub fn target(&self) -> &NodeAddress {
        &self.target
    }

    pub fn is_mature(&self) -> bool {
        self.core.lock().mature
    }

    pub fn peers(&self) -> Arc<Vec<SwarmPeerView>> {
        self.output.current()
    }

    pub fn discovered_count(&self, now: Tick) -> usize {
        discovered_count(&self.core.lock(), now)
    }

    fn finish(&self, core: &mut SwarmCore, now: Tick) -> Vec<SwarmEvent> {
        let mature = discovered_count(core, now) * 2 > core.expected();
        core.set_mature(mature);
        core.publish(&self.output, now);
        core.take_events()
    }
}

fn discovered_count(core: &SwarmCore, now: Tick) -> usize {
    core.peers.iter().filter(|p| p.is_good(now)).count()
}

impl SwarmProtocol for ConnSwarm {
    fn is_private(&self) -> bool {
        self.private
    }

    fn target(&self) -> &NodeAddress {
        &self.target
    }

    fn tick(&self, now: Tick, host: &dyn SwarmHost, out: &mut Vec<Outbound>) -> Vec<SwarmEvent> {
        let mut core = self.core.lock();

        core.collect_garbage(now);
        core.expire_queries(now, SwarmRole::Flat);
        core.drop_where(now, false, |p| p.is_stale(now));
        core.refresh_peers(now, SwarmRole::Flat, 0, host, out);
        core.announce_cycle(now, host, out);
        if !core.mature {
            core.discover(now, host, out);
        }
        core.save(now, host, false);

        self.finish(&mut core, now)
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
        let mut core = self.core.lock();

        if reply.descriptor.is_some_and(|d| d.has(FLAG_MEMBER)) {
            if !core.check_private(reply.psn, &from) {
                debug!("Swarm {:?}: member reply from {} failed the private check", self.target, from);
                return (false, Vec::new());
            }
            let mut contact = Contact::new(reply.sender, from, SwarmRole::Flat);
            contact.latency = Some(latency);
            core.on_contact(contact, now);
        } else if let Some(token) = reply.token {
            if let Some(a) = core.announce(from, token, host) {
                out.push(a);
            }
        }

        let short = !core.mature;
        core.follow_reply(reply, now, host, out, short);
        (true, self.finish(&mut core, now))
    }

    fn on_get_peers(
        &self,
        query: &Query,
        from: NetworkAddress,
        now: Tick,
        host: &dyn SwarmHost,
    ) -> (ServeOutcome, Vec<SwarmEvent>) {
        let mut core = self.core.lock();

        if !core.check_private(query.psn, &from) {
            return (ServeOutcome::Rejected, Vec::new());
        }
        let descriptor = query.descriptor.unwrap_or_default();
        if descriptor.has(FLAG_LEAVING) {
            core.on_leaving(query.sender, from, descriptor.has(FLAG_FORWARD), now);
            return (ServeOutcome::Silent, self.finish(&mut core, now));
        }
        if descriptor.has(FLAG_MEMBER) {
            let mut contact = Contact::new(query.sender, from, SwarmRole::Flat);
            contact.is_query = true;
            contact.alternate = core.decloak(query.cloaked.as_ref());
            core.on_contact(contact, now);
        }

        let good = discovered_count(&core, now);
        let outcome = core.serve(&query.sender, &from, now, host, good);
        (outcome, self.finish(&mut core, now))
    }

    fn on_announce(&self, query: &Query, from: NetworkAddress, now: Tick) -> (bool, Vec<SwarmEvent>) {
        let mut core = self.core.lock();
        if !core.check_private(query.psn, &from) {
            return (false, Vec::new());
        }
        let mut contact = Contact::new(query.sender, from, SwarmRole::Flat);
        contact.is_query = true;
        contact.alternate = core.decloak(query.cloaked.as_ref());
        core.on_contact(contact, now);
        (true, self.finish(&mut core, now))
    }

    fn stop(&self, now: Tick, host: &dyn SwarmHost, out: &mut Vec<Outbound>) -> Vec<SwarmEvent> {
        let mut core = self.core.lock();
        core.leave(now, host, out);
        self.finish(&mut core, now)
    }

    fn peers(&self) -> Arc<Vec<SwarmPeerView>> {
        ConnSwarm::peers(self)
    }

    fn is_mature(&self) -> bool {
        ConnSwarm::is_mature(self)
    }
}
