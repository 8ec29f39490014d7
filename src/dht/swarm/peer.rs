use crate::constants::{
    BACKWARD_STABILITY_FACTOR, BACKWARD_TTL_TICKS, DEFAULT_LATENCY_TICKS, FORWARD_REFRESH_FACTOR,
    FORWARD_REFRESH_MAX_TICKS, FORWARD_REFRESH_MIN_TICKS, MAX_MISSED_REPLIES,
};
use crate::dht::address::NodeAddress;
use crate::dht::message::Token;
use crate::dht::network::NetworkAddress;
use crate::dht::Tick;

/// Which side of a membership a peer is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwarmRole {
    /// We query it (join swarm).
    Forward,
    /// It queries us (join swarm).
    Backward,
    /// Connectivity-only swarm member.
    Flat,
}

/// A swarm member as exposed to higher layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwarmPeerView {
    pub address: NodeAddress,
    pub endpoint: NetworkAddress,
    pub alternate: NetworkAddress,
    pub role: SwarmRole,
    pub verified: bool,
    pub latency: Option<u32>,
}

#[derive(Debug, Clone)]
pub(crate) struct SwarmPeer {
    pub address: NodeAddress,
    pub endpoint: NetworkAddress,
    /// Decloaked alternate address the peer advertised.
    pub alternate: NetworkAddress,
    pub role: SwarmRole,
    /// Node address verifies against the endpoint IP.
    pub verified: bool,
    pub latency: Option<u32>,
    pub discovered: Tick,
    pub last_recv: Tick,
    pub last_query_recv: Option<Tick>,
    pub last_sent: Option<Tick>,
    pub missed: u8,
    /// Backward: it announced itself with a valid token.
    /// Forward: we announced ourselves to it.
    pub announced: bool,
    /// Announce token it handed us.
    pub token: Option<Token>,
}

impl SwarmPeer {
    pub(crate) fn new(
        address: NodeAddress,
        endpoint: NetworkAddress,
        role: SwarmRole,
        verified: bool,
        now: Tick,
    ) -> Self {
        Self {
            address,
            endpoint,
            alternate: NetworkAddress::Empty,
            role,
            verified,
            latency: None,
            discovered: now,
            last_recv: now,
            last_query_recv: None,
            last_sent: None,
            missed: 0,
            announced: false,
            token: None,
        }
    }

    /// How often we query a peer we reach out to; slower peers less often.
    pub(crate) fn refresh_interval(&self) -> Tick {
        let latency = self.latency.unwrap_or(DEFAULT_LATENCY_TICKS) as Tick;
        (latency * FORWARD_REFRESH_FACTOR as Tick)
            .clamp(FORWARD_REFRESH_MIN_TICKS, FORWARD_REFRESH_MAX_TICKS)
    }

    /// Liveness window, derived from role and latency.
    pub(crate) fn ttl(&self) -> Tick {
        match self.role {
            SwarmRole::Backward => BACKWARD_TTL_TICKS,
            SwarmRole::Forward | SwarmRole::Flat => {
                self.refresh_interval() * (MAX_MISSED_REPLIES as Tick + 1)
            }
        }
    }

    /// A backward peer that announced itself and queried us within its TTL.
    pub(crate) fn is_established(&self, now: Tick) -> bool {
        self.announced
            && self
                .last_query_recv
                .is_some_and(|t| now.saturating_sub(t) <= self.ttl())
    }

    /// Past the point where the peer should be dropped.
    pub(crate) fn is_stale(&self, now: Tick) -> bool {
        match self.role {
            SwarmRole::Backward => {
                let last = self.last_query_recv.unwrap_or(self.discovered);
                now.saturating_sub(last) > self.ttl() * BACKWARD_STABILITY_FACTOR
            }
            SwarmRole::Forward | SwarmRole::Flat => {
                self.missed >= MAX_MISSED_REPLIES || now.saturating_sub(self.last_recv) > self.ttl()
            }
        }
    }

    /// Whether the peer belongs in the published peer list.
    pub(crate) fn is_good(&self, now: Tick) -> bool {
        match self.role {
            SwarmRole::Backward => self.is_established(now),
            SwarmRole::Forward | SwarmRole::Flat => {
                (self.latency.is_some() || self.last_query_recv.is_some()) && self.missed == 0
            }
        }
    }

    pub(crate) fn record_reply(&mut self, now: Tick, latency: u32) {
        self.last_recv = now;
        self.missed = 0;
        self.latency = Some(match self.latency {
            Some(old) => (old * 3 + latency + 2) / 4,
            None => latency,
        });
    }

    pub(crate) fn view(&self) -> SwarmPeerView {
        SwarmPeerView {
            address: self.address,
            endpoint: self.endpoint,
            alternate: self.alternate,
            role: self.role,
            verified: self.verified,
            latency: self.latency,
        }
    }
}
