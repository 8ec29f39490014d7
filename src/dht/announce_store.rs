use dashmap::DashMap;
use tracing::trace;

use super::address::NodeAddress;
use super::message::CompactPeer;
use super::Tick;
use crate::constants::{ANNOUNCE_LIFETIME_TICKS, MAX_ANNOUNCED_PER_TARGET, MAX_ANNOUNCE_TARGETS};

#[derive(Debug, Clone, Copy)]
struct StoredPeer {
    peer: CompactPeer,
    announced_at: Tick,
}

/// Peers announced to us for swarms we do not belong to.
///
/// Members find each other by querying the nodes closest to the swarm target,
/// which are usually not members themselves; those nodes keep what was
/// announced to them and hand it out in `get_peers` replies.
#[derive(Debug, Default)]
pub struct AnnounceStore {
    targets: DashMap<NodeAddress, Vec<StoredPeer>>,
}

impl AnnounceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an announcement. Returns false when the store is full.
    pub fn add(&self, target: NodeAddress, peer: CompactPeer, now: Tick) -> bool {
        if !self.targets.contains_key(&target) && self.targets.len() >= MAX_ANNOUNCE_TARGETS {
            self.collect_garbage(now);
            if self.targets.len() >= MAX_ANNOUNCE_TARGETS {
                return false;
            }
        }

        let mut peers = self.targets.entry(target).or_default();
        peers.retain(|p| now.saturating_sub(p.announced_at) < ANNOUNCE_LIFETIME_TICKS);
        peers.retain(|p| p.peer.address != peer.address || p.peer.endpoint.family() != peer.endpoint.family());

        if peers.len() >= MAX_ANNOUNCED_PER_TARGET {
            return false;
        }
        peers.push(StoredPeer {
            peer,
            announced_at: now,
        });
        trace!("Stored announced peer {} for {:?}", peer.endpoint, target);
        true
    }

    /// Live announcements for `target`, newest first, at most `limit`.
    pub fn get(&self, target: &NodeAddress, now: Tick, limit: usize) -> Vec<CompactPeer> {
        match self.targets.get(target) {
            Some(peers) => peers
                .iter()
                .rev()
                .filter(|p| now.saturating_sub(p.announced_at) < ANNOUNCE_LIFETIME_TICKS)
                .take(limit)
                .map(|p| p.peer)
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn collect_garbage(&self, now: Tick) {
        self.targets.retain(|_, peers| {
            peers.retain(|p| now.saturating_sub(p.announced_at) < ANNOUNCE_LIFETIME_TICKS);
            !peers.is_empty()
        });
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::network::{AddressFamily, CompactAddress, NetworkAddress};

    fn peer(b: u8) -> CompactPeer {
        CompactPeer {
            address: NodeAddress([b; 20]),
            endpoint: format!("10.0.0.{}:7000", b).parse::<NetworkAddress>().unwrap(),
            cloaked_alternate: CompactAddress::new(AddressFamily::V4),
        }
    }

    #[test]
    fn test_add_replaces_same_peer() {
        let store = AnnounceStore::new();
        let target = NodeAddress([9u8; 20]);
        assert!(store.add(target, peer(1), 0));
        assert!(store.add(target, peer(1), 5));
        assert!(store.add(target, peer(2), 6));
        let got = store.get(&target, 10, 16);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].address, NodeAddress([2u8; 20]));
    }

    #[test]
    fn test_announcements_expire() {
        let store = AnnounceStore::new();
        let target = NodeAddress([9u8; 20]);
        store.add(target, peer(1), 0);
        assert!(store.get(&target, ANNOUNCE_LIFETIME_TICKS, 16).is_empty());
        store.collect_garbage(ANNOUNCE_LIFETIME_TICKS);
        assert_eq!(store.target_count(), 0);
    }
}
