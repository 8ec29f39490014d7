use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

use parking_lot::Mutex;
use tracing::info;

use super::network::{AddressFamily, NetworkAddress};
use super::Tick;
use crate::constants::{PUBLIC_IP_SAMPLES, RTT_SAMPLES, VERIFIED_VOTE_WEIGHT};

#[derive(Debug, Clone, Copy)]
struct Vote {
    voter: IpAddr,
    observed: IpAddr,
    weight: u32,
}

#[derive(Debug, Default)]
struct FamilyVotes {
    votes: VecDeque<Vote>,
    fixed: Option<IpAddr>,
    winner: Option<IpAddr>,
}

/// Our external address as reported by the nodes we talk to.
///
/// Every reply carries the address its sender saw us at. The last few
/// reports are kept per family, one per reporting IP, and the address with
/// the largest total weight wins; reporters whose node address verifies
/// against their IP count double.
#[derive(Debug, Default)]
pub struct PublicIpVotes {
    families: Mutex<[FamilyVotes; 2]>,
}

impl PublicIpVotes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, voter: IpAddr, observed: &NetworkAddress, verified: bool) {
        let Some(observed_ip) = observed.ip() else {
            return;
        };
        let family = AddressFamily::of_ip(&observed_ip);
        let weight = if verified { VERIFIED_VOTE_WEIGHT } else { 1 };

        let mut families = self.families.lock();
        let slot = &mut families[family.index()];
        slot.votes.retain(|v| v.voter != voter);
        if slot.votes.len() >= PUBLIC_IP_SAMPLES {
            slot.votes.pop_front();
        }
        slot.votes.push_back(Vote {
            voter,
            observed: observed_ip,
            weight,
        });

        let winner = tally(&slot.votes);
        if winner != slot.winner {
            if let Some(ip) = winner {
                info!("External {} address is now {}", family, ip);
            }
            slot.winner = winner;
        }
    }

    /// Pins the external address, overriding votes.
    pub fn set_external(&self, ip: IpAddr) {
        let family = AddressFamily::of_ip(&ip);
        self.families.lock()[family.index()].fixed = Some(ip);
    }

    pub fn external_ip(&self, family: AddressFamily) -> Option<IpAddr> {
        let families = self.families.lock();
        let slot = &families[family.index()];
        slot.fixed.or(slot.winner)
    }

    pub fn vote_count(&self, family: AddressFamily) -> usize {
        self.families.lock()[family.index()].votes.len()
    }
}

fn tally(votes: &VecDeque<Vote>) -> Option<IpAddr> {
    let mut totals: HashMap<IpAddr, u32> = HashMap::new();
    for vote in votes {
        *totals.entry(vote.observed).or_default() += vote.weight;
    }
    totals
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
        .map(|(ip, _)| ip)
}

/// One round trip measured from a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttSample {
    pub peer: NetworkAddress,
    pub rtt: u32,
    pub at: Tick,
}

/// Bounded ring of recent round trips, for network-time estimation.
#[derive(Debug, Default)]
pub struct RttSamples {
    ring: Mutex<VecDeque<RttSample>>,
}

impl RttSamples {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, sample: RttSample) {
        let mut ring = self.ring.lock();
        if ring.len() >= RTT_SAMPLES {
            ring.pop_front();
        }
        ring.push_back(sample);
    }

    pub fn samples(&self) -> Vec<RttSample> {
        self.ring.lock().iter().copied().collect()
    }

    pub fn median(&self) -> Option<u32> {
        let mut rtts: Vec<u32> = self.ring.lock().iter().map(|s| s.rtt).collect();
        if rtts.is_empty() {
            return None;
        }
        rtts.sort_unstable();
        Some(rtts[rtts.len() / 2])
    }
}
