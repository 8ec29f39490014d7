use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Packet and protocol counters shared by an engine and its embedder.
///
/// Each engine gets its own instance so several engines can run side by side
/// in one process (the simulation tests rely on this).
#[derive(Debug, Default)]
pub struct DhtStats {
    packets_in: AtomicU64,
    packets_out: AtomicU64,
    corrupted: AtomicU64,
    protocol_violations: AtomicU64,
    spoofed_replies: AtomicU64,
    stale_replies: AtomicU64,
    queue_drops: AtomicU64,
    send_failures: AtomicU64,
    private_rejected: AtomicU64,
}

/// Plain copy of [`DhtStats`] at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub packets_in: u64,
    pub packets_out: u64,
    pub corrupted: u64,
    pub protocol_violations: u64,
    pub spoofed_replies: u64,
    pub stale_replies: u64,
    pub queue_drops: u64,
    pub send_failures: u64,
    pub private_rejected: u64,
}

impl DhtStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn packet_in(&self) {
        self.packets_in.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn packet_out(&self) {
        self.packets_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn corrupted(&self) {
        self.corrupted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn protocol_violation(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn spoofed_reply(&self) {
        self.spoofed_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stale_reply(&self) {
        self.stale_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn queue_drop(&self) {
        self.queue_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn private_rejected(&self) {
        self.private_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_in: self.packets_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            corrupted: self.corrupted.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            spoofed_replies: self.spoofed_replies.load(Ordering::Relaxed),
            stale_replies: self.stale_replies.load(Ordering::Relaxed),
            queue_drops: self.queue_drops.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            private_rejected: self.private_rejected.load(Ordering::Relaxed),
        }
    }
}
