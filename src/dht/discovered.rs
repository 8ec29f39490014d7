use super::address::NodeAddress;
use super::network::NetworkAddress;
use crossbeam::queue::ArrayQueue;

/// How a node came to our attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryKind {
    /// It answered one of our queries.
    Replied,
    /// It sent us a query.
    Queried,
    /// Some other node listed it; nothing is proven yet.
    Introduced,
}

/// A node observed by a packet handler, waiting for the next rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredNode {
    pub address: NodeAddress,
    pub endpoint: NetworkAddress,
    /// Round trip in ticks, when a reply measured one.
    pub latency: Option<u32>,
    pub kind: DiscoveryKind,
    /// Bucket the node falls into, computed by the producer.
    pub bucket: usize,
}

/// Bounded multi-producer queue feeding the routing rebuild.
///
/// Producers never block: a full queue drops the observation.
pub(crate) struct DiscoveredQueue {
    queue: ArrayQueue<DiscoveredNode>,
}

impl DiscoveredQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
        }
    }

    /// Returns false if the queue was full and the node was dropped.
    pub(crate) fn push(&self, node: DiscoveredNode) -> bool {
        self.queue.push(node).is_ok()
    }

    pub(crate) fn drain(&self) -> Vec<DiscoveredNode> {
        let mut out = Vec::with_capacity(self.queue.len());
        while let Some(node) = self.queue.pop() {
            out.push(node);
        }
        out
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }
}
