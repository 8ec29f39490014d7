use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::peer::SwarmPeerView;

/// Double-buffered list of a swarm's good peers.
///
/// Readers clone the front `Arc` and never see a partial list. The writer
/// fills the back buffer and swaps it in, and only when the peer set was
/// marked dirty since the last publish. The old front becomes the next back
/// buffer once no reader holds it.
pub(crate) struct OutputPeers {
    front: RwLock<Arc<Vec<SwarmPeerView>>>,
    back: Mutex<Vec<SwarmPeerView>>,
    dirty: AtomicBool,
}

impl OutputPeers {
    pub(crate) fn new() -> Self {
        Self {
            front: RwLock::new(Arc::new(Vec::new())),
            back: Mutex::new(Vec::new()),
            dirty: AtomicBool::new(false),
        }
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub(crate) fn current(&self) -> Arc<Vec<SwarmPeerView>> {
        Arc::clone(&self.front.read())
    }

    /// Rebuilds and swaps if dirty. Returns true when a new list went out.
    pub(crate) fn publish(&self, fill: impl FnOnce(&mut Vec<SwarmPeerView>)) -> bool {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return false;
        }
        let mut back = self.back.lock();
        back.clear();
        fill(&mut *back);

        let next = Arc::new(std::mem::take(&mut *back));
        let old = std::mem::replace(&mut *self.front.write(), next);
        if let Ok(mut recycled) = Arc::try_unwrap(old) {
            recycled.clear();
            *back = recycled;
        }
        true
    }
}
