//! Generational slot map of live transactions.
//!
//! Lookups by id or target read an immutable snapshot and never wait on
//! structural changes. Creation and removal go through one mutex, build a new
//! snapshot and swap it in. A removed slot is not recycled until
//! [`TRANSACTION_GRACE_TICKS`] have passed, and comes back with a bumped
//! generation, so a reply resolved against a stale id can never reach the
//! slot's next owner.

use super::address::NodeAddress;
use super::error::DhtError;
use super::Tick;
use crate::constants::{MAX_TRANSACTIONS, TRANSACTION_GRACE_TICKS};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

const INDEX_BITS: u16 = 10;
const INDEX_MASK: u16 = (1 << INDEX_BITS) - 1;
const GENERATION_MASK: u8 = 0x3f;

/// Transaction id: slot index in the low 10 bits, generation in the high 6.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxnId(u16);

impl TxnId {
    fn new(index: u16, generation: u8) -> Self {
        Self((index & INDEX_MASK) | (((generation & GENERATION_MASK) as u16) << INDEX_BITS))
    }

    pub fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u16 {
        self.0
    }

    pub fn index(self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }

    pub fn generation(self) -> u8 {
        (self.0 >> INDEX_BITS) as u8
    }
}

impl fmt::Debug for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxnId({}#{})", self.index(), self.generation())
    }
}

struct Entry<T> {
    id: TxnId,
    target: NodeAddress,
    value: Arc<T>,
}

impl<T> Clone for Entry<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            target: self.target,
            value: Arc::clone(&self.value),
        }
    }
}

struct Snapshot<T> {
    slots: Vec<Option<Entry<T>>>,
    by_target: HashMap<NodeAddress, TxnId>,
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
            by_target: self.by_target.clone(),
        }
    }
}

struct Allocator<T> {
    generations: Vec<u8>,
    free: VecDeque<u16>,
    draining: Vec<(u16, Tick, Arc<T>)>,
}

pub struct PeerRegistry<T> {
    snapshot: RwLock<Arc<Snapshot<T>>>,
    allocator: Mutex<Allocator<T>>,
    capacity: usize,
}

impl<T> PeerRegistry<T> {
    pub fn new() -> Self {
        Self::with_capacity(MAX_TRANSACTIONS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(INDEX_MASK as usize + 1);
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot {
                slots: Vec::new(),
                by_target: HashMap::new(),
            })),
            allocator: Mutex::new(Allocator {
                generations: Vec::new(),
                free: VecDeque::new(),
                draining: Vec::new(),
            }),
            capacity,
        }
    }

    fn current(&self) -> Arc<Snapshot<T>> {
        Arc::clone(&self.snapshot.read())
    }

    /// Returns the transaction for `target`, creating it with `make` if absent.
    ///
    /// The flag is true when the entry was created by this call.
    pub fn get_or_create(
        &self,
        target: NodeAddress,
        make: impl FnOnce(TxnId) -> T,
    ) -> Result<(TxnId, Arc<T>, bool), DhtError> {
        let mut alloc = self.allocator.lock();
        let current = self.current();
        if let Some(&id) = current.by_target.get(&target) {
            if let Some(Some(entry)) = current.slots.get(id.index()) {
                return Ok((id, Arc::clone(&entry.value), false));
            }
        }

        let index = match alloc.free.pop_front() {
            Some(index) => index,
            None if alloc.generations.len() < self.capacity => {
                alloc.generations.push(0);
                (alloc.generations.len() - 1) as u16
            }
            None => return Err(DhtError::RegistryFull),
        };
        let id = TxnId::new(index, alloc.generations[index as usize]);
        let value = Arc::new(make(id));

        let mut next = (*current).clone();
        if next.slots.len() <= index as usize {
            next.slots.resize_with(index as usize + 1, || None);
        }
        next.slots[index as usize] = Some(Entry {
            id,
            target,
            value: Arc::clone(&value),
        });
        next.by_target.insert(target, id);
        *self.snapshot.write() = Arc::new(next);

        Ok((id, value, true))
    }

    pub fn by_id(&self, id: TxnId) -> Option<Arc<T>> {
        let current = self.current();
        match current.slots.get(id.index()) {
            Some(Some(entry)) if entry.id == id => Some(Arc::clone(&entry.value)),
            _ => None,
        }
    }

    pub fn by_target(&self, target: &NodeAddress) -> Option<(TxnId, Arc<T>)> {
        let current = self.current();
        let id = *current.by_target.get(target)?;
        match current.slots.get(id.index()) {
            Some(Some(entry)) => Some((id, Arc::clone(&entry.value))),
            _ => None,
        }
    }

    /// Unpublishes a transaction; its slot drains for the grace window.
    pub fn remove(&self, id: TxnId, now: Tick) -> Option<Arc<T>> {
        let mut alloc = self.allocator.lock();
        let current = self.current();
        let entry = match current.slots.get(id.index()) {
            Some(Some(entry)) if entry.id == id => entry.clone(),
            _ => return None,
        };

        let mut next = (*current).clone();
        next.slots[id.index()] = None;
        next.by_target.remove(&entry.target);
        *self.snapshot.write() = Arc::new(next);

        alloc
            .draining
            .push((id.index() as u16, now, Arc::clone(&entry.value)));
        Some(entry.value)
    }

    /// Recycles slots whose grace window has passed.
    pub fn collect_garbage(&self, now: Tick) {
        let mut alloc = self.allocator.lock();
        let mut released = Vec::new();
        alloc.draining.retain(|(index, at, _)| {
            if now.saturating_sub(*at) >= TRANSACTION_GRACE_TICKS {
                released.push(*index);
                false
            } else {
                true
            }
        });
        for index in released {
            let generation = &mut alloc.generations[index as usize];
            *generation = generation.wrapping_add(1) & GENERATION_MASK;
            alloc.free.push_back(index);
        }
    }

    pub fn all(&self) -> Vec<(TxnId, Arc<T>)> {
        self.current()
            .slots
            .iter()
            .flatten()
            .map(|e| (e.id, Arc::clone(&e.value)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.current().by_target.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn draining(&self) -> usize {
        self.allocator.lock().draining.len()
    }
}

impl<T> Default for PeerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_is_idempotent() {
        let registry: PeerRegistry<u32> = PeerRegistry::new();
        let target = NodeAddress([1u8; 20]);
        let (a, _, created) = registry.get_or_create(target, |_| 5).unwrap();
        assert!(created);
        let (b, value, created) = registry.get_or_create(target, |_| 6).unwrap();
        assert!(!created);
        assert_eq!(a, b);
        assert_eq!(*value, 5);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_removed_id_is_stale_after_reuse() {
        let registry: PeerRegistry<u32> = PeerRegistry::with_capacity(1);
        let (old, _, _) = registry.get_or_create(NodeAddress([1u8; 20]), |_| 1).unwrap();
        assert!(registry.remove(old, 100).is_some());
        assert!(registry.by_id(old).is_none());

        // Slot still draining.
        assert!(matches!(
            registry.get_or_create(NodeAddress([2u8; 20]), |_| 2),
            Err(DhtError::RegistryFull)
        ));

        registry.collect_garbage(100 + TRANSACTION_GRACE_TICKS);
        let (new, _, _) = registry.get_or_create(NodeAddress([2u8; 20]), |_| 2).unwrap();
        assert_eq!(new.index(), old.index());
        assert_ne!(new, old);
        assert!(registry.by_id(old).is_none());
        assert_eq!(*registry.by_id(new).unwrap(), 2);
    }

    #[test]
    fn test_by_target_and_all() {
        let registry: PeerRegistry<u32> = PeerRegistry::new();
        for i in 0..5u8 {
            registry.get_or_create(NodeAddress([i; 20]), |_| i as u32).unwrap();
        }
        assert_eq!(registry.all().len(), 5);
        let (id, value) = registry.by_target(&NodeAddress([3u8; 20])).unwrap();
        assert_eq!(*value, 3);
        registry.remove(id, 0);
        assert!(registry.by_target(&NodeAddress([3u8; 20])).is_none());
        assert_eq!(registry.draining(), 1);
    }
}
