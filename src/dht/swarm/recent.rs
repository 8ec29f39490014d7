use std::collections::HashMap;
use std::hash::Hash;

use crate::dht::Tick;

/// Keys seen within a time window, bounded in size.
///
/// Swarms use one for hosts contacted during discovery, so each is tried at
/// most once per window, and one for rejected peers.
#[derive(Debug, Clone)]
pub(crate) struct RecentSet<K> {
    seen: HashMap<K, Tick>,
    capacity: usize,
    window: Tick,
}

impl<K: Eq + Hash + Copy> RecentSet<K> {
    pub(crate) fn new(capacity: usize, window: Tick) -> Self {
        Self {
            seen: HashMap::new(),
            capacity,
            window,
        }
    }

    pub(crate) fn contains(&self, key: &K, now: Tick) -> bool {
        self.seen
            .get(key)
            .is_some_and(|&t| now.saturating_sub(t) < self.window)
    }

    /// Records `key`; returns false if it was already seen within the window.
    pub(crate) fn admit(&mut self, key: K, now: Tick) -> bool {
        if self.contains(&key, now) {
            return false;
        }
        self.insert(key, now);
        true
    }

    pub(crate) fn insert(&mut self, key: K, now: Tick) {
        if self.seen.len() >= self.capacity && !self.seen.contains_key(&key) {
            self.collect_garbage(now);
            if self.seen.len() >= self.capacity {
                let oldest = self
                    .seen
                    .iter()
                    .min_by_key(|(_, t)| **t)
                    .map(|(k, _)| *k);
                if let Some(oldest) = oldest {
                    self.seen.remove(&oldest);
                }
            }
        }
        self.seen.insert(key, now);
    }

    pub(crate) fn collect_garbage(&mut self, now: Tick) {
        let window = self.window;
        self.seen.retain(|_, t| now.saturating_sub(*t) < window);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admit_once_per_window() {
        let mut recent: RecentSet<u32> = RecentSet::new(4, 10);
        assert!(recent.admit(1, 0));
        assert!(!recent.admit(1, 9));
        assert!(recent.admit(1, 10));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut recent: RecentSet<u32> = RecentSet::new(2, 100);
        recent.admit(1, 0);
        recent.admit(2, 1);
        recent.admit(3, 2);
        assert_eq!(recent.len(), 2);
        assert!(!recent.contains(&1, 2));
        assert!(recent.contains(&3, 2));
    }
}
