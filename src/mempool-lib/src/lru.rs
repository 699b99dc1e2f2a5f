use crate::LocalId;
use std::collections::{HashMap, HashSet};

/// Access-order bookkeeping for resident payloads.
///
/// Tracks which ids currently hold an in-memory copy and how many bytes
/// they occupy, with a logical clock of last touches. Victim selection is
/// a scan; resident sets stay small enough that ordering structures would
/// not pay for themselves here.
#[derive(Default)]
pub(crate) struct LruTracker {
    clock: u64,
    resident: HashMap<LocalId, Residency>,
    mem_used: u64,
}

struct Residency {
    last_touch: u64,
    size: u64,
}

impl LruTracker {
    /// A payload became resident.
    pub fn insert(&mut self, id: LocalId, size: u64) {
        self.clock += 1;
        if self
            .resident
            .insert(
                id,
                Residency {
                    last_touch: self.clock,
                    size,
                },
            )
            .is_none()
        {
            self.mem_used += size;
        }
    }

    /// A payload left memory, through eviction, destruction or delete.
    pub fn remove(&mut self, id: LocalId) {
        if let Some(entry) = self.resident.remove(&id) {
            self.mem_used -= entry.size;
        }
    }

    pub fn touch(&mut self, id: LocalId) {
        self.clock += 1;
        if let Some(entry) = self.resident.get_mut(&id) {
            entry.last_touch = self.clock;
        }
    }

    pub fn mem_used(&self) -> u64 {
        self.mem_used
    }

    /// Least recently touched resident id outside `skip`.
    pub fn victim(&self, skip: &HashSet<LocalId>) -> Option<LocalId> {
        self.resident
            .iter()
            .filter(|(id, _)| !skip.contains(id))
            .min_by_key(|(_, entry)| entry.last_touch)
            .map(|(id, _)| *id)
    }

    pub fn clear(&mut self) {
        self.resident.clear();
        self.mem_used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_accounting() {
        let mut lru = LruTracker::default();
        lru.insert(1, 100);
        lru.insert(2, 50);
        assert_eq!(lru.mem_used(), 150);
        // Re-inserting an id does not double count.
        lru.insert(1, 100);
        assert_eq!(lru.mem_used(), 150);
        lru.remove(1);
        assert_eq!(lru.mem_used(), 50);
        lru.remove(1);
        assert_eq!(lru.mem_used(), 50);
    }

    #[test]
    fn test_victim_follows_touch_order() {
        let mut lru = LruTracker::default();
        lru.insert(1, 10);
        lru.insert(2, 10);
        lru.insert(3, 10);
        lru.touch(1);

        let skip = HashSet::new();
        assert_eq!(lru.victim(&skip), Some(2));
        let skip: HashSet<_> = [2].into_iter().collect();
        assert_eq!(lru.victim(&skip), Some(3));
        let skip: HashSet<_> = [1, 2, 3].into_iter().collect();
        assert_eq!(lru.victim(&skip), None);
    }
}
