//! Descriptor table: fixed slot arena, recency list, membership index.
//!
//! The data region is one allocation carved into fixed-size slots; a
//! descriptor per slot tracks which block lives there and in what
//! state. Recency order is an index-linked doubly-linked list (no
//! pointers, no aliasing hazards), and membership is a hash map keyed
//! by block number — except for very small tables, where the map is
//! skipped and lookup walks the recency list instead.

use std::collections::HashMap;

/// Sentinel for "no slot" in the recency links.
const NIL: usize = usize::MAX;

/// Tables at or above this capacity index blocks through a hash map.
const HASHING_MIN_CAPACITY: usize = 32;

/// Content state of one cache slot.
///
/// `Unstable` marks a slot whose content is being filled or overwritten;
/// it exists only inside the instance lock and must resolve to `Clean`,
/// `Dirty`, or `Empty` before the lock is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockState {
    Empty,
    Clean,
    Dirty,
    Unstable,
}

/// One cache slot descriptor. The block number is meaningful in every
/// state except `Empty`.
#[derive(Debug)]
pub(crate) struct Descriptor {
    pub(crate) block: u64,
    pub(crate) state: BlockState,
    prev: usize,
    next: usize,
    linked: bool,
}

/// Fixed-capacity descriptor table.
///
/// Invariant: a block number appears on at most one non-`Empty`
/// descriptor; the hash map (when enabled) mirrors exactly the set of
/// indexed descriptors.
pub(crate) struct CacheTable {
    descs: Vec<Descriptor>,
    data: Vec<u8>,
    block_size: usize,
    /// Most recently used slot.
    head: usize,
    /// Least recently used slot.
    tail: usize,
    map: Option<HashMap<u64, usize>>,
    free: Vec<usize>,
}

impl CacheTable {
    pub(crate) fn new(capacity: usize, block_size: usize) -> Self {
        let descs = (0..capacity)
            .map(|_| Descriptor {
                block: 0,
                state: BlockState::Empty,
                prev: NIL,
                next: NIL,
                linked: false,
            })
            .collect();
        Self {
            descs,
            data: vec![0_u8; capacity * block_size],
            block_size,
            head: NIL,
            tail: NIL,
            map: (capacity >= HASHING_MIN_CAPACITY).then(HashMap::new),
            free: (0..capacity).rev().collect(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.descs.len()
    }

    pub(crate) fn hashing(&self) -> bool {
        self.map.is_some()
    }

    pub(crate) fn desc(&self, slot: usize) -> &Descriptor {
        &self.descs[slot]
    }

    pub(crate) fn desc_mut(&mut self, slot: usize) -> &mut Descriptor {
        &mut self.descs[slot]
    }

    pub(crate) fn data(&self, slot: usize) -> &[u8] {
        let lo = slot * self.block_size;
        &self.data[lo..lo + self.block_size]
    }

    pub(crate) fn data_mut(&mut self, slot: usize) -> &mut [u8] {
        let lo = slot * self.block_size;
        &mut self.data[lo..lo + self.block_size]
    }

    /// Find the slot holding `block`, if any. Uses the hash map when
    /// enabled, otherwise scans the recency list from MRU to LRU.
    pub(crate) fn locate(&self, block: u64) -> Option<usize> {
        if let Some(map) = &self.map {
            return map.get(&block).copied();
        }
        let mut slot = self.head;
        while slot != NIL {
            let d = &self.descs[slot];
            if d.state != BlockState::Empty && d.block == block {
                return Some(slot);
            }
            slot = d.next;
        }
        None
    }

    /// Take an `Empty` slot, if one exists.
    pub(crate) fn pop_free(&mut self) -> Option<usize> {
        self.free.pop()
    }

    /// Least-recently-used slot that is safe to reclaim: scans from the
    /// tail for the first descriptor that is neither `Dirty` nor
    /// `Unstable`.
    pub(crate) fn evict_candidate(&self) -> Option<usize> {
        let mut slot = self.tail;
        while slot != NIL {
            let d = &self.descs[slot];
            match d.state {
                BlockState::Clean => return Some(slot),
                BlockState::Dirty | BlockState::Unstable => {}
                // Empty slots are never on the recency list.
                BlockState::Empty => debug_assert!(false, "empty slot on recency list"),
            }
            slot = d.prev;
        }
        None
    }

    /// Detach a slot from the index and recency order without freeing
    /// it, so the caller can reuse it for a new block. The slot comes
    /// back as `Empty`.
    pub(crate) fn detach(&mut self, slot: usize) -> u64 {
        let block = self.descs[slot].block;
        self.unlink(slot);
        self.remove_index(block);
        self.descs[slot].state = BlockState::Empty;
        block
    }

    /// Return a slot to the free pool: unlink, unindex, mark `Empty`.
    pub(crate) fn release(&mut self, slot: usize) {
        let block = self.descs[slot].block;
        self.unlink(slot);
        self.remove_index(block);
        self.descs[slot].state = BlockState::Empty;
        self.free.push(slot);
    }

    /// Record `block -> slot` in the membership index.
    pub(crate) fn insert_index(&mut self, block: u64, slot: usize) {
        if let Some(map) = &mut self.map {
            let prior = map.insert(block, slot);
            debug_assert!(prior.is_none(), "block {block} double-indexed");
        }
    }

    pub(crate) fn remove_index(&mut self, block: u64) {
        if let Some(map) = &mut self.map {
            map.remove(&block);
        }
    }

    /// Insert a slot at the MRU end of the recency list.
    pub(crate) fn push_mru(&mut self, slot: usize) {
        debug_assert!(!self.descs[slot].linked, "slot already linked");
        let old_head = self.head;
        {
            let d = &mut self.descs[slot];
            d.prev = NIL;
            d.next = old_head;
            d.linked = true;
        }
        if old_head != NIL {
            self.descs[old_head].prev = slot;
        } else {
            self.tail = slot;
        }
        self.head = slot;
    }

    /// Remove a slot from the recency list. No-op if not linked.
    pub(crate) fn unlink(&mut self, slot: usize) {
        if !self.descs[slot].linked {
            return;
        }
        let (prev, next) = {
            let d = &mut self.descs[slot];
            let links = (d.prev, d.next);
            d.prev = NIL;
            d.next = NIL;
            d.linked = false;
            links
        };
        if prev != NIL {
            self.descs[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.descs[next].prev = prev;
        } else {
            self.tail = prev;
        }
    }

    /// Move a slot to the MRU position.
    pub(crate) fn touch(&mut self, slot: usize) {
        if self.head == slot {
            return;
        }
        self.unlink(slot);
        self.push_mru(slot);
    }

    /// Slots in LRU-to-MRU order.
    pub(crate) fn iter_lru(&self) -> LruIter<'_> {
        LruIter {
            table: self,
            slot: self.tail,
        }
    }

    /// Number of occupied (non-`Empty`) slots.
    pub(crate) fn occupied(&self) -> usize {
        self.capacity() - self.free.len()
    }
}

pub(crate) struct LruIter<'a> {
    table: &'a CacheTable,
    slot: usize,
}

impl Iterator for LruIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.slot == NIL {
            return None;
        }
        let current = self.slot;
        self.slot = self.table.descs[current].prev;
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(table: &mut CacheTable, block: u64, state: BlockState) -> usize {
        let slot = table.pop_free().expect("free slot");
        let d = table.desc_mut(slot);
        d.block = block;
        d.state = state;
        table.insert_index(block, slot);
        table.push_mru(slot);
        slot
    }

    #[test]
    fn locate_with_and_without_hashing() {
        let mut small = CacheTable::new(4, 512);
        assert!(!small.hashing());
        let mut large = CacheTable::new(64, 512);
        assert!(large.hashing());

        for table in [&mut small, &mut large] {
            fill(table, 10, BlockState::Clean);
            fill(table, 11, BlockState::Dirty);
            assert!(table.locate(10).is_some());
            assert!(table.locate(11).is_some());
            assert!(table.locate(12).is_none());
        }
    }

    #[test]
    fn recency_order_follows_touch() {
        let mut table = CacheTable::new(4, 512);
        let a = fill(&mut table, 1, BlockState::Clean);
        let b = fill(&mut table, 2, BlockState::Clean);
        let c = fill(&mut table, 3, BlockState::Clean);

        // LRU order is insertion order: a, b, c.
        assert_eq!(table.iter_lru().collect::<Vec<_>>(), vec![a, b, c]);

        table.touch(a);
        assert_eq!(table.iter_lru().collect::<Vec<_>>(), vec![b, c, a]);
    }

    #[test]
    fn evict_candidate_skips_dirty_and_unstable() {
        let mut table = CacheTable::new(4, 512);
        fill(&mut table, 1, BlockState::Dirty);
        fill(&mut table, 2, BlockState::Unstable);
        let clean = fill(&mut table, 3, BlockState::Clean);

        assert_eq!(table.evict_candidate(), Some(clean));
    }

    #[test]
    fn evict_candidate_prefers_least_recent_clean() {
        let mut table = CacheTable::new(4, 512);
        let a = fill(&mut table, 1, BlockState::Clean);
        let b = fill(&mut table, 2, BlockState::Clean);

        assert_eq!(table.evict_candidate(), Some(a));
        table.touch(a);
        assert_eq!(table.evict_candidate(), Some(b));
    }

    #[test]
    fn no_candidate_when_everything_is_dirty() {
        let mut table = CacheTable::new(2, 512);
        fill(&mut table, 1, BlockState::Dirty);
        fill(&mut table, 2, BlockState::Dirty);
        assert_eq!(table.evict_candidate(), None);
    }

    #[test]
    fn release_returns_slot_to_free_pool() {
        let mut table = CacheTable::new(2, 512);
        let a = fill(&mut table, 7, BlockState::Clean);
        fill(&mut table, 8, BlockState::Clean);
        assert!(table.pop_free().is_none());
        assert_eq!(table.occupied(), 2);

        table.release(a);
        assert!(table.locate(7).is_none());
        assert_eq!(table.pop_free(), Some(a));
    }

    #[test]
    fn detach_keeps_slot_out_of_free_pool() {
        let mut table = CacheTable::new(2, 512);
        let a = fill(&mut table, 7, BlockState::Clean);
        assert_eq!(table.detach(a), 7);
        assert!(table.locate(7).is_none());
        assert!(table.pop_free().is_none());
        assert_eq!(table.iter_lru().count(), 0);
    }

    #[test]
    fn data_slots_are_disjoint() {
        let mut table = CacheTable::new(2, 16);
        let a = fill(&mut table, 1, BlockState::Clean);
        let b = fill(&mut table, 2, BlockState::Clean);
        table.data_mut(a).fill(0xAA);
        table.data_mut(b).fill(0xBB);
        assert!(table.data(a).iter().all(|&x| x == 0xAA));
        assert!(table.data(b).iter().all(|&x| x == 0xBB));
    }
}
