//! Address-keyed map that never touches the global allocator.
//!
//! Entries live in a slab. A block index keyed by `address >> BLOCK_BITS`
//! chains together the entries whose address falls in the same 128-byte
//! block, which lets [`AddressMap::find_inside`] walk backwards from an
//! interior pointer one block at a time.

use crate::arena::{RawAllocator, RawVec};

/// log2 of the block size used by the block index
const BLOCK_BITS: u32 = 7;

const NIL: u32 = u32::MAX;

const MIN_SLOTS: usize = 64;

#[derive(Clone, Copy)]
struct Entry<V: Copy> {
    key: usize,
    value: V,
    /// Next entry in the same block chain, or in the free list
    next: u32,
    in_use: bool,
}

#[derive(Clone, Copy)]
struct Slot {
    block: usize,
    head: u32,
    occupied: bool,
}

const EMPTY_SLOT: Slot = Slot {
    block: 0,
    head: NIL,
    occupied: false,
};

#[inline]
fn block_of(key: usize) -> usize {
    key >> BLOCK_BITS
}

#[inline]
fn slot_hash(block: usize) -> usize {
    ((block as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as usize
}

pub struct AddressMap<V: Copy, A: RawAllocator + Clone> {
    entries: RawVec<Entry<V>, A>,
    free: u32,
    slots: RawVec<Slot, A>,
    /// Slots ever claimed, including those whose chain has since emptied
    used_slots: usize,
    len: usize,
}

impl<V: Copy, A: RawAllocator + Clone> AddressMap<V, A> {
    pub fn new_in(alloc: A) -> Self {
        AddressMap {
            entries: RawVec::new_in(alloc.clone()),
            free: NIL,
            slots: RawVec::new_in(alloc),
            used_slots: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Index of the slot for `block`: either its slot, or the empty slot
    /// where it would go.
    fn probe(&self, block: usize) -> usize {
        let mask = self.slots.len() - 1;
        let mut idx = slot_hash(block) & mask;
        loop {
            let slot = &self.slots[idx];
            if !slot.occupied || slot.block == block {
                return idx;
            }
            idx = (idx + 1) & mask;
        }
    }

    fn chain_head(&self, block: usize) -> u32 {
        if self.slots.is_empty() {
            return NIL;
        }
        let slot = &self.slots[self.probe(block)];
        if slot.occupied { slot.head } else { NIL }
    }

    fn find_entry(&self, key: usize) -> Option<u32> {
        let mut idx = self.chain_head(block_of(key));
        while idx != NIL {
            let entry = &self.entries[idx as usize];
            if entry.key == key {
                return Some(idx);
            }
            idx = entry.next;
        }
        None
    }

    /// Grow the block index if one more block might not fit.
    fn reserve_slot(&mut self) -> bool {
        if (self.used_slots + 1) * 4 <= self.slots.len() * 3 {
            return true;
        }

        let live_blocks = self
            .slots
            .iter()
            .filter(|s| s.occupied && s.head != NIL)
            .count();
        let new_len = ((live_blocks + 1) * 2).next_power_of_two().max(MIN_SLOTS);
        self.rebuild(new_len)
    }

    /// Rehash every live entry into a fresh block index of `new_len` slots,
    /// dropping blocks whose chains have emptied.
    fn rebuild(&mut self, new_len: usize) -> bool {
        if !self.slots.reset_filled(new_len, EMPTY_SLOT) {
            return false;
        }
        self.used_slots = 0;

        for i in 0..self.entries.len() {
            if !self.entries[i].in_use {
                continue;
            }
            let block = block_of(self.entries[i].key);
            let s = self.probe(block);
            if !self.slots[s].occupied {
                self.slots[s] = Slot {
                    block,
                    head: NIL,
                    occupied: true,
                };
                self.used_slots += 1;
            }
            self.entries[i].next = self.slots[s].head;
            self.slots[s].head = i as u32;
        }
        true
    }

    fn alloc_entry(&mut self, entry: Entry<V>) -> Option<u32> {
        if self.free != NIL {
            let idx = self.free;
            self.free = self.entries[idx as usize].next;
            self.entries[idx as usize] = entry;
            return Some(idx);
        }
        let idx = u32::try_from(self.entries.len()).ok().filter(|&i| i != NIL)?;
        self.entries.push(entry).then_some(idx)
    }

    /// Insert or overwrite the value at `key`.
    ///
    /// Returns false if storage could not be obtained; the map is unchanged.
    pub fn insert(&mut self, key: usize, value: V) -> bool {
        if let Some(idx) = self.find_entry(key) {
            self.entries[idx as usize].value = value;
            return true;
        }

        if !self.reserve_slot() {
            return false;
        }
        let Some(idx) = self.alloc_entry(Entry {
            key,
            value,
            next: NIL,
            in_use: true,
        }) else {
            return false;
        };

        let block = block_of(key);
        let s = self.probe(block);
        if !self.slots[s].occupied {
            self.slots[s] = Slot {
                block,
                head: NIL,
                occupied: true,
            };
            self.used_slots += 1;
        }
        self.entries[idx as usize].next = self.slots[s].head;
        self.slots[s].head = idx;
        self.len += 1;
        true
    }

    pub fn get(&self, key: usize) -> Option<&V> {
        self.find_entry(key)
            .map(|idx| &self.entries[idx as usize].value)
    }

    pub fn get_mut(&mut self, key: usize) -> Option<&mut V> {
        let idx = self.find_entry(key)?;
        Some(&mut self.entries[idx as usize].value)
    }

    pub fn contains(&self, key: usize) -> bool {
        self.find_entry(key).is_some()
    }

    pub fn remove(&mut self, key: usize) -> Option<V> {
        if self.slots.is_empty() {
            return None;
        }
        let s = self.probe(block_of(key));
        if !self.slots[s].occupied {
            return None;
        }

        let mut prev = NIL;
        let mut idx = self.slots[s].head;
        while idx != NIL {
            let entry = self.entries[idx as usize];
            if entry.key == key {
                if prev == NIL {
                    self.slots[s].head = entry.next;
                } else {
                    self.entries[prev as usize].next = entry.next;
                }
                let slot = &mut self.entries[idx as usize];
                slot.in_use = false;
                slot.next = self.free;
                self.free = idx;
                self.len -= 1;
                return Some(entry.value);
            }
            prev = idx;
            idx = entry.next;
        }
        None
    }

    /// Find the entry whose range `[key, key + size_of(value))` contains
    /// `ptr`, looking no more than `max_size` bytes below `ptr`.
    ///
    /// Tracked ranges never overlap, so once a block holds a key at or below
    /// `ptr` that does not contain it, no earlier key can either.
    pub fn find_inside<F>(&self, ptr: usize, max_size: usize, size_of: F) -> Option<(usize, &V)>
    where
        F: Fn(&V) -> usize,
    {
        let lowest = block_of(ptr.saturating_sub(max_size));
        let mut block = block_of(ptr);
        loop {
            let mut had_smaller_key = false;
            let mut idx = self.chain_head(block);
            while idx != NIL {
                let entry = &self.entries[idx as usize];
                if entry.key <= ptr {
                    let offset = ptr - entry.key;
                    if offset < size_of(&entry.value) && offset <= max_size {
                        return Some((entry.key, &entry.value));
                    }
                    had_smaller_key = true;
                }
                idx = entry.next;
            }
            if had_smaller_key || block == lowest {
                return None;
            }
            block -= 1;
        }
    }

    pub fn for_each<F: FnMut(usize, &V)>(&self, mut f: F) {
        for entry in self.entries.iter().filter(|e| e.in_use) {
            f(entry.key, &entry.value);
        }
    }

    pub fn for_each_mut<F: FnMut(usize, &mut V)>(&mut self, mut f: F) {
        for entry in self.entries.iter_mut().filter(|e| e.in_use) {
            f(entry.key, &mut entry.value);
        }
    }

    /// Copy the entries accepted by `keep` into a new map on the same
    /// allocator. `None` if storage runs out.
    pub fn try_clone_filtered<F>(&self, mut keep: F) -> Option<Self>
    where
        F: FnMut(usize, &V) -> bool,
    {
        let mut copy = AddressMap::new_in(self.entries.allocator().clone());
        for entry in self.entries.iter().filter(|e| e.in_use) {
            if keep(entry.key, &entry.value) && !copy.insert(entry.key, entry.value) {
                return None;
            }
        }
        Some(copy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::LibcAllocator;

    fn map() -> AddressMap<usize, LibcAllocator> {
        AddressMap::new_in(LibcAllocator)
    }

    #[test]
    fn insert_get_remove() {
        let mut m = map();
        assert!(m.insert(0x1000, 16));
        assert!(m.insert(0x1010, 32));
        assert_eq!(m.get(0x1000), Some(&16));
        assert_eq!(m.get(0x1010), Some(&32));
        assert_eq!(m.len(), 2);

        assert_eq!(m.remove(0x1000), Some(16));
        assert_eq!(m.get(0x1000), None);
        assert_eq!(m.remove(0x1000), None);
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn insert_overwrites_existing_key() {
        let mut m = map();
        m.insert(0x2000, 1);
        m.insert(0x2000, 2);
        assert_eq!(m.len(), 1);
        assert_eq!(m.get(0x2000), Some(&2));
    }

    #[test]
    fn survives_growth_and_slot_reuse() {
        let mut m = map();
        for i in 0..10_000usize {
            assert!(m.insert(0x10_0000 + i * 256, i));
        }
        for i in (0..10_000usize).step_by(2) {
            assert_eq!(m.remove(0x10_0000 + i * 256), Some(i));
        }
        for i in 0..10_000usize {
            let expected = if i % 2 == 0 { None } else { Some(&i) };
            assert_eq!(m.get(0x10_0000 + i * 256), expected);
        }
        // Freed entries are recycled
        for i in 0..5_000usize {
            assert!(m.insert(0x90_0000 + i * 8, i));
        }
        assert_eq!(m.len(), 10_000);
    }

    #[test]
    fn find_inside_spans_blocks() {
        let mut m = map();
        m.insert(0x1000, 1000);
        m.insert(0x2000, 8);

        // Interior of a large object several blocks past its start
        assert_eq!(m.find_inside(0x1000 + 900, 4096, |&s| s), Some((0x1000, &1000)));
        assert_eq!(m.find_inside(0x1000, 4096, |&s| s), Some((0x1000, &1000)));
        assert_eq!(m.find_inside(0x2007, 4096, |&s| s), Some((0x2000, &8)));

        // Gap between the two objects
        assert_eq!(m.find_inside(0x2008, 4096, |&s| s), None);
        assert_eq!(m.find_inside(0x1000 + 1000, 4096, |&s| s), None);

        // Start lies further back than the search limit
        assert_eq!(m.find_inside(0x1000 + 900, 256, |&s| s), None);
    }

    #[test]
    fn find_inside_below_first_block_is_none() {
        let m = map();
        assert_eq!(m.find_inside(0x40, 4096, |&s: &usize| s), None);
    }

    #[test]
    fn filtered_clone_is_independent() {
        let mut m = map();
        for i in 0..100usize {
            m.insert(0x4000 + i * 16, i);
        }
        let even = m.try_clone_filtered(|_, &v| v % 2 == 0).unwrap();
        assert_eq!(even.len(), 50);
        m.remove(0x4000);
        assert!(even.contains(0x4000));

        let mut seen = 0;
        even.for_each(|_, v| {
            assert_eq!(v % 2, 0);
            seen += 1;
        });
        assert_eq!(seen, 50);
    }
}
