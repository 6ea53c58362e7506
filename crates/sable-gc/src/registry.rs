//! Pointer registry.
//!
//! An open-addressing hash table keyed by allocation-start address, with
//! Robin-Hood probe balancing on insert and backward-shift deletion (no
//! tombstones). One entry exists per managed allocation; the table is the
//! collector's single source of truth for liveness metadata.
//!
//! Capacity is always a power of two, so the ideal slot for a hash is a
//! mask instead of a modulo. A zero `hash` denotes an empty slot; the
//! pointer hash is forced nonzero.

use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;

use crate::collector::Dtor;
use crate::error::AllocError;

/// Per-entry metadata bits.
pub mod flags {
    /// Entry is a collection root: it survives every sweep and is
    /// released only by an explicit free.
    pub const ROOT: u8 = 1 << 0;
    /// Entry body contains no managed pointers; the scanner treats it as
    /// opaque bytes.
    pub const LEAF: u8 = 1 << 1;
    /// Transient reachability bit set during the mark phase. Internal;
    /// never surfaced through the metadata accessors.
    pub(crate) const MARK: u8 = 1 << 2;

    /// Bits a caller may set or observe.
    pub(crate) const PUBLIC: u8 = ROOT | LEAF;
}

/// One registry slot.
///
/// `hash == 0` means the slot is empty and every other field is
/// meaningless.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PtrEntry {
    /// Allocation start address (the key).
    pub ptr: *mut u8,
    /// Allocation length in bytes.
    pub size: usize,
    /// Cached nonzero hash of `ptr`.
    pub hash: u64,
    /// Distance from the ideal slot (Robin-Hood metric).
    pub probe: u32,
    /// Bitset from [`flags`].
    pub flags: u8,
    /// Destructor run just before the memory is freed.
    pub dtor: Option<Dtor>,
}

impl PtrEntry {
    pub(crate) const EMPTY: PtrEntry = PtrEntry {
        ptr: std::ptr::null_mut(),
        size: 0,
        hash: 0,
        probe: 0,
        flags: 0,
        dtor: None,
    };

    #[inline]
    pub(crate) fn is_occupied(&self) -> bool {
        self.hash != 0
    }
}

fn hash_ptr(ptr: *mut u8) -> u64 {
    let mut hasher = FxHasher::default();
    (ptr as usize).hash(&mut hasher);
    let hash = hasher.finish();
    // Zero is reserved for empty slots.
    if hash == 0 { 1 } else { hash }
}

/// Hash table of live allocations plus the cached address bounds used to
/// reject scan candidates cheaply.
pub(crate) struct PtrRegistry {
    slots: Vec<PtrEntry>,
    occupied: usize,
    load_factor: f64,
    sweep_factor: f64,
    min_capacity: usize,
    // Minimum and maximum managed start address, each stored bit-inverted
    // so a registry living on the scanned stack never holds a word that
    // aliases an allocation address.
    lo_bound: usize,
    hi_bound: usize,
}

impl PtrRegistry {
    pub(crate) fn new(load_factor: f64, sweep_factor: f64, min_capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            occupied: 0,
            load_factor,
            sweep_factor,
            min_capacity: min_capacity.max(2).next_power_of_two(),
            lo_bound: 0,
            hi_bound: usize::MAX,
        }
    }

    /// Number of live entries.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.occupied
    }

    /// Current slot-array capacity.
    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub(crate) fn slots(&self) -> &[PtrEntry] {
        &self.slots
    }

    #[inline]
    pub(crate) fn slots_mut(&mut self) -> &mut [PtrEntry] {
        &mut self.slots
    }

    #[inline]
    pub(crate) fn entry(&self, index: usize) -> &PtrEntry {
        &self.slots[index]
    }

    #[inline]
    pub(crate) fn entry_mut(&mut self, index: usize) -> &mut PtrEntry {
        &mut self.slots[index]
    }

    /// Fast reject for scan candidates: true only if `addr` falls within
    /// the envelope of managed start addresses.
    #[inline]
    pub(crate) fn in_bounds(&self, addr: usize) -> bool {
        addr >= !self.lo_bound && addr <= !self.hi_bound
    }

    fn note_bounds(&mut self, addr: usize) {
        if addr < !self.lo_bound {
            self.lo_bound = !addr;
        }
        if addr > !self.hi_bound {
            self.hi_bound = !addr;
        }
    }

    /// Register a new allocation. The caller guarantees `ptr` is not
    /// already present.
    pub(crate) fn insert(
        &mut self,
        ptr: *mut u8,
        size: usize,
        flags: u8,
        dtor: Option<Dtor>,
    ) -> Result<(), AllocError> {
        self.ensure_space()?;
        self.insert_entry(PtrEntry {
            ptr,
            size,
            hash: hash_ptr(ptr),
            probe: 0,
            flags,
            dtor,
        });
        self.note_bounds(ptr as usize);
        Ok(())
    }

    /// Find the slot index holding `ptr`.
    ///
    /// The walk stops at an empty slot or as soon as the stored entry's
    /// probe distance drops below the number of steps taken: under
    /// Robin-Hood balancing the key cannot live any deeper.
    pub(crate) fn find(&self, ptr: *mut u8) -> Option<usize> {
        if self.occupied == 0 {
            return None;
        }
        let mask = self.slots.len() - 1;
        let hash = hash_ptr(ptr);
        let mut index = (hash as usize) & mask;
        let mut distance: u32 = 0;
        loop {
            let entry = &self.slots[index];
            if !entry.is_occupied() || entry.probe < distance {
                return None;
            }
            if entry.hash == hash && entry.ptr == ptr {
                return Some(index);
            }
            distance += 1;
            index = (index + 1) & mask;
        }
    }

    /// Remove `ptr` and return its entry.
    pub(crate) fn remove(&mut self, ptr: *mut u8) -> Option<PtrEntry> {
        let index = self.find(ptr)?;
        let removed = self.slots[index];
        self.remove_at(index);
        Some(removed)
    }

    // Backward-shift deletion: pull each displaced successor one slot
    // back, decrementing its probe, until a home entry or an empty slot.
    fn remove_at(&mut self, mut index: usize) {
        let mask = self.slots.len() - 1;
        loop {
            let next = (index + 1) & mask;
            if !self.slots[next].is_occupied() || self.slots[next].probe == 0 {
                self.slots[index] = PtrEntry::EMPTY;
                break;
            }
            self.slots[index] = self.slots[next];
            self.slots[index].probe -= 1;
            index = next;
        }
        self.occupied -= 1;
    }

    // Robin-Hood insert: steal the slot of any entry closer to home than
    // the one being placed, then continue inserting the displaced entry.
    fn insert_entry(&mut self, mut incoming: PtrEntry) {
        let mask = self.slots.len() - 1;
        incoming.probe = 0;
        let mut index = (incoming.hash as usize) & mask;
        loop {
            let slot = &mut self.slots[index];
            if !slot.is_occupied() {
                *slot = incoming;
                self.occupied += 1;
                return;
            }
            if slot.probe < incoming.probe {
                std::mem::swap(slot, &mut incoming);
            }
            incoming.probe += 1;
            index = (index + 1) & mask;
        }
    }

    // Grow ahead of an insert so occupancy never exceeds the load factor.
    fn ensure_space(&mut self) -> Result<(), AllocError> {
        let capacity = self.slots.len();
        if capacity == 0 {
            return self.rehash(self.min_capacity);
        }
        if (self.occupied + 1) as f64 > capacity as f64 * self.load_factor {
            return self.rehash(capacity * 2);
        }
        Ok(())
    }

    /// Halve the table after a sweep if occupancy dropped far enough.
    /// Failure to shrink is not an error; the table keeps its capacity.
    pub(crate) fn maybe_shrink(&mut self) {
        let capacity = self.slots.len();
        if capacity <= self.min_capacity {
            return;
        }
        let half = capacity / 2;
        // The second guard keeps the halved table under the growth
        // threshold, so a shrink can never force an immediate regrow.
        if (self.occupied as f64) < capacity as f64 * self.sweep_factor
            && (self.occupied as f64) <= half as f64 * self.load_factor
        {
            let _ = self.rehash(half);
        }
    }

    // Re-slot every occupied entry into a fresh array. Probe distances
    // are recomputed; all other metadata is preserved. On reservation
    // failure the registry keeps its prior storage.
    fn rehash(&mut self, new_capacity: usize) -> Result<(), AllocError> {
        debug_assert!(new_capacity.is_power_of_two());
        let mut fresh: Vec<PtrEntry> = Vec::new();
        fresh
            .try_reserve_exact(new_capacity)
            .map_err(|_| AllocError::OutOfMemory)?;
        fresh.resize(new_capacity, PtrEntry::EMPTY);

        let old = std::mem::replace(&mut self.slots, fresh);
        self.occupied = 0;
        for entry in old {
            if entry.is_occupied() {
                self.insert_entry(entry);
            }
        }
        Ok(())
    }

    /// Release the slot array. Used at collector teardown.
    pub(crate) fn clear_storage(&mut self) {
        self.slots = Vec::new();
        self.occupied = 0;
        self.lo_bound = 0;
        self.hi_bound = usize::MAX;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_ptr(i: usize) -> *mut u8 {
        // The registry never dereferences its keys, so synthetic aligned
        // addresses are fine here.
        (0x10_0000 + i * 64) as *mut u8
    }

    fn registry() -> PtrRegistry {
        PtrRegistry::new(0.9, 0.5, 32)
    }

    #[test]
    fn test_insert_find_remove() {
        let mut reg = registry();
        for i in 0..10 {
            reg.insert(fake_ptr(i), 64, 0, None).unwrap();
        }
        assert_eq!(reg.len(), 10);

        for i in 0..10 {
            let index = reg.find(fake_ptr(i)).expect("entry present");
            assert_eq!(reg.entry(index).size, 64);
        }
        assert!(reg.find(fake_ptr(99)).is_none());

        let removed = reg.remove(fake_ptr(3)).expect("entry present");
        assert_eq!(removed.ptr, fake_ptr(3));
        assert!(reg.find(fake_ptr(3)).is_none());
        assert_eq!(reg.len(), 9);

        // Neighbors are still reachable after the backward shift.
        for i in (0..10).filter(|&i| i != 3) {
            assert!(reg.find(fake_ptr(i)).is_some());
        }
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut reg = registry();
        reg.insert(fake_ptr(0), 16, 0, None).unwrap();
        assert!(reg.remove(fake_ptr(0)).is_some());
        assert!(reg.remove(fake_ptr(0)).is_none());
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn test_growth_keeps_load_factor() {
        let mut reg = registry();
        for i in 0..200 {
            reg.insert(fake_ptr(i), 8, 0, None).unwrap();
            let capacity = reg.capacity();
            assert!(
                reg.len() as f64 <= capacity as f64 * 0.9,
                "load factor exceeded at {} / {}",
                reg.len(),
                capacity
            );
        }
        assert_eq!(reg.len(), 200);
        for i in 0..200 {
            assert!(reg.find(fake_ptr(i)).is_some());
        }
    }

    #[test]
    fn test_shrink_after_mass_removal() {
        let mut reg = registry();
        for i in 0..200 {
            reg.insert(fake_ptr(i), 8, 0, None).unwrap();
        }
        let grown = reg.capacity();
        for i in 10..200 {
            reg.remove(fake_ptr(i));
        }
        reg.maybe_shrink();
        assert!(reg.capacity() < grown);
        assert!(reg.capacity() >= 32);
        for i in 0..10 {
            assert!(reg.find(fake_ptr(i)).is_some());
        }
    }

    #[test]
    fn test_shrink_stops_at_min_capacity() {
        let mut reg = registry();
        reg.insert(fake_ptr(0), 8, 0, None).unwrap();
        reg.maybe_shrink();
        reg.maybe_shrink();
        assert_eq!(reg.capacity(), 32);
    }

    #[test]
    fn test_metadata_preserved_across_rehash() {
        fn noop(_gc: &mut crate::Collector, _ptr: *mut u8) {}

        let mut reg = registry();
        reg.insert(fake_ptr(0), 24, flags::ROOT | flags::LEAF, Some(noop))
            .unwrap();
        // Force several rehashes.
        for i in 1..100 {
            reg.insert(fake_ptr(i), 8, 0, None).unwrap();
        }
        let index = reg.find(fake_ptr(0)).unwrap();
        let entry = reg.entry(index);
        assert_eq!(entry.size, 24);
        assert_eq!(entry.flags, flags::ROOT | flags::LEAF);
        assert!(entry.dtor.is_some());
    }

    #[test]
    fn test_bounds_envelope() {
        let mut reg = registry();
        assert!(!reg.in_bounds(fake_ptr(5) as usize));

        reg.insert(fake_ptr(2), 8, 0, None).unwrap();
        reg.insert(fake_ptr(7), 8, 0, None).unwrap();

        assert!(reg.in_bounds(fake_ptr(2) as usize));
        assert!(reg.in_bounds(fake_ptr(5) as usize));
        assert!(reg.in_bounds(fake_ptr(7) as usize));
        assert!(!reg.in_bounds(fake_ptr(1) as usize));
        assert!(!reg.in_bounds(fake_ptr(8) as usize));
    }

    #[test]
    fn test_clear_storage() {
        let mut reg = registry();
        for i in 0..50 {
            reg.insert(fake_ptr(i), 8, 0, None).unwrap();
        }
        reg.clear_storage();
        assert_eq!(reg.len(), 0);
        assert_eq!(reg.capacity(), 0);
        assert!(reg.find(fake_ptr(0)).is_none());
        // Usable again after teardown.
        reg.insert(fake_ptr(0), 8, 0, None).unwrap();
        assert!(reg.find(fake_ptr(0)).is_some());
    }
}
