//! Conservative mark-and-sweep collector.
//!
//! One [`Collector`] owns one thread's managed heap. Allocation goes
//! through the facade methods, which register every block in the pointer
//! registry; reclamation happens in two phases:
//!
//! 1. **Mark**: seed from the roots (ROOT-flagged entries, registered
//!    static ranges, and the stack window between the base captured at
//!    construction and the stack pointer captured now), then drain a work
//!    list of body ranges, scanning each aligned word as a candidate
//!    allocation-start address.
//! 2. **Sweep**: move every unmarked non-ROOT entry into the frees
//!    buffer, drop them from the registry, then run destructors and
//!    return the memory. The registry is consistent before the first
//!    destructor runs, so destructors may allocate and free through the
//!    collector they receive.
//!
//! Collection triggers automatically once the live count crosses a
//! threshold recomputed after each sweep, unless the collector is paused.

use std::fmt;
use std::time::Instant;

use crate::allocator::{RawAlloc, SystemAlloc};
use crate::config::GcConfig;
use crate::error::AllocError;
use crate::registry::{flags, PtrRegistry};

/// Destructor callback, invoked with the collector and the allocation's
/// start address immediately before the memory is returned to the raw
/// allocator. The collector reference makes re-entrant allocation legal
/// from inside a destructor.
pub type Dtor = fn(&mut Collector, *mut u8);

/// Collection statistics.
#[derive(Debug, Default, Clone)]
pub struct GcStats {
    /// Completed collections.
    pub collections: u64,
    /// Total time spent collecting, in nanoseconds.
    pub total_time_ns: u64,
    /// Entries marked reachable in the last collection.
    pub last_marked: usize,
    /// Entries freed by the last collection.
    pub last_freed: usize,
    /// Bytes freed by the last collection.
    pub last_freed_bytes: usize,
}

// A reclamation scheduled by sweep: registry-independent so destructors
// can mutate the registry freely while the buffer drains.
#[derive(Clone, Copy)]
struct FreeItem {
    ptr: *mut u8,
    size: usize,
    dtor: Option<Dtor>,
}

/// Conservative, thread-local, mark-and-sweep garbage collector.
///
/// The struct holds raw pointers and is therefore neither `Send` nor
/// `Sync`; each instance serves exactly the thread that created it.
/// Pointers reachable only from other threads are invisible to the
/// scanner and will be reclaimed.
pub struct Collector {
    raw: Box<dyn RawAlloc>,
    registry: PtrRegistry,
    /// High-water stack address captured at construction.
    stack_base: *const u8,
    /// Stack pointer captured at the start of the current collection.
    stack_min: *const u8,
    static_ranges: Vec<(usize, usize)>,
    /// Reusable sweep buffer; decouples destructor invocation from
    /// registry mutation.
    frees: Vec<FreeItem>,
    paused: bool,
    trigger: usize,
    config: GcConfig,
    stats: GcStats,
}

impl Collector {
    /// Create a collector with default configuration and the C heap as
    /// the underlying allocator.
    ///
    /// # Safety
    /// `stack_base` must be the address of a local variable in a frame
    /// that outlives the collector and is *shallower* than every frame
    /// that stores managed pointers; locals outside that window are not
    /// scanned and their referents may be reclaimed while still in use.
    /// The collector must only ever be used from the constructing thread.
    pub unsafe fn new(stack_base: *const u8) -> Self {
        unsafe { Self::with_config(stack_base, GcConfig::default()) }
    }

    /// Create a collector with a custom configuration.
    ///
    /// # Safety
    /// Same contract as [`Collector::new`].
    pub unsafe fn with_config(stack_base: *const u8, config: GcConfig) -> Self {
        unsafe { Self::with_allocator(stack_base, Box::new(SystemAlloc), config) }
    }

    /// Create a collector over a custom raw allocator.
    ///
    /// # Safety
    /// Same contract as [`Collector::new`].
    pub unsafe fn with_allocator(
        stack_base: *const u8,
        raw: Box<dyn RawAlloc>,
        config: GcConfig,
    ) -> Self {
        Self {
            raw,
            registry: PtrRegistry::new(
                config.load_factor,
                config.sweep_factor,
                config.min_capacity,
            ),
            stack_base,
            stack_min: stack_base,
            static_ranges: Vec::new(),
            frees: Vec::new(),
            paused: false,
            trigger: config.initial_trigger,
            config,
            stats: GcStats::default(),
        }
    }

    // ------------------------------------------------------------------
    // Allocation facade
    // ------------------------------------------------------------------

    /// Allocate `size` bytes of managed memory.
    ///
    /// May run a collection before returning. On exhaustion the collector
    /// collects once and retries before reporting
    /// [`AllocError::OutOfMemory`]. A zero `size` yields a minimal unique
    /// block that is tracked and freeable like any other.
    pub fn allocate(&mut self, size: usize) -> Result<*mut u8, AllocError> {
        self.allocate_opt(size, 0, None)
    }

    /// Allocate with initial flags ([`flags::ROOT`], [`flags::LEAF`]) and
    /// an optional destructor.
    pub fn allocate_opt(
        &mut self,
        size: usize,
        flags_bits: u8,
        dtor: Option<Dtor>,
    ) -> Result<*mut u8, AllocError> {
        let size = size.max(1);
        let ptr = self.raw_allocate(size)?;
        self.track(ptr, size, flags_bits, dtor)?;
        Ok(ptr)
    }

    /// Allocate `num * size` zeroed bytes, guarding the multiplication
    /// against overflow.
    pub fn allocate_zeroed(&mut self, num: usize, size: usize) -> Result<*mut u8, AllocError> {
        self.allocate_zeroed_opt(num, size, 0, None)
    }

    /// Zeroed allocation with flags and destructor.
    pub fn allocate_zeroed_opt(
        &mut self,
        num: usize,
        size: usize,
        flags_bits: u8,
        dtor: Option<Dtor>,
    ) -> Result<*mut u8, AllocError> {
        let total = num.checked_mul(size).ok_or(AllocError::SizeOverflow)?;
        let ptr = self.allocate_opt(total, flags_bits, dtor)?;
        unsafe { std::ptr::write_bytes(ptr, 0, total.max(1)) };
        Ok(ptr)
    }

    /// Resize a managed allocation, preserving its flags and destructor
    /// across an address change.
    ///
    /// A null `ptr` behaves as [`Collector::allocate`]. A non-null
    /// pointer the collector does not manage reports
    /// [`AllocError::UnknownPointer`] and performs no side effect.
    pub fn reallocate(&mut self, ptr: *mut u8, new_size: usize) -> Result<*mut u8, AllocError> {
        if ptr.is_null() {
            return self.allocate(new_size);
        }
        let index = self
            .registry
            .find(ptr)
            .ok_or(AllocError::UnknownPointer)?;
        let old = *self.registry.entry(index);
        let new_size = new_size.max(1);

        let mut moved = unsafe { self.raw.reallocate(ptr, old.size, new_size) };
        if moved.is_null() {
            // `ptr` is still live in this frame, which keeps the entry
            // reachable across the forced collection.
            self.run();
            moved = unsafe { self.raw.reallocate(ptr, old.size, new_size) };
            if moved.is_null() {
                return Err(AllocError::OutOfMemory);
            }
        }

        if moved == ptr {
            // The collection above may have rehashed the table.
            let index = self
                .registry
                .find(ptr)
                .ok_or(AllocError::UnknownPointer)?;
            self.registry.entry_mut(index).size = new_size;
            return Ok(ptr);
        }

        self.registry.remove(ptr);
        let kept_flags = old.flags & flags::PUBLIC;
        if let Err(err) = self.registry.insert(moved, new_size, kept_flags, old.dtor) {
            unsafe { self.raw.deallocate(moved, new_size) };
            return Err(err);
        }
        Ok(moved)
    }

    /// Free a managed allocation, running its destructor first. Null and
    /// unknown pointers are ignored.
    pub fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        // Removed before the destructor runs, same as sweep: the registry
        // must be self-consistent when re-entrant calls come in, and a
        // destructor that frees its own pointer must not recurse.
        if let Some(entry) = self.registry.remove(ptr) {
            if let Some(dtor) = entry.dtor {
                dtor(self, ptr);
            }
            unsafe { self.raw.deallocate(ptr, entry.size) };
        }
    }

    // Raw allocation with the collect-and-retry policy.
    fn raw_allocate(&mut self, size: usize) -> Result<*mut u8, AllocError> {
        let ptr = self.raw.allocate(size);
        if !ptr.is_null() {
            return Ok(ptr);
        }
        self.run();
        let ptr = self.raw.allocate(size);
        if ptr.is_null() {
            Err(AllocError::OutOfMemory)
        } else {
            Ok(ptr)
        }
    }

    // Register a fresh block and honor the auto-collection threshold.
    fn track(
        &mut self,
        ptr: *mut u8,
        size: usize,
        flags_bits: u8,
        dtor: Option<Dtor>,
    ) -> Result<(), AllocError> {
        if let Err(err) = self
            .registry
            .insert(ptr, size, flags_bits & flags::PUBLIC, dtor)
        {
            unsafe { self.raw.deallocate(ptr, size) };
            return Err(err);
        }
        if !self.paused && self.registry.len() > self.trigger {
            // The fresh pointer is treated as a root for this cycle so
            // the "live on return" guarantee cannot depend on whether the
            // compiler spilled it yet.
            self.collect(Some(ptr));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Metadata accessors
    // ------------------------------------------------------------------

    /// Replace the public flags of a managed allocation. Unknown pointers
    /// are ignored.
    pub fn set_flags(&mut self, ptr: *mut u8, flags_bits: u8) {
        if let Some(index) = self.registry.find(ptr) {
            let entry = self.registry.entry_mut(index);
            entry.flags = (entry.flags & flags::MARK) | (flags_bits & flags::PUBLIC);
        }
    }

    /// Public flags of a managed allocation, or `None` for an unknown
    /// pointer.
    pub fn get_flags(&self, ptr: *mut u8) -> Option<u8> {
        let index = self.registry.find(ptr)?;
        Some(self.registry.entry(index).flags & flags::PUBLIC)
    }

    /// Replace the destructor of a managed allocation. Unknown pointers
    /// are ignored.
    pub fn set_dtor(&mut self, ptr: *mut u8, dtor: Option<Dtor>) {
        if let Some(index) = self.registry.find(ptr) {
            self.registry.entry_mut(index).dtor = dtor;
        }
    }

    /// Destructor of a managed allocation, or `None` when the pointer is
    /// unknown or no destructor is registered.
    pub fn get_dtor(&self, ptr: *mut u8) -> Option<Dtor> {
        let index = self.registry.find(ptr)?;
        self.registry.entry(index).dtor
    }

    /// Byte length of a managed allocation.
    pub fn allocation_size(&self, ptr: *mut u8) -> Option<usize> {
        let index = self.registry.find(ptr)?;
        Some(self.registry.entry(index).size)
    }

    /// Whether `ptr` is the start address of a live managed allocation.
    pub fn is_managed(&self, ptr: *mut u8) -> bool {
        self.registry.find(ptr).is_some()
    }

    /// Number of live managed allocations.
    pub fn allocation_count(&self) -> usize {
        self.registry.len()
    }

    /// Collection statistics.
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Active configuration.
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------

    /// Disable automatic collection on allocation. Manual [`Collector::run`]
    /// still works while paused.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Re-enable automatic collection.
    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Whether automatic collection is currently disabled.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Enroll a `[start, end)` static-data range as an additional root
    /// region, for programs whose globals hold managed pointers. Without
    /// enrollment, pointers stored only in static memory are not roots.
    ///
    /// # Safety
    /// The range must stay readable for the collector's lifetime.
    pub unsafe fn register_static(&mut self, start: *const u8, end: *const u8) {
        if start.is_null() || end <= start {
            return;
        }
        self.static_ranges.push((start as usize, end as usize));
    }

    /// Run a full mark and sweep immediately, regardless of the paused
    /// state.
    pub fn run(&mut self) {
        self.collect(None);
    }

    /// Tear the collector down: free every non-ROOT allocation (running
    /// destructors) and release the registry storage. ROOT entries are
    /// deliberately left allocated; only an explicit [`Collector::free`]
    /// before `stop` releases them. Dropping the collector performs the
    /// same teardown.
    pub fn stop(&mut self) {
        // Marks are clear between collections, so a bare sweep frees
        // everything that is not a root.
        self.sweep();
        self.registry.clear_storage();
        self.static_ranges.clear();
        self.frees = Vec::new();
    }

    // ------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------

    fn collect(&mut self, scratch_root: Option<*mut u8>) {
        let start = Instant::now();
        self.stats.last_marked = 0;
        self.mark(scratch_root);
        self.sweep();
        self.stats.collections += 1;
        self.stats.total_time_ns += start.elapsed().as_nanos() as u64;

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "sable::gc",
            marked = self.stats.last_marked,
            freed = self.stats.last_freed,
            freed_bytes = self.stats.last_freed_bytes,
            live = self.registry.len(),
            "collection complete"
        );
    }

    // Seed the work list from every root, then drain it. Marking is
    // monotonic, so seeding order does not matter.
    fn mark(&mut self, scratch_root: Option<*mut u8>) {
        self.stack_min = current_stack_pointer();

        let mut work: Vec<(usize, usize)> = Vec::new();

        for index in 0..self.registry.slots().len() {
            let entry = *self.registry.entry(index);
            if entry.is_occupied() && entry.flags & flags::ROOT != 0 {
                let slot = self.registry.entry_mut(index);
                slot.flags |= flags::MARK;
                self.stats.last_marked += 1;
                if entry.flags & flags::LEAF == 0 {
                    work.push((entry.ptr as usize, entry.ptr as usize + entry.size));
                }
            }
        }

        if let Some(ptr) = scratch_root {
            self.mark_candidate(ptr as usize, &mut work);
        }

        for index in 0..self.static_ranges.len() {
            work.push(self.static_ranges[index]);
        }

        let base = self.stack_base as usize;
        let top = self.stack_min as usize;
        let window = if top < base { (top, base) } else { (base, top) };
        work.push(window);

        while let Some((lo, hi)) = work.pop() {
            self.scan_range(lo, hi, &mut work);
        }
    }

    // Walk `[lo, hi)` one aligned word at a time, treating each word as a
    // candidate allocation-start address. Reads of uninitialized stack or
    // heap bytes are expected and tolerated; only exact start addresses
    // of live entries have any effect.
    fn scan_range(&mut self, lo: usize, hi: usize, work: &mut Vec<(usize, usize)>) {
        let word = std::mem::size_of::<usize>();
        let mut cursor = (lo + word - 1) & !(word - 1);
        while cursor + word <= hi {
            let candidate = unsafe { std::ptr::read(cursor as *const usize) };
            self.mark_candidate(candidate, work);
            cursor += word;
        }
    }

    // Exact-start matching: interior pointers never root an allocation.
    fn mark_candidate(&mut self, addr: usize, work: &mut Vec<(usize, usize)>) {
        if !self.registry.in_bounds(addr) {
            return;
        }
        if let Some(index) = self.registry.find(addr as *mut u8) {
            let entry = self.registry.entry_mut(index);
            if entry.flags & flags::MARK == 0 {
                entry.flags |= flags::MARK;
                self.stats.last_marked += 1;
                if entry.flags & flags::LEAF == 0 {
                    work.push((entry.ptr as usize, entry.ptr as usize + entry.size));
                }
            }
        }
    }

    // Free every unmarked non-ROOT entry. Entries leave the registry
    // before any destructor runs; destructors observe a consistent
    // registry and may allocate (the paused flag blocks nested
    // collection) or free without restriction.
    fn sweep(&mut self) {
        let was_paused = self.paused;
        self.paused = true;

        let mut frees = std::mem::take(&mut self.frees);
        frees.clear();
        for entry in self.registry.slots() {
            if entry.is_occupied() && entry.flags & (flags::MARK | flags::ROOT) == 0 {
                frees.push(FreeItem {
                    ptr: entry.ptr,
                    size: entry.size,
                    dtor: entry.dtor,
                });
            }
        }

        for item in &frees {
            self.registry.remove(item.ptr);
        }

        // Shrinking rehashes while auto-collection is disabled, so the
        // registry's own reallocation cannot re-enter the collector.
        self.registry.maybe_shrink();

        let freed = frees.len();
        let mut freed_bytes = 0usize;
        for item in frees.drain(..) {
            if let Some(dtor) = item.dtor {
                dtor(self, item.ptr);
            }
            unsafe { self.raw.deallocate(item.ptr, item.size) };
            freed_bytes += item.size;
        }
        self.frees = frees;

        for entry in self.registry.slots_mut() {
            if entry.is_occupied() {
                entry.flags &= !flags::MARK;
            }
        }

        let live = self.registry.len();
        self.trigger = live + (live as f64 * self.config.trigger_factor) as usize + 1;
        self.stats.last_freed = freed;
        self.stats.last_freed_bytes = freed_bytes;
        self.paused = was_paused;
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("live", &self.registry.len())
            .field("capacity", &self.registry.capacity())
            .field("paused", &self.paused)
            .field("trigger", &self.trigger)
            .finish()
    }
}

// Address of a local in a dedicated frame, which bounds every caller
// frame from below. Routed through black_box so the frame and the address
// survive optimization.
#[inline(never)]
fn current_stack_pointer() -> *const u8 {
    let anchor: usize = 0;
    std::hint::black_box(&anchor) as *const usize as *const u8
}
