//! Heap source
//!
//! The page-managed chunk allocator underneath the coordinator. One
//! contiguous reservation of `maximum_size` bytes is carved into 8-byte
//! aligned chunks by a first-fit free list. Ordinary allocation is bounded
//! by a soft *ideal footprint* that collection policy moves between
//! `starting_size` and `growth_limit`; only [`HeapSource::alloc_and_grow`]
//! may push the footprint past the growth limit, up to the full
//! `maximum_size` reservation.
//!
//! Chunk layout: an 8-byte header holding the usable size, then the
//! zero-filled payload the mutator sees. Bitmap bits are keyed by payload
//! address.
//!
//! All free-list state sits behind an internal lock, so a concurrent sweep
//! freeing dead chunks never races a mutator allocating live ones.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::bitmap::HeapBitmap;
use crate::config::HeapConfig;
use crate::error::HeapError;
use crate::object::{ObjectPtr, OBJECT_ALIGNMENT};

/// Bytes of chunk header ahead of every payload.
const CHUNK_HEADER: usize = 8;

/// Smallest payload handed out; keeps zero-size allocations distinct.
const MIN_PAYLOAD: usize = 8;

/// Live-to-footprint ratio the resize policy steers toward.
const TARGET_UTILIZATION: f64 = 0.5;

/// Footprint and allocation counters exposed to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapValue {
    /// Total bytes currently allocated (chunk headers included).
    BytesAllocated,
    /// Current soft footprint limit.
    Footprint,
    /// Number of live chunks.
    ObjectsAllocated,
}

struct SourceState {
    /// Free spans as `(offset, len)`, sorted by offset, coalesced.
    free: Vec<(usize, usize)>,
    bytes_allocated: usize,
    objects_allocated: usize,
    /// Soft limit on `bytes_allocated`; raised by growth, adjusted by the
    /// utilization policy after each collection.
    ideal_footprint: usize,
    /// Highest chunk end ever allocated; the post-fork hook freezes this as
    /// the immune-region boundary.
    high_water: usize,
}

/// The underlying allocator for the managed heap.
pub struct HeapSource {
    base: NonNull<u8>,
    layout: Layout,
    starting_size: usize,
    /// Ordinary-growth ceiling (resolved `growth_limit`); the utilization
    /// policy keeps the ideal footprint at or under this.
    growth_limit: usize,
    /// Hard ceiling: the whole reservation (`maximum_size`), reachable only
    /// through `alloc_and_grow`.
    capacity: usize,
    state: Mutex<SourceState>,
    /// Live and mark bitmaps; `live_index` selects which is live.
    bitmaps: [HeapBitmap; 2],
    live_index: AtomicUsize,
    /// While set, new chunks are born marked so they survive the in-flight
    /// concurrent cycle.
    mark_new_allocations: AtomicBool,
    /// Offset below which chunks belong to the immune (pre-fork) region.
    immune_end: AtomicUsize,
    trim_deadline: Mutex<Option<Instant>>,
}

// SAFETY: the reservation is owned by this struct for its whole lifetime;
// all mutation of allocator state goes through the internal mutex and the
// bitmaps are atomic.
unsafe impl Send for HeapSource {}
unsafe impl Sync for HeapSource {}

impl HeapSource {
    /// Reserve the region and initialize allocator state.
    pub fn startup(config: &HeapConfig) -> Result<Self, HeapError> {
        let layout = Layout::from_size_align(config.maximum_size, 4096)
            .map_err(|_| HeapError::SourceStartup("unrepresentable region layout"))?;
        // SAFETY: layout has non-zero size (checked by config normalization).
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        let Some(base) = NonNull::new(base) else {
            return Err(HeapError::SourceStartup("region reservation failed"));
        };

        let base_addr = base.as_ptr() as usize;
        Ok(Self {
            base,
            layout,
            starting_size: config.starting_size,
            growth_limit: config.growth_limit,
            capacity: config.maximum_size,
            state: Mutex::new(SourceState {
                free: vec![(0, config.maximum_size)],
                bytes_allocated: 0,
                objects_allocated: 0,
                ideal_footprint: config.starting_size,
                high_water: 0,
            }),
            bitmaps: [
                HeapBitmap::new(base_addr, config.maximum_size),
                HeapBitmap::new(base_addr, config.maximum_size),
            ],
            live_index: AtomicUsize::new(0),
            mark_new_allocations: AtomicBool::new(false),
            immune_end: AtomicUsize::new(0),
            trim_deadline: Mutex::new(None),
        })
    }

    /// Base address of the reservation (for card-table sizing).
    pub fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// One-past-the-end of the allocatable range.
    pub fn limit_addr(&self) -> usize {
        self.base_addr() + self.capacity
    }

    /// Offset of the immune-region boundary; 0 before the post-fork hook.
    pub fn immune_end(&self) -> usize {
        self.immune_end.load(Ordering::Acquire)
    }

    fn alloc_locked(
        &self,
        state: &mut SourceState,
        size: usize,
        soft_limit: usize,
    ) -> Option<ObjectPtr> {
        let payload = size.next_multiple_of(OBJECT_ALIGNMENT).max(MIN_PAYLOAD);
        let total = payload + CHUNK_HEADER;
        if state.bytes_allocated + total > soft_limit {
            return None;
        }

        let idx = state.free.iter().position(|&(_, len)| len >= total)?;
        let (offset, len) = state.free[idx];
        if len == total {
            state.free.remove(idx);
        } else {
            state.free[idx] = (offset + total, len - total);
        }
        state.bytes_allocated += total;
        state.objects_allocated += 1;
        state.high_water = state.high_water.max(offset + total);

        // SAFETY: the span came from the free list, so it lies inside the
        // reservation and overlaps no live chunk.
        let payload_ptr = unsafe {
            let chunk = self.base.as_ptr().add(offset);
            (chunk as *mut usize).write(payload);
            let payload_ptr = chunk.add(CHUNK_HEADER);
            payload_ptr.write_bytes(0, payload);
            payload_ptr
        };

        let obj = ObjectPtr::from_raw(payload_ptr).expect("chunk payload is aligned");
        self.live_bits().set(obj.addr());
        if self.mark_new_allocations.load(Ordering::Acquire) {
            self.mark_bits().set(obj.addr());
        }
        Some(obj)
    }

    /// Allocate within the current soft footprint. Zero-filled, 8-byte
    /// aligned; `None` when the footprint or free space is exhausted.
    pub fn alloc(&self, size: usize) -> Option<ObjectPtr> {
        let mut state = self.state.lock();
        let soft_limit = state.ideal_footprint;
        self.alloc_locked(&mut state, size, soft_limit)
    }

    /// Allocate, growing the soft footprint as far as the reservation
    /// ceiling (`maximum_size`) if necessary. Plain [`alloc`](Self::alloc)
    /// stays under the ideal footprint; this is the only path that can use
    /// the gap between the growth limit and the full reservation.
    pub fn alloc_and_grow(&self, size: usize) -> Option<ObjectPtr> {
        let mut state = self.state.lock();
        let soft_limit = state.ideal_footprint;
        if let Some(obj) = self.alloc_locked(&mut state, size, soft_limit) {
            return Some(obj);
        }
        let obj = self.alloc_locked(&mut state, size, self.capacity)?;
        state.ideal_footprint = state.ideal_footprint.max(state.bytes_allocated);
        Some(obj)
    }

    /// Return a dead chunk to the free list. Returns the bytes recovered
    /// (header included).
    pub fn free(&self, obj: ObjectPtr) -> usize {
        let offset = obj.addr() - CHUNK_HEADER - self.base_addr();
        // SAFETY: callers only pass chunks previously returned by alloc.
        let payload = unsafe { (self.base.as_ptr().add(offset) as *const usize).read() };
        let total = payload + CHUNK_HEADER;

        let mut state = self.state.lock();
        state.bytes_allocated -= total;
        state.objects_allocated -= 1;
        let pos = state.free.partition_point(|&(off, _)| off < offset);

        // Coalesce with the next span, then the previous.
        let mut span = (offset, total);
        if pos < state.free.len() && span.0 + span.1 == state.free[pos].0 {
            span.1 += state.free[pos].1;
            state.free.remove(pos);
        }
        let merges_prev =
            pos > 0 && state.free[pos - 1].0 + state.free[pos - 1].1 == span.0;
        if merges_prev {
            state.free[pos - 1].1 += span.1;
        } else {
            state.free.insert(pos, span);
        }
        total
    }

    /// Whether `ptr` is a known live chunk. Lock-free; no false negatives
    /// for fully-published pointers.
    pub fn contains(&self, obj: ObjectPtr) -> bool {
        let addr = obj.addr();
        addr >= self.base_addr() + CHUNK_HEADER
            && addr < self.limit_addr()
            && self.live_bits().test(addr)
    }

    /// Usable size of the chunk at `ptr`; 0 if `ptr` is not a live chunk.
    pub fn chunk_size(&self, obj: ObjectPtr) -> usize {
        if !self.contains(obj) {
            return 0;
        }
        // SAFETY: contains() established this is a live chunk payload.
        unsafe { (obj.as_ptr().sub(CHUNK_HEADER) as *const usize).read() }
    }

    /// Read a footprint counter.
    pub fn get_value(&self, value: HeapValue) -> usize {
        let state = self.state.lock();
        match value {
            HeapValue::BytesAllocated => state.bytes_allocated,
            HeapValue::Footprint => state.ideal_footprint,
            HeapValue::ObjectsAllocated => state.objects_allocated,
        }
    }

    /// The bitmap currently publishing the live set.
    pub fn live_bits(&self) -> &HeapBitmap {
        &self.bitmaps[self.live_index.load(Ordering::Acquire)]
    }

    /// The bitmap the in-flight cycle is marking into.
    pub fn mark_bits(&self) -> &HeapBitmap {
        &self.bitmaps[1 - self.live_index.load(Ordering::Acquire)]
    }

    /// Publish the mark bitmap as the new live set. The old live bitmap
    /// becomes the next mark bitmap; the sweep walks it before clearing.
    pub fn swap_bitmaps(&self) {
        self.live_index.fetch_xor(1, Ordering::AcqRel);
    }

    /// Toggle born-marked allocation for the concurrent window.
    pub fn set_mark_new_allocations(&self, enabled: bool) {
        self.mark_new_allocations.store(enabled, Ordering::Release);
    }

    /// Move the soft footprint toward the target live-to-footprint ratio.
    /// The utilization target is capped at the growth limit, but a live set
    /// that `alloc_and_grow` already pushed past it is never clamped away;
    /// the reservation ceiling is the absolute bound. No pages move; only
    /// the limit does.
    pub fn grow_for_utilization(&self) {
        let mut state = self.state.lock();
        let target = (state.bytes_allocated as f64 / TARGET_UTILIZATION) as usize;
        state.ideal_footprint = target
            .clamp(self.starting_size, self.growth_limit)
            .max(state.bytes_allocated)
            .min(self.capacity);
        debug!(
            target: "marten::gc",
            footprint = state.ideal_footprint,
            allocated = state.bytes_allocated,
            "footprint adjusted for utilization"
        );
    }

    /// Schedule free pages to be released after `delay`, cancelling any
    /// previously scheduled trim.
    pub fn schedule_trim(&self, delay: Duration) {
        *self.trim_deadline.lock() = Some(Instant::now() + delay);
    }

    /// Whether a trim is scheduled and not yet performed.
    pub fn trim_pending(&self) -> bool {
        self.trim_deadline.lock().is_some()
    }

    /// Perform a due trim: scrub free spans so their pages are clean for the
    /// OS. Returns the bytes scrubbed, or `None` if no trim was due.
    pub fn trim_if_due(&self) -> Option<usize> {
        {
            let mut deadline = self.trim_deadline.lock();
            match *deadline {
                Some(at) if Instant::now() >= at => *deadline = None,
                _ => return None,
            }
        }
        let state = self.state.lock();
        let mut scrubbed = 0;
        for &(offset, len) in &state.free {
            // SAFETY: free spans are unreferenced by any live chunk.
            unsafe { self.base.as_ptr().add(offset).write_bytes(0, len) };
            scrubbed += len;
        }
        debug!(target: "marten::gc", bytes = scrubbed, "trimmed free heap pages");
        Some(scrubbed)
    }

    /// Post-fork hook: freeze everything allocated so far as the immune
    /// region. Partial collections treat those chunks as roots and never
    /// sweep them.
    pub fn startup_after_fork(&self) {
        let state = self.state.lock();
        self.immune_end.store(state.high_water, Ordering::Release);
        debug!(
            target: "marten::gc",
            immune_bytes = state.high_water,
            "immune region frozen after fork"
        );
    }
}

impl Drop for HeapSource {
    fn drop(&mut self) {
        // SAFETY: allocated with this layout in startup().
        unsafe { std::alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_source() -> HeapSource {
        HeapSource::startup(
            &HeapConfig::with_sizes(4096, 64 * 1024, 0)
                .normalized()
                .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_alloc_is_aligned_and_zeroed() {
        let source = small_source();
        let obj = source.alloc(100).unwrap();
        assert_eq!(obj.addr() % OBJECT_ALIGNMENT, 0);
        // SAFETY: freshly allocated 100-byte payload.
        let bytes = unsafe { std::slice::from_raw_parts(obj.as_ptr(), 100) };
        assert!(bytes.iter().all(|&b| b == 0));
        assert!(source.contains(obj));
        assert_eq!(source.chunk_size(obj), 104); // rounded to 8
    }

    #[test]
    fn test_zero_size_allocations_are_distinct() {
        let source = small_source();
        let a = source.alloc(0).unwrap();
        let b = source.alloc(0).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_soft_footprint_bounds_alloc() {
        let source = small_source();
        assert!(source.alloc(8192).is_none()); // over the 4096 starting footprint
        let obj = source.alloc_and_grow(8192).unwrap();
        assert!(source.contains(obj));
        assert!(source.get_value(HeapValue::Footprint) >= 8192);
    }

    #[test]
    fn test_alloc_and_grow_reaches_past_growth_limit() {
        let source = HeapSource::startup(
            &HeapConfig::with_sizes(4096, 64 * 1024, 16 * 1024)
                .normalized()
                .unwrap(),
        )
        .unwrap();

        // Ordinary allocation is held under the ideal footprint, which the
        // growth limit caps...
        assert!(source.alloc(32 * 1024).is_none());

        // ...but alloc_and_grow may use the gap up to the reservation.
        let obj = source.alloc_and_grow(32 * 1024).unwrap();
        assert!(source.contains(obj));
        let footprint = source.get_value(HeapValue::Footprint);
        assert!(footprint > 16 * 1024);
        assert!(footprint <= 64 * 1024);

        // The utilization pass never clamps the footprint back under the
        // live set it already granted.
        source.grow_for_utilization();
        assert!(
            source.get_value(HeapValue::Footprint)
                >= source.get_value(HeapValue::BytesAllocated)
        );

        // The reservation itself is the hard stop.
        assert!(source.alloc_and_grow(64 * 1024).is_none());
    }

    #[test]
    fn test_free_coalesces_and_reuses() {
        let source = small_source();
        let a = source.alloc(64).unwrap();
        let b = source.alloc(64).unwrap();
        let before = source.get_value(HeapValue::BytesAllocated);
        source.live_bits().clear(a.addr());
        source.live_bits().clear(b.addr());
        source.free(a);
        source.free(b);
        assert_eq!(
            source.get_value(HeapValue::BytesAllocated),
            before - 2 * (64 + CHUNK_HEADER)
        );
        // The coalesced span satisfies a larger request.
        assert!(source.alloc(120).is_some());
    }

    #[test]
    fn test_contains_rejects_freed_chunk() {
        let source = small_source();
        let obj = source.alloc(32).unwrap();
        assert!(source.contains(obj));
        source.live_bits().clear(obj.addr());
        source.free(obj);
        assert!(!source.contains(obj));
        assert_eq!(source.chunk_size(obj), 0);
    }

    #[test]
    fn test_swap_publishes_mark_bitmap() {
        let source = small_source();
        let obj = source.alloc(32).unwrap();
        source.mark_bits().set(obj.addr());
        source.swap_bitmaps();
        assert!(source.contains(obj));
        // The old live bitmap is now the mark bitmap.
        assert!(source.mark_bits().test(obj.addr()));
    }

    #[test]
    fn test_born_marked_during_concurrent_window() {
        let source = small_source();
        source.set_mark_new_allocations(true);
        let obj = source.alloc(32).unwrap();
        assert!(source.mark_bits().test(obj.addr()));
        source.set_mark_new_allocations(false);
        let other = source.alloc(32).unwrap();
        assert!(!source.mark_bits().test(other.addr()));
    }

    #[test]
    fn test_grow_for_utilization_clamps() {
        let source = small_source();
        source.grow_for_utilization();
        // Empty heap: footprint snaps back to the starting size.
        assert_eq!(source.get_value(HeapValue::Footprint), 4096);
        let _obj = source.alloc_and_grow(8000).unwrap();
        source.grow_for_utilization();
        let footprint = source.get_value(HeapValue::Footprint);
        assert!(footprint >= source.get_value(HeapValue::BytesAllocated));
        assert!(footprint <= 64 * 1024);
    }

    #[test]
    fn test_trim_scheduling_and_cancel() {
        let source = small_source();
        assert!(!source.trim_pending());
        source.schedule_trim(Duration::from_secs(60));
        assert!(source.trim_pending());
        assert!(source.trim_if_due().is_none()); // not due yet
        source.schedule_trim(Duration::from_secs(0));
        assert!(source.trim_if_due().is_some());
        assert!(!source.trim_pending());
    }

    #[test]
    fn test_immune_boundary_freezes_high_water() {
        let source = small_source();
        let _a = source.alloc(64).unwrap();
        source.startup_after_fork();
        let boundary = source.immune_end();
        assert!(boundary >= 64 + CHUNK_HEADER);
        let _b = source.alloc(64).unwrap();
        assert_eq!(source.immune_end(), boundary);
    }
}
