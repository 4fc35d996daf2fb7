//! Heap coordinator
//!
//! `GcHeap` mediates between mutator threads allocating objects and the
//! mark-sweep collector reclaiming them. It owns the global heap lock, runs
//! the allocation recovery ladder, enforces out-of-memory semantics, and
//! hands finalizable and reference objects off to the worker thread.
//!
//! Lock order: heap lock → worker lock → worker-list lock. Never acquire in
//! reverse.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use tracing::{debug, error, info, warn};

use crate::card::{CARD_SIZE, CardTable};
use crate::config::HeapConfig;
use crate::driver::GcSummary;
use crate::error::{HeapError, VmException};
use crate::marker::{ObjectModel, RootProvider};
use crate::monitor::{HeapMonitor, LogMonitor, MonitorConfig};
use crate::object::{ObjectPtr, alloc_flags};
use crate::safepoint::SafepointQueue;
use crate::source::{HeapSource, HeapValue};
use crate::threads::{AllocProfile, ThreadRegistry, ThreadStatus, current_thread};
use crate::worker::{WorkerOp, WorkerQueues, WorkerState};

/// Allocator state guarded by the heap lock.
pub(crate) struct HeapState {
    /// True while any phase of a collection cycle is active.
    pub(crate) running: bool,
    /// Live objects whose class overrides finalization, in allocation order.
    pub(crate) finalizable_refs: crate::worker::ReferenceTable,
}

/// RAII handle for coarse external synchronization with the allocator.
pub struct HeapLockGuard<'a> {
    pub(crate) guard: MutexGuard<'a, HeapState>,
}

/// The garbage-collected heap coordinator.
pub struct GcHeap {
    pub(crate) config: HeapConfig,
    pub(crate) source: HeapSource,
    pub(crate) state: Mutex<HeapState>,
    /// Broadcast when a concurrent cycle completes.
    pub(crate) gc_done: Condvar,
    /// Excludes the worker thread for the duration of a cycle.
    pub(crate) worker_lock: Mutex<()>,
    /// The worker-list lock and the two hand-off FIFOs it guards.
    pub(crate) worker_queues: Mutex<WorkerQueues>,
    /// Worker introspection for the wedge check at GC entry.
    pub worker_state: WorkerState,
    pub(crate) threads: ThreadRegistry,
    pub(crate) cards: CardTable,
    pub(crate) safepoints: SafepointQueue,
    pub(crate) monitor_config: MonitorConfig,
    pub(crate) monitor: RwLock<Arc<dyn HeapMonitor>>,
    pub(crate) model: Box<dyn ObjectModel>,
    pub(crate) roots: RwLock<Vec<Arc<dyn RootProvider>>>,
    /// Process-wide allocation-profile counters.
    pub alloc_prof: AllocProfile,
    pub(crate) last_gc_summary: Mutex<Option<GcSummary>>,
    shut_down: AtomicBool,
}

impl GcHeap {
    /// Initialize the heap: reserve the region, size the card table to the
    /// maximum heap, and set up the worker hand-off state. Any failure
    /// tears down partial state via drop and reports why.
    pub fn startup(
        config: HeapConfig,
        model: Box<dyn ObjectModel>,
    ) -> Result<Arc<Self>, HeapError> {
        let config = config.normalized()?;
        let source = HeapSource::startup(&config)?;
        if config.maximum_size < CARD_SIZE {
            return Err(HeapError::CardTableStartup);
        }
        let cards = CardTable::startup(source.base_addr(), config.maximum_size);

        debug!(
            target: "marten::gc",
            starting = config.starting_size,
            maximum = config.maximum_size,
            growth_limit = config.growth_limit,
            "heap started"
        );
        Ok(Arc::new(Self {
            config,
            source,
            state: Mutex::new(HeapState {
                running: false,
                finalizable_refs: crate::worker::ReferenceTable::new(),
            }),
            gc_done: Condvar::new(),
            worker_lock: Mutex::new(()),
            worker_queues: Mutex::new(WorkerQueues::default()),
            worker_state: WorkerState::default(),
            threads: ThreadRegistry::new(),
            cards,
            safepoints: SafepointQueue::default(),
            monitor_config: MonitorConfig::default(),
            monitor: RwLock::new(Arc::new(LogMonitor)),
            model,
            roots: RwLock::new(Vec::new()),
            alloc_prof: AllocProfile::default(),
            last_gc_summary: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }))
    }

    /// Post-fork hook: freeze everything allocated by the template process
    /// as the immune region for partial collections.
    pub fn startup_after_fork(&self) {
        self.source.startup_after_fork();
    }

    /// Shut down the heap: drop the card table contents, free the three
    /// hand-off tables, and mark the heap dead so stale pointers answer
    /// `is_valid_object` with false instead of crashing. The region itself
    /// is released when the `GcHeap` drops.
    pub fn shutdown(&self) {
        self.cards.clear();
        {
            let mut queues = self.worker_queues.lock();
            queues.pending_finalization_refs.clear();
            queues.reference_operations.clear();
        }
        self.state.lock().finalizable_refs.clear();
        self.shut_down.store(true, Ordering::Release);
        debug!(target: "marten::gc", "heap shut down");
    }

    /// Quiesce heap-internal threads: returns once any in-flight worker
    /// operation has released the worker lock.
    pub fn thread_shutdown(&self) {
        drop(self.worker_lock.lock());
    }

    /// The resolved startup configuration (growth limit normalized).
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// The underlying heap source (footprint queries, trim state).
    pub fn source(&self) -> &HeapSource {
        &self.source
    }

    /// The mutator thread registry.
    pub fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    /// The deferred safepoint work queue.
    pub fn safepoint_queue(&self) -> &SafepointQueue {
        &self.safepoints
    }

    /// Monitoring knobs (heap-info snapshots after GC).
    pub fn monitor_config(&self) -> &MonitorConfig {
        &self.monitor_config
    }

    /// Replace the monitoring sink.
    pub fn set_monitor(&self, monitor: Arc<dyn HeapMonitor>) {
        *self.monitor.write() = monitor;
    }

    /// Register a source of runtime roots.
    pub fn add_root_provider(&self, provider: Arc<dyn RootProvider>) {
        self.roots.write().push(provider);
    }

    /// The report line of the most recent collection.
    pub fn last_gc_summary(&self) -> Option<GcSummary> {
        self.last_gc_summary.lock().clone()
    }

    // ------------------------------------------------------------------
    // Heap lock
    // ------------------------------------------------------------------

    /// Acquire the heap lock, downgrading thread status while blocked so the
    /// suspend protocol never mistakes a lock waiter for a runnable thread.
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, HeapState> {
        if let Some(guard) = self.state.try_lock() {
            return guard;
        }
        match current_thread() {
            Some(thread) => {
                let old = self.threads.change_status(&thread, ThreadStatus::VmWait);
                let guard = self.state.lock();
                self.threads.change_status(&thread, old);
                guard
            }
            None => self.state.lock(),
        }
    }

    /// Coarse external synchronization with the allocator.
    pub fn lock_heap(&self) -> HeapLockGuard<'_> {
        HeapLockGuard {
            guard: self.lock_state(),
        }
    }

    /// Block until the in-flight concurrent collection completes. The caller
    /// holds the heap lock; `running` is false on return.
    pub fn wait_for_concurrent_gc_to_complete(&self, guard: &mut HeapLockGuard<'_>) {
        self.wait_for_concurrent_gc_locked(&mut guard.guard);
    }

    pub(crate) fn wait_for_concurrent_gc_locked(&self, guard: &mut MutexGuard<'_, HeapState>) {
        while guard.running {
            match current_thread() {
                Some(thread) => {
                    let old = self.threads.change_status(&thread, ThreadStatus::VmWait);
                    self.gc_done.wait(guard);
                    self.threads.change_status(&thread, old);
                }
                None => self.gc_done.wait(guard),
            }
        }
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocate storage on the GC heap: zero-filled, 8-byte aligned.
    /// Returns `None` with an OOM exception set on the current thread when
    /// the full recovery ladder fails.
    pub fn alloc(&self, size: usize, flags: u32) -> Option<ObjectPtr> {
        let guard = self.lock_state();
        let (mut guard, ptr) = self.try_alloc(guard, size);

        match ptr {
            Some(obj) => {
                if flags & alloc_flags::FINALIZABLE != 0
                    && !guard.finalizable_refs.push(obj)
                {
                    error!(
                        target: "marten::gc",
                        "no room for any more finalizable objects; aborting"
                    );
                    std::process::abort();
                }
                self.bump_alloc_profile(size, true);
            }
            None => self.bump_alloc_profile(size, false),
        }
        drop(guard);

        match ptr {
            Some(obj) => {
                // Tracking happens outside the heap lock: the tracking table
                // itself allocates and could deadlock otherwise.
                if flags & alloc_flags::DONT_TRACK == 0 {
                    if let Some(thread) = current_thread() {
                        thread.add_tracked(obj);
                    }
                }
                Some(obj)
            }
            None => {
                self.throw_oome();
                None
            }
        }
    }

    /// The five-step recovery ladder bridging mutators to the collector.
    fn try_alloc<'a>(
        &'a self,
        mut guard: MutexGuard<'a, HeapState>,
        size: usize,
    ) -> (MutexGuard<'a, HeapState>, Option<ObjectPtr>) {
        // A request at or past the growth limit can only be satisfied by
        // growing past it, and soft references must be collected before
        // reporting OOM, so skip straight to the clearing collection and
        // its growing retry.
        if size >= self.config.growth_limit {
            warn!(
                target: "marten::gc",
                size,
                "someone's allocating a huge buffer"
            );
            return self.alloc_after_clearing_soft_refs(guard, size);
        }

        if let Some(obj) = self.source.alloc(size) {
            return (guard, Some(obj));
        }

        // The collector is concurrently tracing the heap: wait for it to
        // complete and retry before forcing a foreground cycle.
        if guard.running {
            self.wait_for_concurrent_gc_locked(&mut guard);
            if let Some(obj) = self.source.alloc(size) {
                return (guard, Some(obj));
            }
        }

        guard = self.gc_for_malloc(guard, false);
        if let Some(obj) = self.source.alloc(size) {
            return (guard, Some(obj));
        }

        if let Some(obj) = self.source.alloc_and_grow(size) {
            let footprint = self.source.get_value(HeapValue::Footprint);
            info!(
                target: "marten::gc",
                "Grow heap (frag case) to {}.{:03}MB for {}-byte allocation",
                footprint / (1024 * 1024),
                (footprint % (1024 * 1024)) * 1000 / (1024 * 1024),
                size
            );
            return (guard, Some(obj));
        }

        self.alloc_after_clearing_soft_refs(guard, size)
    }

    /// Last rung: collect with soft references cleared, then try one final
    /// growing allocation. `None` here commits the caller to OOM.
    fn alloc_after_clearing_soft_refs<'a>(
        &'a self,
        guard: MutexGuard<'a, HeapState>,
        size: usize,
    ) -> (MutexGuard<'a, HeapState>, Option<ObjectPtr>) {
        info!(
            target: "marten::gc",
            size,
            "forcing collection of soft references"
        );
        let guard = self.gc_for_malloc(guard, true);
        if let Some(obj) = self.source.alloc_and_grow(size) {
            return (guard, Some(obj));
        }
        error!(target: "marten::gc", size, "out of memory on allocation");
        (guard, None)
    }

    fn gc_for_malloc<'a>(
        &'a self,
        guard: MutexGuard<'a, HeapState>,
        clear_soft_refs: bool,
    ) -> MutexGuard<'a, HeapState> {
        if self.config.alloc_prof_enabled {
            self.alloc_prof.gc_count.fetch_add(1, Ordering::Relaxed);
            if let Some(thread) = current_thread() {
                thread.alloc_prof.gc_count.fetch_add(1, Ordering::Relaxed);
            }
        }
        debug!(
            target: "marten::gc",
            clear_soft_refs,
            "allocation initiating GC"
        );
        self.collect_locked(guard, clear_soft_refs, crate::driver::GcReason::ForMalloc)
    }

    fn bump_alloc_profile(&self, size: usize, success: bool) {
        if !self.config.alloc_prof_enabled {
            return;
        }
        let thread = current_thread();
        if success {
            self.alloc_prof.alloc_count.fetch_add(1, Ordering::Relaxed);
            self.alloc_prof
                .alloc_size
                .fetch_add(size as u64, Ordering::Relaxed);
            if let Some(thread) = thread {
                thread.alloc_prof.alloc_count.fetch_add(1, Ordering::Relaxed);
                thread
                    .alloc_prof
                    .alloc_size
                    .fetch_add(size as u64, Ordering::Relaxed);
            }
        } else {
            self.alloc_prof
                .failed_alloc_count
                .fetch_add(1, Ordering::Relaxed);
            self.alloc_prof
                .failed_alloc_size
                .fetch_add(size as u64, Ordering::Relaxed);
            if let Some(thread) = thread {
                thread
                    .alloc_prof
                    .failed_alloc_count
                    .fetch_add(1, Ordering::Relaxed);
                thread
                    .alloc_prof
                    .failed_alloc_size
                    .fetch_add(size as u64, Ordering::Relaxed);
            }
        }
    }

    // ------------------------------------------------------------------
    // OOM escalation
    // ------------------------------------------------------------------

    /// Throw a managed OOM at the current thread. Must be called without
    /// the heap lock: throwing on the ordinary path may allocate.
    ///
    /// Threads that are mid-attachment (not yet on the thread list) or
    /// already throwing receive the pre-built, stack-traceless instance,
    /// which cannot allocate.
    fn throw_oome(&self) {
        let Some(thread) = current_thread() else {
            return;
        };
        if thread.is_on_thread_list() && !thread.throwing_oome.load(Ordering::Acquire) {
            thread.throwing_oome.store(true, Ordering::Release);
            thread.set_exception(VmException::out_of_memory());
        } else {
            thread.set_exception(VmException::prebuilt_out_of_memory());
        }
        thread.throwing_oome.store(false, Ordering::Release);
    }

    /// Throw OOM for a request that can never be satisfied (e.g. an array
    /// size computation that overflowed), without attempting collection.
    pub fn throw_bad_alloc(&self, message: &str) {
        if let Some(thread) = current_thread() {
            thread.set_exception(VmException::bad_alloc(message));
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Whether `ptr` points to a valid allocated object. Lock-free; no
    /// false negatives for fully-published pointers. Always false after
    /// shutdown.
    pub fn is_valid_object(&self, ptr: *const u8) -> bool {
        if self.shut_down.load(Ordering::Acquire) {
            return false;
        }
        match ObjectPtr::from_raw(ptr as *mut u8) {
            Some(obj) => self.source.contains(obj),
            None => false,
        }
    }

    /// Exact usable size of the chunk behind `obj`; 0 if not a live object.
    pub fn object_size(&self, obj: ObjectPtr) -> usize {
        if self.shut_down.load(Ordering::Acquire) {
            return 0;
        }
        self.source.chunk_size(obj)
    }

    /// Mutator write barrier: dirty the card containing `obj` after a
    /// reference store so a concurrent trace re-scans it.
    pub fn write_barrier(&self, obj: ObjectPtr) {
        self.cards.mark_card(obj.addr());
    }

    /// The card table (interpreter fast paths embed its base directly).
    pub fn card_table(&self) -> &CardTable {
        &self.cards
    }

    // ------------------------------------------------------------------
    // Worker hand-off
    // ------------------------------------------------------------------

    /// Pop the next object for the worker thread, reference enqueues first.
    /// The object joins the caller's tracked set so it cannot be collected
    /// while the worker holds it; release it when done.
    pub fn next_worker_object(&self) -> Option<(ObjectPtr, WorkerOp)> {
        let mut queues = self.worker_queues.lock();
        let next = queues.next();
        if let Some((obj, _)) = next {
            if let Some(thread) = current_thread() {
                thread.add_tracked(obj);
            }
        }
        next
    }

    /// Number of objects queued for finalization (diagnostics).
    pub fn pending_finalization_count(&self) -> usize {
        self.worker_queues.lock().pending_finalization_refs.len()
    }

    /// Number of live finalizable objects registered (diagnostics).
    pub fn finalizable_count(&self) -> usize {
        self.state.lock().finalizable_refs.len()
    }
}
