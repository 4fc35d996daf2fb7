//! Mark-sweep engine
//!
//! Marks the transitive closure of the root set into the mark bitmap,
//! discovers reference objects along the way, and sweeps whatever the cycle
//! left unmarked. The embedder describes its object graph through
//! [`ObjectModel`] and contributes roots through [`RootProvider`]; tracked
//! allocations and the worker queues are always roots.
//!
//! Reference objects get special treatment: the referent field is skipped
//! during the scan and the reference is parked on a per-cycle discovered
//! list, so reachability through a soft/weak/phantom reference never keeps
//! a referent alive by itself.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, error};

use crate::card::CardTable;
use crate::object::ObjectPtr;
use crate::source::HeapSource;
use crate::threads::ThreadRegistry;
use crate::worker::{ReferenceTable, WorkerQueues};

/// Initial gray-stack reservation; growth past this is demand-driven.
const MARK_STACK_RESERVE: usize = 4096;

/// How much of the heap a cycle scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcMode {
    /// Scan the post-fork allocation area only; immune-region objects act
    /// as roots and are never swept.
    Partial,
    /// Scan and sweep the whole heap.
    Full,
}

/// Reclamation ordering class of a reference object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    /// Cleared only under memory pressure.
    Soft,
    /// Cleared whenever the referent becomes unreachable.
    Weak,
    /// Never cleared by the collector; enqueued for post-mortem notice.
    Phantom,
}

/// Supplies runtime roots (stacks, globals, interned handles) at GC time.
pub trait RootProvider: Send + Sync {
    /// Call `visit` for every root pointer.
    fn visit_roots(&self, visit: &mut dyn FnMut(ObjectPtr));
}

/// Describes the embedder's object graph to the collector.
pub trait ObjectModel: Send + Sync {
    /// Call `visit` for every reference field of `obj`, the referent field
    /// of reference objects included.
    fn scan(&self, obj: ObjectPtr, visit: &mut dyn FnMut(ObjectPtr));

    /// If `obj` is a reference object, its kind.
    fn reference_kind(&self, _obj: ObjectPtr) -> Option<ReferenceKind> {
        None
    }

    /// The referent of a reference object, if still set.
    fn referent(&self, _obj: ObjectPtr) -> Option<ObjectPtr> {
        None
    }

    /// Clear the referent field of a reference object.
    fn clear_referent(&self, _obj: ObjectPtr) {}

    /// Drop dead entries from system weak tables (intern tables and the
    /// like). `is_live` reports whether an object survived marking.
    fn sweep_system_weaks(&self, _is_live: &dyn Fn(ObjectPtr) -> bool) {}
}

/// Object model for heaps whose objects carry no reference fields.
pub struct LeafObjectModel;

impl ObjectModel for LeafObjectModel {
    fn scan(&self, _obj: ObjectPtr, _visit: &mut dyn FnMut(ObjectPtr)) {}
}

/// One collection cycle's marking state.
pub(crate) struct MarkContext<'h> {
    source: &'h HeapSource,
    model: &'h dyn ObjectModel,
    mode: GcMode,
    worklist: VecDeque<ObjectPtr>,
    soft_refs: Vec<ObjectPtr>,
    weak_refs: Vec<ObjectPtr>,
    phantom_refs: Vec<ObjectPtr>,
}

impl<'h> MarkContext<'h> {
    /// Set up the marking context: clears the mark bitmap and reserves the
    /// gray stack. Failure here leaves the heap unrecoverable; the driver
    /// aborts on it.
    pub(crate) fn begin(
        source: &'h HeapSource,
        model: &'h dyn ObjectModel,
        mode: GcMode,
    ) -> Result<Self, ()> {
        let mut worklist = VecDeque::new();
        if worklist.try_reserve(MARK_STACK_RESERVE).is_err() {
            return Err(());
        }
        source.mark_bits().clear_all();
        Ok(Self {
            source,
            model,
            mode,
            worklist,
            soft_refs: Vec::new(),
            weak_refs: Vec::new(),
            phantom_refs: Vec::new(),
        })
    }

    /// Whether `obj` has been marked this cycle.
    pub(crate) fn is_marked(&self, obj: ObjectPtr) -> bool {
        self.source.mark_bits().test(obj.addr())
    }

    /// Mark one object gray. Pointers outside the live heap are ignored so
    /// stale roots cannot corrupt the bitmap.
    pub(crate) fn mark_object(&mut self, obj: ObjectPtr) {
        if !self.source.contains(obj) {
            return;
        }
        if !self.source.mark_bits().set(obj.addr()) {
            self.worklist.push_back(obj);
        }
    }

    /// Mark the root set and reset the per-cycle discovered lists.
    pub(crate) fn mark_roots(
        &mut self,
        providers: &[Arc<dyn RootProvider>],
        threads: &ThreadRegistry,
        queues: &WorkerQueues,
    ) {
        self.soft_refs.clear();
        self.weak_refs.clear();
        self.phantom_refs.clear();

        for provider in providers {
            provider.visit_roots(&mut |obj| self.mark_object(obj));
        }
        threads.visit_all_tracked(&mut |obj| self.mark_object(obj));

        // Objects already handed to the worker must survive until it is done
        // with them.
        queues
            .pending_finalization_refs
            .visit(&mut |obj| self.mark_object(obj));
        queues
            .reference_operations
            .visit(&mut |obj| self.mark_object(obj));

        if self.mode == GcMode::Partial {
            let base = self.source.base_addr();
            let immune_limit = base + self.source.immune_end();
            let mut immune = Vec::new();
            self.source
                .live_bits()
                .walk_range(base, immune_limit, |addr| immune.push(addr));
            for addr in immune {
                self.mark_object(ObjectPtr::from_addr(addr));
            }
        }
    }

    /// Conservative root re-mark for the dirty phase of a concurrent cycle:
    /// root updates carry no write barrier, so every root may be gray again.
    pub(crate) fn re_mark_roots(
        &mut self,
        providers: &[Arc<dyn RootProvider>],
        threads: &ThreadRegistry,
        queues: &WorkerQueues,
    ) {
        for provider in providers {
            provider.visit_roots(&mut |obj| self.mark_object(obj));
        }
        threads.visit_all_tracked(&mut |obj| self.mark_object(obj));
        queues
            .pending_finalization_refs
            .visit(&mut |obj| self.mark_object(obj));
        queues
            .reference_operations
            .visit(&mut |obj| self.mark_object(obj));
    }

    fn scan_object(&mut self, obj: ObjectPtr) {
        // Reference objects: skip the referent field and park the reference
        // for processing after the trace.
        let referent = if let Some(kind) = self.model.reference_kind(obj) {
            let referent = self.model.referent(obj);
            if referent.is_some_and(|r| !self.is_marked(r)) {
                match kind {
                    ReferenceKind::Soft => self.soft_refs.push(obj),
                    ReferenceKind::Weak => self.weak_refs.push(obj),
                    ReferenceKind::Phantom => self.phantom_refs.push(obj),
                }
            }
            referent
        } else {
            None
        };

        let source = self.source;
        let worklist = &mut self.worklist;
        self.model.scan(obj, &mut |child| {
            if Some(child) == referent {
                return;
            }
            if source.contains(child) && !source.mark_bits().set(child.addr()) {
                worklist.push_back(child);
            }
        });
    }

    /// Trace: visit the transitive closure of the current gray set.
    pub(crate) fn scan_marked_objects(&mut self) {
        while let Some(obj) = self.worklist.pop_front() {
            self.scan_object(obj);
        }
    }

    /// Re-scan every marked object on a dirty card, then finish the trace.
    pub(crate) fn rescan_dirty_cards(&mut self, cards: &CardTable) {
        let mut dirty = Vec::new();
        for (start, end) in cards.dirty_cards() {
            self.source
                .mark_bits()
                .walk_range(start, end, |addr| dirty.push(addr));
        }
        debug!(target: "marten::gc", objects = dirty.len(), "re-scanning dirty cards");
        for addr in dirty {
            self.scan_object(ObjectPtr::from_addr(addr));
        }
        self.scan_marked_objects();
    }

    /// Handle soft/weak/finalizable/phantom reachability, in that order.
    /// Clears and enqueues through the worker queues; unreachable
    /// finalizable objects move from `finalizable_refs` to the pending
    /// queue and are resurrected for the finalizer's benefit.
    pub(crate) fn process_references(
        &mut self,
        clear_soft_refs: bool,
        queues: &mut WorkerQueues,
        finalizable_refs: &mut ReferenceTable,
    ) {
        // Soft references are preserved unless this cycle was asked to
        // reclaim them.
        let soft = std::mem::take(&mut self.soft_refs);
        for reference in soft {
            let Some(referent) = self.model.referent(reference) else {
                continue;
            };
            if self.is_marked(referent) {
                continue;
            }
            if clear_soft_refs {
                self.model.clear_referent(reference);
                enqueue_reference(queues, reference);
            } else {
                self.mark_object(referent);
            }
        }
        self.scan_marked_objects();

        let weak = std::mem::take(&mut self.weak_refs);
        for reference in weak {
            let Some(referent) = self.model.referent(reference) else {
                continue;
            };
            if !self.is_marked(referent) {
                self.model.clear_referent(reference);
                enqueue_reference(queues, reference);
            }
        }

        let source = self.source;
        let dead_finalizable =
            finalizable_refs.take_unreachable(|obj| source.mark_bits().test(obj.addr()));
        for obj in dead_finalizable {
            if !queues.pending_finalization_refs.push(obj) {
                error!(
                    target: "marten::gc",
                    "no room for any more pending finalizations; aborting"
                );
                std::process::abort();
            }
            self.mark_object(obj);
        }
        self.scan_marked_objects();

        // Phantoms stay set; they are only announced, and only once the
        // referent remains unreachable after finalization marking.
        let phantom = std::mem::take(&mut self.phantom_refs);
        for reference in phantom {
            let Some(referent) = self.model.referent(reference) else {
                continue;
            };
            if !self.is_marked(referent) {
                enqueue_reference(queues, reference);
            }
        }
    }

    /// Sweep unmarked chunks. Must run after the bitmap swap: the previous
    /// live set is read out of the (former live, now mark) bitmap. Returns
    /// `(objects_freed, bytes_freed)`.
    pub(crate) fn sweep_unmarked(&self) -> (usize, usize) {
        let base = self.source.base_addr();
        let from = match self.mode {
            GcMode::Full => base,
            GcMode::Partial => base + self.source.immune_end(),
        };
        let previous_live = self.source.mark_bits();
        let current_live = self.source.live_bits();

        let mut dead = Vec::new();
        previous_live.walk_range(from, self.source.limit_addr(), |addr| {
            if !current_live.test(addr) {
                dead.push(addr);
            }
        });
        let mut bytes_freed = 0;
        for &addr in &dead {
            bytes_freed += self.source.free(ObjectPtr::from_addr(addr));
        }
        (dead.len(), bytes_freed)
    }

    /// Tear down marking state: the old live bitmap becomes the next
    /// cycle's (clean) mark bitmap.
    pub(crate) fn finish(self) {
        self.source.mark_bits().clear_all();
    }
}

fn enqueue_reference(queues: &mut WorkerQueues, reference: ObjectPtr) {
    if !queues.reference_operations.push(reference) {
        error!(
            target: "marten::gc",
            "no room for any more reference operations; aborting"
        );
        std::process::abort();
    }
}
