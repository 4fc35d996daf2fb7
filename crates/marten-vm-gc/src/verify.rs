//! Heap verification
//!
//! Optional paranoia for debug builds of the runtime: walk the roots and the
//! live bitmap and abort on the first structural violation, before (or
//! after) a collection gets the chance to act on corrupt state.

use std::sync::Arc;

use tracing::{debug, error};

use crate::card::CardTable;
use crate::marker::{ObjectModel, RootProvider};
use crate::object::ObjectPtr;
use crate::source::HeapSource;
use crate::threads::ThreadRegistry;
use crate::worker::WorkerQueues;

fn verify_object(source: &HeapSource, obj: ObjectPtr, what: &str) {
    if !source.contains(obj) {
        error!(
            target: "marten::gc",
            addr = obj.addr(),
            what,
            "heap verification failed; aborting"
        );
        std::process::abort();
    }
}

/// Verify that every root and every reference field of every live object
/// points at a known live chunk. Aborts on violation.
pub(crate) fn verify_roots_and_heap(
    source: &HeapSource,
    model: &dyn ObjectModel,
    providers: &[Arc<dyn RootProvider>],
    threads: &ThreadRegistry,
    queues: &WorkerQueues,
) {
    debug!(target: "marten::gc", "verifying roots and heap");
    for provider in providers {
        provider.visit_roots(&mut |obj| verify_object(source, obj, "root"));
    }
    threads.visit_all_tracked(&mut |obj| verify_object(source, obj, "tracked root"));
    queues
        .pending_finalization_refs
        .visit(&mut |obj| verify_object(source, obj, "pending finalization"));
    queues
        .reference_operations
        .visit(&mut |obj| verify_object(source, obj, "reference operation"));

    let mut live = Vec::new();
    source.live_bits().walk(|addr| live.push(addr));
    for addr in live {
        let obj = ObjectPtr::from_addr(addr);
        model.scan(obj, &mut |child| verify_object(source, child, "object field"));
    }
}

/// Verify the concurrent-mark contract at the dirty re-suspend: any marked
/// object still referencing an unmarked one must sit on a dirty card, or
/// the re-scan would miss it. Aborts on violation.
pub(crate) fn verify_card_table(source: &HeapSource, model: &dyn ObjectModel, cards: &CardTable) {
    debug!(target: "marten::gc", "verifying card table");
    let mut marked = Vec::new();
    source.mark_bits().walk(|addr| marked.push(addr));
    for addr in marked {
        let obj = ObjectPtr::from_addr(addr);
        let mut holds_unmarked = false;
        model.scan(obj, &mut |child| {
            if source.contains(child) && !source.mark_bits().test(child.addr()) {
                holds_unmarked = true;
            }
        });
        if holds_unmarked && !cards.is_dirty(addr) {
            error!(
                target: "marten::gc",
                addr,
                "marked object with unmarked field is on a clean card; aborting"
            );
            std::process::abort();
        }
    }
}
