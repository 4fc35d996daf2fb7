//! Batched safepoint work
//!
//! Some runtime maintenance (compiled-code chaining-cell patches and the
//! like) is cheap to apply but expensive to synchronize for. Such work is
//! deferred here and drained by the GC driver during a window where every
//! thread is already quiescent.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::debug;

type SafepointWork = Box<dyn FnOnce() + Send>;

/// Queue of deferred work applied at the next all-threads-quiescent window.
#[derive(Default)]
pub struct SafepointQueue {
    pending: Mutex<VecDeque<SafepointWork>>,
}

impl SafepointQueue {
    /// Defer `work` until the next stop-the-world window.
    pub fn defer(&self, work: impl FnOnce() + Send + 'static) {
        self.pending.lock().push_back(Box::new(work));
    }

    /// Number of deferred items.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Run every deferred item. Caller must guarantee all mutators are
    /// suspended. Returns the number of items applied.
    pub(crate) fn run_pending(&self) -> usize {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock();
            pending.drain(..).collect()
        };
        let count = drained.len();
        for work in drained {
            work();
        }
        if count > 0 {
            debug!(target: "marten::gc", count, "applied deferred safepoint work");
        }
        count
    }
}
