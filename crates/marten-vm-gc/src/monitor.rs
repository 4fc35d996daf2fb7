//! Monitoring sinks
//!
//! Debugger/profiler integration: when a `when` knob is non-zero the driver
//! pushes a heap snapshot to the configured sink after every collection.

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::debug;

/// Point-in-time heap statistics delivered to monitoring sinks.
#[derive(Debug, Clone, Copy)]
pub struct HeapSnapshot {
    /// Bytes currently allocated.
    pub bytes_allocated: usize,
    /// Current soft footprint.
    pub footprint: usize,
    /// Objects reclaimed by the reporting cycle.
    pub objects_freed: usize,
    /// Bytes reclaimed by the reporting cycle.
    pub bytes_freed: usize,
}

/// Receiver for heap monitoring events.
pub trait HeapMonitor: Send + Sync {
    /// A collection is about to begin.
    fn gc_begin(&self) {}
    /// A collection has completed.
    fn gc_end(&self) {}
    /// Deliver a heap-info snapshot.
    fn heap_info(&self, snapshot: &HeapSnapshot);
    /// Deliver heap-segment details; `native` selects the native heap.
    fn heap_segments(&self, native: bool);
}

/// Default sink: forwards everything to `tracing` at debug level.
pub struct LogMonitor;

impl HeapMonitor for LogMonitor {
    fn heap_info(&self, snapshot: &HeapSnapshot) {
        debug!(
            target: "marten::gc",
            allocated = snapshot.bytes_allocated,
            footprint = snapshot.footprint,
            freed = snapshot.bytes_freed,
            "heap info snapshot"
        );
    }

    fn heap_segments(&self, native: bool) {
        debug!(target: "marten::gc", native, "heap segment dump");
    }
}

/// When/what knobs controlling which snapshots are emitted after GC.
/// Zero means disabled; the values themselves are sink-defined.
#[derive(Default)]
pub struct MonitorConfig {
    /// Emit heap-info snapshots when non-zero.
    pub hpif_when: AtomicU32,
    /// Emit managed heap-segment dumps when non-zero.
    pub hpsg_when: AtomicU32,
    /// Segment-dump detail selector.
    pub hpsg_what: AtomicU32,
    /// Emit native heap-segment dumps when non-zero.
    pub nhsg_when: AtomicU32,
    /// Native segment-dump detail selector.
    pub nhsg_what: AtomicU32,
}

impl MonitorConfig {
    pub(crate) fn emit_post_gc(&self, monitor: &dyn HeapMonitor, snapshot: &HeapSnapshot) {
        if self.hpif_when.load(Ordering::Acquire) != 0 {
            monitor.heap_info(snapshot);
        }
        if self.hpsg_when.load(Ordering::Acquire) != 0 {
            monitor.heap_segments(false);
        }
        if self.nhsg_when.load(Ordering::Acquire) != 0 {
            monitor.heap_segments(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingMonitor {
        events: Mutex<Vec<&'static str>>,
    }

    impl HeapMonitor for RecordingMonitor {
        fn heap_info(&self, _snapshot: &HeapSnapshot) {
            self.events.lock().push("hpif");
        }
        fn heap_segments(&self, native: bool) {
            self.events.lock().push(if native { "nhsg" } else { "hpsg" });
        }
    }

    #[test]
    fn test_disabled_by_default() {
        let config = MonitorConfig::default();
        let monitor = RecordingMonitor::default();
        config.emit_post_gc(&monitor, &snapshot());
        assert!(monitor.events.lock().is_empty());
    }

    #[test]
    fn test_enabled_knobs_emit() {
        let config = MonitorConfig::default();
        config.hpif_when.store(1, Ordering::Release);
        config.nhsg_when.store(1, Ordering::Release);
        let monitor = RecordingMonitor::default();
        config.emit_post_gc(&monitor, &snapshot());
        assert_eq!(*monitor.events.lock(), vec!["hpif", "nhsg"]);
    }

    fn snapshot() -> HeapSnapshot {
        HeapSnapshot {
            bytes_allocated: 0,
            footprint: 0,
            objects_freed: 0,
            bytes_freed: 0,
        }
    }
}
