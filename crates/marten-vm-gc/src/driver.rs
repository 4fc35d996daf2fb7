//! GC driver
//!
//! One collection cycle, start to finish: worker exclusion, root
//! suspension, marking (optionally concurrent with a dirty-card re-scan),
//! reference processing, sweeping, bitmap swap, resize policy, and the
//! stable one-line report.
//!
//! ```text
//! IDLE → STW_ROOTS → [MARK_CONC] → STW_DIRTY → REF_PROC
//!      → SWEEP_SYS_WEAKS → BITMAP_SWAP → SWEEP → FINISH → RESIZE → IDLE
//! ```

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::MutexGuard;
use tracing::{debug, error, info, warn};

use crate::heap::{GcHeap, HeapState};
use crate::marker::{GcMode, MarkContext};
use crate::monitor::HeapSnapshot;
use crate::source::HeapValue;
use crate::threads::SuspendReason;
use crate::verify;

/// Why a collection cycle was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcReason {
    /// A mutator allocation failed; partial, synchronous cycle.
    ForMalloc,
    /// Background trigger; mutators run during the trace.
    Concurrent,
    /// Explicit request from the runtime; full, synchronous cycle.
    Explicit,
}

impl GcReason {
    /// Stable reason string used in the GC report line.
    pub fn as_str(self) -> &'static str {
        match self {
            GcReason::ForMalloc => "GC_FOR_MALLOC",
            GcReason::Concurrent => "GC_CONCURRENT",
            GcReason::Explicit => "GC_EXPLICIT",
        }
    }
}

/// Pause accounting for one cycle. Concurrent cycles pause twice (root
/// suspension and the dirty re-scan); everything else pauses once for the
/// whole mark and sweep.
#[derive(Debug, Clone, Copy)]
pub enum GcPause {
    /// Synchronous cycle: mutators stopped for the full mark+sweep.
    Foreground {
        /// Time spent waiting for threads to reach safepoints.
        suspend_ms: u64,
        /// Stop-the-world mark+sweep duration.
        mark_sweep_ms: u64,
    },
    /// Concurrent cycle: two short pauses around a running trace.
    Concurrent {
        /// Wait for the initial root suspension.
        root_suspend_ms: u64,
        /// Root-marking pause.
        root_ms: u64,
        /// Wait for the dirty-phase suspension.
        dirty_suspend_ms: u64,
        /// Dirty re-scan pause.
        dirty_ms: u64,
    },
}

/// Result of one collection cycle; `Display` renders the stable log line.
#[derive(Debug, Clone)]
pub struct GcSummary {
    /// What started the cycle.
    pub reason: GcReason,
    /// Chunks reclaimed.
    pub objects_freed: usize,
    /// Bytes reclaimed.
    pub bytes_freed: usize,
    /// Free share of the footprint after the cycle, in percent.
    pub percent_free: usize,
    /// Bytes allocated after the cycle.
    pub bytes_allocated: usize,
    /// Soft footprint after the cycle.
    pub footprint: usize,
    /// Pause interval(s).
    pub pause: GcPause,
}

impl fmt::Display for GcSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let freed_kib = if self.bytes_freed == 0 {
            0
        } else {
            (self.bytes_freed / 1024).max(1)
        };
        let small = if self.bytes_freed > 0 && self.bytes_freed < 1024 {
            "<"
        } else {
            ""
        };
        write!(
            f,
            "{} freed {}{}K, {}% free {}K/{}K, ",
            self.reason.as_str(),
            small,
            freed_kib,
            self.percent_free,
            self.bytes_allocated / 1024,
            self.footprint / 1024,
        )?;
        match self.pause {
            GcPause::Foreground { mark_sweep_ms, .. } => write!(f, "paused {mark_sweep_ms}ms"),
            GcPause::Concurrent {
                root_ms, dirty_ms, ..
            } => write!(f, "paused {root_ms}ms+{dirty_ms}ms"),
        }
    }
}

/// Scoped priority elevation for synchronous cycles: a collector starved by
/// its own nice level stalls every other thread behind the heap lock. The
/// saved priority is restored on drop, on every exit path.
struct PriorityBoost {
    #[cfg(unix)]
    saved_nice: i32,
}

/// Nice value considered "normal"; anything numerically greater runs at
/// lower priority.
#[cfg(unix)]
const NICE_NORMAL: i32 = 0;
/// Nice value of the background scheduling class.
#[cfg(unix)]
const NICE_BACKGROUND: i32 = 10;

impl PriorityBoost {
    #[cfg(unix)]
    fn engage() -> Option<Self> {
        // SAFETY: plain syscalls on the calling thread.
        let nice = unsafe { libc::getpriority(libc::PRIO_PROCESS, 0) };
        if nice <= NICE_NORMAL {
            return None;
        }
        if nice >= NICE_BACKGROUND {
            // A background-class collector also needs the foreground
            // scheduling group for the duration of the pause.
            debug!(target: "marten::gc", "moving collector to foreground scheduling group");
        }
        // SAFETY: as above.
        if unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, NICE_NORMAL) } != 0 {
            info!(
                target: "marten::gc",
                from = nice,
                to = NICE_NORMAL,
                "unable to elevate collector priority"
            );
            return None;
        }
        debug!(target: "marten::gc", from = nice, "elevated collector priority");
        Some(Self { saved_nice: nice })
    }

    #[cfg(not(unix))]
    fn engage() -> Option<Self> {
        None
    }
}

impl Drop for PriorityBoost {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            // SAFETY: plain syscall on the calling thread.
            if unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, self.saved_nice) } != 0 {
                warn!(
                    target: "marten::gc",
                    to = self.saved_nice,
                    "unable to restore collector priority"
                );
            } else if self.saved_nice >= NICE_BACKGROUND {
                debug!(target: "marten::gc", "returned collector to background scheduling group");
            }
        }
    }
}

impl GcHeap {
    /// Run an explicit collection cycle. Blocks while another cycle is in
    /// flight only for the duration of lock acquisition; a request arriving
    /// mid-cycle on the same driver is ignored as recursive.
    pub fn collect_garbage(&self, clear_soft_refs: bool, reason: GcReason) {
        let guard = self.lock_state();
        let guard = self.collect_locked(guard, clear_soft_refs, reason);
        drop(guard);
    }

    /// One collection cycle. Entry contract: heap lock held (the guard).
    /// For concurrent cycles the guard is released during the trace and the
    /// concurrent sweep and reacquired afterwards; the returned guard is
    /// always held.
    pub(crate) fn collect_locked<'a>(
        &'a self,
        mut guard: MutexGuard<'a, HeapState>,
        clear_soft_refs: bool,
        reason: GcReason,
    ) -> MutexGuard<'a, HeapState> {
        if guard.running {
            warn!(target: "marten::gc", "attempted recursive GC");
            return guard;
        }
        let gc_mode = if reason == GcReason::ForMalloc {
            GcMode::Partial
        } else {
            GcMode::Full
        };
        guard.running = true;
        let mut guard = Some(guard);

        // Exclude the worker for the whole cycle. It never holds its lock
        // while parked between operations, so this returns quickly.
        let worker_guard = self.worker_lock.lock();

        let root_suspend_start = Instant::now();
        self.threads.suspend_all(SuspendReason::ForGc);
        let root_start = Instant::now();
        let root_suspend_time = root_start - root_suspend_start;

        let mut priority_boost = if reason != GcReason::Concurrent {
            PriorityBoost::engage()
        } else {
            None
        };

        // A worker wedged in interpreted code would deadlock the exclusion
        // above on the next cycle; better to find out now.
        self.worker_state.assert_running();

        // Freeze the hand-off queues while the marker inspects them. Taken
        // after suspension so the worker cannot sit Running while we wait.
        let mut worker_queues = self.worker_queues.lock();

        let providers = self.roots.read().clone();
        let monitor = self.monitor.read().clone();

        if self.config.pre_verify {
            debug!(target: "marten::gc", "verifying roots and heap before GC");
            verify::verify_roots_and_heap(
                &self.source,
                self.model.as_ref(),
                &providers,
                &self.threads,
                &worker_queues,
            );
        }

        monitor.gc_begin();

        let Ok(mut ctx) = MarkContext::begin(&self.source, self.model.as_ref(), gc_mode) else {
            error!(target: "marten::gc", "failed to set up the mark step; aborting");
            std::process::abort();
        };

        debug!(target: "marten::gc", "marking...");
        ctx.mark_roots(&providers, &self.threads, &worker_queues);

        let mut root_end = root_start;
        if reason == GcReason::Concurrent {
            // Trace with the world running: new objects are born marked and
            // the write barrier dirties cards behind us.
            root_end = Instant::now();
            self.cards.clear();
            self.source.set_mark_new_allocations(true);
            drop(guard.take());
            self.threads.resume_all(SuspendReason::ForGc);
        }

        debug!(target: "marten::gc", "recursing...");
        ctx.scan_marked_objects();

        let mut dirty_suspend_time = Duration::ZERO;
        let mut dirty_start = root_start;
        if reason == GcReason::Concurrent {
            guard = Some(self.lock_state());
            let dirty_suspend_start = Instant::now();
            self.threads.suspend_all(SuspendReason::ForGc);
            dirty_start = Instant::now();
            dirty_suspend_time = dirty_start - dirty_suspend_start;
            // No barrier intercepts root updates; conservatively assume all
            // roots may be gray and re-mark them.
            ctx.re_mark_roots(&providers, &self.threads, &worker_queues);
            if self.config.verify_card_table {
                verify::verify_card_table(&self.source, self.model.as_ref(), &self.cards);
            }
            ctx.rescan_dirty_cards(&self.cards);
        }

        // Everything strongly reachable is marked; decide the fate of the
        // soft/weak/phantom discoveries and unreachable finalizables.
        ctx.process_references(
            clear_soft_refs,
            &mut worker_queues,
            &mut guard.as_mut().unwrap().finalizable_refs,
        );

        // Deferred compiled-code patches apply cheaply while every thread
        // is known quiescent.
        self.safepoints.run_pending();

        debug!(target: "marten::gc", "sweeping...");
        self.model.sweep_system_weaks(&|obj| ctx.is_marked(obj));

        // Publish the mark bitmap as the new live set; the sweep reads the
        // old one, so it can proceed with mutators running.
        self.source.swap_bitmaps();
        self.source.set_mark_new_allocations(false);

        if self.config.post_verify {
            debug!(target: "marten::gc", "verifying roots and heap after GC");
            verify::verify_roots_and_heap(
                &self.source,
                self.model.as_ref(),
                &providers,
                &self.threads,
                &worker_queues,
            );
        }

        let mut dirty_end = root_start;
        if reason == GcReason::Concurrent {
            dirty_end = Instant::now();
            drop(guard.take());
            self.threads.resume_all(SuspendReason::ForGc);
        }
        let (objects_freed, bytes_freed) = ctx.sweep_unmarked();
        debug!(target: "marten::gc", "cleaning up...");
        ctx.finish();
        if reason == GcReason::Concurrent {
            guard = Some(self.lock_state());
        }
        debug!(target: "marten::gc", "done.");

        // Good moment to resize: utilization is exact. No pages move.
        self.source.grow_for_utilization();
        let bytes_allocated = self.source.get_value(HeapValue::BytesAllocated);
        let footprint = self.source.get_value(HeapValue::Footprint);

        // Return free pages to the OS, but not immediately: a process that
        // re-allocates right away would just fault them back in.
        self.source.schedule_trim(Duration::from_secs(5));

        monitor.gc_end();
        guard.as_mut().unwrap().running = false;

        drop(worker_queues);
        drop(worker_guard);

        if reason == GcReason::Concurrent {
            // Wake mutators that blocked after a failed allocation.
            self.gc_done.notify_all();
        } else {
            dirty_end = Instant::now();
            self.threads.resume_all(SuspendReason::ForGc);
            drop(priority_boost.take());
        }

        let percent_free =
            100 - (100.0 * bytes_allocated as f64 / footprint as f64) as usize;
        let pause = if reason == GcReason::Concurrent {
            GcPause::Concurrent {
                root_suspend_ms: root_suspend_time.as_millis() as u64,
                root_ms: (root_end - root_start).as_millis() as u64,
                dirty_suspend_ms: dirty_suspend_time.as_millis() as u64,
                dirty_ms: (dirty_end - dirty_start).as_millis() as u64,
            }
        } else {
            GcPause::Foreground {
                suspend_ms: root_suspend_time.as_millis() as u64,
                mark_sweep_ms: (dirty_end - root_start).as_millis() as u64,
            }
        };
        let summary = GcSummary {
            reason,
            objects_freed,
            bytes_freed,
            percent_free,
            bytes_allocated,
            footprint,
            pause,
        };
        info!(target: "marten::gc", "{summary}");
        *self.last_gc_summary.lock() = Some(summary);

        let snapshot = HeapSnapshot {
            bytes_allocated,
            footprint,
            objects_freed,
            bytes_freed,
        };
        self.monitor_config.emit_post_gc(monitor.as_ref(), &snapshot);

        guard.unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_strings() {
        assert_eq!(GcReason::ForMalloc.as_str(), "GC_FOR_MALLOC");
        assert_eq!(GcReason::Concurrent.as_str(), "GC_CONCURRENT");
        assert_eq!(GcReason::Explicit.as_str(), "GC_EXPLICIT");
    }

    #[test]
    fn test_summary_format_foreground() {
        let summary = GcSummary {
            reason: GcReason::ForMalloc,
            objects_freed: 12,
            bytes_freed: 53 * 1024,
            percent_free: 37,
            bytes_allocated: 640 * 1024,
            footprint: 1024 * 1024,
            pause: GcPause::Foreground {
                suspend_ms: 1,
                mark_sweep_ms: 12,
            },
        };
        assert_eq!(
            summary.to_string(),
            "GC_FOR_MALLOC freed 53K, 37% free 640K/1024K, paused 12ms"
        );
    }

    #[test]
    fn test_summary_format_concurrent() {
        let summary = GcSummary {
            reason: GcReason::Concurrent,
            objects_freed: 1,
            bytes_freed: 512,
            percent_free: 50,
            bytes_allocated: 512 * 1024,
            footprint: 1024 * 1024,
            pause: GcPause::Concurrent {
                root_suspend_ms: 0,
                root_ms: 2,
                dirty_suspend_ms: 0,
                dirty_ms: 3,
            },
        };
        assert_eq!(
            summary.to_string(),
            "GC_CONCURRENT freed <1K, 50% free 512K/1024K, paused 2ms+3ms"
        );
    }

    #[test]
    fn test_summary_zero_freed_is_not_small() {
        let summary = GcSummary {
            reason: GcReason::Explicit,
            objects_freed: 0,
            bytes_freed: 0,
            percent_free: 99,
            bytes_allocated: 1024,
            footprint: 2 * 1024 * 1024,
            pause: GcPause::Foreground {
                suspend_ms: 0,
                mark_sweep_ms: 0,
            },
        };
        assert_eq!(
            summary.to_string(),
            "GC_EXPLICIT freed 0K, 99% free 1K/2048K, paused 0ms"
        );
    }
}
