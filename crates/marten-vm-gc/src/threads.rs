//! Thread registry
//!
//! Mutator threads register here so the collector can stop the world.
//! Suspension is cooperative: a thread is *safe* whenever its status is not
//! `Running` — either parked at a safepoint, blocked on the heap lock in
//! `VmWait`, or executing native code. [`ThreadRegistry::change_status`] is
//! the single suspension point; restoring `Running` while a suspend request
//! is pending blocks until the collector resumes the world.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashSet;
use tracing::warn;

use crate::error::VmException;
use crate::object::ObjectPtr;

/// How long suspend-all waits for a straggler before proceeding anyway.
const SUSPEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Cooperative scheduling status of a mutator thread.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Executing managed code; must reach a safepoint to become safe.
    Running = 0,
    /// Blocked inside the runtime (heap lock, GC-done wait); already safe.
    VmWait = 1,
    /// Executing native code; already safe.
    Native = 2,
    /// Parked at a safepoint by a suspend request.
    Suspended = 3,
}

impl From<u8> for ThreadStatus {
    fn from(v: u8) -> Self {
        match v {
            1 => ThreadStatus::VmWait,
            2 => ThreadStatus::Native,
            3 => ThreadStatus::Suspended,
            _ => ThreadStatus::Running,
        }
    }
}

/// Why the world is being stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendReason {
    /// Stop-the-world phase of a collection.
    ForGc,
}

/// Per-thread allocation-profile counters.
#[derive(Debug, Default)]
pub struct AllocProfile {
    /// Successful allocations.
    pub alloc_count: AtomicU64,
    /// Bytes successfully allocated.
    pub alloc_size: AtomicU64,
    /// Failed allocations.
    pub failed_alloc_count: AtomicU64,
    /// Bytes requested by failed allocations.
    pub failed_alloc_size: AtomicU64,
    /// Collections initiated on behalf of allocation.
    pub gc_count: AtomicU64,
}

/// State for one registered mutator thread.
pub struct VmThread {
    id: u32,
    status: AtomicU8,
    suspend_requested: AtomicBool,
    park_lock: Mutex<()>,
    park_cond: Condvar,
    on_thread_list: AtomicBool,
    /// Guards against recursive OOM throws on this thread.
    pub(crate) throwing_oome: AtomicBool,
    exception: Mutex<Option<VmException>>,
    tracked: Mutex<FxHashSet<usize>>,
    /// Allocation counters for this thread.
    pub alloc_prof: AllocProfile,
}

impl VmThread {
    fn new(id: u32, on_thread_list: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            status: AtomicU8::new(ThreadStatus::Running as u8),
            suspend_requested: AtomicBool::new(false),
            park_lock: Mutex::new(()),
            park_cond: Condvar::new(),
            on_thread_list: AtomicBool::new(on_thread_list),
            throwing_oome: AtomicBool::new(false),
            exception: Mutex::new(None),
            tracked: Mutex::new(FxHashSet::default()),
            alloc_prof: AllocProfile::default(),
        })
    }

    /// Registry-assigned thread id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Current scheduling status.
    pub fn status(&self) -> ThreadStatus {
        self.status.load(Ordering::Acquire).into()
    }

    /// Whether this thread has completed attachment to the thread list.
    pub fn is_on_thread_list(&self) -> bool {
        self.on_thread_list.load(Ordering::Acquire)
    }

    /// Deliver an exception to this thread.
    pub fn set_exception(&self, exception: VmException) {
        *self.exception.lock() = Some(exception);
    }

    /// Take and clear the pending exception, if any.
    pub fn take_exception(&self) -> Option<VmException> {
        self.exception.lock().take()
    }

    /// Whether an exception is pending.
    pub fn has_exception(&self) -> bool {
        self.exception.lock().is_some()
    }

    /// Add an object to this thread's tracked-allocation set, pinning it
    /// until released.
    pub fn add_tracked(&self, obj: ObjectPtr) {
        self.tracked.lock().insert(obj.addr());
    }

    /// Release a previously tracked object.
    pub fn release_tracked(&self, obj: ObjectPtr) {
        self.tracked.lock().remove(&obj.addr());
    }

    /// Visit every tracked allocation.
    pub fn visit_tracked(&self, visit: &mut dyn FnMut(ObjectPtr)) {
        for &addr in self.tracked.lock().iter() {
            visit(ObjectPtr::from_addr(addr));
        }
    }

    /// Park until the pending suspend request clears.
    fn park_while_suspended(&self) {
        let mut guard = self.park_lock.lock();
        while self.suspend_requested.load(Ordering::Acquire) {
            self.park_cond.wait(&mut guard);
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<VmThread>>> = const { RefCell::new(None) };
}

/// The calling OS thread's registered handle, if attached.
pub fn current_thread() -> Option<Arc<VmThread>> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Registry of mutator threads participating in the suspend protocol.
pub struct ThreadRegistry {
    threads: Mutex<Vec<Arc<VmThread>>>,
    next_id: AtomicU32,
    suspend_all_calls: AtomicU64,
}

impl ThreadRegistry {
    pub(crate) fn new() -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(1),
            suspend_all_calls: AtomicU64::new(0),
        }
    }

    /// Attach the calling OS thread: register it on the thread list and
    /// install it as the thread-local current thread.
    pub fn attach(&self) -> Arc<VmThread> {
        let thread = VmThread::new(self.next_id.fetch_add(1, Ordering::Relaxed), true);
        self.threads.lock().push(thread.clone());
        CURRENT.with(|current| *current.borrow_mut() = Some(thread.clone()));
        thread
    }

    /// Create a handle for a thread mid-attachment: current for this OS
    /// thread but not yet on the thread list, so it has no usable
    /// tracked-allocation table.
    pub fn attach_unlisted(&self) -> Arc<VmThread> {
        let thread = VmThread::new(self.next_id.fetch_add(1, Ordering::Relaxed), false);
        CURRENT.with(|current| *current.borrow_mut() = Some(thread.clone()));
        thread
    }

    /// Promote an unlisted thread onto the thread list once attachment
    /// completes.
    pub fn complete_attach(&self, thread: &Arc<VmThread>) {
        if !thread.on_thread_list.swap(true, Ordering::AcqRel) {
            self.threads.lock().push(thread.clone());
        }
    }

    /// Detach the calling OS thread.
    pub fn detach(&self) {
        let current = CURRENT.with(|current| current.borrow_mut().take());
        if let Some(thread) = current {
            self.threads.lock().retain(|t| t.id != thread.id);
        }
    }

    /// Number of suspend-all invocations so far (cycle accounting).
    pub fn suspend_all_count(&self) -> u64 {
        self.suspend_all_calls.load(Ordering::Acquire)
    }

    /// Suspend every registered thread except the caller. Returns once all
    /// of them are safe (not `Running`), or after a bounded wait with a
    /// warning for a straggler that never reaches a safepoint.
    pub fn suspend_all(&self, _reason: SuspendReason) {
        self.suspend_all_calls.fetch_add(1, Ordering::AcqRel);
        let self_id = current_thread().map(|t| t.id());
        let threads: Vec<_> = self
            .threads
            .lock()
            .iter()
            .filter(|t| Some(t.id) != self_id)
            .cloned()
            .collect();

        for thread in &threads {
            thread.suspend_requested.store(true, Ordering::Release);
        }

        let start = std::time::Instant::now();
        for thread in &threads {
            while thread.status() == ThreadStatus::Running {
                if start.elapsed() > SUSPEND_TIMEOUT {
                    warn!(
                        target: "marten::gc",
                        thread = thread.id,
                        "thread did not reach a safepoint before suspend timeout"
                    );
                    break;
                }
                std::thread::yield_now();
            }
        }
    }

    /// Resume every suspended thread.
    pub fn resume_all(&self, _reason: SuspendReason) {
        let threads: Vec<_> = self.threads.lock().clone();
        for thread in threads {
            thread.suspend_requested.store(false, Ordering::Release);
            let _guard = thread.park_lock.lock();
            thread.park_cond.notify_all();
        }
    }

    /// Change a thread's status, returning the previous one. This is the
    /// single suspension point: re-entering `Running` honors any pending
    /// suspend request before returning.
    pub fn change_status(&self, thread: &VmThread, new: ThreadStatus) -> ThreadStatus {
        let old = thread.status.swap(new as u8, Ordering::AcqRel).into();
        if new == ThreadStatus::Running && thread.suspend_requested.load(Ordering::Acquire) {
            thread
                .status
                .store(ThreadStatus::Suspended as u8, Ordering::Release);
            thread.park_while_suspended();
            thread
                .status
                .store(ThreadStatus::Running as u8, Ordering::Release);
        }
        old
    }

    /// Visit the tracked-allocation set of every registered thread.
    pub fn visit_all_tracked(&self, visit: &mut dyn FnMut(ObjectPtr)) {
        let threads: Vec<_> = self.threads.lock().clone();
        for thread in threads {
            thread.visit_tracked(visit);
        }
    }
}

/// Safepoint poll for mutator loops: parks if a suspend is pending.
pub fn safepoint_check(thread: &VmThread) {
    if thread.suspend_requested.load(Ordering::Acquire)
        && thread.status() == ThreadStatus::Running
    {
        thread
            .status
            .store(ThreadStatus::Suspended as u8, Ordering::Release);
        thread.park_while_suspended();
        thread
            .status
            .store(ThreadStatus::Running as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_and_current() {
        let registry = ThreadRegistry::new();
        let thread = registry.attach();
        assert!(thread.is_on_thread_list());
        assert_eq!(current_thread().unwrap().id(), thread.id());
        registry.detach();
        assert!(current_thread().is_none());
    }

    #[test]
    fn test_unlisted_thread_promotion() {
        let registry = ThreadRegistry::new();
        let thread = registry.attach_unlisted();
        assert!(!thread.is_on_thread_list());
        registry.complete_attach(&thread);
        assert!(thread.is_on_thread_list());
        registry.detach();
    }

    #[test]
    fn test_tracked_allocations() {
        let registry = ThreadRegistry::new();
        let thread = registry.attach();
        let obj = ObjectPtr::from_addr(0x1000);
        thread.add_tracked(obj);

        let mut seen = Vec::new();
        registry.visit_all_tracked(&mut |o| seen.push(o));
        assert_eq!(seen, vec![obj]);

        thread.release_tracked(obj);
        seen.clear();
        registry.visit_all_tracked(&mut |o| seen.push(o));
        assert!(seen.is_empty());
        registry.detach();
    }

    #[test]
    fn test_exception_slot() {
        let registry = ThreadRegistry::new();
        let thread = registry.attach();
        assert!(!thread.has_exception());
        thread.set_exception(VmException::out_of_memory());
        assert!(thread.has_exception());
        assert_eq!(thread.take_exception(), Some(VmException::out_of_memory()));
        assert!(!thread.has_exception());
        registry.detach();
    }

    #[test]
    fn test_suspend_resume_handshake() {
        let registry = Arc::new(ThreadRegistry::new());
        let driver = registry.attach();
        assert_eq!(driver.status(), ThreadStatus::Running);

        let registry2 = registry.clone();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let mutator = std::thread::spawn(move || {
            let me = registry2.attach();
            ready_tx.send(me.clone()).unwrap();
            // Poll safepoints until the driver suspends and resumes us once.
            loop {
                safepoint_check(&me);
                if me.suspend_requested.load(Ordering::Acquire) {
                    continue;
                }
                if SUSPENDED_ONCE.load(Ordering::Acquire) {
                    break;
                }
                std::thread::yield_now();
            }
            registry2.detach();
        });

        static SUSPENDED_ONCE: AtomicBool = AtomicBool::new(false);
        let remote = ready_rx.recv().unwrap();
        registry.suspend_all(SuspendReason::ForGc);
        assert_ne!(remote.status(), ThreadStatus::Running);
        SUSPENDED_ONCE.store(true, Ordering::Release);
        registry.resume_all(SuspendReason::ForGc);
        mutator.join().unwrap();
        assert_eq!(registry.suspend_all_count(), 1);
        registry.detach();
    }

    #[test]
    fn test_vmwait_counts_as_safe() {
        let registry = ThreadRegistry::new();
        let driver = registry.attach();
        registry.change_status(&driver, ThreadStatus::VmWait);
        // A second thread suspending the world would not wait on us.
        assert_ne!(driver.status(), ThreadStatus::Running);
        registry.change_status(&driver, ThreadStatus::Running);
        assert_eq!(driver.status(), ThreadStatus::Running);
        registry.detach();
    }
}
