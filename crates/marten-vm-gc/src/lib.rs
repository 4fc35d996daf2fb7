//! # Marten VM Garbage-Collected Heap
//!
//! The heap coordinator of the Marten managed-object runtime: mediates
//! between mutator threads allocating objects and a mark-sweep collector
//! reclaiming them.
//!
//! ## Design
//!
//! - **Global heap lock**: one mutex guards allocator state; a condition
//!   variable broadcasts "GC finished" to blocked allocators
//! - **Allocation ladder**: failed allocations escalate through waiting for
//!   a concurrent cycle, a foreground collection, heap growth, and a final
//!   soft-reference-clearing pass before OOM
//! - **Optionally concurrent cycles**: mutators run during the trace; a
//!   card-table write barrier drives the dirty re-scan
//! - **Worker hand-off**: finalizers and reference enqueues run on a
//!   dedicated worker thread fed through two FIFOs
//!
//! The embedder supplies an [`ObjectModel`] describing its object graph and
//! any number of [`RootProvider`]s; everything else is internal.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod bitmap;
pub mod card;
pub mod config;
pub mod driver;
pub mod error;
pub mod heap;
pub mod marker;
pub mod monitor;
pub mod object;
pub mod safepoint;
pub mod source;
pub mod threads;
mod verify;
pub mod worker;

pub use card::{CARD_SIZE, CardTable};
pub use config::HeapConfig;
pub use driver::{GcPause, GcReason, GcSummary};
pub use error::{HeapError, VmException};
pub use heap::{GcHeap, HeapLockGuard};
pub use marker::{GcMode, LeafObjectModel, ObjectModel, ReferenceKind, RootProvider};
pub use monitor::{HeapMonitor, HeapSnapshot, LogMonitor, MonitorConfig};
pub use object::{ObjectPtr, OBJECT_ALIGNMENT, alloc_flags};
pub use safepoint::SafepointQueue;
pub use source::{HeapSource, HeapValue};
pub use threads::{
    AllocProfile, SuspendReason, ThreadRegistry, ThreadStatus, VmThread, current_thread,
    safepoint_check,
};
pub use worker::{ReferenceTable, WorkerOp, WorkerQueues, WorkerState};
