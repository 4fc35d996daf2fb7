//! Heap error types

use thiserror::Error;

/// Errors surfaced by heap lifecycle operations.
///
/// Allocation exhaustion is deliberately not represented here: the allocator
/// reports it as an absent pointer plus a managed [`VmException`] in the
/// failing thread's exception slot.
#[derive(Debug, Error)]
pub enum HeapError {
    /// The startup configuration is internally inconsistent.
    #[error("invalid heap configuration: {0}")]
    InvalidConfig(&'static str),

    /// The heap source could not reserve or initialize its region.
    #[error("heap source startup failed: {0}")]
    SourceStartup(&'static str),

    /// The card table could not cover the configured heap range.
    #[error("card table startup failed")]
    CardTableStartup,
}

/// A managed exception delivered to a mutator thread.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmException {
    /// The heap could not satisfy an allocation after the full recovery
    /// ladder. `stackless` marks the pre-built instance used when throwing
    /// cannot allocate.
    #[error("OutOfMemoryError{}", .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    OutOfMemory {
        /// Optional detail message; omitted on the ordinary path to save an
        /// allocation.
        message: Option<String>,
        /// True for the pre-built, stack-traceless instance.
        stackless: bool,
    },
}

impl VmException {
    /// The ordinary OOM instance, thrown with no message.
    pub fn out_of_memory() -> Self {
        Self::OutOfMemory {
            message: None,
            stackless: false,
        }
    }

    /// The pre-built OOM used when the throw itself must not allocate.
    pub fn prebuilt_out_of_memory() -> Self {
        Self::OutOfMemory {
            message: None,
            stackless: true,
        }
    }

    /// An OOM for requests that can never succeed (e.g. overflowing array
    /// length computations), carrying a caller-supplied message.
    pub fn bad_alloc(message: impl Into<String>) -> Self {
        Self::OutOfMemory {
            message: Some(message.into()),
            stackless: false,
        }
    }
}
