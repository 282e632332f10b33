//! Host-visible error taxonomy.
//!
//! `InvariantViolation` is deliberately **not** returned by any operation in
//! this crate: an invariant break means the heap can no longer be trusted,
//! so the collector aborts via `panic!` instead of propagating a `Result`
//! the caller might be tempted to recover from. The variant is kept on the
//! enum so embedders that catch the panic at an FFI boundary still have a
//! typed value to report.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum GcError {
    /// The heap could not satisfy an allocation after a synchronous
    /// assist cycle.
    #[error("allocation failure: heap exhausted after assist cycle")]
    AllocationFailure,

    /// A slot index passed to `load`/`store` was outside `0..N`.
    #[error("invalid slot index {index} (body has {len} slots)")]
    InvalidSlot { index: usize, len: usize },

    /// The collector has been torn down via `stop_gc` and no longer
    /// accepts allocation or mutation requests.
    #[error("allocation requested after collector shutdown")]
    ShutdownInProgress,

    /// Fatal: a forwarding-map lookup missed, a color failed to decode, or
    /// a page was double-reclaimed. Never returned; see module docs.
    #[error("GC invariant violated: {0}")]
    InvariantViolation(&'static str),
}

pub type GcResult<T> = Result<T, GcError>;

/// Aborts the process with a diagnostic. Called at the few points where
/// continuing would observe heap corruption.
#[cold]
#[inline(never)]
pub fn fatal(message: &'static str) -> ! {
    log::error!("fatal GC invariant violation: {message}");
    panic!("GC invariant violation: {message}");
}
