use thiserror::Error as ThisError;

/// Reason a task steal was denied.
///
/// Steal failures are recovered locally (the entry is re-woken on the
/// owning carrier), so they never surface to callers; the counters record
/// them instead.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub(crate) enum StealFailure {
    /// The runtime is draining; no carrier may take new ownership.
    ByStatus,
    /// Another carrier is racing for the same task; the steal may be retried.
    ByContention,
    /// The task's stack has not finished switching out yet.
    ByRacingWorker,
}

/// Errors surfaced by the runtime.
///
/// Programming errors (yielding to the current task, switching inside a
/// critical section, parking a task that has no resume entry) are not
/// represented here; those are bugs and abort via assertions.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The runtime has been shut down and no longer accepts new tasks.
    #[error("the task runtime has been shut down")]
    Rejected,
    /// The operation is not valid for the current carrier.
    #[error("invalid carrier state: {0}")]
    InvalidState(&'static str),
    /// An allocation limit was reached.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),
    /// The task unwound before completing, either through a panic or
    /// because the runtime shut down underneath it.
    #[error("the task was aborted before completing")]
    TaskAborted,
}
