//! A carrier-based M:N coroutine runtime.
//!
//! Lightweight stackful tasks are multiplexed onto a pool of worker
//! threads. Each worker is bound to one [`Carrier`], the per-thread
//! scheduling engine: it owns the run-loop task, performs the cooperative
//! context switches, recycles exited tasks and cooperates with the other
//! workers through per-worker FIFO runqueues with opportunistic stealing.
//! Timers and an optional I/O readiness pump unpark tasks through the same
//! wake path.
//!
//! ```no_run
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let runtime = fiber_tasks::Builder::new().build().unwrap();
//! let counter = Arc::new(AtomicUsize::new(0));
//!
//! let handles: Vec<_> = (0..8)
//!     .map(|i| {
//!         let counter = counter.clone();
//!         runtime
//!             .spawn(&format!("task-{i}"), move || {
//!                 counter.fetch_add(1, Ordering::AcqRel);
//!                 fiber_tasks::yield_now();
//!             })
//!             .unwrap()
//!     })
//!     .collect();
//!
//! for handle in &handles {
//!     handle.join().unwrap();
//! }
//! assert_eq!(counter.load(Ordering::Acquire), 8);
//! runtime.shutdown();
//! ```
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    rustdoc::broken_intra_doc_links
)]

mod carrier;
mod coroutine;
mod error;
mod event;
mod raw_task;
mod runtime;
mod scheduler;
mod spin_wait;
mod timer;

pub use carrier::{Carrier, CarrierCounters};
pub use error::Error;
pub use event::{ChannelId, EventPump, Interest, WakeupHandle};
pub use raw_task::TaskHandle;
pub use runtime::{Builder, Runtime};
pub use scheduler::WorkerId;

use std::time::{Duration, Instant};

/// Parks the current task until it is unparked.
///
/// Outside the worker pool this degrades to [`std::thread::park`].
pub fn park() {
    match carrier::current_carrier() {
        Some(carrier) if !carrier.current_task().is_thread_task() => carrier.schedule(),
        _ => std::thread::park(),
    }
}

/// Cooperatively yields the current task; queued tasks on the same worker
/// run before the caller resumes.
///
/// Outside the worker pool this degrades to [`std::thread::yield_now`].
pub fn yield_now() {
    match carrier::current_carrier() {
        Some(carrier) => carrier.yield_now(),
        None => std::thread::yield_now(),
    }
}

/// Parks the current task until `duration` has elapsed or the task is
/// unparked, whichever comes first.
///
/// Outside the worker pool this degrades to [`std::thread::sleep`], which
/// always waits the full duration.
pub fn sleep(duration: Duration) {
    let deadline = Instant::now() + duration;
    match carrier::current_carrier() {
        Some(carrier) if !carrier.current_task().is_thread_task() => {
            if carrier.add_timer(deadline).is_err() {
                std::thread::sleep(duration);
                return;
            }
            carrier.schedule();
            // The task may have migrated while parked.
            if let Some(carrier) = carrier::current_carrier() {
                carrier.cancel_timer();
            }
        }
        _ => std::thread::sleep(duration),
    }
}

/// Identity of the worker executing the caller, if the calling thread
/// belongs to a runtime's pool.
pub fn current_worker_id() -> Option<WorkerId> {
    carrier::current_carrier().and_then(|c| c.worker_id())
}

/// Name of the task executing the caller, if any.
pub fn current_task_name() -> Option<String> {
    carrier::current_carrier().and_then(|c| c.current_task_name())
}
