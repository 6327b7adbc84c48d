//! Deadline bookkeeping: per-task timer bindings, the per-worker coarse
//! wheel and the shared high-precision timer thread.

use crate::raw_task::{self, TaskRef};
use log::trace;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

/// Per-task deadline record.
///
/// Firing and cancelling race on a single consume-once flag, so whichever
/// happens first wins and the loser is a no-op.
#[derive(Debug)]
pub(crate) struct TimerBinding {
    task: TaskRef,
    epoch: u64,
    deadline: Instant,
    consumed: AtomicBool,
}

unsafe impl Send for TimerBinding {}
unsafe impl Sync for TimerBinding {}

impl TimerBinding {
    pub fn new(task: TaskRef, epoch: u64, deadline: Instant) -> Arc<Self> {
        Arc::new(Self {
            task,
            epoch,
            deadline,
            consumed: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Marks the binding canceled; a later fire is a no-op.
    pub fn cancel(&self) {
        self.consumed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_canceled(&self) -> bool {
        self.consumed.load(Ordering::Acquire)
    }

    /// Unparks the target task unless the binding was canceled or has
    /// already fired.
    pub fn fire(&self) {
        if !self.consumed.swap(true, Ordering::AcqRel) {
            trace!("timer fired, waking task epoch {}", self.epoch);
            raw_task::unpark(self.task, self.epoch);
        }
    }
}

struct Entry(Arc<TimerBinding>);

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.0.deadline == other.0.deadline
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the earliest deadline surfaces first on the max-heap.
        other.0.deadline.cmp(&self.0.deadline)
    }
}

/// Coarse timer wheel owned by one worker and drained by its run loop.
/// Cancellation is lazy: canceled bindings are discarded when they surface.
#[derive(Default)]
pub(crate) struct TimerWheel {
    heap: Mutex<BinaryHeap<Entry>>,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, binding: Arc<TimerBinding>) {
        self.heap.lock().push(Entry(binding));
    }

    /// Fires every binding whose deadline has passed; returns the number of
    /// bindings fired.
    pub fn fire_due(&self, now: Instant) -> usize {
        let mut fired = 0;
        loop {
            let binding = {
                let mut heap = self.heap.lock();
                match heap.peek() {
                    Some(entry) if entry.0.deadline <= now => heap.pop().map(|e| e.0),
                    _ => None,
                }
            };
            match binding {
                // Fire outside the lock; the wake path takes other locks.
                Some(binding) => {
                    if !binding.is_canceled() {
                        binding.fire();
                        fired += 1;
                    }
                }
                None => return fired,
            }
        }
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.lock().peek().map(|e| e.0.deadline)
    }

    pub fn clear(&self) {
        self.heap.lock().clear();
    }
}

impl std::fmt::Debug for TimerWheel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerWheel")
            .field("pending", &self.heap.lock().len())
            .finish()
    }
}

#[derive(Default)]
struct ServiceState {
    heap: BinaryHeap<Entry>,
    shutdown: bool,
}

/// Shared high-precision timer: a dedicated thread sleeping until the next
/// deadline instead of piggybacking on worker run-loop ticks.
pub(crate) struct TimerService {
    state: Arc<(Mutex<ServiceState>, Condvar)>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    pub fn start() -> Self {
        let state = Arc::new((Mutex::new(ServiceState::default()), Condvar::new()));
        let thread_state = state.clone();
        let thread = std::thread::Builder::new()
            .name("fiber-timer".into())
            .spawn(move || Self::run(thread_state))
            .expect("could not spawn the timer service thread");

        Self {
            state,
            thread: Mutex::new(Some(thread)),
        }
    }

    pub fn schedule(&self, binding: Arc<TimerBinding>) {
        trace!("scheduling high-precision timer for {:?}", binding.deadline);
        let (lock, cv) = &*self.state;
        lock.lock().heap.push(Entry(binding));
        cv.notify_one();
    }

    pub fn shutdown(&self) {
        let (lock, cv) = &*self.state;
        lock.lock().shutdown = true;
        cv.notify_one();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }

    fn run(state: Arc<(Mutex<ServiceState>, Condvar)>) {
        let (lock, cv) = &*state;
        loop {
            let due = {
                let mut guard = lock.lock();
                loop {
                    if guard.shutdown {
                        return;
                    }
                    let now = Instant::now();
                    match guard.heap.peek().map(|e| e.0.deadline) {
                        Some(deadline) if deadline <= now => {
                            break guard.heap.pop().map(|e| e.0);
                        }
                        Some(deadline) => {
                            cv.wait_until(&mut guard, deadline);
                        }
                        None => {
                            cv.wait(&mut guard);
                        }
                    }
                }
            };
            if let Some(binding) = due {
                binding.fire();
            }
        }
    }
}

impl std::fmt::Debug for TimerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerService").finish_non_exhaustive()
    }
}
