//! Worker pool: one OS thread per worker, each bound to one carrier, with
//! per-worker FIFO runqueues and opportunistic stealing between them.

use crate::carrier::{self, Carrier};
use crate::raw_task::{ResumeEntry, TaskRef};
use crate::runtime::Runtime;
use crate::timer::{TimerBinding, TimerWheel};
use crossbeam_deque::{Injector, Steal};
use log::{debug, error, info, trace};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::{JoinHandle, Thread};
use std::time::{Duration, Instant};

/// Longest a worker sleeps between runqueue scans. Bounds the latency of
/// stealing from a carrier whose own thread is stuck in user code.
const MAX_IDLE: Duration = Duration::from_millis(10);

/// Identity of a worker thread inside the pool.
#[derive(Debug, Copy, Clone, Hash, Ord, PartialOrd, PartialEq, Eq)]
pub struct WorkerId(pub usize);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker {}", self.0)
    }
}

/// Cross-thread face of one worker: its inbox, timer wheel, handoff state
/// and a handle for waking the thread.
pub(crate) struct WorkerShared {
    id: WorkerId,
    inbox: Injector<Arc<ResumeEntry>>,
    queue_len: AtomicUsize,
    thread: Mutex<Option<Thread>>,
    handoff: AtomicBool,
    wheel: TimerWheel,
}

impl WorkerShared {
    fn new(id: WorkerId) -> Arc<Self> {
        Arc::new(Self {
            id,
            inbox: Injector::new(),
            queue_len: AtomicUsize::new(0),
            thread: Mutex::new(None),
            handoff: AtomicBool::new(false),
            wheel: TimerWheel::new(),
        })
    }

    #[inline]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    #[inline]
    pub fn wheel(&self) -> &TimerWheel {
        &self.wheel
    }

    /// Number of entries currently enqueued for this worker.
    #[inline]
    pub fn queue_length(&self) -> usize {
        self.queue_len.load(Ordering::Acquire)
    }

    pub fn push(&self, entry: Arc<ResumeEntry>) {
        self.queue_len.fetch_add(1, Ordering::AcqRel);
        self.inbox.push(entry);
        self.signal();
    }

    /// Pops one entry from this worker's inbox. Callable from any thread;
    /// calling it from another worker is the steal path.
    pub fn steal_inbox(&self) -> Option<Arc<ResumeEntry>> {
        loop {
            match self.inbox.steal() {
                Steal::Success(entry) => {
                    self.queue_len.fetch_sub(1, Ordering::AcqRel);
                    return Some(entry);
                }
                Steal::Empty => return None,
                Steal::Retry => std::hint::spin_loop(),
            }
        }
    }

    /// Wakes the worker thread.
    pub fn signal(&self) {
        if let Some(thread) = &*self.thread.lock() {
            thread.unpark();
        }
    }

    #[inline]
    pub fn has_been_handoff(&self) -> bool {
        self.handoff.load(Ordering::Acquire)
    }

    fn set_handoff(&self, handoff: bool) {
        self.handoff.store(handoff, Ordering::Release);
    }

    fn set_thread(&self, thread: Thread) {
        *self.thread.lock() = Some(thread);
    }
}

impl std::fmt::Debug for WorkerShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerShared")
            .field("id", &self.id)
            .field("queue_len", &self.queue_length())
            .field("handoff", &self.has_been_handoff())
            .finish()
    }
}

/// The worker pool.
#[derive(Debug)]
pub(crate) struct Scheduler {
    workers: Vec<Arc<WorkerShared>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    next_worker: AtomicUsize,
}

impl Scheduler {
    pub fn new(worker_count: usize) -> Self {
        let workers = (0..worker_count)
            .map(|id| WorkerShared::new(WorkerId(id)))
            .collect();
        Self {
            workers,
            threads: Mutex::new(Vec::new()),
            next_worker: AtomicUsize::new(0),
        }
    }

    /// Starts all worker threads and blocks until each has bound its
    /// carrier, so spawns may target any worker as soon as this returns.
    pub fn start(&self, runtime: &Arc<Runtime>) {
        trace!("starting {} worker threads", self.workers.len());
        let barrier = Arc::new(Barrier::new(self.workers.len() + 1));

        let mut threads = self.threads.lock();
        for worker in &self.workers {
            let runtime = runtime.clone();
            let worker = worker.clone();
            let barrier = barrier.clone();
            let thread = std::thread::Builder::new()
                .name(format!("fiber-worker-{}", worker.id().0))
                .spawn(move || worker_main(runtime, worker, barrier))
                .expect("could not spawn a worker thread");
            threads.push(thread);
        }
        drop(threads);

        barrier.wait();
    }

    #[inline]
    pub fn workers(&self) -> &[Arc<WorkerShared>] {
        &self.workers
    }

    /// Picks the submission target for work that is not bound to a
    /// carrier yet.
    pub fn select_worker(&self) -> &Arc<WorkerShared> {
        let next = self.next_worker.fetch_add(1, Ordering::AcqRel);
        &self.workers[next % self.workers.len()]
    }

    /// Registers a timer on the wheel of the worker owning `carrier`'s
    /// thread and re-arms that worker's sleep.
    pub fn add_timer(&self, binding: Arc<TimerBinding>, worker: &WorkerShared) {
        worker.wheel().push(binding);
        worker.signal();
    }

    /// Detaches `worker` from dispatch duty for the duration of a presumed
    /// blocking syscall: siblings are woken so they drain its queue, and
    /// the worker is signaled once the queue runs empty.
    pub fn hand_off(&self, worker: &WorkerShared) {
        debug!("{} handed off", worker.id());
        worker.set_handoff(true);
        self.signal_all();
    }

    pub fn signal_all(&self) {
        for worker in &self.workers {
            worker.signal();
        }
    }

    /// Steals one entry from any worker other than `thief`.
    fn steal_for(&self, thief: &WorkerShared) -> Option<Arc<ResumeEntry>> {
        for worker in &self.workers {
            if worker.id() == thief.id() {
                continue;
            }
            if let Some(entry) = worker.steal_inbox() {
                trace!("{} stole an entry from {}", thief.id(), worker.id());
                return Some(entry);
            }
        }
        None
    }

    pub fn join_workers(&self) {
        let threads = std::mem::take(&mut *self.threads.lock());
        for thread in threads {
            if thread.join().is_err() {
                error!("a worker thread terminated with a panic");
            }
        }
    }
}

/// Enqueues `task`'s resume entry on the worker of its owning carrier.
///
/// This is the single wake path used by unpark, timers, the event pump and
/// the yield epilog. The enqueue slot makes each park/wake pair consume the
/// entry exactly once.
pub(crate) fn wakeup_task(task: TaskRef) {
    let Some(entry) = task.resume_entry() else {
        // Run-loop tasks have no entry; they are resumed by their own
        // worker loop.
        return;
    };
    if entry.epoch() != task.epoch() {
        return;
    }
    let carrier = task.carrier();
    let Some(worker) = carrier.worker() else {
        error!("cannot wake a task owned by a detached carrier");
        return;
    };
    if entry.try_enqueue() {
        task.set_enqueue_time(Instant::now());
        worker.push(entry);
    }
}

fn worker_main(runtime: Arc<Runtime>, me: Arc<WorkerShared>, barrier: Arc<Barrier>) {
    me.set_thread(std::thread::current());
    let carrier = Carrier::bind_worker(runtime.clone(), me.clone());
    barrier.wait();

    info!("{} started", me.id());

    loop {
        me.wheel().fire_due(Instant::now());

        let entry = me
            .steal_inbox()
            .or_else(|| runtime.scheduler().steal_for(&me));
        if let Some(entry) = entry {
            carrier::dispatch_entry(carrier, &entry);
            carrier.run_epilog();
            continue;
        }

        if runtime.has_been_shutdown()
            && runtime.running_tasks() == 0
            && me.queue_length() == 0
        {
            break;
        }

        let park_for = me
            .wheel()
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(MAX_IDLE)
            .min(MAX_IDLE);
        std::thread::park_timeout(park_for);
    }

    info!("{} stopped", me.id());
    me.wheel().clear();
    carrier::unbind_worker(carrier);
}
