//! The runtime: process-wide owner of the worker pool, the running-task
//! counter, the shared task cache and the shutdown flag.

use crate::carrier::{current_carrier, CarrierCounters, CarrierShared};
use crate::error::Error;
use crate::event::EventPump;
use crate::raw_task::{RawTask, TaskHandle, TaskStatus, SHUTDOWN_TASK_NAME};
use crate::scheduler::{Scheduler, WorkerId};
use crate::timer::TimerService;
use crossbeam_deque::{Injector, Steal};
use log::{info, trace};
use parking_lot::{const_rwlock, Mutex, RwLock};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// Most recently built runtime; used to attach carriers to threads the
/// pool does not own.
static CURRENT_RUNTIME: RwLock<Option<Weak<Runtime>>> = const_rwlock(None);

pub(crate) fn current_runtime() -> Option<Arc<Runtime>> {
    CURRENT_RUNTIME.read().as_ref().and_then(Weak::upgrade)
}

/// A builder for a [`Runtime`].
#[derive(Clone)]
pub struct Builder {
    stack_size: usize,
    task_cache_size: usize,
    workers: Option<usize>,
    high_precision_timer: bool,
    event_pump: Option<Arc<dyn EventPump>>,
}

impl Builder {
    /// Default stack size for new tasks.
    ///
    /// Is currently set to 2 MiB.
    pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024 * 2;

    /// Default number of recycled tasks a carrier keeps before spilling to
    /// the shared cache.
    pub const DEFAULT_TASK_CACHE_SIZE: usize = 64;

    /// Default number of workers created by the runtime.
    ///
    /// Defaults to the number of available threads on the core.
    pub const DEFAULT_NUM_WORKERS: Option<usize> = None;

    /// Creates a new builder with the default settings.
    #[inline]
    pub fn new() -> Self {
        Self {
            stack_size: Self::DEFAULT_STACK_SIZE,
            task_cache_size: Self::DEFAULT_TASK_CACHE_SIZE,
            workers: Self::DEFAULT_NUM_WORKERS,
            high_precision_timer: false,
            event_pump: None,
        }
    }

    /// Changes the stack size for new tasks.
    #[inline]
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    /// Changes the per-carrier recycle cap; overflow spills to the shared
    /// cache.
    #[inline]
    pub fn task_cache_size(mut self, size: usize) -> Self {
        self.task_cache_size = size;
        self
    }

    /// Changes the number of workers.
    ///
    /// Setting `None` creates a worker per available thread.
    #[inline]
    pub fn workers(mut self, workers: Option<usize>) -> Self {
        self.workers = workers;
        self
    }

    /// Routes timers through a dedicated timer thread instead of the
    /// coarse per-worker wheels.
    #[inline]
    pub fn high_precision_timer(mut self, enabled: bool) -> Self {
        self.high_precision_timer = enabled;
        self
    }

    /// Installs an I/O readiness pump.
    #[inline]
    pub fn event_pump(mut self, pump: Arc<dyn EventPump>) -> Self {
        self.event_pump = Some(pump);
        self
    }

    /// Builds the runtime with the provided settings and starts its
    /// workers.
    pub fn build(self) -> Result<Arc<Runtime>, Error> {
        let workers = self.workers.unwrap_or_else(num_cpus::get).max(1);
        let timer_service = self.high_precision_timer.then(TimerService::start);

        let runtime = Arc::new(Runtime {
            scheduler: Scheduler::new(workers),
            running_task_count: AtomicUsize::new(0),
            group_task_cache: Injector::new(),
            group_cache_len: AtomicUsize::new(0),
            has_been_shutdown: AtomicBool::new(false),
            stack_size: self.stack_size,
            task_cache_size: self.task_cache_size,
            high_precision_timer: self.high_precision_timer,
            event_pump: self.event_pump,
            timer_service,
            carriers: Mutex::new(BTreeMap::new()),
        });

        *CURRENT_RUNTIME.write() = Some(Arc::downgrade(&runtime));
        runtime.scheduler.start(&runtime);

        info!("task runtime started with {} workers", workers);
        Ok(runtime)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("stack_size", &self.stack_size)
            .field("task_cache_size", &self.task_cache_size)
            .field("workers", &self.workers)
            .field("high_precision_timer", &self.high_precision_timer)
            .field("event_pump", &self.event_pump.is_some())
            .finish()
    }
}

/// A runtime for running tasks on carrier threads.
pub struct Runtime {
    scheduler: Scheduler,
    running_task_count: AtomicUsize,
    group_task_cache: Injector<Pin<Arc<RawTask>>>,
    group_cache_len: AtomicUsize,
    has_been_shutdown: AtomicBool,
    stack_size: usize,
    task_cache_size: usize,
    high_precision_timer: bool,
    event_pump: Option<Arc<dyn EventPump>>,
    timer_service: Option<TimerService>,
    carriers: Mutex<BTreeMap<WorkerId, Arc<CarrierShared>>>,
}

impl Runtime {
    /// Spawns a task.
    ///
    /// From inside the worker pool the task runs on the calling thread
    /// until its first park, exactly like [`Carrier::spawn`](crate::Carrier::spawn).
    /// From any other thread the spawn is queued on a worker and the task
    /// starts there.
    pub fn spawn<F>(&self, name: &str, f: F) -> Result<TaskHandle, Error>
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(carrier) = current_carrier() {
            let same_runtime = std::ptr::eq(Arc::as_ptr(carrier.runtime()), self);
            if carrier.worker_id().is_some() && same_runtime {
                return carrier.spawn_boxed(name, Box::new(f));
            }
        }
        self.submit_spawn(name, Box::new(f))
    }

    fn submit_spawn(
        &self,
        name: &str,
        entry: Box<dyn FnOnce() + Send>,
    ) -> Result<TaskHandle, Error> {
        if self.has_been_shutdown() && name != SHUTDOWN_TASK_NAME {
            return Err(Error::Rejected);
        }
        trace!("queueing external spawn of task {:?}", name);

        let worker = self.scheduler.select_worker();
        let carrier = self
            .carriers
            .lock()
            .get(&worker.id())
            .cloned()
            .ok_or(Error::InvalidState("the selected worker has no carrier"))?;

        let task = self.obtain_cached_task()?;
        task.reset(task.clone(), entry, name, None, carrier, crate::carrier::task_main);
        self.add_running_task();
        // Enters the pool like any woken task: parked, entry enqueued.
        task.set_status(TaskStatus::Parked);

        let task_ref = task.as_ref_ptr();
        let handle = TaskHandle::new(task_ref, task.epoch(), task.completion());
        let resume = task
            .resume_entry()
            .expect("freshly reset task has no resume entry");
        drop(task);

        if resume.try_enqueue() {
            task_ref.set_enqueue_time(Instant::now());
            worker.push(resume);
        }
        Ok(handle)
    }

    fn obtain_cached_task(&self) -> Result<Pin<Arc<RawTask>>, Error> {
        if let Some(task) = self.steal_cached_task() {
            // The previous incarnation must be fully switched out before
            // its stack can be reused.
            if task.ctx().steal().is_ok() {
                return Ok(task);
            }
            self.return_cached_task(task);
        }
        RawTask::new(self.stack_size)
    }

    /// Number of live (spawned, not yet exited) tasks.
    pub fn running_tasks(&self) -> usize {
        self.running_task_count.load(Ordering::Acquire)
    }

    /// Number of recycled tasks in the shared cache.
    pub fn group_cache_len(&self) -> usize {
        self.group_cache_len.load(Ordering::Acquire)
    }

    /// Whether [`shutdown`](Self::shutdown) has been requested.
    pub fn has_been_shutdown(&self) -> bool {
        self.has_been_shutdown.load(Ordering::Acquire)
    }

    /// Counter snapshots of all worker carriers, ordered by worker id.
    pub fn carrier_counters(&self) -> Vec<CarrierCounters> {
        self.carriers.lock().values().map(|c| c.snapshot()).collect()
    }

    /// Shuts the runtime down cooperatively.
    ///
    /// New spawns are rejected, every task observes the shutdown at its
    /// next resume and unwinds, and the workers exit once the last task is
    /// gone. Must be called from outside the worker pool; parked tasks are
    /// only collected once something (a timer, an unpark, channel close)
    /// wakes them.
    pub fn shutdown(&self) {
        if !self.has_been_shutdown.swap(true, Ordering::AcqRel) {
            info!("shutting down the task runtime");
        }
        self.scheduler.signal_all();
        self.scheduler.join_workers();
        if let Some(service) = &self.timer_service {
            service.shutdown();
        }
        // Free the recycled tasks that spilled to the shared cache.
        while self.steal_cached_task().is_some() {}
        trace!("task runtime drained");
    }

    pub(crate) fn add_running_task(&self) {
        self.running_task_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn remove_running_task(&self) -> usize {
        self.running_task_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn steal_cached_task(&self) -> Option<Pin<Arc<RawTask>>> {
        loop {
            match self.group_task_cache.steal() {
                Steal::Success(task) => {
                    self.group_cache_len.fetch_sub(1, Ordering::AcqRel);
                    return Some(task);
                }
                Steal::Empty => return None,
                Steal::Retry => std::hint::spin_loop(),
            }
        }
    }

    pub(crate) fn return_cached_task(&self, task: Pin<Arc<RawTask>>) {
        self.group_cache_len.fetch_add(1, Ordering::AcqRel);
        self.group_task_cache.push(task);
    }

    pub(crate) fn register_carrier(&self, id: WorkerId, carrier: Arc<CarrierShared>) {
        self.carriers.lock().insert(id, carrier);
    }

    #[inline]
    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    #[inline]
    pub(crate) fn stack_size(&self) -> usize {
        self.stack_size
    }

    #[inline]
    pub(crate) fn task_cache_size(&self) -> usize {
        self.task_cache_size
    }

    #[inline]
    pub(crate) fn high_precision_timer(&self) -> bool {
        self.high_precision_timer
    }

    #[inline]
    pub(crate) fn event_pump(&self) -> Option<&Arc<dyn EventPump>> {
        self.event_pump.as_ref()
    }

    #[inline]
    pub(crate) fn timer_service(&self) -> Option<&TimerService> {
        self.timer_service.as_ref()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("running_tasks", &self.running_tasks())
            .field("group_cache_len", &self.group_cache_len())
            .field("has_been_shutdown", &self.has_been_shutdown())
            .field("high_precision_timer", &self.high_precision_timer)
            .finish_non_exhaustive()
    }
}
