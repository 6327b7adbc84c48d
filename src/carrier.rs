//! The carrier: a scheduler instance pinned to one OS thread.
//!
//! A carrier owns a distinguished run-loop task (the worker's scheduler
//! loop runs on it), tracks which task currently occupies the thread,
//! recycles exited tasks through a bounded LIFO cache and performs the
//! cooperative context switches. Worker threads bind a carrier at startup;
//! foreign threads get a detached carrier on first contact, which serves as
//! an identity holder only.
//!
//! After any context switch the current carrier must be re-resolved with
//! [`current_carrier`]: the switched-out task may be stolen and resume on a
//! different OS thread.

use crate::coroutine::{self, ShutdownSignal};
use crate::error::{Error, StealFailure};
use crate::event::{ChannelId, Interest, WakeupHandle};
use crate::raw_task::{
    RawTask, ResumeEntry, TaskHandle, TaskRef, TaskStatus, SHUTDOWN_TASK_NAME,
};
use crate::runtime::Runtime;
use crate::scheduler::{self, WorkerId, WorkerShared};
use crate::spin_wait::SpinWait;
use crate::timer::TimerBinding;
use context::Transfer;
use log::{debug, error, trace};
use std::cell::{Cell, RefCell};
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cross-thread face of a carrier: the part wakers, thieves and monitors
/// may touch. The hot scheduling state stays in [`Carrier`] and is only
/// accessed by the owning thread.
pub(crate) struct CarrierShared {
    worker: Option<Arc<WorkerShared>>,
    sched_tick: AtomicU64,
    last_sched_tick: AtomicU64,
    terminated: AtomicBool,
    cached_tasks: AtomicUsize,
    switches: AtomicU64,
    spawns: AtomicU64,
    steals: AtomicU64,
    steal_failures: AtomicU64,
    enqueues: AtomicU64,
    enqueue_nanos: AtomicU64,
}

impl CarrierShared {
    fn new(worker: Option<Arc<WorkerShared>>) -> Arc<Self> {
        Arc::new(Self {
            worker,
            sched_tick: AtomicU64::new(0),
            last_sched_tick: AtomicU64::new(0),
            terminated: AtomicBool::new(false),
            cached_tasks: AtomicUsize::new(0),
            switches: AtomicU64::new(0),
            spawns: AtomicU64::new(0),
            steals: AtomicU64::new(0),
            steal_failures: AtomicU64::new(0),
            enqueues: AtomicU64::new(0),
            enqueue_nanos: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn worker(&self) -> Option<&Arc<WorkerShared>> {
        self.worker.as_ref()
    }

    #[inline]
    pub fn worker_id(&self) -> Option<WorkerId> {
        self.worker.as_ref().map(|w| w.id())
    }

    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Liveness probe for an external monitor: true when the carrier has
    /// switched at least once since the previous probe.
    pub fn probe_liveness(&self) -> bool {
        let tick = self.sched_tick.load(Ordering::Acquire);
        let last = self.last_sched_tick.swap(tick, Ordering::AcqRel);
        tick != last
    }

    fn record_enqueue_latency(&self, latency: Duration) {
        self.enqueues.fetch_add(1, Ordering::AcqRel);
        self.enqueue_nanos
            .fetch_add(latency.as_nanos() as u64, Ordering::AcqRel);
    }

    /// Counter snapshot.
    pub fn snapshot(&self) -> CarrierCounters {
        CarrierCounters {
            worker: self.worker_id(),
            sched_ticks: self.sched_tick.load(Ordering::Acquire),
            switches: self.switches.load(Ordering::Acquire),
            spawns: self.spawns.load(Ordering::Acquire),
            steals: self.steals.load(Ordering::Acquire),
            steal_failures: self.steal_failures.load(Ordering::Acquire),
            enqueued: self.enqueues.load(Ordering::Acquire),
            enqueue_nanos: self.enqueue_nanos.load(Ordering::Acquire),
            cached_tasks: self.cached_tasks.load(Ordering::Acquire),
            terminated: self.is_terminated(),
        }
    }
}

impl std::fmt::Debug for CarrierShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CarrierShared")
            .field("worker", &self.worker_id())
            .field("terminated", &self.is_terminated())
            .finish_non_exhaustive()
    }
}

/// Scheduling counters of one carrier.
#[derive(Debug, Clone)]
pub struct CarrierCounters {
    /// Worker the carrier is bound to; `None` for a detached carrier.
    pub worker: Option<WorkerId>,
    /// Context switches observed by the liveness counter.
    pub sched_ticks: u64,
    /// Completed `yield_to` switches.
    pub switches: u64,
    /// Tasks spawned on this carrier.
    pub spawns: u64,
    /// Tasks successfully stolen onto this carrier.
    pub steals: u64,
    /// Steal attempts that failed.
    pub steal_failures: u64,
    /// Resume entries dispatched with latency accounting.
    pub enqueued: u64,
    /// Total queue latency of dispatched entries, in nanoseconds.
    pub enqueue_nanos: u64,
    /// Recycled tasks currently held in the local cache.
    pub cached_tasks: usize,
    /// Whether the carrier has been destroyed.
    pub terminated: bool,
}

/// A scheduler instance pinned to one OS thread.
pub struct Carrier {
    runtime: Arc<Runtime>,
    shared: Arc<CarrierShared>,
    thread_task: Pin<Arc<RawTask>>,
    current: Cell<TaskRef>,
    task_cache: RefCell<Vec<Pin<Arc<RawTask>>>>,
    in_critical: Cell<bool>,
    switch_timestamp: Cell<Instant>,
    yielding_task: Cell<Option<TaskRef>>,
    pending_timer: RefCell<Option<Arc<TimerBinding>>>,
}

thread_local! {
    static CARRIER: CarrierSlot = CarrierSlot::new();
}

struct CarrierSlot {
    carrier: Cell<Option<NonNull<Carrier>>>,
    owned: Cell<bool>,
}

impl CarrierSlot {
    fn new() -> Self {
        Self {
            carrier: Cell::new(None),
            owned: Cell::new(false),
        }
    }
}

impl Drop for CarrierSlot {
    fn drop(&mut self) {
        // Carriers attached to foreign threads are reclaimed when their OS
        // thread exits; worker carriers are reclaimed by the worker loop.
        if self.owned.get() {
            if let Some(ptr) = self.carrier.take() {
                unsafe {
                    (*ptr.as_ptr()).destroy();
                    drop(Box::from_raw(ptr.as_ptr()));
                }
            }
        }
    }
}

/// The carrier bound to the calling OS thread, if any.
///
/// Must be re-invoked after every context switch; the result from before a
/// switch may belong to a thread this stack no longer runs on, which is why
/// this accessor is never inlined.
#[inline(never)]
pub(crate) fn current_carrier() -> Option<&'static Carrier> {
    CARRIER.with(|slot| slot.carrier.get().map(|ptr| unsafe { &*ptr.as_ptr() }))
}

impl Carrier {
    fn new(runtime: Arc<Runtime>, shared: Arc<CarrierShared>) -> Self {
        let name = match shared.worker_id() {
            Some(id) => format!("fiber-carrier-{}", id.0),
            None => "fiber-carrier-detached".to_string(),
        };
        let thread_task = RawTask::new_thread_task(&name);
        thread_task.set_carrier(shared.clone());
        let current = thread_task.as_ref_ptr();

        Self {
            runtime,
            shared,
            thread_task,
            current: Cell::new(current),
            task_cache: RefCell::new(Vec::new()),
            in_critical: Cell::new(false),
            switch_timestamp: Cell::new(Instant::now()),
            yielding_task: Cell::new(None),
            pending_timer: RefCell::new(None),
        }
    }

    /// Creates the carrier of a worker thread and publishes it in the
    /// thread-local slot and the runtime registry.
    pub(crate) fn bind_worker(
        runtime: Arc<Runtime>,
        worker: Arc<WorkerShared>,
    ) -> &'static Carrier {
        let shared = CarrierShared::new(Some(worker.clone()));
        let carrier: &'static Carrier = Box::leak(Box::new(Carrier::new(runtime, shared)));
        CARRIER.with(|slot| {
            assert!(
                slot.carrier.get().is_none(),
                "this thread already has a carrier"
            );
            slot.carrier.set(Some(NonNull::from(carrier)));
            slot.owned.set(false);
        });
        carrier
            .runtime
            .register_carrier(worker.id(), carrier.shared.clone());
        carrier
    }

    /// Tears down a worker carrier. Only the owning worker loop may call
    /// this, after its last task has exited.
    pub(crate) fn unbind_worker(carrier: &'static Carrier) {
        carrier.destroy();
        CARRIER.with(|slot| slot.carrier.set(None));
        unsafe {
            drop(Box::from_raw(carrier as *const Carrier as *mut Carrier));
        }
    }

    /// Returns the carrier of the calling thread, lazily attaching a
    /// detached one for threads outside the worker pool.
    ///
    /// A detached carrier has no worker: it answers identity queries but
    /// rejects every operation that would reach the scheduler.
    pub fn current_or_attach() -> Result<&'static Carrier, Error> {
        if let Some(carrier) = current_carrier() {
            return Ok(carrier);
        }
        let runtime = crate::runtime::current_runtime()
            .ok_or(Error::InvalidState("no task runtime has been built"))?;
        let shared = CarrierShared::new(None);
        let carrier: &'static Carrier = Box::leak(Box::new(Carrier::new(runtime, shared)));
        CARRIER.with(|slot| {
            slot.carrier.set(Some(NonNull::from(carrier)));
            slot.owned.set(true);
        });
        debug!(
            "attached a detached carrier to thread {:?}",
            std::thread::current().name()
        );
        Ok(carrier)
    }

    #[inline]
    pub(crate) fn shared(&self) -> &Arc<CarrierShared> {
        &self.shared
    }

    /// Worker this carrier is pinned to; `None` for a detached carrier.
    pub fn worker_id(&self) -> Option<WorkerId> {
        self.shared.worker_id()
    }

    /// Name of the task currently executing on this carrier's thread.
    pub fn current_task_name(&self) -> Option<String> {
        self.current.get().thread_name()
    }

    /// Liveness probe: whether the carrier switched since the last probe.
    pub fn is_running(&self) -> bool {
        self.shared.probe_liveness()
    }

    /// Counter snapshot of this carrier.
    pub fn counters(&self) -> CarrierCounters {
        self.shared.snapshot()
    }

    fn enter_critical(&self) {
        assert!(!self.in_critical.get(), "re-entered a critical section");
        self.in_critical.set(true);
    }

    fn exit_critical(&self) {
        debug_assert!(self.in_critical.get());
        self.in_critical.set(false);
    }

    /// Spawns a task and runs it on the calling thread until its first
    /// park; user code after `spawn` continues once the new task suspends
    /// or exits.
    pub fn spawn<F>(&self, name: &str, f: F) -> Result<TaskHandle, Error>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_boxed(name, Box::new(f))
    }

    pub(crate) fn spawn_boxed(
        &self,
        name: &str,
        entry: Box<dyn FnOnce() + Send>,
    ) -> Result<TaskHandle, Error> {
        if self.shared.worker().is_none() {
            return Err(Error::InvalidState(
                "a detached carrier cannot spawn tasks",
            ));
        }
        if self.runtime.has_been_shutdown() && name != SHUTDOWN_TASK_NAME {
            return Err(Error::Rejected);
        }
        trace!("spawning task {:?}", name);

        self.enter_critical();
        let task = match self.obtain_task() {
            Ok(task) => task,
            Err(e) => {
                self.exit_critical();
                return Err(e);
            }
        };
        task.reset(
            task.clone(),
            entry,
            name,
            Some(self.current.get()),
            self.shared.clone(),
            task_main,
        );
        self.runtime.add_running_task();
        self.exit_critical();

        self.shared.spawns.fetch_add(1, Ordering::AcqRel);
        let task_ref = task.as_ref_ptr();
        let handle = TaskHandle::new(task_ref, task.epoch(), task.completion());
        // The task's own strong handle keeps it alive from here on.
        drop(task);

        self.yield_to(task_ref);

        // The spawner may have been resumed on a different thread.
        let carrier = current_carrier().expect("spawner resumed on a thread without a carrier");
        carrier.run_epilog();
        Ok(handle)
    }

    /// Fetches a recyclable task: local cache first, then the runtime-wide
    /// cache (stealing it over if another carrier owned it), else a fresh
    /// allocation.
    fn obtain_task(&self) -> Result<Pin<Arc<RawTask>>, Error> {
        debug_assert!(self.in_critical.get());

        if let Some(task) = self.task_cache.borrow_mut().pop() {
            self.shared.cached_tasks.fetch_sub(1, Ordering::AcqRel);
            return Ok(task);
        }

        if let Some(task) = self.runtime.steal_cached_task() {
            let task_ref = task.as_ref_ptr();
            match self.steal_task(task_ref) {
                Ok(()) => return Ok(task),
                Err(failure) => {
                    // The previous incarnation has not finished switching
                    // out; put it back and allocate a fresh task instead.
                    trace!("could not reuse a cached task: {:?}", failure);
                    self.runtime.return_cached_task(task);
                }
            }
        }

        RawTask::new(self.runtime.stack_size())
    }

    /// Context-switches the thread onto `task`'s stack. The single entry
    /// point to any task.
    ///
    /// Returns `false` without switching when `task` is a zombie. After
    /// the call returns, `self` must not be used; re-resolve the carrier
    /// with [`current_carrier`].
    pub(crate) fn yield_to(&self, task: TaskRef) -> bool {
        let current = self.current.get();
        assert!(
            !self.in_critical.get(),
            "attempted a context switch inside a critical section"
        );
        assert!(
            !current.same_task(task),
            "attempted to yield to the current task"
        );
        debug_assert!(
            current_carrier().map_or(false, |c| std::ptr::eq(c, self)),
            "yield_to called through a foreign carrier"
        );
        debug_assert!(Arc::ptr_eq(&task.carrier(), &self.shared));

        if task.poll_status() == TaskStatus::Zombie {
            self.unregister_event_of(task);
            return false;
        }

        self.shared.sched_tick.fetch_add(1, Ordering::AcqRel);
        self.shared.switches.fetch_add(1, Ordering::AcqRel);

        let now = Instant::now();
        current.record_execution(now - self.switch_timestamp.replace(now));

        self.current.set(task);
        task.set_status(TaskStatus::Runnable);
        unsafe { coroutine::switch(current, task) };
        // From here on this frame may execute on a different OS thread.
        true
    }

    /// Parks the current task.
    ///
    /// On the first park of a freshly spawned task control returns to the
    /// spawner; afterwards it returns to the run-loop task and the park is
    /// ended by a dispatch of the task's resume entry.
    pub(crate) fn schedule(&self) {
        let current = self.current.get();
        assert!(
            !current.is_thread_task(),
            "the run-loop task cannot be parked"
        );

        if current.poll_status() != TaskStatus::Zombie {
            current.set_status(TaskStatus::Parked);
        }

        if let Some(parent) = current.take_parent() {
            self.yield_to(parent);
        } else {
            let entry = current
                .resume_entry()
                .expect("task parked without a resume entry");
            // Forbid steals until the switch-out completes, then allow any
            // carrier to pick the entry up.
            current.lock_steal();
            entry.set_steal_enabled(true);
            // Nothing owned may live across this switch: a task that exits
            // never returns here, and its abandoned frame must not leak.
            drop(entry);
            self.yield_to(self.thread_task.as_ref_ptr());
        }

        // Resumed, possibly on a different carrier.
        let carrier = current_carrier().expect("task resumed on a thread without a carrier");
        debug_assert!(carrier.current.get().same_task(current));
        // The wake that ended this park is consumed; the entry may be
        // enqueued again from now on.
        if let Some(entry) = current.resume_entry() {
            entry.mark_dequeued();
        }
        if carrier.runtime.has_been_shutdown() && !current.is_shutdown_task() {
            std::panic::resume_unwind(Box::new(ShutdownSignal));
        }
    }

    /// Requests dispatch of a parked task owned by this carrier.
    pub(crate) fn wakeup_task(&self, task: TaskRef) {
        debug_assert!(Arc::ptr_eq(&task.carrier(), &self.shared));
        scheduler::wakeup_task(task);
    }

    /// Moves ownership of a suspended task to this carrier.
    pub(crate) fn steal_task(&self, task: TaskRef) -> Result<(), StealFailure> {
        if self.runtime.has_been_shutdown() {
            return Err(StealFailure::ByStatus);
        }
        if Arc::ptr_eq(&task.carrier(), &self.shared) {
            return Ok(());
        }

        // The window between "published for stealing" and "registers
        // saved" is a few instructions; spin it out.
        let mut spin = SpinWait::new();
        while task.steal_locked() {
            spin.spin_yield_thread();
        }
        debug_assert!(task.parent_is_none());

        match task.ctx().steal() {
            Ok(()) => {
                task.set_carrier(self.shared.clone());
                let nth = task.add_steal();
                self.shared.steals.fetch_add(1, Ordering::AcqRel);
                debug!("stole task {:?} (steal #{})", task.name(), nth);
                Ok(())
            }
            Err(failure) => {
                task.add_steal_failure();
                self.shared.steal_failures.fetch_add(1, Ordering::AcqRel);
                Err(failure)
            }
        }
    }

    /// Sole exit path of a task. Marks it zombie, returns it to a cache
    /// and picks the next task. Never returns.
    pub(crate) fn task_exit(&self, aborted: bool) -> ! {
        let task = self.current.get();
        debug_assert!(!task.is_thread_task());
        trace!("task {:?} exiting (aborted: {})", task.name(), aborted);

        task.set_status(TaskStatus::Zombie);
        let remaining = self.runtime.remove_running_task();

        self.unregister_event_of(task);
        if let Some(binding) = task.take_timer() {
            binding.cancel();
        }
        // A timer deferred to the epilog but never installed dies with the
        // task.
        self.pending_timer.borrow_mut().take();

        let completion = task.completion();
        let owner = task
            .take_strong()
            .expect("exiting task has no owning handle");

        self.enter_critical();
        self.recycle(owner);
        self.exit_critical();

        // Reset the thread identity only after caching, so identity
        // queries still resolve during the exit path.
        task.clear_thread_name();

        completion.finish(aborted);
        drop(completion);
        if remaining == 0 && self.runtime.has_been_shutdown() {
            self.runtime.scheduler().signal_all();
        }

        self.schedule();
        unreachable!("a zombie task was resumed");
    }

    fn recycle(&self, task: Pin<Arc<RawTask>>) {
        debug_assert!(self.in_critical.get());
        let mut cache = self.task_cache.borrow_mut();
        if cache.len() < self.runtime.task_cache_size() && !self.runtime.has_been_shutdown() {
            cache.push(task);
            self.shared.cached_tasks.fetch_add(1, Ordering::AcqRel);
        } else {
            drop(cache);
            self.runtime.return_cached_task(task);
        }
    }

    /// Cooperative yield: if other entries are queued on this worker, park
    /// behind them; otherwise yield the OS thread.
    pub fn yield_now(&self) {
        if !self.runtime.high_precision_timer() {
            if let Some(worker) = self.shared.worker() {
                worker.wheel().fire_due(Instant::now());
            }
        }

        let current = self.current.get();
        if !current.is_thread_task() {
            if let Some(worker) = self.shared.worker() {
                if worker.queue_length() > 0 {
                    trace!("task {:?} yielding to the runqueue", current.name());
                    // Re-enqueueing is deferred to the epilog; doing it here
                    // would let another worker steal a still-running stack.
                    self.yielding_task.set(Some(current));
                    self.schedule();
                    return;
                }
            }
        }
        std::thread::yield_now();
    }

    /// Epilog work after every resume into the run-loop task: install a
    /// deferred high-precision timer and re-enqueue a yielded task.
    pub(crate) fn run_epilog(&self) {
        if let Some(binding) = self.pending_timer.borrow_mut().take() {
            if let Some(service) = self.runtime.timer_service() {
                service.schedule(binding);
            }
        }
        if let Some(task) = self.yielding_task.take() {
            // The yielding task cannot have been stolen: its entry was not
            // enqueued anywhere until now.
            self.wakeup_task(task);
        }
    }

    /// Registers the current task's interest in channel readiness.
    pub fn register_event(&self, channel: ChannelId, interest: Interest) -> Result<(), Error> {
        let pump = self
            .runtime
            .event_pump()
            .ok_or(Error::InvalidState("no event pump configured"))?;
        let task = self.current.get();
        task.set_channel(channel);
        task.set_register_event_time(Instant::now());
        pump.register(WakeupHandle::new(task, task.epoch()), channel, interest);
        Ok(())
    }

    /// Clears the current task's channel registration.
    pub fn unregister_event(&self) {
        self.unregister_event_of(self.current.get());
    }

    fn unregister_event_of(&self, task: TaskRef) {
        if let Some(channel) = task.take_channel() {
            if let Some(pump) = self.runtime.event_pump() {
                pump.deregister(channel);
            }
        }
    }

    /// Arms a timer that unparks the current task at `deadline`.
    ///
    /// Low-precision timers go onto the worker's wheel. High-precision
    /// timers are handed to the shared timer service; from inside a task
    /// the registration is deferred to the run-loop epilog, because the
    /// service could park the registering stack mid-switch.
    pub(crate) fn add_timer(&self, deadline: Instant) -> Result<Arc<TimerBinding>, Error> {
        let task = self.current.get();
        let binding = TimerBinding::new(task, task.epoch(), deadline);
        task.set_timer(binding.clone());

        if !self.runtime.high_precision_timer() {
            let worker = self
                .shared
                .worker()
                .ok_or(Error::InvalidState("a detached carrier has no timer wheel"))?;
            self.runtime.scheduler().add_timer(binding.clone(), worker);
        } else if task.is_thread_task() {
            if let Some(service) = self.runtime.timer_service() {
                service.schedule(binding.clone());
            }
        } else {
            *self.pending_timer.borrow_mut() = Some(binding.clone());
        }
        Ok(binding)
    }

    /// Cancels the current task's timer, if armed. A canceled timer's fire
    /// is a no-op.
    pub(crate) fn cancel_timer(&self) {
        if let Some(binding) = self.current.get().take_timer() {
            binding.cancel();
        }
        self.pending_timer.borrow_mut().take();
    }

    /// Requests that the scheduler detach this carrier's worker for the
    /// duration of a presumed blocking syscall.
    pub fn hand_off(&self) -> Result<(), Error> {
        let worker = self
            .shared
            .worker()
            .ok_or(Error::InvalidState("a detached carrier has no worker"))?;
        self.runtime.scheduler().hand_off(worker);
        Ok(())
    }

    /// Frees the recycled tasks held by this carrier and marks it
    /// terminated.
    pub(crate) fn destroy(&self) {
        let freed = {
            let mut cache = self.task_cache.borrow_mut();
            let freed = cache.len();
            cache.clear();
            freed
        };
        self.pending_timer.borrow_mut().take();
        self.shared.cached_tasks.store(0, Ordering::Release);
        self.shared.terminated.store(true, Ordering::Release);
        debug!("carrier destroyed, {} cached tasks freed", freed);
    }

    #[inline]
    pub(crate) fn current_task(&self) -> TaskRef {
        self.current.get()
    }

    #[inline]
    pub(crate) fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }
}

impl std::fmt::Debug for Carrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Carrier")
            .field("worker", &self.worker_id())
            .field("in_critical", &self.in_critical.get())
            .finish_non_exhaustive()
    }
}

/// Dispatches one resume entry on `carrier`, stealing the task over first
/// when another carrier owns it.
///
/// The entry's enqueue slot stays claimed until the resumed task clears it;
/// a wake arriving mid-dispatch therefore cannot enqueue a second copy.
/// When the dispatch has to bounce the entry back to the owning carrier it
/// re-pushes the claimed entry directly.
pub(crate) fn dispatch_entry(carrier: &'static Carrier, entry: &Arc<ResumeEntry>) {
    let task = entry.task();
    if entry.epoch() != task.epoch() || task.poll_status() == TaskStatus::Zombie {
        // Entry of an exited or recycled incarnation.
        entry.mark_dequeued();
        return;
    }

    let owner = task.carrier();
    if !Arc::ptr_eq(&owner, carrier.shared()) {
        if !entry.steal_enabled() {
            requeue_on(entry, &owner);
            return;
        }
        match carrier.steal_task(task) {
            Ok(()) => {
                // Draining the last entry of a handed-off worker lets it
                // exit its blocking section cleanly.
                if let Some(worker) = owner.worker() {
                    if worker.queue_length() == 0 && worker.has_been_handoff() {
                        worker.signal();
                    }
                }
            }
            Err(StealFailure::ByContention) => {
                requeue_on(entry, &owner);
                return;
            }
            Err(failure) => {
                trace!("disabling steals for task {:?}: {:?}", task.name(), failure);
                entry.set_steal_enabled(false);
                requeue_on(entry, &owner);
                return;
            }
        }
    }

    if let Some(enqueued_at) = task.take_enqueue_time() {
        carrier.shared().record_enqueue_latency(enqueued_at.elapsed());
    }
    carrier.yield_to(task);
}

/// Hands a still-claimed entry back to the worker of the carrier that owns
/// its task.
fn requeue_on(entry: &Arc<ResumeEntry>, owner: &Arc<CarrierShared>) {
    match owner.worker() {
        Some(worker) => worker.push(entry.clone()),
        None => {
            error!("dropping a resume entry owned by a detached carrier");
            entry.mark_dequeued();
        }
    }
}

/// Reclaims a worker carrier; forwarded from the worker loop.
pub(crate) fn unbind_worker(carrier: &'static Carrier) {
    Carrier::unbind_worker(carrier);
}

/// Trampoline every task stack starts in: complete the inbound switch, run
/// the task body, catch unwinds (including the shutdown signal) and leave
/// through `task_exit`.
pub(crate) extern "C" fn task_main(transfer: Transfer) -> ! {
    unsafe { coroutine::finish_switch(transfer) };

    let carrier = current_carrier().expect("task started on a thread without a carrier");
    let task = carrier.current_task();
    // First resume of this incarnation: consume the wake that started it.
    if let Some(entry) = task.resume_entry() {
        entry.mark_dequeued();
    }
    let entry = task.take_entry();

    let mut aborted = false;
    if let Some(entry) = entry {
        if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(entry)) {
            aborted = true;
            if !payload.is::<ShutdownSignal>() {
                error!("task {:?} panicked", task.name());
            }
        }
    }

    // The body may have migrated across carriers; resolve again for the
    // exit path.
    let carrier = current_carrier().expect("task finished on a thread without a carrier");
    carrier.task_exit(aborted)
}
