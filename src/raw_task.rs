use crate::carrier::CarrierShared;
use crate::coroutine::TaskContext;
use crate::error::Error;
use crate::event::ChannelId;
use crate::timer::TimerBinding;
use atomic::Atomic;
use context::stack::ProtectedFixedSizeStack;
use context::Transfer;
use parking_lot::{Condvar, Mutex};
use std::cell::{Cell, RefCell};
use std::fmt::{Debug, Formatter};
use std::marker::PhantomPinned;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Name of the distinguished task that is still allowed to spawn after the
/// runtime has been shut down.
pub(crate) const SHUTDOWN_TASK_NAME: &str = "fiber-shutdown";

#[derive(Debug, Copy, Clone, Hash, Ord, PartialOrd, PartialEq, Eq)]
pub(crate) enum TaskStatus {
    Runnable,
    Parked,
    Zombie,
}

/// A coroutine: stack context, status and scheduling metadata.
///
/// Tasks are pinned and recycled; `reset` turns a cached zombie into a
/// logically new task on the same stack. The `epoch` counter distinguishes
/// incarnations so that stale handles and late wakeups resolve to no-ops.
pub(crate) struct RawTask {
    name: RefCell<String>,
    status: Atomic<TaskStatus>,
    carrier: Mutex<Option<Arc<CarrierShared>>>,
    parent: Cell<Option<TaskRef>>,
    resume_entry: Mutex<Option<Arc<ResumeEntry>>>,
    is_thread_task: Cell<bool>,
    is_shutdown_task: Cell<bool>,
    steal_lock: AtomicU32,
    steal_count: AtomicUsize,
    steal_failure_count: AtomicUsize,
    epoch: AtomicU64,
    enqueue_time: Mutex<Option<Instant>>,
    register_event_time: Cell<Option<Instant>>,
    channel: Cell<Option<ChannelId>>,
    time_out: RefCell<Option<Arc<TimerBinding>>>,
    entry: RefCell<Option<Box<dyn FnOnce() + Send>>>,
    completion: RefCell<Arc<Completion>>,
    thread_name: RefCell<Option<String>>,
    execution_nanos: AtomicU64,
    strong_handle: RefCell<Option<Pin<Arc<RawTask>>>>,
    ctx: TaskContext,
    _pinned: PhantomPinned,
}

// Cross-thread access is funneled through the scheduling protocol: a task
// is mutated either by the carrier currently running it or, for the fields
// behind locks and atomics, by wakers and thieves.
unsafe impl Send for RawTask {}
unsafe impl Sync for RawTask {}

impl RawTask {
    /// Allocates a task together with its protected stack.
    pub fn new(stack_size: usize) -> Result<Pin<Arc<Self>>, Error> {
        let stack = ProtectedFixedSizeStack::new(stack_size)
            .map_err(|_| Error::ResourceExhausted("could not allocate a task stack"))?;
        Ok(Arc::pin(Self::with_context(TaskContext::with_stack(stack))))
    }

    /// Creates the run-loop task of a carrier. It executes on the native
    /// thread stack and is never enqueued, stolen or recycled.
    pub fn new_thread_task(name: &str) -> Pin<Arc<Self>> {
        let task = Arc::pin(Self::with_context(TaskContext::native()));
        task.is_thread_task.set(true);
        // Live from the start: the zombie check in yield_to must never
        // refuse a switch back to the run loop.
        task.set_status(TaskStatus::Runnable);
        *task.name.borrow_mut() = name.into();
        *task.thread_name.borrow_mut() = Some(name.into());
        task
    }

    fn with_context(ctx: TaskContext) -> Self {
        Self {
            name: RefCell::new(String::new()),
            status: Atomic::new(TaskStatus::Zombie),
            carrier: Mutex::new(None),
            parent: Cell::new(None),
            resume_entry: Mutex::new(None),
            is_thread_task: Cell::new(false),
            is_shutdown_task: Cell::new(false),
            steal_lock: AtomicU32::new(0),
            steal_count: AtomicUsize::new(0),
            steal_failure_count: AtomicUsize::new(0),
            epoch: AtomicU64::new(0),
            enqueue_time: Mutex::new(None),
            register_event_time: Cell::new(None),
            channel: Cell::new(None),
            time_out: RefCell::new(None),
            entry: RefCell::new(None),
            completion: RefCell::new(Arc::new(Completion::new())),
            thread_name: RefCell::new(None),
            execution_nanos: AtomicU64::new(0),
            strong_handle: RefCell::new(None),
            ctx,
            _pinned: PhantomPinned,
        }
    }

    /// Re-creates a logically new task on the same stack. `owner` is the
    /// task's own pinned allocation; it is held by the task until
    /// `take_strong` releases it on exit.
    ///
    /// Must only be called on a zombie owned by the resetting carrier; the
    /// previous incarnation's suspended frame is discarded.
    pub fn reset(
        &self,
        owner: Pin<Arc<RawTask>>,
        entry: Box<dyn FnOnce() + Send>,
        name: &str,
        parent: Option<TaskRef>,
        carrier: Arc<CarrierShared>,
        trampoline: extern "C" fn(Transfer) -> !,
    ) {
        debug_assert!(std::ptr::eq(&*owner, self));
        debug_assert_eq!(self.poll_status(), TaskStatus::Zombie);
        debug_assert!(!self.is_thread_task.get());

        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;

        *self.name.borrow_mut() = name.into();
        *self.thread_name.borrow_mut() = Some(name.into());
        self.is_shutdown_task.set(name == SHUTDOWN_TASK_NAME);
        *self.carrier.lock() = Some(carrier);
        self.parent.set(parent);
        *self.resume_entry.lock() = Some(Arc::new(ResumeEntry::new(self.as_ref_ptr(), epoch)));
        self.steal_lock.store(0, Ordering::Release);
        self.steal_count.store(0, Ordering::Release);
        self.steal_failure_count.store(0, Ordering::Release);
        *self.enqueue_time.lock() = None;
        self.register_event_time.set(None);
        self.channel.set(None);
        *self.time_out.borrow_mut() = None;
        *self.entry.borrow_mut() = Some(entry);
        *self.completion.borrow_mut() = Arc::new(Completion::new());
        self.execution_nanos.store(0, Ordering::Release);
        *self.strong_handle.borrow_mut() = Some(owner);
        self.ctx.prime(trampoline);
        self.set_status(TaskStatus::Runnable);
    }

    #[inline]
    pub fn as_ref_ptr(&self) -> TaskRef {
        TaskRef(self as *const RawTask)
    }

    #[inline]
    pub fn ctx(&self) -> &TaskContext {
        &self.ctx
    }

    #[inline]
    pub fn poll_status(&self) -> TaskStatus {
        self.status.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_status(&self, status: TaskStatus) {
        self.status.store(status, Ordering::Release)
    }

    /// The carrier that currently owns this task.
    pub fn carrier(&self) -> Arc<CarrierShared> {
        self.carrier
            .lock()
            .clone()
            .expect("task is not bound to a carrier")
    }

    /// Rebinds the task to a new carrier. Only a successful steal and
    /// `reset` may do this.
    pub fn set_carrier(&self, carrier: Arc<CarrierShared>) {
        *self.carrier.lock() = Some(carrier);
    }

    #[inline]
    pub fn take_parent(&self) -> Option<TaskRef> {
        self.parent.take()
    }

    #[inline]
    pub fn parent_is_none(&self) -> bool {
        self.parent.get().is_none()
    }

    pub fn resume_entry(&self) -> Option<Arc<ResumeEntry>> {
        self.resume_entry.lock().clone()
    }

    #[inline]
    pub fn is_thread_task(&self) -> bool {
        self.is_thread_task.get()
    }

    #[inline]
    pub fn is_shutdown_task(&self) -> bool {
        self.is_shutdown_task.get()
    }

    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    #[inline]
    pub fn lock_steal(&self) {
        self.steal_lock.store(1, Ordering::Release);
    }

    #[inline]
    pub fn steal_locked(&self) -> bool {
        self.steal_lock.load(Ordering::Acquire) != 0
    }

    #[inline]
    pub fn clear_steal_lock(&self) {
        self.steal_lock.store(0, Ordering::Release);
    }

    pub fn add_steal(&self) -> usize {
        self.steal_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn add_steal_failure(&self) -> usize {
        self.steal_failure_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn set_enqueue_time(&self, at: Instant) {
        *self.enqueue_time.lock() = Some(at);
    }

    pub fn take_enqueue_time(&self) -> Option<Instant> {
        self.enqueue_time.lock().take()
    }

    pub fn set_register_event_time(&self, at: Instant) {
        self.register_event_time.set(Some(at));
    }

    pub fn set_channel(&self, channel: ChannelId) {
        self.channel.set(Some(channel));
    }

    /// Clears the channel reference so a late readiness notification cannot
    /// re-wake an unrelated reincarnation of this task.
    pub fn take_channel(&self) -> Option<ChannelId> {
        self.register_event_time.set(None);
        self.channel.take()
    }

    pub fn set_timer(&self, binding: Arc<TimerBinding>) {
        *self.time_out.borrow_mut() = Some(binding);
    }

    pub fn take_timer(&self) -> Option<Arc<TimerBinding>> {
        self.time_out.borrow_mut().take()
    }

    pub fn take_entry(&self) -> Option<Box<dyn FnOnce() + Send>> {
        self.entry.borrow_mut().take()
    }

    pub fn completion(&self) -> Arc<Completion> {
        self.completion.borrow().clone()
    }

    pub fn name(&self) -> String {
        self.name.borrow().clone()
    }

    pub fn thread_name(&self) -> Option<String> {
        self.thread_name.borrow().clone()
    }

    /// Drops the thread identity. Happens only after the task has been
    /// returned to a cache, so identity queries still resolve during the
    /// exit path itself.
    pub fn clear_thread_name(&self) {
        *self.thread_name.borrow_mut() = None;
    }

    pub fn record_execution(&self, elapsed: Duration) {
        self.execution_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::AcqRel);
    }

    pub fn take_strong(&self) -> Option<Pin<Arc<RawTask>>> {
        self.strong_handle.borrow_mut().take()
    }
}

impl Debug for RawTask {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawTask")
            .field("name", &self.name.borrow())
            .field("status", &self.poll_status())
            .field("epoch", &self.epoch())
            .field("is_thread_task", &self.is_thread_task.get())
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

/// Borrowed view of a task, valid while the task is registered with the
/// runtime.
#[derive(Copy, Clone)]
pub(crate) struct TaskRef(*const RawTask);

unsafe impl Send for TaskRef {}

impl TaskRef {
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// # Safety
    ///
    /// `value` must originate from [`TaskRef::as_usize`] of a still-live
    /// task.
    #[inline]
    pub unsafe fn from_usize(value: usize) -> Self {
        Self(value as *const RawTask)
    }

    #[inline]
    pub fn same_task(self, other: TaskRef) -> bool {
        std::ptr::eq(self.0, other.0)
    }
}

impl Deref for TaskRef {
    type Target = RawTask;

    #[inline]
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.0 }
    }
}

impl Debug for TaskRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&**self, f)
    }
}

/// Single-shot queue entry that resumes exactly one task when dispatched by
/// a worker.
#[derive(Debug)]
pub(crate) struct ResumeEntry {
    task: TaskRef,
    epoch: u64,
    steal_enable: AtomicBool,
    enqueued: AtomicBool,
}

unsafe impl Send for ResumeEntry {}
unsafe impl Sync for ResumeEntry {}

impl ResumeEntry {
    fn new(task: TaskRef, epoch: u64) -> Self {
        Self {
            task,
            epoch,
            steal_enable: AtomicBool::new(false),
            enqueued: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn task(&self) -> TaskRef {
        self.task
    }

    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    #[inline]
    pub fn steal_enabled(&self) -> bool {
        self.steal_enable.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_steal_enabled(&self, enabled: bool) {
        self.steal_enable.store(enabled, Ordering::Release)
    }

    /// Claims the enqueue slot. Each claim is paired with exactly one
    /// dispatch, which keeps the entry single-consumer per park.
    #[inline]
    pub fn try_enqueue(&self) -> bool {
        self.enqueued
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn mark_dequeued(&self) {
        self.enqueued.store(false, Ordering::Release)
    }
}

/// Join/abort record shared between a task and its handles. Outlives the
/// task incarnation it was created for.
#[derive(Debug)]
pub(crate) struct Completion {
    done: Mutex<bool>,
    done_cv: Condvar,
    aborted: AtomicBool,
}

impl Completion {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            done_cv: Condvar::new(),
            aborted: AtomicBool::new(false),
        }
    }

    pub fn finish(&self, aborted: bool) {
        if aborted {
            self.aborted.store(true, Ordering::Release);
        }
        let mut done = self.done.lock();
        *done = true;
        self.done_cv.notify_all();
    }

    pub fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.done_cv.wait(&mut done);
        }
    }

    pub fn is_done(&self) -> bool {
        *self.done.lock()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

/// Owner-facing handle to a spawned task.
///
/// The handle stays valid after the task exits; operations on a recycled
/// task degrade to no-ops (`unpark`) or report completion (`join`).
#[derive(Debug)]
pub struct TaskHandle {
    task: TaskRef,
    epoch: u64,
    completion: Arc<Completion>,
}

unsafe impl Send for TaskHandle {}
unsafe impl Sync for TaskHandle {}

impl TaskHandle {
    pub(crate) fn new(task: TaskRef, epoch: u64, completion: Arc<Completion>) -> Self {
        Self {
            task,
            epoch,
            completion,
        }
    }

    /// Blocks the calling OS thread until the task exits.
    ///
    /// Meant for threads outside the worker pool; joining from inside a
    /// task stalls the whole carrier.
    pub fn join(&self) -> Result<(), Error> {
        self.completion.wait();
        if self.completion.is_aborted() {
            Err(Error::TaskAborted)
        } else {
            Ok(())
        }
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.completion.is_done()
    }

    /// Whether the task is currently parked. A snapshot; the task may be
    /// woken concurrently.
    pub fn is_parked(&self) -> bool {
        self.task.epoch() == self.epoch && self.task.poll_status() == TaskStatus::Parked
    }

    /// Makes the task runnable again if it is parked. Waking a task that
    /// has not parked yet is remembered and consumed by its next park.
    pub fn unpark(&self) {
        unpark(self.task, self.epoch);
    }
}

/// Epoch-checked unpark: wakes the given incarnation of a task through the
/// standard scheduler path, and does nothing if the task has since exited.
pub(crate) fn unpark(task: TaskRef, epoch: u64) {
    if task.epoch() != epoch || task.poll_status() == TaskStatus::Zombie {
        return;
    }
    crate::scheduler::wakeup_task(task);
}
