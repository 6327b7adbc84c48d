//! Thin wrapper around the stackful context-switch primitive.
//!
//! Every switch is a `Context::resume` carrying the yielding task's pointer
//! in `Transfer::data`. The side that is resumed writes the returned context
//! back into the yielding task's slot; only after that write-back is the
//! task marked `Suspended`, so "registers fully saved" is an observable
//! state and the steal path can refuse half-switched stacks.

use crate::error::StealFailure;
use crate::raw_task::TaskRef;
use atomic::Atomic;
use context::stack::ProtectedFixedSizeStack;
use context::{Context, Transfer};
use std::cell::RefCell;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};

/// Unwind payload injected into tasks that resume after the runtime has
/// been shut down.
#[derive(Debug)]
pub(crate) struct ShutdownSignal;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ContextState {
    /// The stack is live on some OS thread, or has never been entered.
    Running,
    /// The stack is fully switched out; its context is saved in `context`.
    Suspended,
}

/// Coroutine half of a task: the stack, the saved machine context and the
/// state machine that makes stealing sound.
pub(crate) struct TaskContext {
    stack: Option<ProtectedFixedSizeStack>,
    context: RefCell<Option<Context>>,
    state: Atomic<ContextState>,
    steal_guard: AtomicBool,
}

impl TaskContext {
    /// Context backed by its own protected stack; used by every spawned
    /// task.
    pub fn with_stack(stack: ProtectedFixedSizeStack) -> Self {
        Self {
            stack: Some(stack),
            context: RefCell::new(None),
            state: Atomic::new(ContextState::Running),
            steal_guard: AtomicBool::new(false),
        }
    }

    /// Context of a run-loop task. It executes on the native thread stack,
    /// so there is nothing to allocate; the context slot is filled the
    /// first time the thread switches away.
    pub fn native() -> Self {
        Self {
            stack: None,
            context: RefCell::new(None),
            state: Atomic::new(ContextState::Running),
            steal_guard: AtomicBool::new(false),
        }
    }

    /// Discards whatever the context slot holds and arranges for the next
    /// resume to enter `entry` at the top of the task's stack.
    pub fn prime(&self, entry: extern "C" fn(Transfer) -> !) {
        let stack = self
            .stack
            .as_ref()
            .expect("cannot prime a native-stack context");
        let context = unsafe { Context::new(&*stack, entry) };
        *self.context.borrow_mut() = Some(context);
        self.state.store(ContextState::Suspended, Ordering::Release);
    }

    pub fn state(&self) -> ContextState {
        self.state.load(Ordering::Acquire)
    }

    fn take_context(&self) -> Context {
        self.context
            .borrow_mut()
            .take()
            .expect("switched to a task without a saved context")
    }

    /// Claims a suspended stack for the calling OS thread.
    ///
    /// Fails with `ByContention` when another thread holds the guard and
    /// with `ByRacingWorker` when the stack has not finished switching out.
    pub fn steal(&self) -> Result<(), StealFailure> {
        if self
            .steal_guard
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(StealFailure::ByContention);
        }

        let result = if self.state() == ContextState::Suspended && self.context.borrow().is_some() {
            Ok(())
        } else {
            Err(StealFailure::ByRacingWorker)
        };

        self.steal_guard.store(false, Ordering::Release);
        result
    }
}

impl Debug for TaskContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("native", &self.stack.is_none())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Switches the calling OS thread from `from`'s stack onto `to`'s stack.
///
/// Returns when somebody switches back into `from`, which may happen on a
/// different OS thread; the caller must re-resolve every thread-bound
/// reference afterwards.
///
/// # Safety
///
/// `to` must hold a suspended context and must not be running anywhere, and
/// both tasks must outlive the switch.
pub(crate) unsafe fn switch(from: TaskRef, to: TaskRef) {
    let context = to.ctx().take_context();
    to.ctx().state.store(ContextState::Running, Ordering::Release);

    let transfer = context.resume(from.as_usize());
    finish_switch(transfer);
}

/// Second half of a switch, run by the side that has just been resumed:
/// store the yielding task's context and publish it as fully suspended.
///
/// # Safety
///
/// `transfer` must come from a [`switch`] (or from the first entry into a
/// primed context), so that `transfer.data` is a valid task pointer.
pub(crate) unsafe fn finish_switch(transfer: Transfer) {
    let yielder = TaskRef::from_usize(transfer.data);
    *yielder.ctx().context.borrow_mut() = Some(transfer.context);
    yielder
        .ctx()
        .state
        .store(ContextState::Suspended, Ordering::Release);
    // The yielder's registers are saved; lift its steal protection.
    yielder.clear_steal_lock();
}
