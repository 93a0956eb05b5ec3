//! Direct-to-task notifications
//!
//! Every task has a 32-bit notification value and a pending flag. A
//! notification updates the value, sets the flag, and wakes the task if it's
//! waiting in [`System::notify_take`] or [`System::notify_wait`]. This is a
//! lightweight substitute for a binary or counting semaphore, or an event
//! group, that has exactly one receiver.
use crate::{
    error::{NotifyError, WaitTimeoutError},
    klock,
    sched::{self, CoreSet, Scheduler},
    state,
    task::{TaskIndex, TaskSt},
    utils::OrFatal,
    wait::{self, WaitOn, WaitResult},
    Fatal, KernelTraits, System, Tick, TaskId,
};

/// The update applied by [`System::notify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyAction {
    /// Leave the value unchanged.
    NoAction,
    /// Bitwise-OR the value with the given bits.
    SetBits(u32),
    /// Increment the value.
    Increment,
    /// Replace the value.
    SetValueWithOverwrite(u32),
    /// Replace the value unless a previous notification is still pending,
    /// in which case the notification fails with `QueueOverflow`.
    SetValueWithoutOverwrite(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NotifyState {
    pub(crate) value: u32,
    pub(crate) pending: bool,
}

impl NotifyState {
    pub(crate) const INIT: Self = Self {
        value: 0,
        pending: false,
    };
}

impl<P> Scheduler<P> {
    /// Deliver a notification. Returns `None` if the notification was
    /// rejected because of [`NotifyAction::SetValueWithoutOverwrite`].
    pub(crate) fn notify(&mut self, i: TaskIndex, action: NotifyAction) -> Result<Option<CoreSet>, Fatal> {
        let task_cb = &self.tasks[i];
        let mut state = task_cb.notification.get();

        match action {
            NotifyAction::NoAction => {}
            NotifyAction::SetBits(bits) => state.value |= bits,
            NotifyAction::Increment => state.value = state.value.wrapping_add(1),
            NotifyAction::SetValueWithOverwrite(value) => state.value = value,
            NotifyAction::SetValueWithoutOverwrite(_) if state.pending => return Ok(None),
            NotifyAction::SetValueWithoutOverwrite(value) => state.value = value,
        }
        state.pending = true;
        task_cb.notification.set(state);

        if task_cb.st() == TaskSt::Blocked && task_cb.wait.get().on == Some(WaitOn::Notification) {
            self.wake(i, WaitResult::Woken).map(Some)
        } else {
            Ok(Some(CoreSet::EMPTY))
        }
    }
}

/// These associate functions implement the notification-related portion of
/// the API. The senders can be called from an interrupt handler.
impl<Traits: KernelTraits> System<Traits> {
    /// Increment a task's notification value. Equivalent to
    /// `notify(task, NotifyAction::Increment)`.
    pub fn notify_give(task: TaskId) -> Result<(), NotifyError> {
        Self::notify(task, NotifyAction::Increment)
    }

    /// Send a notification to a task.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn notify(task: TaskId, action: NotifyAction) -> Result<(), NotifyError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let sched = lock.sched();
        let i = sched.resolve(task)?;
        let cores = sched
            .notify(i, action)
            .or_fatal::<Traits>()
            .ok_or(NotifyError::QueueOverflow)?;
        sched::unlock_cpu_and_request_switch(lock, cores);
        Ok(())
    }

    /// Wait for the calling task's notification value to become non-zero,
    /// then decrement it (or clear it if `clear_on_exit` is set). Returns the
    /// value before the update.
    ///
    /// This is the receiving side of [`Self::notify_give`], with the
    /// notification value used as a counting (or binary, with
    /// `clear_on_exit`) semaphore.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn notify_take(clear_on_exit: bool, timeout: Option<Tick>) -> Result<u32, WaitTimeoutError> {
        state::expect_task_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        let core = lock.core();
        let i = lock.sched().running(core).ok_or(WaitTimeoutError::BadContext)?;

        let mut result = WaitResult::Timeout;
        if lock.sched().task_cb(i).notification.get().value == 0 && timeout != Some(0) {
            state::expect_waitable_context::<Traits>(&mut lock)?;
            let (new_lock, r) = wait::block_current(lock, timeout, WaitOn::Notification)?;
            lock = new_lock;
            result = r;
        }

        let task_cb = lock.sched().task_cb(i);
        let mut state = task_cb.notification.get();
        let value = state.value;
        state.pending = false;
        if value != 0 {
            state.value = if clear_on_exit { 0 } else { value - 1 };
        }
        task_cb.notification.set(state);

        match (value, result) {
            (0, WaitResult::Interrupted) => Err(WaitTimeoutError::Interrupted),
            (0, _) => Err(WaitTimeoutError::Timeout),
            _ => Ok(value),
        }
    }

    /// Wait for a notification to be pending for the calling task, then
    /// return its value.
    ///
    /// The bits in `clear_on_entry` are cleared from the value if no
    /// notification is pending on entry; those in `clear_on_exit` are
    /// cleared after receiving a notification.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn notify_wait(
        clear_on_entry: u32,
        clear_on_exit: u32,
        timeout: Option<Tick>,
    ) -> Result<u32, WaitTimeoutError> {
        state::expect_task_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        let core = lock.core();
        let i = lock.sched().running(core).ok_or(WaitTimeoutError::BadContext)?;

        let mut result = WaitResult::Timeout;
        let task_cb = lock.sched().task_cb(i);
        let mut state = task_cb.notification.get();
        if !state.pending {
            state.value &= !clear_on_entry;
            task_cb.notification.set(state);

            if timeout != Some(0) {
                state::expect_waitable_context::<Traits>(&mut lock)?;
                let (new_lock, r) = wait::block_current(lock, timeout, WaitOn::Notification)?;
                lock = new_lock;
                result = r;
            }
        }

        let task_cb = lock.sched().task_cb(i);
        let mut state = task_cb.notification.get();
        if !state.pending {
            return Err(match result {
                WaitResult::Interrupted => WaitTimeoutError::Interrupted,
                _ => WaitTimeoutError::Timeout,
            });
        }

        let value = state.value;
        state.value &= !clear_on_exit;
        state.pending = false;
        task_cb.notification.set(state);
        Ok(value)
    }

    /// Clear a task's pending notification. Returns `true` if one was
    /// pending.
    pub fn notify_state_clear(task: TaskId) -> Result<bool, NotifyError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let sched = lock.sched();
        let i = sched.resolve(task)?;
        let task_cb = sched.task_cb(i);
        let mut state = task_cb.notification.get();
        let was_pending = core::mem::replace(&mut state.pending, false);
        task_cb.notification.set(state);
        Ok(was_pending)
    }
}
