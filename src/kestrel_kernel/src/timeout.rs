//! Tick counting, delays, and timeouts
//!
//! Delayed tasks are kept on two lists sorted by their absolute wake tick.
//! A wake tick that numerically wraps past `Tick::MAX` belongs to the
//! *overflow* list; when the tick count itself wraps to zero, the roles of
//! the two lists are exchanged. This way, comparing two wake ticks on the
//! same list never has to account for wraparound.
use core::sync::atomic::Ordering;

use crate::{
    error::{AbortDelayError, BadContextError, DelayError},
    klock,
    sched::{self, Scheduler, StateList},
    state,
    task::{state_list, TaskIndex, TaskPool, TaskSt},
    utils::{intrusive_list::ListHead, OrFatal},
    wait::{self, WaitOn, WaitResult},
    Fatal, KernelTraits, System, TaskId,
};

/// Represents an absolute time or a duration in ticks.
pub type Tick = u32;

pub(crate) struct DelayedLists {
    lists: [ListHead<TaskIndex>; 2],
    /// The index of the list holding wake ticks in the current epoch.
    near: u8,
    /// The wake tick of the head of the near list, or `Tick::MAX` if it's
    /// empty. Ticks before this can skip looking at the list.
    next_unblock: Tick,
}

impl DelayedLists {
    pub(crate) const fn new() -> Self {
        Self {
            lists: [ListHead::new(); 2],
            near: 0,
            next_unblock: Tick::MAX,
        }
    }

    /// Insert a task, keeping the list sorted by wake tick. Tasks with the
    /// same wake tick wake in insertion order.
    pub(crate) fn insert<P>(
        &mut self,
        tasks: &TaskPool<P>,
        i: TaskIndex,
        now: Tick,
        wake_at: Tick,
    ) -> Result<(), Fatal> {
        if tasks[i].state_list.get() != StateList::Detached {
            return Err(Fatal::ContractViolation("delaying a task that is still queued"));
        }

        let which = if wake_at < now { self.near ^ 1 } else { self.near };
        let mut list = state_list(&mut self.lists[which as usize], tasks);

        let mut at = None;
        for j in list.iter() {
            let j = j?;
            if tasks[j].wake_at.get() > wake_at {
                at = Some(j);
                break;
            }
        }
        list.insert(i, at)?;

        tasks[i].wake_at.set(wake_at);
        tasks[i].state_list.set(StateList::Delayed(which));

        if which == self.near && wake_at < self.next_unblock {
            self.next_unblock = wake_at;
        }
        Ok(())
    }

    pub(crate) fn remove<P>(&mut self, tasks: &TaskPool<P>, i: TaskIndex) -> Result<(), Fatal> {
        let StateList::Delayed(which) = tasks[i].state_list.get() else {
            return Err(Fatal::ContractViolation("task is not delayed"));
        };
        state_list(&mut self.lists[which as usize], tasks).remove(i)?;
        tasks[i].state_list.set(StateList::Detached);

        if which == self.near {
            self.update_next_unblock(tasks);
        }
        Ok(())
    }

    fn update_next_unblock<P>(&mut self, tasks: &TaskPool<P>) {
        self.next_unblock = match self.lists[self.near as usize].first {
            Some(j) => tasks[j].wake_at.get(),
            None => Tick::MAX,
        };
    }

    /// Get the first task whose wake tick has been reached at `now`, without
    /// removing it.
    pub(crate) fn first_expired<P>(&mut self, tasks: &TaskPool<P>, now: Tick) -> Option<TaskIndex> {
        if now < self.next_unblock {
            return None;
        }
        match self.lists[self.near as usize].first {
            Some(j) if tasks[j].wake_at.get() <= now => Some(j),
            _ => {
                self.update_next_unblock(tasks);
                None
            }
        }
    }

    /// Exchange the near and overflow lists. Called when the tick count
    /// wraps to zero.
    pub(crate) fn swap<P>(&mut self, tasks: &TaskPool<P>) -> Result<(), Fatal> {
        if !self.lists[self.near as usize].is_empty() {
            return Err(Fatal::ContractViolation(
                "delayed tasks left behind at tick count overflow",
            ));
        }
        self.near ^= 1;
        self.update_next_unblock(tasks);
        Ok(())
    }
}

/// A snapshot of the tick count for retrying operations with a timeout
/// spanning several waits. Used with [`System::set_timeout_state`] and
/// [`System::check_for_timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeOut {
    overflow_count: u32,
    time_on_entering: Tick,
}

impl<P> Scheduler<P> {
    pub(crate) fn set_timeout_state(&self) -> TimeOut {
        TimeOut {
            overflow_count: self.num_overflows,
            time_on_entering: self.tick_count,
        }
    }

    /// Check whether `remaining` ticks have elapsed since `timeout` was
    /// captured. If not, `remaining` is reduced by the elapsed time and
    /// `timeout` is recaptured. `None` means waiting indefinitely.
    pub(crate) fn check_for_timeout(&self, timeout: &mut TimeOut, remaining: &mut Option<Tick>) -> bool {
        let Some(left) = *remaining else { return false };

        let now = self.tick_count;
        let elapsed = now.wrapping_sub(timeout.time_on_entering);

        if timeout.overflow_count != self.num_overflows && now >= timeout.time_on_entering {
            // The tick count wrapped and came back past the starting point, so
            // a whole `Tick` range has passed
            *remaining = Some(0);
            true
        } else if elapsed < left {
            *remaining = Some(left - elapsed);
            *timeout = self.set_timeout_state();
            false
        } else {
            *remaining = Some(0);
            true
        }
    }
}

/// These associate functions implement the time-related portion of the API.
impl<Traits: KernelTraits> System<Traits> {
    /// Get the current tick count.
    pub fn tick_count() -> Tick {
        Traits::state().tick_count.load(Ordering::Relaxed)
    }

    /// Block the calling task for `ticks` ticks. `0` is equivalent to
    /// [`Self::yield_now`].
    ///
    /// Returns `Interrupted` if the delay was ended early by
    /// [`Self::abort_delay`] or a suspension.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn delay(ticks: Tick) -> Result<(), DelayError> {
        if ticks == 0 {
            return Self::yield_now().map_err(|_| DelayError::BadContext);
        }

        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>(&mut lock)?;

        let (_lock, result) = wait::block_current(lock, Some(ticks), WaitOn::Delay)?;
        match result {
            WaitResult::Woken | WaitResult::Timeout => Ok(()),
            WaitResult::Interrupted => Err(DelayError::Interrupted),
        }
    }

    /// Block the calling task until `*prev_wake + period`, then advance
    /// `*prev_wake` by `period`. Used to implement fixed-frequency periodic
    /// tasks without drift.
    ///
    /// Returns `Ok(false)` without blocking if the wake time has already
    /// passed.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn delay_until(prev_wake: &mut Tick, period: Tick) -> Result<bool, DelayError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>(&mut lock)?;

        let now = lock.sched().tick_count();
        let wake_at = prev_wake.wrapping_add(period);

        let should_delay = if now < *prev_wake {
            // The tick count wrapped since `prev_wake`. The wake time has not
            // passed only if it wrapped as well and lies ahead of `now`.
            wake_at < *prev_wake && wake_at > now
        } else {
            wake_at < *prev_wake || wake_at > now
        };
        *prev_wake = wake_at;

        if !should_delay {
            drop(lock);
            Self::yield_now().map_err(|_| DelayError::BadContext)?;
            return Ok(false);
        }

        let (_lock, result) =
            wait::block_current(lock, Some(wake_at.wrapping_sub(now)), WaitOn::Delay)?;
        match result {
            WaitResult::Woken | WaitResult::Timeout => Ok(true),
            WaitResult::Interrupted => Err(DelayError::Interrupted),
        }
    }

    /// Force a Blocked task to become Ready. Its wait ends with
    /// `Interrupted`.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn abort_delay(task: TaskId) -> Result<(), AbortDelayError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let sched = lock.sched();
        let i = sched.resolve(task)?;
        if sched.task_cb(i).st() != TaskSt::Blocked {
            return Err(AbortDelayError::BadObjectState);
        }

        let cores = sched.wake(i, WaitResult::Interrupted).or_fatal::<Traits>();
        sched::unlock_cpu_and_request_switch(lock, cores);
        Ok(())
    }

    /// Capture the current time for [`Self::check_for_timeout`].
    pub fn set_timeout_state() -> Result<TimeOut, BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        Ok(lock.sched().set_timeout_state())
    }

    /// Check whether the `remaining` ticks of a timeout started at `timeout`
    /// have elapsed, updating both for the next attempt if not.
    pub fn check_for_timeout(
        timeout: &mut TimeOut,
        remaining: &mut Option<Tick>,
    ) -> Result<bool, BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        Ok(lock.sched().check_for_timeout(timeout, remaining))
    }
}
