//! The blocking/wake contract consumed by inter-task primitives
//!
//! A [`WaitQueue`] is a FIFO list of tasks blocked on some event. Queues,
//! semaphores, event groups, and the like are built by pairing one or more
//! wait queues with their own state, which they inspect and update in the
//! `poll` closure of [`WaitQueue::wait_until`].
use alloc::vec::Vec;
use core::{fmt, marker::PhantomData};

use crate::{
    error::{BadContextError, CreateWaitQueueError, WaitTimeoutError, WakeError},
    klock::{self, CpuLockGuard},
    sched::{self, CoreSet, Scheduler},
    state,
    task::{event_list, TaskIndex, TaskPool},
    utils::{intrusive_list::ListHead, OrFatal},
    Fatal, KernelTraits, Tick,
};

/// What a Blocked task is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOn {
    Delay,
    Queue(WaitQueueId),
    Notification,
}

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitResult {
    /// The awaited event occurred.
    Woken,
    /// The timeout elapsed.
    Timeout,
    /// The wait was cancelled by a suspension, `abort_delay`, or the
    /// destruction of the wait queue.
    Interrupted,
}

/// The wait bookkeeping of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TaskWait {
    /// The ongoing wait, if any.
    pub(crate) on: Option<WaitOn>,
    /// The result of the last completed wait.
    pub(crate) result: WaitResult,
}

impl TaskWait {
    pub(crate) const NONE: Self = Self {
        on: None,
        result: WaitResult::Woken,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WaitQueueId(usize);

enum WaitQueueSlot {
    Occupied(ListHead<TaskIndex>),
    Vacant(Option<usize>),
}

/// The arena of wait queue list heads.
pub(crate) struct WaitQueuePool {
    slots: Vec<WaitQueueSlot>,
    free: Option<usize>,
}

impl WaitQueuePool {
    pub(crate) const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: None,
        }
    }

    fn head_mut(&mut self, q: WaitQueueId) -> Result<&mut ListHead<TaskIndex>, Fatal> {
        match self.slots.get_mut(q.0) {
            Some(WaitQueueSlot::Occupied(head)) => Ok(head),
            _ => Err(Fatal::ContractViolation("wait queue does not exist")),
        }
    }

    pub(crate) fn push_waiter<P>(
        &mut self,
        tasks: &TaskPool<P>,
        q: WaitQueueId,
        i: TaskIndex,
    ) -> Result<(), Fatal> {
        event_list(self.head_mut(q)?, tasks).push_back(i)?;
        Ok(())
    }

    pub(crate) fn remove_waiter<P>(
        &mut self,
        tasks: &TaskPool<P>,
        q: WaitQueueId,
        i: TaskIndex,
    ) -> Result<(), Fatal> {
        event_list(self.head_mut(q)?, tasks).remove(i)?;
        Ok(())
    }

    fn first_waiter(&mut self, q: WaitQueueId) -> Result<Option<TaskIndex>, Fatal> {
        Ok(self.head_mut(q)?.first)
    }
}

impl<P> Scheduler<P> {
    pub(crate) fn create_wait_queue(&mut self) -> Result<WaitQueueId, CreateWaitQueueError> {
        let pool = &mut self.wait_queues;
        if let Some(q) = pool.free {
            let WaitQueueSlot::Vacant(next_free) = pool.slots[q] else {
                unreachable!()
            };
            pool.slots[q] = WaitQueueSlot::Occupied(ListHead::new());
            pool.free = next_free;
            Ok(WaitQueueId(q))
        } else {
            pool.slots
                .try_reserve(1)
                .map_err(|_| CreateWaitQueueError::OutOfMemory)?;
            pool.slots.push(WaitQueueSlot::Occupied(ListHead::new()));
            Ok(WaitQueueId(pool.slots.len() - 1))
        }
    }

    /// Destroy a wait queue. Its waiters are woken with
    /// [`WaitResult::Interrupted`].
    pub(crate) fn destroy_wait_queue(&mut self, q: WaitQueueId) -> Result<CoreSet, Fatal> {
        let (_, cores) = self.wake_all_waiters(q, WaitResult::Interrupted)?;
        let pool = &mut self.wait_queues;
        pool.slots[q.0] = WaitQueueSlot::Vacant(pool.free);
        pool.free = Some(q.0);
        Ok(cores)
    }

    /// Wake the longest-waiting task of a wait queue.
    pub(crate) fn wake_one_waiter(
        &mut self,
        q: WaitQueueId,
        result: WaitResult,
    ) -> Result<(bool, CoreSet), Fatal> {
        match self.wait_queues.first_waiter(q)? {
            Some(i) => Ok((true, self.wake(i, result)?)),
            None => Ok((false, CoreSet::EMPTY)),
        }
    }

    /// Wake every task of a wait queue, in the order they started waiting.
    pub(crate) fn wake_all_waiters(
        &mut self,
        q: WaitQueueId,
        result: WaitResult,
    ) -> Result<(usize, CoreSet), Fatal> {
        let mut count = 0;
        let mut cores = CoreSet::EMPTY;
        while let Some(i) = self.wait_queues.first_waiter(q)? {
            cores |= self.wake(i, result)?;
            count += 1;
        }
        Ok((count, cores))
    }
}

/// Block the calling task, and wait until it's woken up. CPU Lock is
/// released while the task is Blocked and re-acquired before returning.
///
/// The caller must have checked the context with
/// [`state::expect_waitable_context`].
pub(crate) fn block_current<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
    timeout: Option<Tick>,
    on: WaitOn,
) -> Result<(CpuLockGuard<Traits>, WaitResult), BadContextError> {
    let core = lock.core();
    let sched = lock.sched();
    let i = sched.running(core).ok_or(BadContextError::BadContext)?;
    let cores = sched.block_running(core, timeout, on).or_fatal::<Traits>();

    // The context switch takes place when CPU Lock is released
    sched::unlock_cpu_and_request_switch(lock, cores);

    let mut lock = klock::lock_cpu::<Traits>()?;
    let result = lock.sched().task_cb(i).wait.get().result;
    Ok((lock, result))
}

/// A FIFO queue of tasks waiting for an event.
///
/// Dropping a `WaitQueue` wakes its waiters with `Interrupted`.
///
/// # Examples
///
/// A binary semaphore:
///
/// ```rust,ignore
/// struct Semaphore<Traits: KernelTraits> {
///     available: AtomicBool,
///     waiters: WaitQueue<Traits>,
/// }
///
/// impl<Traits: KernelTraits> Semaphore<Traits> {
///     fn take(&self, timeout: Option<Tick>) -> Result<(), WaitTimeoutError> {
///         self.waiters.wait_until(timeout, || {
///             self.available.swap(false, Ordering::Relaxed).then_some(())
///         })
///     }
///
///     fn give(&self) -> Result<(), WakeError> {
///         self.available.store(true, Ordering::Relaxed);
///         self.waiters.wake_one().map(|_| ())
///     }
/// }
/// ```
pub struct WaitQueue<Traits: KernelTraits> {
    id: WaitQueueId,
    _phantom: PhantomData<Traits>,
}

impl<Traits: KernelTraits> fmt::Debug for WaitQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("WaitQueue").field(&self.id.0).finish()
    }
}

impl<Traits: KernelTraits> WaitQueue<Traits> {
    pub fn new() -> Result<Self, CreateWaitQueueError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let id = lock.sched().create_wait_queue()?;
        Ok(Self {
            id,
            _phantom: PhantomData,
        })
    }

    /// Block the calling task until woken by [`Self::wake_one`] or
    /// [`Self::wake_all`], or until `timeout` ticks elapse. `None` waits
    /// indefinitely; `Some(0)` fails with `Timeout` immediately.
    pub fn wait(&self, timeout: Option<Tick>) -> Result<(), WaitTimeoutError> {
        if timeout == Some(0) {
            return Err(WaitTimeoutError::Timeout);
        }

        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>(&mut lock)?;

        let (_lock, result) = block_current(lock, timeout, WaitOn::Queue(self.id))?;
        match result {
            WaitResult::Woken => Ok(()),
            WaitResult::Timeout => Err(WaitTimeoutError::Timeout),
            WaitResult::Interrupted => Err(WaitTimeoutError::Interrupted),
        }
    }

    /// Block the calling task until `poll` returns `Some(_)`.
    ///
    /// `poll` is evaluated with CPU Lock active (so it must not call kernel
    /// functions), first immediately, then every time the task is woken up.
    /// The timeout covers the whole operation. When it expires, `poll` is
    /// given one last chance before `Timeout` is returned.
    pub fn wait_until<T>(
        &self,
        timeout: Option<Tick>,
        mut poll: impl FnMut() -> Option<T>,
    ) -> Result<T, WaitTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        if let Some(x) = poll() {
            return Ok(x);
        }

        let mut time_out = lock.sched().set_timeout_state();
        let mut remaining = timeout;
        loop {
            if remaining == Some(0) {
                return Err(WaitTimeoutError::Timeout);
            }
            state::expect_waitable_context::<Traits>(&mut lock)?;

            let (new_lock, result) = block_current(lock, remaining, WaitOn::Queue(self.id))?;
            lock = new_lock;

            if let Some(x) = poll() {
                return Ok(x);
            }
            match result {
                WaitResult::Woken => {}
                WaitResult::Timeout => return Err(WaitTimeoutError::Timeout),
                WaitResult::Interrupted => return Err(WaitTimeoutError::Interrupted),
            }

            // Someone else consumed the event. Wait for the rest of the
            // timeout.
            lock.sched().check_for_timeout(&mut time_out, &mut remaining);
        }
    }

    /// Wake the longest-waiting task. Returns `true` if a task was woken.
    pub fn wake_one(&self) -> Result<bool, WakeError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let (woken, cores) = lock
            .sched()
            .wake_one_waiter(self.id, WaitResult::Woken)
            .or_fatal::<Traits>();
        sched::unlock_cpu_and_request_switch(lock, cores);
        Ok(woken)
    }

    /// Wake all waiting tasks. Returns the number of tasks woken.
    pub fn wake_all(&self) -> Result<usize, WakeError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let (count, cores) = lock
            .sched()
            .wake_all_waiters(self.id, WaitResult::Woken)
            .or_fatal::<Traits>();
        sched::unlock_cpu_and_request_switch(lock, cores);
        Ok(count)
    }

    /// Get the number of waiting tasks.
    pub fn num_waiters(&self) -> Result<usize, BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let sched = lock.sched();
        let head = sched
            .wait_queues
            .head_mut(self.id)
            .or_fatal::<Traits>();
        Ok(event_list(head, &sched.tasks).iter().count())
    }
}

impl<Traits: KernelTraits> Drop for WaitQueue<Traits> {
    fn drop(&mut self) {
        let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
            crate::fatal::<Traits>(Fatal::ContractViolation(
                "wait queue dropped while the kernel state is borrowed",
            ));
        };
        let cores = lock
            .sched()
            .destroy_wait_queue(self.id)
            .or_fatal::<Traits>();
        sched::unlock_cpu_and_request_switch(lock, cores);
    }
}
