//! The scheduler state and the task selection policy
//!
//! [`Scheduler`] is a plain data structure with no knowledge of the port or
//! of interrupt masking, so that it can be exercised directly by unit tests.
//! Its mutating methods return the set of cores that need a context switch
//! ([`CoreSet`]); the `System` layer turns that into port calls once the
//! kernel state is consistent again.
use alloc::boxed::Box;
use core::{fmt, mem, ops, sync::atomic::Ordering};

use crate::{
    error::{CreateTaskError, NoAccessError, SchedulerLockError, YieldError},
    klock::{self, CpuLockGuard},
    state,
    task::{
        readyqueue::{ReadyQueue, ScheduleDecision},
        state_list, TaskCb, TaskId, TaskIndex, TaskPool, TaskSt,
    },
    timeout::DelayedLists,
    utils::{intrusive_list::ListHead, OrFatal},
    wait::{TaskWait, WaitOn, WaitQueuePool, WaitResult},
    Fatal, KernelTraits, PortThreading, System, Tick, MAX_CORES,
};

/// A set of cores, used to report which cores need a context switch.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CoreSet(u32);

impl CoreSet {
    pub const EMPTY: Self = Self(0);

    #[inline]
    pub const fn single(core: usize) -> Self {
        Self(1 << core)
    }

    #[inline]
    pub fn insert(&mut self, core: usize) {
        self.0 |= 1 << core;
    }

    #[inline]
    pub fn contains(self, core: usize) -> bool {
        self.0 & (1 << core) != 0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterate over the cores in ascending order.
    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..MAX_CORES).filter(move |&core| self.contains(core))
    }
}

impl ops::BitOr for CoreSet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for CoreSet {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for CoreSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Identifies the list [`TaskCb::state_link`] is threaded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StateList {
    Detached,
    /// A ready queue level
    Ready(usize),
    /// One of the two delayed lists
    Delayed(u8),
    Suspended,
    PendingCleanup,
}

/// Static parameters of a [`Scheduler`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct SchedulerCfg {
    pub(crate) num_priorities: usize,
    pub(crate) num_cores: usize,
    pub(crate) time_slicing: bool,
    pub(crate) initial_tick_count: Tick,
    pub(crate) trace: TraceHooks,
}

/// Observers of scheduler events. They run with the scheduler borrowed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TraceHooks {
    pub(crate) task_create: fn(TaskId),
    pub(crate) task_delete: fn(TaskId),
    pub(crate) moved_to_ready: fn(TaskId),
    pub(crate) task_switched_out: fn(TaskId),
    pub(crate) task_switched_in: fn(TaskId),
    pub(crate) increment_tick: fn(Tick),
}

impl TraceHooks {
    #[cfg(test)]
    pub(crate) const NONE: Self = {
        fn nop<T>(_: T) {}
        Self {
            task_create: nop,
            task_delete: nop,
            moved_to_ready: nop,
            task_switched_out: nop,
            task_switched_in: nop,
            increment_tick: nop,
        }
    };
}

/// The registry of every task, plus the state of the tick counter and the
/// scheduler lock.
pub(crate) struct Scheduler<PortTaskState> {
    pub(crate) tasks: TaskPool<PortTaskState>,
    pub(crate) ready: ReadyQueue,
    pub(crate) delayed: DelayedLists,
    /// Suspended tasks, and tasks blocked without a timeout.
    pub(crate) suspended: ListHead<TaskIndex>,
    /// Deleted tasks waiting to be reclaimed by an idle task.
    pub(crate) pending_cleanup: ListHead<TaskIndex>,
    pub(crate) wait_queues: WaitQueuePool,
    running: [Option<TaskIndex>; MAX_CORES],
    idle: [Option<TaskIndex>; MAX_CORES],
    /// A round-robin rotation was requested by a yield or a time slice.
    yield_pending: [bool; MAX_CORES],
    /// A context switch was suppressed by `suspend_all`.
    deferred: [bool; MAX_CORES],
    /// The highest priority a core was asked to switch to since its last
    /// `choose_next`.
    claimed: [Option<usize>; MAX_CORES],
    cfg: SchedulerCfg,
    pub(crate) tick_count: Tick,
    pub(crate) num_overflows: u32,
    suspend_all_depth: usize,
    pended_ticks: Tick,
    task_count: usize,
}

impl<PortTaskState> Scheduler<PortTaskState> {
    pub(crate) const fn new(cfg: SchedulerCfg) -> Self {
        assert!(cfg.num_cores >= 1 && cfg.num_cores <= MAX_CORES);
        assert!(cfg.num_priorities >= 1 && cfg.num_priorities <= crate::utils::PRIO_BITMAP_MAX_LEN);
        Self {
            tasks: TaskPool::new(),
            ready: ReadyQueue::new(),
            delayed: DelayedLists::new(),
            suspended: ListHead::new(),
            pending_cleanup: ListHead::new(),
            wait_queues: WaitQueuePool::new(),
            running: [None; MAX_CORES],
            idle: [None; MAX_CORES],
            yield_pending: [false; MAX_CORES],
            deferred: [false; MAX_CORES],
            claimed: [None; MAX_CORES],
            tick_count: cfg.initial_tick_count,
            num_overflows: 0,
            suspend_all_depth: 0,
            pended_ticks: 0,
            task_count: 0,
            cfg,
        }
    }

    #[inline]
    pub(crate) fn task_cb(&self, i: TaskIndex) -> &TaskCb<PortTaskState> {
        &self.tasks[i]
    }

    /// Map a handle to a live task.
    pub(crate) fn resolve(&self, id: TaskId) -> Result<TaskIndex, NoAccessError> {
        match self.tasks.get(id) {
            Some(task_cb) if task_cb.st() != TaskSt::Deleted => Ok(id.index()),
            _ => Err(NoAccessError::NoAccess),
        }
    }

    /// Get the task `core` is running, or about to switch away from.
    #[inline]
    pub(crate) fn running(&self, core: usize) -> Option<TaskIndex> {
        self.running[core]
    }

    pub(crate) fn is_idle_task(&self, i: TaskIndex) -> bool {
        self.idle[..self.cfg.num_cores].contains(&Some(i))
    }

    pub(crate) fn set_idle_task(&mut self, core: usize, i: TaskIndex) {
        self.idle[core] = Some(i);
    }

    #[inline]
    pub(crate) fn task_count(&self) -> usize {
        self.task_count
    }

    pub(crate) fn enumerate_tasks(&self, out: &mut [TaskId]) -> usize {
        let live = self
            .tasks
            .iter()
            .filter(|task_cb| task_cb.st() != TaskSt::Deleted);
        let mut n = 0;
        for (task_cb, slot) in live.zip(out.iter_mut()) {
            *slot = task_cb.id();
            n += 1;
        }
        n
    }

    #[inline]
    pub(crate) fn tick_count(&self) -> Tick {
        self.tick_count
    }

    #[inline]
    pub(crate) fn is_suspended_all(&self) -> bool {
        self.suspend_all_depth > 0
    }

    pub(crate) fn insert_task(
        &mut self,
        task_cb: Box<TaskCb<PortTaskState>>,
    ) -> Result<TaskIndex, CreateTaskError> {
        let i = self.tasks.insert(task_cb)?;
        self.task_count += 1;
        (self.cfg.trace.task_create)(self.tasks[i].id());
        Ok(i)
    }

    /// Transition a task into the Ready state.
    pub(crate) fn make_ready(&mut self, i: TaskIndex) -> Result<CoreSet, Fatal> {
        self.tasks[i].st.set(TaskSt::Ready);
        self.ready.push_back(&self.tasks, i)?;
        (self.cfg.trace.moved_to_ready)(self.tasks[i].id());
        Ok(self.preemption_target(self.tasks[i].effective_priority.get()))
    }

    /// Find the core that should be preempted by a newly-Ready task of
    /// priority `priority`.
    ///
    /// Each core is ranked by the priority it will run once its pending
    /// switch completes: the highest priority already directed at it, or its
    /// running task's priority, whichever is higher. A core whose current
    /// task has stopped running and that hasn't been claimed ranks below
    /// every priority. The lowest-ranked core below `priority` is picked and
    /// claimed for `priority`.
    fn preemption_target(&mut self, priority: usize) -> CoreSet {
        let mut best: Option<(usize, Option<usize>)> = None;
        for core in 0..self.cfg.num_cores {
            let running = self.running[core]
                .map(|r| &self.tasks[r])
                .filter(|task_cb| task_cb.st() == TaskSt::Running)
                .map(|task_cb| task_cb.effective_priority.get());
            // `None` orders below `Some(_)`
            let outlook = running.max(self.claimed[core]);
            if outlook < Some(priority) && best.map_or(true, |(_, best_p)| outlook < best_p) {
                best = Some((core, outlook));
            }
        }
        match best {
            Some((core, _)) => {
                self.claimed[core] = Some(priority);
                CoreSet::single(core)
            }
            None => CoreSet::EMPTY,
        }
    }

    /// Unlink a task from its state list and its wait queue.
    fn detach(&mut self, i: TaskIndex) -> Result<(), Fatal> {
        match self.tasks[i].state_list.get() {
            StateList::Detached => {}
            StateList::Ready(_) => self.ready.remove(&self.tasks, i)?,
            StateList::Delayed(_) => self.delayed.remove(&self.tasks, i)?,
            StateList::Suspended => {
                state_list(&mut self.suspended, &self.tasks).remove(i)?;
                self.tasks[i].state_list.set(StateList::Detached);
            }
            StateList::PendingCleanup => {
                return Err(Fatal::ContractViolation("task is deleted"));
            }
        }

        let wait = self.tasks[i].wait.get();
        if let Some(WaitOn::Queue(q)) = wait.on {
            self.wait_queues.remove_waiter(&self.tasks, q, i)?;
        }
        self.tasks[i].wait.set(TaskWait { on: None, ..wait });
        Ok(())
    }

    /// Block the task running on `core`.
    ///
    /// With a timeout, the task is placed on the delayed lists; otherwise, it
    /// joins the suspended set in the Blocked state.
    pub(crate) fn block_running(
        &mut self,
        core: usize,
        timeout: Option<Tick>,
        on: WaitOn,
    ) -> Result<CoreSet, Fatal> {
        let i = self.running[core].ok_or(Fatal::ContractViolation("no running task"))?;
        let task_cb = &self.tasks[i];
        if task_cb.st() != TaskSt::Running {
            return Err(Fatal::ContractViolation("blocking a task that is not running"));
        }

        task_cb.st.set(TaskSt::Blocked);
        task_cb.wait.set(TaskWait {
            on: Some(on),
            result: WaitResult::Woken,
        });

        if let WaitOn::Queue(q) = on {
            self.wait_queues.push_waiter(&self.tasks, q, i)?;
        }

        match timeout {
            Some(duration) => {
                let now = self.tick_count;
                self.delayed
                    .insert(&self.tasks, i, now, now.wrapping_add(duration))?;
            }
            None => {
                state_list(&mut self.suspended, &self.tasks).push_back(i)?;
                self.tasks[i].state_list.set(StateList::Suspended);
            }
        }

        Ok(CoreSet::single(core))
    }

    /// End a Blocked task's wait with `result` and make it Ready.
    pub(crate) fn wake(&mut self, i: TaskIndex, result: WaitResult) -> Result<CoreSet, Fatal> {
        if self.tasks[i].st() != TaskSt::Blocked {
            return Err(Fatal::ContractViolation("waking a task that is not blocked"));
        }
        self.detach(i)?;
        self.tasks[i].wait.set(TaskWait { on: None, result });
        self.make_ready(i)
    }

    /// Advance the tick count by one, or pend the tick if the scheduler is
    /// suspended.
    pub(crate) fn tick(&mut self) -> Result<CoreSet, Fatal> {
        if self.is_suspended_all() {
            self.pended_ticks = self.pended_ticks.wrapping_add(1);
            return Ok(CoreSet::EMPTY);
        }
        self.advance_tick()
    }

    fn advance_tick(&mut self) -> Result<CoreSet, Fatal> {
        let now = self.tick_count.wrapping_add(1);
        self.tick_count = now;
        (self.cfg.trace.increment_tick)(now);

        if now == 0 {
            self.delayed.swap(&self.tasks)?;
            self.num_overflows = self.num_overflows.wrapping_add(1);
        }

        let mut cores = CoreSet::EMPTY;
        while let Some(i) = self.delayed.first_expired(&self.tasks, now) {
            cores |= self.wake(i, WaitResult::Timeout)?;
        }

        if self.cfg.time_slicing {
            for core in 0..self.cfg.num_cores {
                let Some(r) = self.running[core] else { continue };
                let task_cb = &self.tasks[r];
                if task_cb.st() == TaskSt::Running
                    && !self
                        .ready
                        .is_level_empty(task_cb.effective_priority.get())
                {
                    self.yield_pending[core] = true;
                    cores.insert(core);
                }
            }
        }

        Ok(cores)
    }

    /// Decide which task `core` should run next.
    ///
    /// A running task keeps the core unless a higher level is non-empty or a
    /// rotation was requested and its own level is non-empty; in both cases
    /// it's re-appended to the tail of its level. Tasks that still hold
    /// another core are skipped.
    pub(crate) fn choose_next(
        &mut self,
        core: usize,
    ) -> Result<ScheduleDecision<TaskIndex>, Fatal> {
        let current = self.running[core];

        if self.is_suspended_all() && current.is_some() {
            self.deferred[core] = true;
            return Ok(ScheduleDecision::Keep);
        }

        self.claimed[core] = None;
        let rotate = mem::take(&mut self.yield_pending[core]);

        if let Some(cur) = current {
            let task_cb = &self.tasks[cur];
            if task_cb.st() == TaskSt::Running {
                let priority = task_cb.effective_priority.get();
                match self.ready.highest_level() {
                    Some(h) if h > priority || (h == priority && rotate) => {
                        task_cb.st.set(TaskSt::Ready);
                        self.ready.push_back(&self.tasks, cur)?;
                    }
                    _ => return Ok(ScheduleDecision::Keep),
                }
            }
            task_cb.running_on.set(None);
        }

        let next = self
            .ready
            .find_eligible(&self.tasks, core)?
            .ok_or(Fatal::NoReadyTask)?;
        self.ready.remove(&self.tasks, next)?;

        let task_cb = &self.tasks[next];
        task_cb.st.set(TaskSt::Running);
        task_cb.running_on.set(Some(core));
        self.running[core] = Some(next);

        if current == Some(next) {
            return Ok(ScheduleDecision::Keep);
        }
        if let Some(cur) = current {
            (self.cfg.trace.task_switched_out)(self.tasks[cur].id());
        }
        (self.cfg.trace.task_switched_in)(self.tasks[next].id());
        Ok(ScheduleDecision::SwitchTo(next))
    }

    /// Request a round-robin rotation on `core`.
    pub(crate) fn yield_current(&mut self, core: usize) -> CoreSet {
        self.yield_pending[core] = true;
        CoreSet::single(core)
    }

    /// Move a task to the suspended set. A Blocked task's wait ends with
    /// [`WaitResult::Interrupted`].
    pub(crate) fn suspend(&mut self, i: TaskIndex) -> Result<CoreSet, Fatal> {
        let mut cores = CoreSet::EMPTY;
        match self.tasks[i].st() {
            TaskSt::Ready => self.detach(i)?,
            TaskSt::Blocked => {
                self.detach(i)?;
                self.tasks[i].wait.set(TaskWait {
                    on: None,
                    result: WaitResult::Interrupted,
                });
            }
            TaskSt::Running => {}
            TaskSt::Suspended | TaskSt::Deleted => {
                return Err(Fatal::ContractViolation("task can't be suspended"));
            }
        }
        if let Some(core) = self.tasks[i].running_on.get() {
            cores.insert(core);
        }

        self.tasks[i].st.set(TaskSt::Suspended);
        state_list(&mut self.suspended, &self.tasks).push_back(i)?;
        self.tasks[i].state_list.set(StateList::Suspended);
        Ok(cores)
    }

    /// Move a Suspended task back to the ready queue.
    pub(crate) fn resume(&mut self, i: TaskIndex) -> Result<CoreSet, Fatal> {
        if self.tasks[i].st() != TaskSt::Suspended {
            return Err(Fatal::ContractViolation("resuming a task that is not suspended"));
        }
        self.detach(i)?;
        self.make_ready(i)
    }

    /// Logically delete a task: unlink it from everything and queue it for
    /// reclamation by [`Self::reclaim_one`].
    pub(crate) fn delete(&mut self, i: TaskIndex) -> Result<CoreSet, Fatal> {
        if self.tasks[i].st() == TaskSt::Deleted || self.is_idle_task(i) {
            return Err(Fatal::ContractViolation("task can't be deleted"));
        }
        self.detach(i)?;

        let mut cores = CoreSet::EMPTY;
        if let Some(core) = self.tasks[i].running_on.get() {
            cores.insert(core);
        }

        self.tasks[i].st.set(TaskSt::Deleted);
        state_list(&mut self.pending_cleanup, &self.tasks).push_back(i)?;
        self.tasks[i].state_list.set(StateList::PendingCleanup);
        self.task_count -= 1;
        (self.cfg.trace.task_delete)(self.tasks[i].id());
        Ok(cores)
    }

    /// Take out a deleted task that no core is executing anymore.
    pub(crate) fn reclaim_one(&mut self) -> Result<Option<Box<TaskCb<PortTaskState>>>, Fatal> {
        let mut found = None;
        let list = state_list(&mut self.pending_cleanup, &self.tasks);
        for i in list.iter() {
            let i = i?;
            if list[i].running_on.get().is_none() {
                found = Some(i);
                break;
            }
        }

        let Some(i) = found else { return Ok(None) };
        state_list(&mut self.pending_cleanup, &self.tasks).remove(i)?;
        self.tasks[i].state_list.set(StateList::Detached);
        Ok(self.tasks.remove(i))
    }

    /// Change a task's effective priority, repositioning it in the ready
    /// queue if needed.
    fn set_effective_priority(&mut self, i: TaskIndex, priority: usize) -> Result<CoreSet, Fatal> {
        let task_cb = &self.tasks[i];
        let old = task_cb.effective_priority.get();
        if old == priority {
            return Ok(CoreSet::EMPTY);
        }

        match task_cb.st() {
            TaskSt::Ready => {
                self.ready.remove(&self.tasks, i)?;
                self.tasks[i].effective_priority.set(priority);
                self.ready.push_back(&self.tasks, i)?;
                Ok(if priority > old {
                    self.preemption_target(priority)
                } else {
                    CoreSet::EMPTY
                })
            }
            TaskSt::Running => {
                task_cb.effective_priority.set(priority);
                let core = task_cb
                    .running_on
                    .get()
                    .ok_or(Fatal::ContractViolation("running task has no core"))?;
                // A lowered priority may let a Ready task take over
                Ok(match self.ready.highest_level() {
                    Some(h) if h > priority => CoreSet::single(core),
                    _ => CoreSet::EMPTY,
                })
            }
            TaskSt::Blocked | TaskSt::Suspended | TaskSt::Deleted => {
                task_cb.effective_priority.set(priority);
                Ok(CoreSet::EMPTY)
            }
        }
    }

    /// Change a task's base priority. An effective priority raised above the
    /// new base priority is kept.
    pub(crate) fn set_base_priority(&mut self, i: TaskIndex, priority: usize) -> Result<CoreSet, Fatal> {
        let task_cb = &self.tasks[i];
        let inherited = task_cb.effective_priority.get() != task_cb.base_priority.get();
        let effective = task_cb.effective_priority.get();
        task_cb.base_priority.set(priority);

        if !inherited || priority > effective {
            self.set_effective_priority(i, priority)
        } else {
            Ok(CoreSet::EMPTY)
        }
    }

    pub(crate) fn raise_priority(&mut self, i: TaskIndex, priority: usize) -> Result<CoreSet, Fatal> {
        if priority > self.tasks[i].effective_priority.get() {
            self.set_effective_priority(i, priority)
        } else {
            Ok(CoreSet::EMPTY)
        }
    }

    pub(crate) fn restore_priority(&mut self, i: TaskIndex) -> Result<CoreSet, Fatal> {
        let base = self.tasks[i].base_priority.get();
        self.set_effective_priority(i, base)
    }

    pub(crate) fn suspend_all(&mut self) {
        self.suspend_all_depth += 1;
    }

    /// Undo one [`Self::suspend_all`]. On the outermost call, pended ticks
    /// are replayed and the deferred context switches are released.
    pub(crate) fn resume_all(&mut self) -> Result<CoreSet, Fatal> {
        if self.suspend_all_depth == 0 {
            return Err(Fatal::ContractViolation("scheduler is not suspended"));
        }
        self.suspend_all_depth -= 1;
        if self.suspend_all_depth > 0 {
            return Ok(CoreSet::EMPTY);
        }

        let mut cores = CoreSet::EMPTY;
        while self.pended_ticks > 0 {
            self.pended_ticks -= 1;
            cores |= self.advance_tick()?;
        }
        for core in 0..self.cfg.num_cores {
            if mem::take(&mut self.deferred[core]) {
                cores.insert(core);
            }
        }
        Ok(cores)
    }
}

/// Release CPU Lock, having asked the port to switch contexts on `cores`.
///
/// The requests are made before the lock is released; the switch interrupt
/// is masked until then.
pub(super) fn unlock_cpu_and_request_switch<Traits: KernelTraits>(
    lock: CpuLockGuard<Traits>,
    cores: CoreSet,
) {
    if Traits::state().started.load(Ordering::Relaxed) {
        let local = lock.core();
        for core in cores.iter() {
            // Safety: CPU Lock active, the scheduler is running
            unsafe {
                if core == local {
                    Traits::yield_cpu();
                } else {
                    Traits::yield_core(core);
                }
            }
        }
    }
    drop(lock);
}

/// The kernel half of a context switch. See
/// [`PortToKernel::choose_running_task`](crate::PortToKernel::choose_running_task).
///
/// # Safety
///
/// Interrupts must be masked on the calling core.
pub(super) unsafe fn choose_running_task<Traits: KernelTraits>() {
    // Safety: Upheld by the caller
    let mut lock = unsafe { klock::lock_cpu_masked::<Traits>() };
    let core = lock.core();
    let state = Traits::state();
    let sched = lock.sched();

    if let Some(cur) = sched.running(core) {
        let task_cb = sched.task_cb(cur);
        if Traits::STACK_OVERFLOW_CHECK && !task_cb.stack.canary_intact() {
            Traits::stack_overflow_hook(task_cb.id(), task_cb.attr.name);
        }
        task_cb
            .critical_nesting
            .set(state.critical_nesting[core].load(Ordering::Relaxed));
    }

    sched.choose_next(core).or_fatal::<Traits>();

    let next = sched
        .running(core)
        .ok_or(Fatal::NoReadyTask)
        .or_fatal::<Traits>();
    let task_cb = sched.task_cb(next);
    state.critical_nesting[core].store(task_cb.critical_nesting.get(), Ordering::Relaxed);
    state.set_running_task(core, task_cb);
}

/// The tick handler. See
/// [`PortToKernel::timer_tick`](crate::PortToKernel::timer_tick).
pub(super) fn timer_tick<Traits: KernelTraits>() {
    let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
        crate::fatal::<Traits>(Fatal::ContractViolation(
            "timer tick while the kernel state is borrowed",
        ));
    };
    let sched = lock.sched();
    let cores = sched.tick().or_fatal::<Traits>();
    Traits::state()
        .tick_count
        .store(sched.tick_count(), Ordering::Relaxed);
    unlock_cpu_and_request_switch(lock, cores);

    Traits::tick_hook();
}

/// These associate functions implement the scheduler-related portion of the
/// API.
impl<Traits: KernelTraits> System<Traits> {
    /// Give up the processor to the next task of the same priority, if any.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn yield_now() -> Result<(), YieldError> {
        state::expect_task_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        let core = lock.core();
        let cores = lock.sched().yield_current(core);
        unlock_cpu_and_request_switch(lock, cores);
        Ok(())
    }

    /// Suspend the scheduler. Context switches and tick processing are
    /// deferred until the matching [`Self::resume_all`]. Calls may be nested.
    ///
    /// Interrupts stay enabled; ticks arriving in the meantime are counted
    /// and replayed later.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn suspend_all() -> Result<(), SchedulerLockError> {
        state::expect_task_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        lock.sched().suspend_all();
        Ok(())
    }

    /// Undo [`Self::suspend_all`]. Returns `true` if a context switch on the
    /// calling core was requested as a result.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn resume_all() -> Result<bool, SchedulerLockError> {
        state::expect_task_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        let core = lock.core();
        let sched = lock.sched();
        if !sched.is_suspended_all() {
            return Err(SchedulerLockError::BadContext);
        }

        let cores = sched.resume_all().or_fatal::<Traits>();
        Traits::state()
            .tick_count
            .store(sched.tick_count(), Ordering::Relaxed);
        unlock_cpu_and_request_switch(lock, cores);
        Ok(cores.contains(core))
    }

    /// Check whether the scheduler is suspended by [`Self::suspend_all`].
    pub fn is_scheduler_suspended() -> bool {
        match klock::lock_cpu::<Traits>() {
            Ok(mut lock) => lock.sched().is_suspended_all(),
            Err(_) => false,
        }
    }

    /// Check whether the scheduler has been started.
    pub fn is_scheduler_started() -> bool {
        Traits::state().started.load(Ordering::Relaxed)
    }

    /// Reclaim the control blocks and stacks of deleted tasks. Called by the
    /// idle task.
    pub fn idle_sweep() {
        loop {
            let task_cb = {
                let Ok(mut lock) = klock::lock_cpu::<Traits>() else { return };
                let Some(task_cb) = lock.sched().reclaim_one().or_fatal::<Traits>() else {
                    return;
                };
                // Safety: The task is no longer known to the scheduler
                unsafe { <Traits as PortThreading>::finalize_task_state(&task_cb) };
                task_cb
            };

            // Deallocate outside the critical section
            drop(task_cb);
        }
    }
}
