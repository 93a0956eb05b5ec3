//! Tasks
use alloc::{alloc as heap, boxed::Box, vec::Vec};
use core::{alloc::Layout, cell::Cell, convert::Infallible, fmt, ops, ptr::NonNull};

use crate::{
    error::{
        CreateTaskError, DeleteTaskError, ExitTaskError, GetCurrentTaskError, GetTaskInfoError,
        ResumeTaskError, SetTaskPriorityError, SuspendTaskError,
    },
    klock,
    notify::NotifyState,
    sched::{self, StateList},
    state,
    utils::{
        intrusive_list::{Link, ListAccessor, ListHead},
        OrFatal,
    },
    wait::TaskWait,
    KernelTraits, System, Tick,
};

#[doc(hidden)]
pub mod readyqueue;

/// The index of a task control block in the task arena.
pub(crate) type TaskIndex = usize;

/// The byte value the stack region is filled with at creation.
pub const STACK_FILL_BYTE: u8 = 0xa5;

/// The number of bytes at the bottom (lowest addresses) of a stack that must
/// keep [`STACK_FILL_BYTE`] for the stack to be considered intact.
pub const STACK_CANARY_LEN: usize = 16;

/// A handle to a task.
///
/// A handle stays valid until the task is deleted. Using it afterwards
/// results in `NoAccess`, even if the task's slot was reused by a newer task.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId {
    index: u32,
    generation: u32,
}

impl TaskId {
    pub(crate) const fn new(index: TaskIndex, generation: u32) -> Self {
        Self {
            index: index as u32,
            generation,
        }
    }

    #[inline]
    pub(crate) const fn index(self) -> TaskIndex {
        self.index as TaskIndex
    }

    #[inline]
    pub(crate) const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TaskId({}#{})", self.index, self.generation)
    }
}

/// The creation parameters of a task.
///
/// # Examples
///
/// ```
/// use kestrel_kernel::TaskAttr;
///
/// fn blink(_: usize) {}
///
/// const BLINK: TaskAttr = TaskAttr::new(blink)
///     .name("blink")
///     .priority(2)
///     .stack_size(512);
/// assert_eq!(BLINK.priority, 2);
/// ```
#[derive(Clone, Copy)]
pub struct TaskAttr {
    /// The entry point of the task.
    pub entry_point: fn(usize),

    /// The parameter supplied for `entry_point`.
    pub entry_param: usize,

    /// The size of the stack region in bytes.
    pub stack_size: usize,

    /// The initial base priority of the task. `0` is the lowest priority.
    pub priority: usize,

    /// The name of the task, for diagnostic purposes only.
    pub name: &'static str,
}

impl TaskAttr {
    /// The stack size used when none is specified.
    pub const DEFAULT_STACK_SIZE: usize = 2048;

    pub const fn new(entry_point: fn(usize)) -> Self {
        Self {
            entry_point,
            entry_param: 0,
            stack_size: Self::DEFAULT_STACK_SIZE,
            priority: 1,
            name: "",
        }
    }

    pub const fn param(self, entry_param: usize) -> Self {
        Self {
            entry_param,
            ..self
        }
    }

    pub const fn stack_size(self, stack_size: usize) -> Self {
        Self { stack_size, ..self }
    }

    pub const fn priority(self, priority: usize) -> Self {
        Self { priority, ..self }
    }

    pub const fn name(self, name: &'static str) -> Self {
        Self { name, ..self }
    }
}

impl fmt::Debug for TaskAttr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskAttr")
            .field("entry_point", &(self.entry_point as *const ()))
            .field("entry_param", &self.entry_param)
            .field("stack_size", &self.stack_size)
            .field("priority", &self.priority)
            .field("name", &self.name)
            .finish()
    }
}

/// Task state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskSt {
    /// The task is waiting in the ready queue.
    Ready,
    /// The task is running on a core.
    Running,
    /// The task is waiting for an event or a timeout.
    Blocked,
    /// The task was suspended by [`System::suspend_task`].
    Suspended,
    /// The task was deleted and is waiting to be reclaimed.
    Deleted,
}

/// An owned stack region, filled with [`STACK_FILL_BYTE`] at creation.
pub struct TaskStack {
    ptr: NonNull<u8>,
    layout: Layout,
}

// Safety: `TaskStack` is an owned allocation. Access to the contents is
// coordinated by the kernel and the port.
unsafe impl Send for TaskStack {}
unsafe impl Sync for TaskStack {}

impl TaskStack {
    /// Allocate a stack region. Returns `None` if the allocation failed.
    pub(crate) fn new(len: usize, align: usize) -> Option<Self> {
        debug_assert_ne!(len, 0);
        let layout = Layout::from_size_align(len, align).ok()?;
        // Safety: `layout` has a non-zero size
        let ptr = NonNull::new(unsafe { heap::alloc(layout) })?;
        // Safety: `ptr` points to a fresh allocation of `len` bytes
        unsafe { ptr.as_ptr().write_bytes(STACK_FILL_BYTE, len) };
        Some(Self { ptr, layout })
    }

    /// Get a raw pointer to the lowest address of the stack region.
    ///
    /// This is mainly used by [`PortThreading::initialize_task_state`] to
    /// calculate the initial stack pointer.
    ///
    /// [`PortThreading::initialize_task_state`]: crate::PortThreading::initialize_task_state
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Get the size of the stack region in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the number of bytes at the bottom of the stack that have never been
    /// touched.
    pub fn high_water_mark(&self) -> usize {
        (0..self.len())
            // Safety: In bounds. Volatile because the owning task may be
            // running on another core.
            .take_while(|&i| unsafe { self.ptr.as_ptr().add(i).read_volatile() } == STACK_FILL_BYTE)
            .count()
    }

    /// Check that the lowest [`STACK_CANARY_LEN`] bytes are intact.
    pub fn canary_intact(&self) -> bool {
        let canary_len = STACK_CANARY_LEN.min(self.len());
        (0..canary_len)
            // Safety: In bounds
            .all(|i| unsafe { self.ptr.as_ptr().add(i).read_volatile() } == STACK_FILL_BYTE)
    }
}

impl Drop for TaskStack {
    fn drop(&mut self) {
        // Safety: Allocated by `heap::alloc` with `self.layout`
        unsafe { heap::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl fmt::Debug for TaskStack {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskStack")
            .field("ptr", &self.ptr)
            .field("len", &self.len())
            .finish()
    }
}

/// *Task control block* - the state data of a task.
///
/// Apart from `port_task_state`, the fields are only accessed by the kernel
/// in a critical section.
#[repr(C)]
pub struct TaskCb<PortTaskState> {
    /// The port-specific state of the task (e.g., the saved stack pointer).
    ///
    /// This is guaranteed to be placed at the beginning of the struct so that
    /// assembler code can refer to this easily.
    pub port_task_state: PortTaskState,

    /// The creation parameters of the task.
    pub attr: TaskAttr,

    pub(crate) stack: TaskStack,

    pub(crate) id: Cell<TaskId>,

    /// The task's base priority.
    pub(crate) base_priority: Cell<usize>,

    /// The task's effective priority. It's equal to `base_priority` unless
    /// raised by an IPC layer through [`System::raise_priority`].
    ///
    /// The effective priority determines the ready queue level the task is
    /// placed on.
    pub(crate) effective_priority: Cell<usize>,

    pub(crate) st: Cell<TaskSt>,

    /// Membership in one of the ready levels, the delayed lists, the
    /// suspended set, or the pending-cleanup list.
    pub(crate) state_link: Cell<Option<Link<TaskIndex>>>,

    /// The list `state_link` currently belongs to.
    pub(crate) state_list: Cell<StateList>,

    /// Membership in a wait queue.
    pub(crate) event_link: Cell<Option<Link<TaskIndex>>>,

    /// The wake time of a task blocked with a timeout.
    pub(crate) wake_at: Cell<Tick>,

    /// The wait state of the task.
    pub(crate) wait: Cell<TaskWait>,

    pub(crate) notification: Cell<NotifyState>,

    /// The saved critical section nesting count. Swapped with the per-core
    /// counter on every context switch.
    pub(crate) critical_nesting: Cell<usize>,

    /// The core the task is running on.
    pub(crate) running_on: Cell<Option<usize>>,
}

impl<PortTaskState> TaskCb<PortTaskState> {
    pub(crate) fn new(attr: TaskAttr, port_task_state: PortTaskState, stack: TaskStack) -> Self {
        Self {
            port_task_state,
            attr,
            stack,
            id: Cell::new(TaskId::new(0, 0)),
            base_priority: Cell::new(attr.priority),
            effective_priority: Cell::new(attr.priority),
            st: Cell::new(TaskSt::Ready),
            state_link: Cell::new(None),
            state_list: Cell::new(StateList::Detached),
            event_link: Cell::new(None),
            wake_at: Cell::new(0),
            wait: Cell::new(TaskWait::NONE),
            notification: Cell::new(NotifyState::INIT),
            critical_nesting: Cell::new(0),
            running_on: Cell::new(None),
        }
    }

    /// Get the task's handle.
    #[inline]
    pub fn id(&self) -> TaskId {
        self.id.get()
    }

    /// Get the task's stack region.
    #[inline]
    pub fn stack(&self) -> &TaskStack {
        &self.stack
    }

    #[inline]
    pub(crate) fn st(&self) -> TaskSt {
        self.st.get()
    }
}

impl<PortTaskState: fmt::Debug> fmt::Debug for TaskCb<PortTaskState> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("self", &(self as *const _))
            .field("port_task_state", &self.port_task_state)
            .field("attr", &self.attr)
            .field("id", &self.id.get())
            .field("base_priority", &self.base_priority.get())
            .field("effective_priority", &self.effective_priority.get())
            .field("st", &self.st.get())
            .field("state_list", &self.state_list.get())
            .field("wake_at", &self.wake_at.get())
            .field("wait", &self.wait.get())
            .field("notification", &self.notification.get())
            .finish()
    }
}

/// These associate functions implement the task-related portion of the API.
impl<Traits: KernelTraits> System<Traits> {
    /// Create a task and make it Ready.
    ///
    /// The task preempts the caller immediately if its priority is higher.
    /// Tasks may also be created before the scheduler starts, i.e., from
    /// [`KernelCfg::startup`](crate::KernelCfg::startup).
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn create_task(attr: TaskAttr) -> Result<TaskId, CreateTaskError> {
        if attr.priority >= Traits::NUM_PRIORITIES {
            return Err(CreateTaskError::BadParam);
        }
        create_task_inner::<Traits>(attr, None)
    }

    /// Delete a task.
    ///
    /// The task is removed from the scheduler immediately, while its control
    /// block and stack are reclaimed later by the idle task. If `task` is
    /// the calling task, this function doesn't return.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn delete_task(task: TaskId) -> Result<(), DeleteTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let core = lock.core();
        let sched = lock.sched();
        let i = sched.resolve(task)?;

        if sched.is_idle_task(i) {
            return Err(DeleteTaskError::BadObjectState);
        }

        if sched.running(core) == Some(i) && sched.task_cb(i).st() == TaskSt::Running {
            drop(lock);
            return match Self::exit_task() {
                Ok(x) => match x {},
                Err(ExitTaskError::BadContext) => Err(DeleteTaskError::BadContext),
            };
        }

        let cores = sched.delete(i).or_fatal::<Traits>();
        sched::unlock_cpu_and_request_switch(lock, cores);
        Ok(())
    }

    /// Delete the calling task. Does not return on success.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn exit_task() -> Result<Infallible, ExitTaskError> {
        state::expect_task_context::<Traits>()?;

        let mut lock = klock::lock_cpu::<Traits>()?;
        let core = lock.core();
        let sched = lock.sched();
        if sched.is_suspended_all() || Self::critical_nesting() > 1 {
            return Err(ExitTaskError::BadContext);
        }
        let i = sched.running(core).ok_or(ExitTaskError::BadContext)?;
        if sched.is_idle_task(i) {
            return Err(ExitTaskError::BadContext);
        }

        sched.delete(i).or_fatal::<Traits>();
        let task_cb: *const TaskCb<Traits::PortTaskState> = sched.task_cb(i);

        // The context is discarded along with the critical section
        lock.forget();
        klock::discard_task_critical::<Traits>();

        // Safety: Interrupts are masked, and the task was removed from the
        // scheduler. The control block is only reclaimed by the idle task
        // after the switch completes.
        unsafe { Traits::exit_and_dispatch(&*task_cb) }
    }

    /// Suspend a task. A blocked task's wait ends with `Interrupted`.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn suspend_task(task: TaskId) -> Result<(), SuspendTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let core = lock.core();
        let sched = lock.sched();
        let i = sched.resolve(task)?;

        if sched.is_idle_task(i) || sched.task_cb(i).st() == TaskSt::Suspended {
            return Err(SuspendTaskError::BadObjectState);
        }

        if sched.running(core) == Some(i)
            && (sched.is_suspended_all()
                || Traits::is_interrupt_context()
                || Self::critical_nesting() > 1)
        {
            // Suspending the calling task would need a context switch that
            // can't happen here
            return Err(SuspendTaskError::BadContext);
        }

        let cores = sched.suspend(i).or_fatal::<Traits>();
        sched::unlock_cpu_and_request_switch(lock, cores);
        Ok(())
    }

    /// Resume a task suspended by [`Self::suspend_task`].
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn resume_task(task: TaskId) -> Result<(), ResumeTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let sched = lock.sched();
        let i = sched.resolve(task)?;

        if sched.task_cb(i).st() != TaskSt::Suspended {
            return Err(ResumeTaskError::BadObjectState);
        }

        let cores = sched.resume(i).or_fatal::<Traits>();
        sched::unlock_cpu_and_request_switch(lock, cores);
        Ok(())
    }

    /// Get the calling task. In an interrupt context, this returns the task
    /// that was interrupted.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn current_task() -> Result<TaskId, GetCurrentTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let core = lock.core();
        let sched = lock.sched();
        let i = sched.running(core).ok_or(GetCurrentTaskError::BadContext)?;
        Ok(sched.task_cb(i).id())
    }

    /// Change a task's base priority.
    ///
    /// If the task's priority is currently raised by [`Self::raise_priority`]
    /// above the new base priority, the effective priority is left as is until
    /// [`Self::restore_priority`].
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn set_priority(task: TaskId, priority: usize) -> Result<(), SetTaskPriorityError> {
        if priority >= Traits::NUM_PRIORITIES {
            return Err(SetTaskPriorityError::BadParam);
        }

        let mut lock = klock::lock_cpu::<Traits>()?;
        let sched = lock.sched();
        let i = sched.resolve(task)?;
        if sched.is_idle_task(i) {
            return Err(SetTaskPriorityError::BadObjectState);
        }

        let cores = sched.set_base_priority(i, priority).or_fatal::<Traits>();
        sched::unlock_cpu_and_request_switch(lock, cores);
        Ok(())
    }

    /// Raise a task's effective priority to at least `priority`. Used by IPC
    /// layers to implement priority inheritance.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn raise_priority(task: TaskId, priority: usize) -> Result<(), SetTaskPriorityError> {
        if priority >= Traits::NUM_PRIORITIES {
            return Err(SetTaskPriorityError::BadParam);
        }

        let mut lock = klock::lock_cpu::<Traits>()?;
        let sched = lock.sched();
        let i = sched.resolve(task)?;

        let cores = sched.raise_priority(i, priority).or_fatal::<Traits>();
        sched::unlock_cpu_and_request_switch(lock, cores);
        Ok(())
    }

    /// Reset a task's effective priority to its base priority.
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    pub fn restore_priority(task: TaskId) -> Result<(), SetTaskPriorityError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let sched = lock.sched();
        let i = sched.resolve(task)?;

        let cores = sched.restore_priority(i).or_fatal::<Traits>();
        sched::unlock_cpu_and_request_switch(lock, cores);
        Ok(())
    }

    /// Get a task's base priority.
    pub fn priority(task: TaskId) -> Result<usize, GetTaskInfoError> {
        Self::with_task_cb(task, |task_cb| task_cb.base_priority.get())
    }

    /// Get a task's effective priority.
    pub fn effective_priority(task: TaskId) -> Result<usize, GetTaskInfoError> {
        Self::with_task_cb(task, |task_cb| task_cb.effective_priority.get())
    }

    /// Get a task's state.
    pub fn task_state(task: TaskId) -> Result<TaskSt, GetTaskInfoError> {
        Self::with_task_cb(task, |task_cb| task_cb.st())
    }

    /// Get a task's name.
    pub fn task_name(task: TaskId) -> Result<&'static str, GetTaskInfoError> {
        Self::with_task_cb(task, |task_cb| task_cb.attr.name)
    }

    /// Get the number of bytes at the bottom of a task's stack that have
    /// never been used.
    pub fn stack_high_water_mark(task: TaskId) -> Result<usize, GetTaskInfoError> {
        Self::with_task_cb(task, |task_cb| task_cb.stack.high_water_mark())
    }

    /// Get the number of tasks that have been created and not deleted,
    /// including the idle tasks.
    pub fn task_count() -> usize {
        match klock::lock_cpu::<Traits>() {
            Ok(mut lock) => lock.sched().task_count(),
            Err(_) => 0,
        }
    }

    /// Write the handles of the tasks that have been created and not
    /// deleted to `out`, including the idle tasks. Returns the number of
    /// handles written, which is less than [`Self::task_count`] if `out` is
    /// too short.
    pub fn enumerate_tasks(out: &mut [TaskId]) -> usize {
        match klock::lock_cpu::<Traits>() {
            Ok(mut lock) => lock.sched().enumerate_tasks(out),
            Err(_) => 0,
        }
    }

    fn with_task_cb<T>(
        task: TaskId,
        f: impl FnOnce(&TaskCb<Traits::PortTaskState>) -> T,
    ) -> Result<T, GetTaskInfoError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let sched = lock.sched();
        let i = sched.resolve(task)?;
        Ok(f(sched.task_cb(i)))
    }
}

/// Create a task. `idle_of` designates the task as the idle task of a core.
pub(crate) fn create_task_inner<Traits: KernelTraits>(
    attr: TaskAttr,
    idle_of: Option<usize>,
) -> Result<TaskId, CreateTaskError> {
    if attr.stack_size < Traits::STACK_MIN_SIZE.max(STACK_CANARY_LEN + 1) {
        return Err(CreateTaskError::BadParam);
    }

    // Allocate outside the critical section
    let stack = TaskStack::new(attr.stack_size, Traits::STACK_ALIGN)
        .ok_or(CreateTaskError::OutOfMemory)?;
    let task_cb = Box::new(TaskCb::new(attr, Traits::PORT_TASK_STATE_INIT, stack));

    let mut lock = klock::lock_cpu::<Traits>()?;
    let sched = lock.sched();
    let i = sched.insert_task(task_cb)?;
    if let Some(core) = idle_of {
        sched.set_idle_task(core, i);
    }

    // Safety: The task was never scheduled, CPU Lock active
    unsafe { Traits::initialize_task_state(sched.task_cb(i)) };

    let cores = sched.make_ready(i).or_fatal::<Traits>();
    let id = sched.task_cb(i).id();
    sched::unlock_cpu_and_request_switch(lock, cores);

    Ok(id)
}

/// The arena owning every task control block.
///
/// Control blocks are boxed so that their addresses stay fixed while the
/// arena grows; the port keeps raw pointers to them.
pub(crate) struct TaskPool<PortTaskState> {
    slots: Vec<TaskSlot<PortTaskState>>,
    free: Option<TaskIndex>,
}

enum TaskSlot<PortTaskState> {
    Occupied {
        generation: u32,
        task_cb: Box<TaskCb<PortTaskState>>,
    },
    Vacant {
        generation: u32,
        next_free: Option<TaskIndex>,
    },
}

impl<PortTaskState> TaskPool<PortTaskState> {
    pub(crate) const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: None,
        }
    }

    /// Store a control block and assign it a fresh [`TaskId`].
    pub(crate) fn insert(
        &mut self,
        task_cb: Box<TaskCb<PortTaskState>>,
    ) -> Result<TaskIndex, CreateTaskError> {
        if let Some(i) = self.free {
            let slot = &mut self.slots[i];
            let (generation, next_free) = match *slot {
                TaskSlot::Vacant {
                    generation,
                    next_free,
                } => (generation, next_free),
                TaskSlot::Occupied { .. } => unreachable!(),
            };
            task_cb.id.set(TaskId::new(i, generation));
            *slot = TaskSlot::Occupied {
                generation,
                task_cb,
            };
            self.free = next_free;
            Ok(i)
        } else {
            let i = self.slots.len();
            if i > u32::MAX as usize {
                return Err(CreateTaskError::OutOfMemory);
            }
            self.slots
                .try_reserve(1)
                .map_err(|_| CreateTaskError::OutOfMemory)?;
            task_cb.id.set(TaskId::new(i, 0));
            self.slots.push(TaskSlot::Occupied {
                generation: 0,
                task_cb,
            });
            Ok(i)
        }
    }

    /// Remove a control block. The slot's generation is bumped so that
    /// handles to the removed task are rejected from now on.
    pub(crate) fn remove(&mut self, i: TaskIndex) -> Option<Box<TaskCb<PortTaskState>>> {
        let slot = self.slots.get_mut(i)?;
        let generation = match *slot {
            TaskSlot::Occupied { generation, .. } => generation,
            TaskSlot::Vacant { .. } => return None,
        };
        let old = core::mem::replace(
            slot,
            TaskSlot::Vacant {
                generation: generation.wrapping_add(1),
                next_free: self.free,
            },
        );
        self.free = Some(i);
        match old {
            TaskSlot::Occupied { task_cb, .. } => Some(task_cb),
            TaskSlot::Vacant { .. } => None,
        }
    }

    /// Iterate over the stored control blocks in slot order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &TaskCb<PortTaskState>> + '_ {
        self.slots.iter().filter_map(|slot| match slot {
            TaskSlot::Occupied { task_cb, .. } => Some(&**task_cb),
            TaskSlot::Vacant { .. } => None,
        })
    }

    /// Get the control block a handle refers to.
    pub(crate) fn get(&self, id: TaskId) -> Option<&TaskCb<PortTaskState>> {
        match self.slots.get(id.index())? {
            TaskSlot::Occupied {
                generation,
                task_cb,
            } if *generation == id.generation() => Some(task_cb),
            _ => None,
        }
    }
}

impl<PortTaskState> ops::Index<TaskIndex> for TaskPool<PortTaskState> {
    type Output = TaskCb<PortTaskState>;

    #[inline]
    #[track_caller]
    fn index(&self, i: TaskIndex) -> &Self::Output {
        match &self.slots[i] {
            TaskSlot::Occupied { task_cb, .. } => task_cb,
            TaskSlot::Vacant { .. } => panic!("task slot {i} is vacant"),
        }
    }
}

pub(crate) type MapLink<PortTaskState> =
    fn(&TaskCb<PortTaskState>) -> &Cell<Option<Link<TaskIndex>>>;

/// A list of tasks threaded through one of the link fields of [`TaskCb`].
pub(crate) type TaskList<'a, PortTaskState> =
    ListAccessor<'a, TaskIndex, TaskPool<PortTaskState>, MapLink<PortTaskState>>;

/// Access a list threaded through [`TaskCb::state_link`].
#[inline]
pub(crate) fn state_list<'a, PortTaskState>(
    head: &'a mut ListHead<TaskIndex>,
    tasks: &'a TaskPool<PortTaskState>,
) -> TaskList<'a, PortTaskState> {
    let map_link: MapLink<PortTaskState> = |task_cb| &task_cb.state_link;
    ListAccessor::new(head, tasks, map_link)
}

/// Access a list threaded through [`TaskCb::event_link`].
#[inline]
pub(crate) fn event_list<'a, PortTaskState>(
    head: &'a mut ListHead<TaskIndex>,
    tasks: &'a TaskPool<PortTaskState>,
) -> TaskList<'a, PortTaskState> {
    let map_link: MapLink<PortTaskState> = |task_cb| &task_cb.event_link;
    ListAccessor::new(head, tasks, map_link)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_is_filled() {
        let stack = TaskStack::new(64, 8).unwrap();
        assert_eq!(stack.len(), 64);
        assert_eq!(stack.as_ptr() as usize % 8, 0);
        assert_eq!(stack.high_water_mark(), 64);
        assert!(stack.canary_intact());
    }

    #[test]
    fn stack_usage_is_tracked() {
        let stack = TaskStack::new(64, 8).unwrap();

        // Stacks grow downwards
        unsafe { stack.as_ptr().add(40).write_bytes(0, 24) };
        assert_eq!(stack.high_water_mark(), 40);
        assert!(stack.canary_intact());

        unsafe { stack.as_ptr().add(STACK_CANARY_LEN - 1).write(0) };
        assert!(!stack.canary_intact());
    }

    #[test]
    fn task_id_debug() {
        assert_eq!(format!("{:?}", TaskId::new(3, 7)), "TaskId(3#7)");
    }
}
