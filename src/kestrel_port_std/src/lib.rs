#![doc = include_str!("./lib.md")]
#![deny(unsafe_op_in_unsafe_fn)]
use kestrel_kernel::{utils::Init, KernelTraits, PortThreading, PortToKernel, System, TaskCb};
use slab::Slab;
use spin::Mutex as SpinMutex;
use std::{
    any::Any,
    cell::Cell,
    collections::VecDeque,
    mem,
    panic::{self, AssertUnwindSafe},
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
    time::Duration,
};


/// Used by `use_port!`
#[doc(hidden)]
pub extern crate kestrel_kernel;
/// Used by `use_port!`
#[doc(hidden)]
pub extern crate env_logger;

/// The tick period used by [`use_port!`] unless specified otherwise.
pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_millis(1);

/// Implemented on a kernel trait type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
#[doc(hidden)]
pub unsafe trait PortInstance:
    KernelTraits + PortThreading<PortTaskState = TaskState> + PortToKernel
{
    /// The period of the tick generated by a host thread. `None` leaves tick
    /// generation to [`pend_tick`].
    const TICK_PERIOD: Option<Duration>;

    fn port_state() -> &'static State;
}

/// The internal state of the port.
///
/// # Safety
///
/// For the safety information of this type's methods, see the documentation of
/// the corresponding trait methods of `PortThreading`.
#[doc(hidden)]
pub struct State {
    machine: Mutex<Machine>,
    /// Signalled whenever a turn changes hands or something becomes pending.
    cond: Condvar,
}

/// The simulated hardware.
struct Machine {
    cores: Vec<Core>,
    /// The threads taking part in the simulation.
    threads: Slab<ManagedThread>,
    shutdown: bool,
    /// The first panic raised by a managed thread.
    panic: Option<Box<dyn Any + Send>>,
    timer: Option<JoinHandle<()>>,
}

struct Core {
    /// The thread holding this core's turn.
    active: Option<ThreadId>,
    /// Kernel-managed interrupts are masked.
    masked: bool,
    /// A context switch was requested by `yield_cpu` or `yield_core`.
    switch_pending: bool,
    /// Only used on core 0, which handles the tick.
    tick_pending: bool,
    irqs: VecDeque<fn()>,
}

impl Core {
    const fn new() -> Self {
        Self {
            active: None,
            masked: false,
            switch_pending: false,
            tick_pending: false,
            irqs: VecDeque::new(),
        }
    }

    fn has_pending(&self) -> bool {
        self.tick_pending || self.switch_pending || !self.irqs.is_empty()
    }
}

struct ManagedThread {
    /// The thread's task was deleted. The thread must never run again.
    doomed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ThreadId(usize);

#[derive(Debug)]
pub struct TaskState {
    /// The task's state in the task state machine.
    ///
    /// This field is only accessed with CPU Lock or with `State::machine`
    /// locked, so `SpinMutex` is sufficient.
    tsm: SpinMutex<Tsm>,
}

impl Init for TaskState {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

/// Task state machine
///
/// These don't exactly align with the task states defined in the kernel.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Tsm {
    /// The task's context state is not initialized. The kernel has to call
    /// `initialize_task_state` first before choosing this task as the running
    /// task.
    Uninit,
    /// The task's context state is initialized but hasn't started running.
    Dormant,
    /// The task has a backing thread.
    Running(ThreadId),
}

/// The role of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    Unknown,
    Boot,
    /// A task thread running an interrupt handler or the dispatcher.
    Interrupt,
    /// The backing thread for a task.
    Task,
}

thread_local! {
    /// The current thread's role. It's automatically assigned after the
    /// creation of a thread managed by the port.
    static THREAD_ROLE: Cell<ThreadRole> = const { Cell::new(ThreadRole::Unknown) };
    static THREAD_ID: Cell<Option<ThreadId>> = const { Cell::new(None) };
    /// The core the current thread holds the turn of.
    static CORE: Cell<usize> = const { Cell::new(0) };
}

fn thread_role() -> ThreadRole {
    THREAD_ROLE.with(Cell::get)
}

fn current_core() -> usize {
    CORE.with(Cell::get)
}

/// Assert that the current thread is a managed thread.
fn expect_worker_thread() -> ThreadRole {
    let role = thread_role();
    assert_ne!(
        role,
        ThreadRole::Unknown,
        "this function can only be called from a port-managed thread"
    );
    role
}

/// What the dispatching thread does once it handed over the turn.
#[derive(Clone, Copy, PartialEq, Eq)]
enum AfterDispatch {
    /// Wait for the turn to come back.
    Wait,
    /// Return immediately. The thread won't run as a task again.
    Leave,
}

impl TaskState {
    pub const fn new() -> Self {
        Self {
            tsm: SpinMutex::new(Tsm::Uninit),
        }
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::missing_safety_doc)]
impl State {
    pub const fn new() -> Self {
        Self {
            machine: Mutex::new(Machine {
                cores: Vec::new(),
                threads: Slab::new(),
                shutdown: false,
                panic: None,
                timer: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Lock the machine. A managed thread calling this after shutdown parks
    /// forever.
    fn lock(&self) -> MutexGuard<'_, Machine> {
        let m = self.machine.lock().unwrap_or_else(PoisonError::into_inner);
        if m.shutdown && thread_role() != ThreadRole::Unknown {
            self.park_forever(m);
        }
        m
    }

    fn wait<'a>(&self, m: MutexGuard<'a, Machine>) -> MutexGuard<'a, Machine> {
        self.cond.wait(m).unwrap_or_else(PoisonError::into_inner)
    }

    /// Withdraw the current thread from the simulation.
    fn park_forever(&self, mut m: MutexGuard<'_, Machine>) -> ! {
        if let Some(ThreadId(id)) = THREAD_ID.with(Cell::get) {
            log::trace!("thread {id} is leaving the simulation");
            m.threads.try_remove(id);
        }
        loop {
            m = self.wait(m);
        }
    }

    /// Stop the simulation, recording `payload` to be resumed by
    /// [`Self::port_boot`].
    fn abort(&self, payload: Box<dyn Any + Send>) {
        let mut m = self.machine.lock().unwrap_or_else(PoisonError::into_inner);
        log::debug!("a managed thread panicked, shutting down");
        m.panic.get_or_insert(payload);
        m.shutdown = true;
        self.cond.notify_all();
    }

    /// Spawn a managed thread. It starts running `body` when it receives a
    /// turn.
    fn spawn_thread(
        &'static self,
        m: &mut Machine,
        name: &str,
        role: ThreadRole,
        body: impl FnOnce() + Send + 'static,
    ) -> ThreadId {
        let id = ThreadId(m.threads.insert(ManagedThread { doomed: false }));
        log::trace!("spawning thread {id:?} ({name:?})");

        thread::Builder::new()
            .name(format!("{name}#{}", id.0))
            .spawn(move || {
                THREAD_ROLE.with(|r| r.set(role));
                THREAD_ID.with(|t| t.set(Some(id)));
                drop(self.wait_for_turn(self.lock(), id));

                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(body)) {
                    self.abort(payload);
                }
            })
            .expect("failed to spawn a host thread");
        id
    }

    /// Block the current thread until it holds the turn of some core.
    fn wait_for_turn<'a>(
        &self,
        mut m: MutexGuard<'a, Machine>,
        id: ThreadId,
    ) -> MutexGuard<'a, Machine> {
        loop {
            if m.shutdown || m.threads.get(id.0).map_or(true, |t| t.doomed) {
                self.park_forever(m);
            }
            if let Some(core) = m.cores.iter().position(|c| c.active == Some(id)) {
                CORE.with(|c| c.set(core));
                return m;
            }
            m = self.wait(m);
        }
    }

    /// Initialize the simulated machine and boot the kernel.
    ///
    /// Returns when the shutdown initiated by [`shutdown`] completes.
    pub fn port_boot<Traits: PortInstance>(&'static self) {
        {
            let mut m = self.lock();
            assert!(m.cores.is_empty(), "the system was already booted");
            m.cores = (0..Traits::NUM_CORES).map(|_| Core::new()).collect();

            // The boot phase runs on core 0
            let thread = self.spawn_thread(&mut m, "boot", ThreadRole::Boot, || {
                // Safety: We are a port, so it's okay to call this
                unsafe { <Traits as PortToKernel>::boot() };
            });
            m.cores[0].active = Some(thread);
            self.cond.notify_all();
        }

        // Wait until the simulation shuts down
        let mut m = self.lock();
        while !m.shutdown {
            m = self.wait(m);
        }
        let timer = m.timer.take();
        let result = m.panic.take();
        drop(m);

        if let Some(timer) = timer {
            log::trace!("stopping the timer thread");
            let _ = timer.join();
        }

        // Propagate any panic that occured in a managed thread
        if let Some(payload) = result {
            panic::resume_unwind(payload);
        }
    }

    fn spawn_timer(&'static self, period: Duration) -> JoinHandle<()> {
        log::trace!("starting the timer thread");
        thread::Builder::new()
            .name("tick".to_owned())
            .spawn(move || loop {
                thread::sleep(period);
                let mut m = self.lock();
                if m.shutdown {
                    break;
                }
                m.cores[0].tick_pending = true;
                self.cond.notify_all();
            })
            .expect("failed to spawn the timer thread")
    }

    /// Take pending interrupts and context switch requests on the current
    /// core.
    fn interrupt_point<Traits: PortInstance>(&'static self) {
        // The boot phase and interrupt handlers are never preempted. Anything
        // pended by a handler is taken when it returns to the loop below.
        if thread_role() != ThreadRole::Task {
            return;
        }

        let mut m = self.lock();
        loop {
            let core = current_core();
            let c = &mut m.cores[core];
            if c.masked {
                return;
            }

            if mem::take(&mut c.tick_pending) {
                m = self.run_isr(m, || {
                    // Safety: An interrupt context, interrupts unmasked
                    unsafe { <Traits as PortToKernel>::timer_tick() };
                });
            } else if let Some(handler) = c.irqs.pop_front() {
                m = self.run_isr(m, handler);
            } else if mem::take(&mut c.switch_pending) {
                // The context switch has the lowest priority
                m = self.dispatch::<Traits>(m, core, AfterDispatch::Wait);
            } else {
                return;
            }
        }
    }

    fn run_isr<'a>(
        &'a self,
        m: MutexGuard<'a, Machine>,
        handler: impl FnOnce(),
    ) -> MutexGuard<'a, Machine> {
        drop(m);
        let role = THREAD_ROLE.with(|r| r.replace(ThreadRole::Interrupt));
        handler();
        THREAD_ROLE.with(|r| r.set(role));
        self.lock()
    }

    /// Choose the next task to run on `core` and hand over the core's turn to
    /// its thread, spawning one if it has none.
    fn dispatch<Traits: PortInstance>(
        &'static self,
        mut m: MutexGuard<'static, Machine>,
        core: usize,
        after: AfterDispatch,
    ) -> MutexGuard<'static, Machine> {
        m.cores[core].masked = true;
        drop(m);

        let role = THREAD_ROLE.with(|r| r.replace(ThreadRole::Interrupt));
        let saved_core = CORE.with(|c| c.replace(core));
        // Safety: Interrupts masked
        unsafe { <Traits as PortToKernel>::choose_running_task() };
        THREAD_ROLE.with(|r| r.set(role));

        let task_ptr = Traits::state().running_task_ptr(core);
        assert!(!task_ptr.is_null(), "no task was chosen");
        // Safety: The chosen task's control block is not reclaimed while
        //         it's the running task of `core`, which is until the next
        //         dispatch on `core`
        let task = unsafe { &*task_ptr };

        let mut m = self.lock();
        let target = {
            let mut tsm = task.port_task_state.tsm.lock();
            match *tsm {
                Tsm::Running(thread) => thread,
                Tsm::Dormant => {
                    let attr = task.attr;
                    let thread =
                        self.spawn_thread(&mut m, attr.name, ThreadRole::Task, move || {
                            log::debug!("task {:?} is now running", attr.name);
                            (attr.entry_point)(attr.entry_param);

                            match System::<Traits>::exit_task() {
                                Ok(never) => match never {},
                                Err(e) => panic!("task {:?} failed to exit: {e:?}", attr.name),
                            }
                        });
                    *tsm = Tsm::Running(thread);
                    thread
                }
                Tsm::Uninit => unreachable!("dispatching an uninitialized task"),
            }
        };
        log::trace!("core {core}: dispatching task {task_ptr:p} on thread {target:?}");

        // The incoming task always resumes with interrupts unmasked
        let c = &mut m.cores[core];
        c.active = Some(target);
        c.masked = false;
        self.cond.notify_all();
        CORE.with(|c| c.set(saved_core));

        match (after, THREAD_ID.with(Cell::get)) {
            (AfterDispatch::Wait, Some(me)) if me != target => self.wait_for_turn(m, me),
            (AfterDispatch::Wait, Some(_)) => {
                CORE.with(|c| c.set(core));
                m
            }
            _ => m,
        }
    }

    pub unsafe fn dispatch_first_task<Traits: PortInstance>(&'static self) -> ! {
        log::trace!("dispatch_first_task");
        assert_eq!(expect_worker_thread(), ThreadRole::Boot);

        let mut m = self.lock();
        for core in (0..Traits::NUM_CORES).rev() {
            m = self.dispatch::<Traits>(m, core, AfterDispatch::Leave);
        }

        if let Some(period) = Traits::TICK_PERIOD {
            m.timer = Some(self.spawn_timer(period));
        }

        // The boot context is discarded
        self.park_forever(m)
    }

    pub unsafe fn yield_cpu<Traits: PortInstance>(&'static self) {
        log::trace!("yield_cpu");
        expect_worker_thread();

        let mut m = self.lock();
        let c = &mut m.cores[current_core()];
        c.switch_pending = true;
        let masked = c.masked;
        drop(m);

        if !masked {
            self.interrupt_point::<Traits>();
        }
    }

    pub unsafe fn yield_core<Traits: PortInstance>(&'static self, core: usize) {
        log::trace!("yield_core({core})");
        expect_worker_thread();

        let mut m = self.lock();
        m.cores[core].switch_pending = true;
        self.cond.notify_all();
    }

    pub unsafe fn exit_and_dispatch<Traits: PortInstance>(
        &'static self,
        task: &TaskCb<TaskState>,
    ) -> ! {
        log::trace!("exit_and_dispatch({task:p})");
        assert_eq!(expect_worker_thread(), ThreadRole::Task);

        // Dissociate this thread from the task
        *task.port_task_state.tsm.lock() = Tsm::Uninit;

        let m = self.lock();
        assert!(m.cores[current_core()].masked);
        let m = self.dispatch::<Traits>(m, current_core(), AfterDispatch::Leave);
        self.park_forever(m)
    }

    pub unsafe fn disable_interrupts<Traits: PortInstance>(&self) {
        expect_worker_thread();
        self.lock().cores[current_core()].masked = true;
    }

    pub unsafe fn enable_interrupts<Traits: PortInstance>(&'static self) {
        expect_worker_thread();
        self.lock().cores[current_core()].masked = false;
        self.interrupt_point::<Traits>();
    }

    pub unsafe fn set_interrupt_mask_from_isr<Traits: PortInstance>(&self) -> usize {
        expect_worker_thread();
        let mut m = self.lock();
        mem::replace(&mut m.cores[current_core()].masked, true) as usize
    }

    pub unsafe fn clear_interrupt_mask_from_isr<Traits: PortInstance>(&'static self, mask: usize) {
        expect_worker_thread();
        self.lock().cores[current_core()].masked = mask != 0;
        self.interrupt_point::<Traits>();
    }

    pub fn core_id<Traits: PortInstance>(&self) -> usize {
        expect_worker_thread();
        current_core()
    }

    pub fn is_interrupt_context<Traits: PortInstance>(&self) -> bool {
        expect_worker_thread() == ThreadRole::Interrupt
    }

    pub unsafe fn initialize_task_state<Traits: PortInstance>(&self, task: &TaskCb<TaskState>) {
        log::trace!("initialize_task_state({task:p})");
        expect_worker_thread();

        let mut tsm = task.port_task_state.tsm.lock();
        match *tsm {
            Tsm::Uninit => *tsm = Tsm::Dormant,
            Tsm::Dormant | Tsm::Running(_) => unreachable!("task initialized twice"),
        }
    }

    pub unsafe fn finalize_task_state<Traits: PortInstance>(&self, task: &TaskCb<TaskState>) {
        log::trace!("finalize_task_state({task:p})");
        expect_worker_thread();

        let mut m = self.lock();
        let old = mem::replace(&mut *task.port_task_state.tsm.lock(), Tsm::Uninit);
        if let Tsm::Running(thread) = old {
            // The thread is parked in `wait_for_turn`. Let it leave.
            if let Some(t) = m.threads.get_mut(thread.0) {
                t.doomed = true;
            }
            self.cond.notify_all();
        }
    }

    pub unsafe fn idle_wait<Traits: PortInstance>(&'static self) {
        let mut m = self.lock();
        while !m.cores[current_core()].has_pending() {
            m = self.wait(m);
            if m.shutdown {
                self.park_forever(m);
            }
        }
        drop(m);
        self.interrupt_point::<Traits>();
    }

    fn pend<Traits: PortInstance>(&'static self, core: usize, f: impl FnOnce(&mut Core)) {
        let mut m = self.lock();
        f(&mut m.cores[core]);
        self.cond.notify_all();
        drop(m);

        if thread_role() == ThreadRole::Task && current_core() == core {
            self.interrupt_point::<Traits>();
        }
    }
}

/// Boot the kernel and run it until [`shutdown`] is called.
///
/// A panic raised by a task or an interrupt handler stops the simulation and
/// is resumed here.
pub fn boot<Traits: PortInstance>() {
    Traits::port_state().port_boot::<Traits>();
}

/// Initiate shutdown.
///
/// [`boot`] returns after this. Managed threads are parked at their next
/// interaction with the port.
///
/// Note: There is no safe way to restart the simulated system without
/// restarting an entire process.
pub fn shutdown<Traits: PortInstance>() {
    let state = Traits::port_state();
    let mut m = state.machine.lock().unwrap_or_else(PoisonError::into_inner);
    log::debug!("shutdown requested");
    m.shutdown = true;
    state.cond.notify_all();
}

/// Pend an interrupt on `core`. `handler` runs in an interrupt context on
/// the thread holding the core's turn, at its next interrupt point.
///
/// This can be called from any thread, including host threads unknown to
/// the port.
pub fn pend_interrupt<Traits: PortInstance>(core: usize, handler: fn()) {
    log::trace!("pend_interrupt({core})");
    assert!(core < Traits::NUM_CORES, "core {core} doesn't exist");
    Traits::port_state().pend::<Traits>(core, |c| c.irqs.push_back(handler));
}

/// Pend a tick interrupt on core 0.
pub fn pend_tick<Traits: PortInstance>() {
    log::trace!("pend_tick");
    Traits::port_state().pend::<Traits>(0, |c| c.tick_pending = true);
}

/// Take pending interrupts and context switches, as if the current task was
/// interrupted here. Does nothing outside a task context.
pub fn interrupt_point<Traits: PortInstance>() {
    if thread_role() != ThreadRole::Unknown {
        Traits::port_state().interrupt_point::<Traits>();
    }
}

/// Instantiate the port.
///
/// ```rust,ignore
/// // A uniprocessor system with a 1 ms tick
/// kestrel_port_std::use_port!(unsafe struct SystemTraits);
///
/// // A dual-core system without a periodic tick
/// kestrel_port_std::use_port!(unsafe struct SystemTraits, num_cores = 2, tick_period = None);
/// ```
#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $SystemTraits:ident) => {
        $crate::use_port!(
            unsafe $vis struct $SystemTraits,
            num_cores = 1,
            tick_period = Some($crate::DEFAULT_TICK_PERIOD)
        );
    };
    (unsafe $vis:vis struct $SystemTraits:ident, num_cores = $num_cores:expr) => {
        $crate::use_port!(
            unsafe $vis struct $SystemTraits,
            num_cores = $num_cores,
            tick_period = Some($crate::DEFAULT_TICK_PERIOD)
        );
    };
    (unsafe $vis:vis struct $SystemTraits:ident, tick_period = $tick_period:expr) => {
        $crate::use_port!(
            unsafe $vis struct $SystemTraits,
            num_cores = 1,
            tick_period = $tick_period
        );
    };
    (
        unsafe $vis:vis struct $SystemTraits:ident,
        num_cores = $num_cores:expr,
        tick_period = $tick_period:expr
    ) => {
        $vis struct $SystemTraits;

        mod port_std_impl {
            use super::$SystemTraits;
            use $crate::kestrel_kernel::{PortThreading, TaskCb};
            use $crate::{State, TaskState, PortInstance};

            pub(super) static PORT_STATE: State = State::new();

            unsafe impl PortInstance for $SystemTraits {
                const TICK_PERIOD: Option<::std::time::Duration> = $tick_period;

                #[inline]
                fn port_state() -> &'static State {
                    &PORT_STATE
                }
            }

            // Assume `$SystemTraits: KernelCfg`
            unsafe impl PortThreading for $SystemTraits {
                type PortTaskState = TaskState;
                #[allow(clippy::declare_interior_mutable_const)]
                const PORT_TASK_STATE_INIT: Self::PortTaskState = TaskState::new();

                const NUM_CORES: usize = $num_cores;

                fn core_id() -> usize {
                    PORT_STATE.core_id::<Self>()
                }

                unsafe fn dispatch_first_task() -> ! {
                    unsafe { PORT_STATE.dispatch_first_task::<Self>() }
                }

                unsafe fn yield_cpu() {
                    unsafe { PORT_STATE.yield_cpu::<Self>() }
                }

                unsafe fn yield_core(core: usize) {
                    unsafe { PORT_STATE.yield_core::<Self>(core) }
                }

                unsafe fn exit_and_dispatch(task: &TaskCb<TaskState>) -> ! {
                    unsafe { PORT_STATE.exit_and_dispatch::<Self>(task) }
                }

                unsafe fn disable_interrupts() {
                    unsafe { PORT_STATE.disable_interrupts::<Self>() }
                }

                unsafe fn enable_interrupts() {
                    unsafe { PORT_STATE.enable_interrupts::<Self>() }
                }

                unsafe fn set_interrupt_mask_from_isr() -> usize {
                    unsafe { PORT_STATE.set_interrupt_mask_from_isr::<Self>() }
                }

                unsafe fn clear_interrupt_mask_from_isr(mask: usize) {
                    unsafe { PORT_STATE.clear_interrupt_mask_from_isr::<Self>(mask) }
                }

                fn is_interrupt_context() -> bool {
                    PORT_STATE.is_interrupt_context::<Self>()
                }

                unsafe fn initialize_task_state(task: &TaskCb<TaskState>) {
                    unsafe { PORT_STATE.initialize_task_state::<Self>(task) }
                }

                unsafe fn finalize_task_state(task: &TaskCb<TaskState>) {
                    unsafe { PORT_STATE.finalize_task_state::<Self>(task) }
                }

                unsafe fn idle_wait() {
                    unsafe { PORT_STATE.idle_wait::<Self>() }
                }
            }
        }
    };
}
