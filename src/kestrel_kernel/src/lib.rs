//! Kestrel is the portable core of a preemptive, priority-based real-time
//! scheduler.
//!
//! It keeps the registry of tasks (ready, delayed, suspended, pending
//! cleanup), selects the task to run on each core, drives time slicing from a
//! periodic tick, enforces the critical-section discipline (including the
//! spinlock pair of a multi-core configuration), and provides the
//! blocking/wake contract inter-task primitives are built upon.
//!
//! Everything architecture-specific lives behind [`PortThreading`]: raising
//! the context-switch interrupt, saving and restoring the register file,
//! masking interrupts, and synthesizing a new task's initial frame. A port
//! calls back into the kernel through [`PortToKernel`].
//!
//! # Instantiating a kernel
//!
//! A kernel instance is identified by a *system type* implementing
//! [`PortThreading`] (usually generated by the port's `use_port!` macro) and
//! [`KernelCfg`]. The kernel API is exposed as associated functions of
//! [`System`]`<SystemType>`.
//!
//! ```rust,ignore
//! kestrel_port_std::use_port!(unsafe struct SystemTraits);
//!
//! impl kestrel_kernel::KernelCfg for SystemTraits {
//!     const NUM_PRIORITIES: usize = 8;
//!
//!     fn state() -> &'static kestrel_kernel::State<Self> {
//!         static STATE: kestrel_kernel::State<SystemTraits> = kestrel_kernel::State::new();
//!         &STATE
//!     }
//!
//!     fn startup() {
//!         System::create_task(TaskAttr::new(blink).priority(2)).unwrap();
//!     }
//! }
//!
//! type System = kestrel_kernel::System<SystemTraits>;
//! ```
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
#![warn(clippy::undocumented_unsafe_blocks)]

extern crate alloc;

use core::{fmt, marker::PhantomData};

mod error;
mod klock;
mod notify;
mod sched;
pub mod smp;
mod state;
pub mod task;
mod timeout;
pub mod utils;
mod wait;

pub use self::{
    error::*,
    klock::IsrCriticalState,
    notify::NotifyAction,
    sched::CoreSet,
    state::State,
    task::{TaskAttr, TaskCb, TaskId, TaskSt, TaskStack, STACK_CANARY_LEN},
    timeout::{Tick, TimeOut},
    wait::WaitQueue,
};

/// The maximum number of cores supported.
pub const MAX_CORES: usize = 8;

/// Wraps a system type and exposes the kernel API as associated functions.
pub struct System<Traits>(PhantomData<Traits>);

impl<Traits> fmt::Debug for System<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("System")
    }
}

/// Represents a system type having sufficient trait `impl`s to instantiate
/// the kernel.
pub trait KernelTraits: PortThreading + KernelCfg + 'static {}
impl<T: PortThreading + KernelCfg + 'static> KernelTraits for T {}

/// Implemented by a port.
///
/// # Safety
///
/// Implementing a port is inherently unsafe because it's responsible for
/// initializing the execution environment and providing a dispatcher
/// implementation.
///
/// These methods are only meant to be called by the kernel.
pub unsafe trait PortThreading: Sized + Send + Sync + 'static {
    type PortTaskState: Send + Sync + 'static;

    /// The initial value of [`TaskCb::port_task_state`] for all tasks.
    #[allow(clippy::declare_interior_mutable_const)]
    const PORT_TASK_STATE_INIT: Self::PortTaskState;

    /// The number of cores. Must be in range `1..=MAX_CORES`.
    const NUM_CORES: usize = 1;

    /// The alignment requirement for task stack regions.
    const STACK_ALIGN: usize = core::mem::size_of::<usize>() * 2;

    /// The minimum stack size, which must at least accommodate the initial
    /// frame synthesized by [`Self::initialize_task_state`].
    const STACK_MIN_SIZE: usize = 128;

    /// Get the index of the calling core.
    ///
    /// Precondition: Interrupts are masked, or `NUM_CORES == 1`
    fn core_id() -> usize {
        0
    }

    /// Transfer the control to the task chosen by
    /// [`PortToKernel::choose_running_task`], discarding the current
    /// (startup) context.
    ///
    /// Precondition: Interrupts masked, Startup phase
    unsafe fn dispatch_first_task() -> !;

    /// Pend a context switch on the calling core. The switch takes place
    /// when interrupts are unmasked, or right away if they aren't masked.
    /// Repeated requests before the switch are coalesced.
    unsafe fn yield_cpu();

    /// Pend a context switch on another core.
    ///
    /// The default implementation is for single-core ports, where it's never
    /// called.
    unsafe fn yield_core(_core: usize) {}

    /// Discard the calling task's context, which was just deleted, and
    /// switch to the next task.
    ///
    /// Precondition: Interrupts masked, the task is no longer Running
    unsafe fn exit_and_dispatch(task: &TaskCb<Self::PortTaskState>) -> !;

    /// Mask all kernel-managed interrupts.
    unsafe fn disable_interrupts();

    /// Unmask interrupts masked by [`Self::disable_interrupts`].
    unsafe fn enable_interrupts();

    /// Mask all kernel-managed interrupts from an interrupt handler,
    /// returning the previous mask.
    unsafe fn set_interrupt_mask_from_isr() -> usize;

    /// Restore the mask returned by [`Self::set_interrupt_mask_from_isr`].
    unsafe fn clear_interrupt_mask_from_isr(mask: usize);

    /// Return a flag indicating whether the caller is an interrupt handler.
    fn is_interrupt_context() -> bool;

    /// Prepare the task for activation. More specifically, arrange for the
    /// task to start execution from [`TaskAttr::entry_point`], with
    /// [`TaskAttr::entry_param`] as its argument and its stack pointer at
    /// the top of [`TaskCb::stack`], next time it receives the control.
    /// Returning from the entry point must lead to
    /// [`System::exit_task`].
    ///
    /// Precondition: CPU Lock active, the task has never run
    unsafe fn initialize_task_state(task: &TaskCb<Self::PortTaskState>);

    /// Release the port resources of a task about to be deallocated.
    ///
    /// Precondition: CPU Lock active, the task has stopped running
    unsafe fn finalize_task_state(_task: &TaskCb<Self::PortTaskState>) {}

    /// Wait for an interrupt. Called by the idle task.
    unsafe fn idle_wait() {}
}

/// Methods intended to be called by a port.
///
/// # Safety
///
/// These are only meant to be called by the port.
pub trait PortToKernel {
    /// Initialize runtime structures, create the idle tasks, call
    /// [`KernelCfg::startup`], and start the scheduler.
    ///
    /// Should be called for exactly once by the port.
    unsafe fn boot() -> !;

    /// Determine the next task to run on the calling core and store it in
    /// [`State::running_task_ptr`].
    ///
    /// The port calls this from its context switch handler after saving the
    /// outgoing task's context, and restores the context of the task found
    /// in `running_task_ptr` afterwards.
    ///
    /// Precondition: Interrupts masked
    unsafe fn choose_running_task();

    /// Advance the tick count. Called by the tick interrupt handler (on core
    /// 0 of a multi-core system).
    ///
    /// Precondition: Interrupt context, interrupts unmasked
    unsafe fn timer_tick();
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn boot() -> ! {
        for core in 0..Traits::NUM_CORES {
            let attr = TaskAttr::new(idle_task_body::<Traits>)
                .name("IDLE")
                .priority(0)
                .stack_size(Traits::IDLE_STACK_SIZE);
            if task::create_task_inner::<Traits>(attr, Some(core)).is_err() {
                fatal::<Traits>(Fatal::ContractViolation("failed to create an idle task"));
            }
        }

        Traits::startup();

        // Safety: We are the kernel, and the scheduler is about to start
        unsafe { Traits::disable_interrupts() };
        Traits::state()
            .started
            .store(true, core::sync::atomic::Ordering::Relaxed);

        // Safety: Interrupts masked, Startup phase
        unsafe { Traits::dispatch_first_task() }
    }

    #[inline]
    unsafe fn choose_running_task() {
        // Safety: Upheld by the caller
        unsafe { sched::choose_running_task::<Traits>() }
    }

    #[inline]
    unsafe fn timer_tick() {
        sched::timer_tick::<Traits>();
    }
}

/// The configuration of a kernel instance.
pub trait KernelCfg: PortThreading {
    /// The number of task priority levels. Must be in range `1..=64`.
    /// Priority `0` is the lowest and is used by the idle tasks.
    const NUM_PRIORITIES: usize;

    /// Rotate tasks of equal priority on every tick.
    const TIME_SLICING: bool = true;

    /// Check the outgoing task's stack canary on every context switch.
    const STACK_OVERFLOW_CHECK: bool = true;

    /// The stack size of the idle tasks.
    const IDLE_STACK_SIZE: usize = 1024;

    /// The initial value of the tick count.
    const INITIAL_TICK_COUNT: Tick = 0;

    /// Access the kernel's global state.
    fn state() -> &'static State<Self>;

    /// Called once during boot, before the scheduler starts. This is where
    /// the application creates its initial tasks.
    fn startup() {}

    /// Called repeatedly by the idle task.
    fn idle_hook() {}

    /// Called by the tick handler once for every tick interrupt, after the
    /// tick was processed or pended. Ticks replayed by
    /// [`System::resume_all`] don't call it again.
    fn tick_hook() {}

    /// Called when a task is created, before it's made Ready.
    ///
    /// The `trace_*` hooks are called with the kernel state borrowed and
    /// must not call kernel services.
    fn trace_task_create(_task: TaskId) {}

    /// Called when a task is deleted.
    fn trace_task_delete(_task: TaskId) {}

    /// Called when a task enters the Ready state.
    fn trace_moved_to_ready(_task: TaskId) {}

    /// Called when a core stops running a task in favor of another.
    fn trace_task_switched_out(_task: TaskId) {}

    /// Called when a core selects a task to run.
    fn trace_task_switched_in(_task: TaskId) {}

    /// Called whenever the tick count advances, with the new count. This
    /// includes ticks replayed by [`System::resume_all`].
    fn trace_increment_tick(_tick_count: Tick) {}

    /// Called on an unrecoverable error, with interrupts masked.
    fn fatal_hook(fatal: Fatal) -> ! {
        panic!("{fatal}")
    }

    /// Called when a task was found to have overflowed its stack, with
    /// interrupts masked.
    fn stack_overflow_hook(task: TaskId, name: &'static str) -> ! {
        Self::fatal_hook(Fatal::StackOverflow { task, name })
    }
}

/// Report an unrecoverable error to [`KernelCfg::fatal_hook`].
#[cold]
pub(crate) fn fatal<Traits: KernelTraits>(fatal: Fatal) -> ! {
    // Safety: We are the kernel, and we're not coming back
    unsafe { Traits::disable_interrupts() };
    Traits::fatal_hook(fatal)
}

fn idle_task_body<Traits: KernelTraits>(_: usize) {
    loop {
        System::<Traits>::idle_sweep();
        Traits::idle_hook();
        // Safety: We are the idle task
        unsafe { Traits::idle_wait() };
    }
}
