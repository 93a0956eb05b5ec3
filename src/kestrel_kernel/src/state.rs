//! The per-system kernel state
use core::{
    ptr,
    sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering},
};

use crate::{
    error::BadContextError,
    klock::{CpuLockCell, CpuLockGuard},
    sched::{Scheduler, SchedulerCfg, TraceHooks},
    smp::SpinlockPair,
    task::TaskCb,
    utils::Init,
    KernelCfg, KernelTraits, PortThreading, MAX_CORES,
};

/// The global kernel state of a system type. A port instantiates one as a
/// `static` and returns it from [`KernelCfg::state`].
pub struct State<Traits: PortThreading> {
    pub(crate) sched: CpuLockCell<Traits, Scheduler<Traits::PortTaskState>>,

    /// The task each core is running. Port code reads this to find the
    /// [`TaskCb::port_task_state`] to save to or restore from.
    running_task: [AtomicPtr<TaskCb<Traits::PortTaskState>>; MAX_CORES],

    /// The critical section nesting counter of each core.
    pub(crate) critical_nesting: [AtomicUsize; MAX_CORES],

    /// Set while a core has a `CpuLockGuard`.
    pub(crate) cpu_lock_held: [AtomicBool; MAX_CORES],

    pub(crate) spinlocks: SpinlockPair,

    pub(crate) started: AtomicBool,

    /// A copy of the tick count readable without a critical section.
    pub(crate) tick_count: AtomicU32,
}

// Safety: `sched` is only accessed with the `CpuLockToken`, which is only
// handed out inside a critical section. Everything else is atomic.
unsafe impl<Traits: PortThreading> Sync for State<Traits> {}

impl<Traits: KernelCfg> State<Traits> {
    pub const fn new() -> Self {
        assert!(
            Traits::NUM_CORES >= 1 && Traits::NUM_CORES <= MAX_CORES,
            "`NUM_CORES` is out of range"
        );
        Self {
            sched: CpuLockCell::new(Scheduler::new(SchedulerCfg {
                num_priorities: Traits::NUM_PRIORITIES,
                num_cores: Traits::NUM_CORES,
                time_slicing: Traits::TIME_SLICING,
                initial_tick_count: Traits::INITIAL_TICK_COUNT,
                trace: TraceHooks {
                    task_create: Traits::trace_task_create,
                    task_delete: Traits::trace_task_delete,
                    moved_to_ready: Traits::trace_moved_to_ready,
                    task_switched_out: Traits::trace_task_switched_out,
                    task_switched_in: Traits::trace_task_switched_in,
                    increment_tick: Traits::trace_increment_tick,
                },
            })),
            running_task: [const { AtomicPtr::new(ptr::null_mut()) }; MAX_CORES],
            critical_nesting: Init::INIT,
            cpu_lock_held: Init::INIT,
            spinlocks: SpinlockPair::new(),
            started: AtomicBool::new(false),
            tick_count: AtomicU32::new(Traits::INITIAL_TICK_COUNT),
        }
    }
}

impl<Traits: PortThreading> State<Traits> {
    /// Get the task running on `core`, or a null pointer before the first
    /// dispatch on that core.
    ///
    /// The pointee stays valid until the core switches to another task.
    #[inline]
    pub fn running_task_ptr(&self, core: usize) -> *mut TaskCb<Traits::PortTaskState> {
        self.running_task[core].load(Ordering::Relaxed)
    }

    pub(crate) fn set_running_task(&self, core: usize, task_cb: &TaskCb<Traits::PortTaskState>) {
        self.running_task[core].store(task_cb as *const _ as *mut _, Ordering::Relaxed);
    }

    /// Check whether the scheduler has been started.
    #[inline]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Relaxed)
    }
}

/// Return `BadContext` unless called from a task after the scheduler was
/// started.
pub(crate) fn expect_task_context<Traits: KernelTraits>() -> Result<(), BadContextError> {
    if Traits::is_interrupt_context() || !Traits::state().is_started() {
        Err(BadContextError::BadContext)
    } else {
        Ok(())
    }
}

/// Return `BadContext` unless the calling task can block: it must not be an
/// interrupt handler or an idle task, it must hold no critical section other
/// than `lock`, and the scheduler must not be suspended.
pub(crate) fn expect_waitable_context<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
) -> Result<(), BadContextError> {
    expect_task_context::<Traits>()?;

    let core = lock.core();
    if crate::System::<Traits>::critical_nesting() != 1 {
        return Err(BadContextError::BadContext);
    }

    let sched = lock.sched();
    match sched.running(core) {
        Some(i) if !sched.is_suspended_all() && !sched.is_idle_task(i) => Ok(()),
        _ => Err(BadContextError::BadContext),
    }
}
