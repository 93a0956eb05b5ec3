//! Kernel state locking mechanism
//!
//! Two layers are implemented here:
//!
//!  - The public critical-section API ([`System::enter_critical`] and
//!    friends), which maintains the per-core nesting counter, masks interrupts
//!    through the port, and takes the spinlock pair on multi-core systems.
//!
//!  - *CPU Lock*, the kernel-internal RAII guard built on top of it.
//!    [`CpuLockGuard`] owns the unique token that unlocks [`CpuLockCell`]s, so
//!    the borrow checker proves that kernel state is only touched inside a
//!    critical section.
use core::{ops, sync::atomic::Ordering};
use tokenlock::UnsyncTokenLock;

use crate::{error::BadContextError, utils::Init, Fatal, KernelTraits, System};

pub(super) struct CpuLockTag<Traits>(Traits);

/// The key that "unlocks" [`CpuLockCell`].
pub(super) type CpuLockToken<Traits> = tokenlock::UnsyncSingletonToken<CpuLockTag<Traits>>;

/// The keyhole type for [`UnsyncTokenLock`] that can be "unlocked" by
/// [`CpuLockToken`].
pub(super) type CpuLockKeyhole<Traits> = tokenlock::SingletonTokenId<CpuLockTag<Traits>>;

/// Cell type that can be accessed by [`CpuLockToken`] (which can be obtained
/// by [`lock_cpu`]).
pub(super) struct CpuLockCell<Traits, T: ?Sized>(UnsyncTokenLock<T, CpuLockKeyhole<Traits>>);

impl<Traits, T> CpuLockCell<Traits, T> {
    pub(super) const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(CpuLockKeyhole::INIT, x))
    }
}

impl<Traits, T: Init> Init for CpuLockCell<Traits, T> {
    const INIT: Self = Self::new(T::INIT);
}

impl<Traits, T> ops::Deref for CpuLockCell<Traits, T> {
    type Target = UnsyncTokenLock<T, CpuLockKeyhole<Traits>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// The saved state returned by [`System::enter_critical_from_isr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "the interrupt mask must be restored by `exit_critical_from_isr`"]
pub struct IsrCriticalState {
    mask: usize,
}

/// The critical section API.
impl<Traits: KernelTraits> System<Traits> {
    /// Enter a task-level critical section.
    ///
    /// Masks interrupts up to the kernel priority and increments the calling
    /// core's nesting counter. On the outermost entry of a multi-core system,
    /// the task lock and then the ISR lock are acquired. Calls may be nested;
    /// each must be balanced by [`Self::exit_critical`].
    ///
    /// Must not be called from an interrupt context. Use
    /// [`Self::enter_critical_from_isr`] instead.
    pub fn enter_critical() {
        // Mask first so that the read-modify-write of the counter can't be
        // interrupted
        // Safety: The kernel is allowed to control interrupt masking
        unsafe { Traits::disable_interrupts() };

        let state = Traits::state();
        let core = Traits::core_id();
        let nesting = state.critical_nesting[core].load(Ordering::Relaxed);
        if nesting == 0 && Traits::NUM_CORES > 1 {
            if let Err(e) = state.spinlocks.lock_task_level(core) {
                crate::fatal::<Traits>(e);
            }
        }
        state.critical_nesting[core].store(nesting + 1, Ordering::Relaxed);
    }

    /// Leave a task-level critical section entered by
    /// [`Self::enter_critical`].
    ///
    /// Calling this more times than `enter_critical` is reported to
    /// [`KernelCfg::fatal_hook`](crate::KernelCfg::fatal_hook) as
    /// [`Fatal::CriticalUnderflow`].
    pub fn exit_critical() {
        let state = Traits::state();
        let core = Traits::core_id();
        let nesting = state.critical_nesting[core].load(Ordering::Relaxed);
        if nesting == 0 {
            crate::fatal::<Traits>(Fatal::CriticalUnderflow);
        }
        state.critical_nesting[core].store(nesting - 1, Ordering::Relaxed);

        if nesting == 1 {
            if Traits::NUM_CORES > 1 {
                if let Err(e) = state.spinlocks.unlock_task_level(core) {
                    crate::fatal::<Traits>(e);
                }
            }
            // Safety: The outermost critical section just ended
            unsafe { Traits::enable_interrupts() };
        }
    }

    /// Enter a critical section from an interrupt handler.
    ///
    /// The previous interrupt mask is returned and must be passed to
    /// [`Self::exit_critical_from_isr`]. The nesting counter is not touched.
    /// On a multi-core system the ISR lock is taken (recursively) every time.
    pub fn enter_critical_from_isr() -> IsrCriticalState {
        // Safety: The kernel is allowed to control interrupt masking
        let mask = unsafe { Traits::set_interrupt_mask_from_isr() };
        if Traits::NUM_CORES > 1 {
            if let Err(e) = Traits::state().spinlocks.isr.lock(Traits::core_id()) {
                crate::fatal::<Traits>(e);
            }
        }
        IsrCriticalState { mask }
    }

    /// Leave a critical section entered by
    /// [`Self::enter_critical_from_isr`], restoring the saved interrupt mask.
    pub fn exit_critical_from_isr(saved: IsrCriticalState) {
        if Traits::NUM_CORES > 1 {
            if let Err(e) = Traits::state().spinlocks.isr.unlock(Traits::core_id()) {
                crate::fatal::<Traits>(e);
            }
        }
        // Safety: `saved` was produced by `set_interrupt_mask_from_isr`
        unsafe { Traits::clear_interrupt_mask_from_isr(saved.mask) };
    }

    /// Get the calling core's critical section nesting depth.
    pub fn critical_nesting() -> usize {
        Traits::state().critical_nesting[Traits::core_id()].load(Ordering::Relaxed)
    }
}

/// How a [`CpuLockGuard`] entered the critical section.
#[derive(Debug, Clone, Copy)]
enum LockMode {
    Task,
    Isr(IsrCriticalState),
    /// Interrupts were already masked by the port.
    Masked,
}

/// Attempt to enter a CPU Lock state and get an RAII guard.
///
/// The task-level or ISR-level critical section is chosen based on
/// [`PortThreading::is_interrupt_context`]. Returns `BadContext` if the
/// calling core already holds a `CpuLockGuard` (e.g., when a kernel hook
/// calls back into the kernel).
///
/// [`PortThreading::is_interrupt_context`]: crate::PortThreading::is_interrupt_context
pub(super) fn lock_cpu<Traits: KernelTraits>() -> Result<CpuLockGuard<Traits>, BadContextError> {
    let mode = if Traits::is_interrupt_context() {
        LockMode::Isr(System::<Traits>::enter_critical_from_isr())
    } else {
        System::<Traits>::enter_critical();
        LockMode::Task
    };

    // The core can't change from here on because interrupts are masked
    let core = Traits::core_id();
    let held = &Traits::state().cpu_lock_held[core];
    if held.load(Ordering::Relaxed) {
        leave::<Traits>(mode);
        return Err(BadContextError::BadContext);
    }
    held.store(true, Ordering::Relaxed);

    Ok(CpuLockGuard {
        // Safety: `cpu_lock_held` was clear on this core, and the spinlocks
        //         exclude every other core, so there are no other instances
        //         of `CpuLockToken`
        token: unsafe { CpuLockToken::new_unchecked() },
        mode,
        core,
    })
}

/// Enter a CPU Lock state from the port's context switch handler, where
/// interrupts are already masked. Only the ISR spinlock is taken, and the
/// nesting counter is left alone so that the caller can swap it.
///
/// # Safety
///
/// Interrupts must be masked on the calling core.
pub(super) unsafe fn lock_cpu_masked<Traits: KernelTraits>() -> CpuLockGuard<Traits> {
    let core = Traits::core_id();
    let state = Traits::state();
    if Traits::NUM_CORES > 1 {
        if let Err(e) = state.spinlocks.isr.lock(core) {
            crate::fatal::<Traits>(e);
        }
    }

    if state.cpu_lock_held[core].swap(true, Ordering::Relaxed) {
        crate::fatal::<Traits>(Fatal::ContractViolation(
            "context switch requested while the kernel state is borrowed",
        ));
    }

    CpuLockGuard {
        // Safety: See `lock_cpu`
        token: unsafe { CpuLockToken::new_unchecked() },
        mode: LockMode::Masked,
        core,
    }
}

fn leave<Traits: KernelTraits>(mode: LockMode) {
    match mode {
        LockMode::Task => System::<Traits>::exit_critical(),
        LockMode::Isr(saved) => System::<Traits>::exit_critical_from_isr(saved),
        LockMode::Masked => {
            if Traits::NUM_CORES > 1 {
                if let Err(e) = Traits::state().spinlocks.isr.unlock(Traits::core_id()) {
                    crate::fatal::<Traits>(e);
                }
            }
        }
    }
}

/// RAII guard for a CPU Lock state.
///
/// [`CpuLockToken`] can be borrowed from this type.
pub(super) struct CpuLockGuard<Traits: KernelTraits> {
    token: CpuLockToken<Traits>,
    mode: LockMode,
    core: usize,
}

impl<Traits: KernelTraits> CpuLockGuard<Traits> {
    /// The core that owns this guard.
    #[inline]
    pub(super) fn core(&self) -> usize {
        self.core
    }

    /// Get a mutable reference to the scheduler state.
    #[inline]
    pub(super) fn sched(&mut self) -> &mut crate::sched::Scheduler<Traits::PortTaskState> {
        Traits::state().sched.write(&mut self.token)
    }

    /// Leave CPU Lock without leaving the critical section.
    ///
    /// The caller takes over the critical section entered by [`lock_cpu`]
    /// and must end it through [`System::exit_critical`] or discard it by
    /// [`discard_task_critical`].
    pub(super) fn forget(self) {
        Traits::state().cpu_lock_held[self.core].store(false, Ordering::Relaxed);
        core::mem::forget(self);
    }
}

impl<Traits: KernelTraits> Drop for CpuLockGuard<Traits> {
    fn drop(&mut self) {
        Traits::state().cpu_lock_held[self.core].store(false, Ordering::Relaxed);
        leave::<Traits>(self.mode);
    }
}

impl<Traits: KernelTraits> ops::Deref for CpuLockGuard<Traits> {
    type Target = CpuLockToken<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: KernelTraits> ops::DerefMut for CpuLockGuard<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

/// Drop the calling core's task-level critical section without unmasking
/// interrupts. Used when the current context is about to be discarded.
pub(super) fn discard_task_critical<Traits: KernelTraits>() {
    let state = Traits::state();
    let core = Traits::core_id();
    let nesting = state.critical_nesting[core].swap(0, Ordering::Relaxed);
    if nesting != 0 && Traits::NUM_CORES > 1 {
        // The spinlocks were taken once, at the outermost level
        if let Err(e) = state.spinlocks.unlock_task_level(core) {
            crate::fatal::<Traits>(e);
        }
    }
}
