use crate::{tick_period, SysTickOptions};

/// The configuration of the port.
pub trait ThreadingOptions {
    /// The priority value to which a critical section boosts the current
    /// execution priority. Must be in range `0..256`. Defaults to `0` when
    /// unspecified, in which case critical sections mask all interrupts by
    /// `PRIMASK`.
    ///
    /// Interrupts with priority values lower than this are never masked by
    /// the kernel and must not call the kernel.
    const CPU_LOCK_PRIORITY_MASK: u8 = 0;

    /// Enables the use of the `wfi` instruction in the idle task to save power.
    /// Defaults to `true`.
    const USE_WFI: bool = true;

    /// Get the top of the interrupt stack. Defaults to
    /// `*(SCB.VTOR as *const u32)`.
    ///
    /// # Safety
    ///
    /// This only can be called by the port.
    unsafe fn interrupt_stack_top() -> usize {
        #[cfg(target_os = "none")]
        {
            // Safety: We claimed the ownership of `Peripherals`
            let peripherals = unsafe { cortex_m::Peripherals::steal() };

            // Safety: `unsafe trait`
            unsafe { (peripherals.SCB.vtor.read() as *const usize).read_volatile() }
        }

        #[cfg(not(target_os = "none"))]
        panic!("unsupported target")
    }
}

/// Used by `use_port!`
pub const fn validate<Traits: ThreadingOptions + SysTickOptions>() {
    assert!(
        tick_period(Traits::FREQUENCY, Traits::TICK_RATE_HZ).is_some(),
        "the tick period measured in SysTick cycles must be in range `1..=0x1000000`"
    );
    assert!(
        Traits::INTERRUPT_PRIORITY >= Traits::CPU_LOCK_PRIORITY_MASK,
        "SysTick must be masked by critical sections"
    );
}

/// Instantiate the port.
///
/// The generated system type must additionally implement
/// [`ThreadingOptions`], [`SysTickOptions`], and
/// [`KernelCfg`](kestrel_kernel::KernelCfg).
///
/// # Safety
///
///  - The target must really be a bare-metal Arm-M environment.
///  - You shouldn't interfere with the port's operrations. For example, you
///    shouldn't manually modify `PRIMASK`, `BASEPRI`, or SysTick.
///  - `::cortex_m_rt` should point to the `cortex-m-rt` crate.
///  - `<$sys as `[`ThreadingOptions`]`>::`[`interrupt_stack_top`] must return a
///    valid stack pointer.
///
/// [`interrupt_stack_top`]: ThreadingOptions::interrupt_stack_top
#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $sys:ident) => {
        $vis struct $sys;

        mod port_arm_m_impl {
            use super::$sys;
            use $crate::kestrel_kernel::{utils::Init, PortThreading, TaskCb};
            use $crate::threading::imp::{PortInstance, TaskState, PORT_STATE};

            unsafe impl PortInstance for $sys {}

            unsafe impl PortThreading for $sys {
                type PortTaskState = TaskState;
                #[allow(clippy::declare_interior_mutable_const)]
                const PORT_TASK_STATE_INIT: Self::PortTaskState = Init::INIT;

                const STACK_ALIGN: usize = 8;

                unsafe fn dispatch_first_task() -> ! {
                    unsafe { PORT_STATE.dispatch_first_task::<Self>() }
                }

                unsafe fn yield_cpu() {
                    unsafe { PORT_STATE.yield_cpu::<Self>() }
                }

                unsafe fn exit_and_dispatch(task: &TaskCb<TaskState>) -> ! {
                    unsafe { PORT_STATE.exit_and_dispatch::<Self>(task) }
                }

                #[inline(always)]
                unsafe fn disable_interrupts() {
                    unsafe { PORT_STATE.disable_interrupts::<Self>() }
                }

                #[inline(always)]
                unsafe fn enable_interrupts() {
                    unsafe { PORT_STATE.enable_interrupts::<Self>() }
                }

                #[inline(always)]
                unsafe fn set_interrupt_mask_from_isr() -> usize {
                    unsafe { PORT_STATE.set_interrupt_mask_from_isr::<Self>() }
                }

                #[inline(always)]
                unsafe fn clear_interrupt_mask_from_isr(mask: usize) {
                    unsafe { PORT_STATE.clear_interrupt_mask_from_isr::<Self>(mask) }
                }

                fn is_interrupt_context() -> bool {
                    PORT_STATE.is_interrupt_context()
                }

                unsafe fn initialize_task_state(task: &TaskCb<TaskState>) {
                    unsafe { PORT_STATE.initialize_task_state::<Self>(task) }
                }

                unsafe fn idle_wait() {
                    PORT_STATE.idle_wait::<Self>()
                }
            }
        }

        const _: () = $crate::threading::cfg::validate::<$sys>();

        // Pull the PendSV handler into the link
        #[used]
        static __KESTREL_PEND_SV: unsafe extern "C" fn() = $crate::threading::imp::PendSV;

        #[$crate::cortex_m_rt::entry]
        fn main() -> ! {
            unsafe { $crate::threading::imp::PORT_STATE.port_boot::<$sys>() };
        }

        #[$crate::cortex_m_rt::exception]
        fn SysTick() {
            unsafe { $crate::systick::imp::handle_tick::<$sys>() };
        }
    };
}
