//! The tick source based on SysTick.
use cortex_m::peripheral::{scb::SystemHandler, syst::SystClkSource};
use kestrel_kernel::PortToKernel;

use crate::{tick_period, SysTickOptions};

/// Configure and start SysTick.
///
/// # Safety
///
/// The port has the control of SysTick. Interrupts masked.
pub unsafe fn init<Traits: SysTickOptions>() {
    // `validate` rejects out-of-range periods at compile time
    let Some(period) = tick_period(Traits::FREQUENCY, Traits::TICK_RATE_HZ) else {
        return;
    };

    // Safety: We have the control of SysTick
    let mut peripherals = unsafe { cortex_m::Peripherals::steal() };

    // Safety: We don't make "priority-based critical sections"
    unsafe {
        peripherals
            .SCB
            .set_priority(SystemHandler::SysTick, Traits::INTERRUPT_PRIORITY)
    };

    peripherals.SYST.set_clock_source(SystClkSource::Core);
    peripherals.SYST.set_reload(period - 1);
    peripherals.SYST.clear_current();
    peripherals.SYST.enable_interrupt();
    peripherals.SYST.enable_counter();
}

/// Handle a SysTick exception.
///
/// # Safety
///
/// Interrupt context, interrupts unmasked
#[inline(always)]
pub unsafe fn handle_tick<Traits: PortToKernel>() {
    // Safety: Upheld by the caller
    unsafe { Traits::timer_tick() };
}
