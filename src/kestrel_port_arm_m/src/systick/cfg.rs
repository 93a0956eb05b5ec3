/// The configuration of the SysTick tick source.
pub trait SysTickOptions {
    /// The input clock frequency of SysTick, measured in hertz.
    const FREQUENCY: u32;

    /// The tick rate, measured in hertz. Defaults to `1000`.
    const TICK_RATE_HZ: u32 = 1000;

    /// The SysTick priority value. Defaults to `0xff`, the lowest priority.
    ///
    /// Must not be higher (numerically lower) than
    /// [`ThreadingOptions::CPU_LOCK_PRIORITY_MASK`] because the tick handler
    /// calls into the kernel.
    ///
    /// [`ThreadingOptions::CPU_LOCK_PRIORITY_MASK`]: crate::ThreadingOptions::CPU_LOCK_PRIORITY_MASK
    const INTERRUPT_PRIORITY: u8 = 0xff;
}

/// The largest value the 24-bit reload register can hold, plus one.
pub const MAX_TICK_PERIOD: u32 = 0x100_0000;

/// Calculate the tick period measured in SysTick cycles. Returns `None` if
/// it's out of range `1..=MAX_TICK_PERIOD`.
pub const fn tick_period(frequency: u32, tick_rate_hz: u32) -> Option<u32> {
    if tick_rate_hz == 0 {
        return None;
    }
    let period = frequency / tick_rate_hz;
    if period == 0 || period > MAX_TICK_PERIOD {
        None
    } else {
        Some(period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn periods() {
        assert_eq!(tick_period(64_000_000, 1000), Some(64_000));
        assert_eq!(tick_period(2_000_000, 100), Some(20_000));
        assert_eq!(tick_period(16_777_216, 1), Some(MAX_TICK_PERIOD));
    }

    #[test]
    fn out_of_range() {
        assert_eq!(tick_period(64_000_000, 0), None);
        assert_eq!(tick_period(999, 1000), None);
        assert_eq!(tick_period(16_777_217, 1), None);
    }
}
