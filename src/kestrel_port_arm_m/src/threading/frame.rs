//! The initial stack frame of a task.
//!
//! A suspended task's stack holds, from its saved stack pointer upwards:
//!
//! ```text
//!  sp ->  EXC_RETURN
//!         r4 - r11          (software-saved)
//!        [s16 - s31]        (only if EXC_RETURN.FType == 0)
//!         r0 - r3, r12, lr, pc, xPSR
//!        [s0 - s15, FPSCR]  (hardware-saved, lazily)
//! ```
//!
//! A new task starts with the FPU context absent.

/// `EXC_RETURN` for "return to Thread mode, use PSP, no FPU context".
pub const EXC_RETURN_THREAD_PSP: u32 = 0xffff_fffd;

/// The initial `xPSR` value. Only the Thumb bit is set.
pub const XPSR_THUMB: u32 = 1 << 24;

/// The number of words stacked by the processor on exception entry.
pub const HW_FRAME_WORDS: usize = 8;

/// The number of words stacked by the PendSV handler (integer context only).
pub const SW_FRAME_WORDS: usize = 9;

pub const FRAME_WORDS: usize = HW_FRAME_WORDS + SW_FRAME_WORDS;

/// The processor requires an 8-byte aligned stack at exception return.
const FRAME_ALIGN: usize = 8;

/// The register values a new task starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitialFrame {
    /// The address of the first instruction.
    pub pc: u32,
    /// The value passed in `r0`.
    pub r0: u32,
    /// The link register. The entry function must not return, so this is
    /// only ever seen by a debugger unwinding the stack.
    pub lr: u32,
    /// Fill the unused registers with recognizable values.
    pub preload: bool,
}

impl InitialFrame {
    /// Lay out the frame in the order it's popped by the PendSV handler.
    pub fn to_words(&self) -> [u32; FRAME_WORDS] {
        let mut words = [0; FRAME_WORDS];
        let (sw, hw) = words.split_at_mut(SW_FRAME_WORDS);

        sw[0] = EXC_RETURN_THREAD_PSP;
        if self.preload {
            // r4-r11
            for (i, word) in sw[1..].iter_mut().enumerate() {
                *word = 0x0101_0101 * (i as u32 + 4);
            }
            // r1-r3
            for (i, word) in hw[1..4].iter_mut().enumerate() {
                *word = 0x0101_0101 * (i as u32 + 1);
            }
            // r12
            hw[4] = 0x1212_1212;
        }

        hw[0] = self.r0;
        hw[5] = self.lr;
        // A function pointer has its LSB set to mark a Thumb function. The
        // stacked return address must be the exact halfword address.
        hw[6] = self.pc & !1;
        hw[7] = XPSR_THUMB;
        words
    }
}

/// Find where the initial frame of a stack occupying
/// `stack_start..stack_start + stack_len` goes.
///
/// Returns `None` if the region is too small.
pub fn frame_base(stack_start: usize, stack_len: usize) -> Option<usize> {
    let top = stack_start.checked_add(stack_len)? & !(FRAME_ALIGN - 1);
    let base = top.checked_sub(FRAME_WORDS * 4)?;
    (base >= stack_start).then_some(base)
}
