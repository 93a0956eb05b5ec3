use core::{
    arch::{asm, global_asm},
    cell::UnsafeCell,
    mem::offset_of,
    ptr,
};
use cortex_m::{
    peripheral::{scb::SystemHandler, scb::VectActive, SCB},
    register::{basepri, primask},
};
use kestrel_kernel::{
    utils::Init, Fatal, KernelTraits, PortThreading, PortToKernel, System, TaskCb,
};

use crate::{
    threading::frame::{frame_base, InitialFrame, FRAME_WORDS},
    SysTickOptions, ThreadingOptions,
};

/// Implemented on a system type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
pub unsafe trait PortInstance:
    KernelTraits + PortThreading<PortTaskState = TaskState> + ThreadingOptions + SysTickOptions
{
}

/// The port state shared with the PendSV handler.
///
/// The assembler code relies on the field layout.
#[repr(C)]
pub struct State {
    /// The port state of the running task, or null if the current context
    /// needn't be saved (before the first dispatch or after the running task
    /// exited).
    running: UnsafeCell<*mut TaskState>,
    /// Determines the next task and returns its port state.
    choose_next_task: UnsafeCell<unsafe extern "C" fn() -> *mut TaskState>,
}

const _: () = assert!(offset_of!(State, running) == 0);
const _: () = assert!(offset_of!(State, choose_next_task) == 4);

// Safety: Only accessed with interrupts masked or by the PendSV handler,
//         which can't be preempted by anything touching these fields
unsafe impl Sync for State {}

pub static PORT_STATE: State = State {
    running: UnsafeCell::new(ptr::null_mut()),
    choose_next_task: UnsafeCell::new(choose_next_task_uninit),
};

#[repr(C)]
pub struct TaskState {
    /// The saved stack pointer. Must be the first field.
    sp: UnsafeCell<*mut u32>,
}

// Safety: `sp` is only accessed by the PendSV handler and by
//         `initialize_task_state`, which are serialized
unsafe impl Send for TaskState {}
unsafe impl Sync for TaskState {}

impl Init for TaskState {
    const INIT: Self = Self {
        sp: UnsafeCell::new(ptr::null_mut()),
    };
}

#[allow(non_snake_case)]
extern "C" {
    /// The PendSV handler.
    pub fn PendSV();
}

// Precondition: PendSV has the lowest priority, so it's always taken from
// Thread mode, and the interrupted context is a task using PSP (or a
// context that doesn't need saving, in which case `running` is null)
macro_rules! pend_sv_handler {
    ($save_fpu:literal, $restore_fpu:literal) => {
        global_asm!(
            "
            .section .text.PendSV, \"ax\"
            .global PendSV
            .type PendSV, %function
            .thumb_func
        PendSV:
            movw r0, :lower16:{state}
            movt r0, :upper16:{state}

            # Save the outgoing context unless `running` is null
            ldr r1, [r0]
            cbz r1, 1f
            mrs r2, psp
            stmdb r2!, {{r4-r11}}",
            $save_fpu,
            "
            str lr, [r2, #-4]!
            str r2, [r1]
        1:
            # r0 = the incoming task's `TaskState`
            ldr r1, [r0, #4]
            blx r1

            ldr r2, [r0]
            ldr lr, [r2], #4",
            $restore_fpu,
            "
            ldmia r2!, {{r4-r11}}
            msr psp, r2
            bx lr
            .size PendSV, . - PendSV
            ",
            state = sym PORT_STATE,
        );
    };
}

#[cfg(target_abi = "eabihf")]
pend_sv_handler!(
    "
            tst lr, #0x10
            it eq
            vstmdbeq r2!, {{s16-s31}}",
    "
            tst lr, #0x10
            it eq
            vldmiaeq r2!, {{s16-s31}}"
);

#[cfg(not(target_abi = "eabihf"))]
pend_sv_handler!("", "");

unsafe extern "C" fn choose_next_task_uninit() -> *mut TaskState {
    panic!("dispatcher invoked before boot")
}

/// Called by the PendSV handler after saving the outgoing context.
unsafe extern "C" fn choose_next_task<Traits: PortInstance>() -> *mut TaskState {
    // Safety: We are the dispatcher
    unsafe { PORT_STATE.disable_interrupts::<Traits>() };

    // Safety: Interrupts masked
    unsafe { Traits::choose_running_task() };

    // There's always a task to run because the idle task never blocks
    let task = Traits::state().running_task_ptr(0);
    // Safety: `task` points to the running task's control block, which stays
    //         valid while it's running
    let task_state = unsafe { ptr::addr_of_mut!((*task).port_task_state) };

    // Safety: Interrupts masked
    unsafe { *PORT_STATE.running.get() = task_state };

    // Safety: Balances the above
    unsafe { PORT_STATE.enable_interrupts::<Traits>() };

    task_state
}

/// The entry point of every task. The hardware frame delivers the task's
/// control block in `r0`.
extern "C" fn task_entry<Traits: PortInstance>(task: *const TaskCb<TaskState>) -> ! {
    // Safety: The control block outlives the task's execution
    let attr = unsafe { (*task).attr };
    (attr.entry_point)(attr.entry_param);

    match System::<Traits>::exit_task() {
        Ok(never) => match never {},
        Err(e) => panic!("task {:?} returned in a bad context: {e:?}", attr.name),
    }
}

impl State {
    /// The program entry point.
    ///
    /// # Safety
    ///
    /// Only meant to be called once by the entry point generated by
    /// [`use_port!`]
    pub unsafe fn port_boot<Traits: PortInstance>(&'static self) -> ! {
        // Safety: Boot context
        unsafe { self.disable_interrupts::<Traits>() };

        // Safety: Interrupts masked, PendSV isn't running
        unsafe { *self.choose_next_task.get() = choose_next_task::<Traits> };

        // Safety: We own the system control block
        let mut peripherals = unsafe { cortex_m::Peripherals::steal() };

        // Safety: We don't make "priority-based critical sections"
        unsafe { peripherals.SCB.set_priority(SystemHandler::PendSV, 0xff) };

        // Safety: We have the control of SysTick. Interrupts masked
        unsafe { crate::systick::imp::init::<Traits>() };

        // Safety: We are a port, so it's okay to call this
        unsafe { <Traits as PortToKernel>::boot() }
    }

    pub unsafe fn dispatch_first_task<Traits: PortInstance>(&'static self) -> ! {
        // `running` is null, so the first PendSV doesn't save anything
        SCB::set_pendsv();

        // Safety: Only the port can call this method
        let msp_top = unsafe { Traits::interrupt_stack_top() };

        // Discard the boot context, then unmask interrupts to let PendSV
        // kick in. The boot context never gets the control back.
        //
        // Safety: Thread mode on MSP, interrupts masked
        unsafe {
            asm!(
                "
                mov sp, {msp_top}
                movs r0, #0
                msr basepri, r0
                cpsie i
                isb
            2:
                wfi
                b 2b
                ",
                msp_top = in(reg) msp_top,
                options(noreturn),
            )
        }
    }

    pub unsafe fn yield_cpu<Traits: PortInstance>(&'static self) {
        SCB::set_pendsv();
        cortex_m::asm::dsb();
        cortex_m::asm::isb();
    }

    pub unsafe fn exit_and_dispatch<Traits: PortInstance>(
        &'static self,
        _task: &TaskCb<TaskState>,
    ) -> ! {
        // The exiting task's stack is still usable for the exception frame
        // PendSV is about to push. It's reclaimed only after the switch.
        //
        // Safety: Interrupts masked
        unsafe { *self.running.get() = ptr::null_mut() };

        SCB::set_pendsv();

        // Safety: The context is being discarded
        unsafe { self.enable_interrupts::<Traits>() };

        loop {
            cortex_m::asm::wfi();
        }
    }

    #[inline(always)]
    pub unsafe fn disable_interrupts<Traits: PortInstance>(&self) {
        if Traits::CPU_LOCK_PRIORITY_MASK > 0 {
            // Safety: Upheld by the caller
            unsafe { basepri::write(Traits::CPU_LOCK_PRIORITY_MASK) };
            cortex_m::asm::isb();
        } else {
            cortex_m::interrupt::disable();
        }
    }

    #[inline(always)]
    pub unsafe fn enable_interrupts<Traits: PortInstance>(&self) {
        if Traits::CPU_LOCK_PRIORITY_MASK > 0 {
            // Safety: Upheld by the caller
            unsafe { basepri::write(0) };
        } else {
            // Safety: Upheld by the caller
            unsafe { cortex_m::interrupt::enable() };
        }
        cortex_m::asm::isb();
    }

    #[inline(always)]
    pub unsafe fn set_interrupt_mask_from_isr<Traits: PortInstance>(&self) -> usize {
        let old = if Traits::CPU_LOCK_PRIORITY_MASK > 0 {
            basepri::read() as usize
        } else {
            primask::read().is_inactive() as usize
        };
        // Safety: Upheld by the caller
        unsafe { self.disable_interrupts::<Traits>() };
        old
    }

    #[inline(always)]
    pub unsafe fn clear_interrupt_mask_from_isr<Traits: PortInstance>(&self, mask: usize) {
        if Traits::CPU_LOCK_PRIORITY_MASK > 0 {
            // Safety: Restores the value read by `set_interrupt_mask_from_isr`
            unsafe { basepri::write(mask as u8) };
        } else if mask == 0 {
            // Safety: Interrupts were unmasked when the mask was saved
            unsafe { cortex_m::interrupt::enable() };
        }
        cortex_m::asm::isb();
    }

    #[inline]
    pub fn is_interrupt_context(&self) -> bool {
        SCB::vect_active() != VectActive::ThreadMode
    }

    pub unsafe fn initialize_task_state<Traits: PortInstance>(&self, task: &TaskCb<TaskState>) {
        let stack = task.stack();
        let Some(base) = frame_base(stack.as_ptr() as usize, stack.len()) else {
            Traits::fatal_hook(Fatal::ContractViolation(
                "the stack can't hold the initial frame",
            ));
        };

        let words = InitialFrame {
            pc: task_entry::<Traits> as usize as u32,
            r0: task as *const TaskCb<TaskState> as usize as u32,
            lr: 0,
            preload: cfg!(feature = "preload-registers"),
        }
        .to_words();

        let sp = base as *mut u32;
        // Safety: `frame_base` returned a region inside the task's stack,
        //         which isn't in use because the task has never run
        unsafe {
            ptr::copy_nonoverlapping(words.as_ptr(), sp, FRAME_WORDS);
            *task.port_task_state.sp.get() = sp;
        }
    }

    #[inline]
    pub fn idle_wait<Traits: PortInstance>(&self) {
        if Traits::USE_WFI {
            cortex_m::asm::wfi();
        }
    }
}
