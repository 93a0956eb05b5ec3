//! A task whose stack canary was overwritten is reported on its next context
//! switch.
use kestrel_kernel::{System, TaskAttr, TaskId, STACK_CANARY_LEN};
use kestrel_port_std::PortInstance;

use crate::{Driver, KernelTest, SeqTracker};

pub struct App;

static SEQ: SeqTracker = SeqTracker::new();

impl KernelTest for App {
    fn startup<Traits: PortInstance, D: Driver>() {
        System::<Traits>::create_task(
            TaskAttr::new(victim_body::<Traits, D>)
                .priority(1)
                .name("victim"),
        )
        .unwrap();
        System::<Traits>::create_task(TaskAttr::new(bystander_body::<Traits, D>).priority(1))
            .unwrap();
    }

    fn stack_overflow_hook<Traits: PortInstance, D: Driver>(task: TaskId, name: &'static str) -> ! {
        SEQ.expect_and_replace(1, 2);
        assert_eq!(name, "victim");
        log::debug!("stack overflow detected in {task:?}");
        D::success();

        // The system can't continue
        loop {
            std::thread::park();
        }
    }
}

fn victim_body<Traits: PortInstance, D: Driver>(_: usize) {
    SEQ.expect_and_replace(0, 1);

    // Simulate an overflow by scribbling over the bottom of the stack
    let task_cb = Traits::state().running_task_ptr(0);
    // Safety: The running task's control block is valid while it's running.
    //         The bottom of the stack isn't used by the simulator.
    unsafe {
        let stack = (*task_cb).stack();
        assert!(stack.canary_intact());
        stack.as_ptr().write_bytes(0, STACK_CANARY_LEN / 2);
        assert!(!stack.canary_intact());
    }

    // Switch to `bystander`
    System::<Traits>::yield_now().unwrap();
    unreachable!();
}

fn bystander_body<Traits: PortInstance, D: Driver>(_: usize) {
    panic!("`bystander` ran after a stack overflow");
}
