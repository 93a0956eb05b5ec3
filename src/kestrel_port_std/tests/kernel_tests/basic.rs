//! Runs a task and queries its attributes.
use kestrel_kernel::{System, TaskAttr, TaskSt};
use kestrel_port_std::PortInstance;

use crate::{Driver, KernelTest, SeqTracker};

pub struct App;

static SEQ: SeqTracker = SeqTracker::new();

impl KernelTest for App {
    fn startup<Traits: PortInstance, D: Driver>() {
        assert!(!System::<Traits>::is_scheduler_started());
        System::<Traits>::create_task(
            TaskAttr::new(task_body::<Traits, D>)
                .name("task1")
                .priority(3)
                .param(42),
        )
        .unwrap();
        SEQ.expect_and_replace(0, 1);
    }
}

fn task_body<Traits: PortInstance, D: Driver>(param: usize) {
    SEQ.expect_and_replace(1, 2);
    assert_eq!(param, 42);
    assert!(System::<Traits>::is_scheduler_started());

    let me = System::<Traits>::current_task().unwrap();
    assert_eq!(System::<Traits>::task_name(me), Ok("task1"));
    assert_eq!(System::<Traits>::priority(me), Ok(3));
    assert_eq!(System::<Traits>::effective_priority(me), Ok(3));
    assert_eq!(System::<Traits>::task_state(me), Ok(TaskSt::Running));
    assert_eq!(System::<Traits>::critical_nesting(), 0);
    assert!(!System::<Traits>::is_scheduler_suspended());

    // The idle tasks and `task1`
    assert_eq!(System::<Traits>::task_count(), 2);

    let hwm = System::<Traits>::stack_high_water_mark(me).unwrap();
    assert!(hwm <= TaskAttr::DEFAULT_STACK_SIZE);

    D::success();
}
