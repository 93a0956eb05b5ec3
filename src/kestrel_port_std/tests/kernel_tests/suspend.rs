//! Suspending a blocked task ends its wait, and a suspended task only runs
//! again after being resumed.
use kestrel_kernel::{
    DelayError, ResumeTaskError, SuspendTaskError, System, TaskAttr, TaskId, TaskSt,
};
use kestrel_port_std::PortInstance;
use std::sync::OnceLock;

use crate::{Driver, KernelTest, SeqTracker};

pub struct App;

static SEQ: SeqTracker = SeqTracker::new();
static TASK1: OnceLock<TaskId> = OnceLock::new();

impl KernelTest for App {
    fn startup<Traits: PortInstance, D: Driver>() {
        let task1 =
            System::<Traits>::create_task(TaskAttr::new(task1_body::<Traits, D>).priority(2))
                .unwrap();
        TASK1.set(task1).unwrap();
        System::<Traits>::create_task(TaskAttr::new(task2_body::<Traits, D>).priority(1)).unwrap();
    }
}

fn task1_body<Traits: PortInstance, D: Driver>(_: usize) {
    SEQ.expect_and_replace(0, 1);

    // Suspended (and resumed) by `task2` while blocked
    assert_eq!(System::<Traits>::delay(1000), Err(DelayError::Interrupted));
    SEQ.expect_and_replace(2, 3);

    let me = System::<Traits>::current_task().unwrap();
    System::<Traits>::suspend_task(me).unwrap();
    SEQ.expect_and_replace(4, 5);
}

fn task2_body<Traits: PortInstance, D: Driver>(_: usize) {
    SEQ.expect_and_replace(1, 2);
    let task1 = *TASK1.get().unwrap();

    assert_eq!(System::<Traits>::task_state(task1), Ok(TaskSt::Blocked));
    assert_eq!(
        System::<Traits>::resume_task(task1),
        Err(ResumeTaskError::BadObjectState)
    );

    System::<Traits>::suspend_task(task1).unwrap();
    assert_eq!(System::<Traits>::task_state(task1), Ok(TaskSt::Suspended));
    assert_eq!(
        System::<Traits>::suspend_task(task1),
        Err(SuspendTaskError::BadObjectState)
    );

    // Preempted by `task1`
    System::<Traits>::resume_task(task1).unwrap();

    // `task1` suspended itself
    SEQ.expect_and_replace(3, 4);
    assert_eq!(System::<Traits>::task_state(task1), Ok(TaskSt::Suspended));

    System::<Traits>::resume_task(task1).unwrap();
    SEQ.expect_and_replace(5, 6);

    D::success();
}
