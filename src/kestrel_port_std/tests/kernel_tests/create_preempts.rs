//! A task creating a higher-priority task is preempted immediately, while a
//! task of equal priority has to wait for its turn.
use kestrel_kernel::{CreateTaskError, System, TaskAttr};
use kestrel_port_std::PortInstance;

use crate::{Driver, KernelTest, SeqTracker};

pub struct App;

static SEQ: SeqTracker = SeqTracker::new();

impl KernelTest for App {
    fn startup<Traits: PortInstance, D: Driver>() {
        System::<Traits>::create_task(TaskAttr::new(task1_body::<Traits, D>).priority(2)).unwrap();
    }
}

fn task1_body<Traits: PortInstance, D: Driver>(_: usize) {
    SEQ.expect_and_replace(0, 1);

    assert_eq!(
        System::<Traits>::create_task(TaskAttr::new(task2_body::<Traits, D>).priority(8)),
        Err(CreateTaskError::BadParam)
    );
    assert_eq!(
        System::<Traits>::create_task(TaskAttr::new(task2_body::<Traits, D>).stack_size(4)),
        Err(CreateTaskError::BadParam)
    );

    // Preempts `task1`
    System::<Traits>::create_task(TaskAttr::new(task2_body::<Traits, D>).priority(3)).unwrap();
    SEQ.expect_and_replace(2, 3);

    // Doesn't preempt `task1`
    System::<Traits>::create_task(TaskAttr::new(task3_body::<Traits, D>).priority(2)).unwrap();
    SEQ.expect_and_replace(3, 4);
}

fn task2_body<Traits: PortInstance, D: Driver>(_: usize) {
    SEQ.expect_and_replace(1, 2);
}

fn task3_body<Traits: PortInstance, D: Driver>(_: usize) {
    SEQ.expect_and_replace(4, 5);
    D::success();
}
