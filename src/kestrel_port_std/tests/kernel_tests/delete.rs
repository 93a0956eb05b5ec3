//! Deleted tasks become inaccessible at once and are reclaimed by the idle
//! task later.
use kestrel_kernel::{DeleteTaskError, GetTaskInfoError, System, TaskAttr, TaskId};
use kestrel_port_std::PortInstance;
use std::sync::OnceLock;

use crate::{Driver, KernelTest, SeqTracker};

pub struct App;

static SEQ: SeqTracker = SeqTracker::new();
static VICTIM: OnceLock<TaskId> = OnceLock::new();

impl KernelTest for App {
    fn startup<Traits: PortInstance, D: Driver>() {
        System::<Traits>::create_task(TaskAttr::new(task1_body::<Traits, D>).priority(2)).unwrap();
        let victim =
            System::<Traits>::create_task(TaskAttr::new(victim_body::<Traits, D>).priority(1))
                .unwrap();
        VICTIM.set(victim).unwrap();
    }
}

fn task1_body<Traits: PortInstance, D: Driver>(_: usize) {
    SEQ.expect_and_replace(0, 1);
    let victim = *VICTIM.get().unwrap();
    let task_count = System::<Traits>::task_count();

    // Delete a task that has never run
    System::<Traits>::delete_task(victim).unwrap();
    assert_eq!(System::<Traits>::task_count(), task_count - 1);
    assert_eq!(
        System::<Traits>::task_state(victim),
        Err(GetTaskInfoError::NoAccess)
    );
    assert_eq!(
        System::<Traits>::delete_task(victim),
        Err(DeleteTaskError::NoAccess)
    );

    // A task returning from its entry point exits
    let exiter =
        System::<Traits>::create_task(TaskAttr::new(exiter_body::<Traits, D>).priority(3))
            .unwrap();
    SEQ.expect_and_replace(2, 3);
    assert_eq!(
        System::<Traits>::task_state(exiter),
        Err(GetTaskInfoError::NoAccess)
    );
    assert_eq!(System::<Traits>::task_count(), task_count - 1);

    // Let the idle task reclaim them
    System::<Traits>::delay(2).unwrap();

    // The slots are reused, but the old handles stay invalid
    let new_task =
        System::<Traits>::create_task(TaskAttr::new(victim_body::<Traits, D>).priority(1))
            .unwrap();
    assert_ne!(new_task, victim);
    assert_ne!(new_task, exiter);
    assert_eq!(
        System::<Traits>::task_state(victim),
        Err(GetTaskInfoError::NoAccess)
    );
    System::<Traits>::delete_task(new_task).unwrap();

    // Delete itself
    SEQ.expect_and_replace(3, 4);
    D::success();
    System::<Traits>::delete_task(System::<Traits>::current_task().unwrap()).unwrap();
    unreachable!();
}

fn victim_body<Traits: PortInstance, D: Driver>(_: usize) {
    panic!("a deleted task ran");
}

fn exiter_body<Traits: PortInstance, D: Driver>(_: usize) {
    SEQ.expect_and_replace(1, 2);
}
