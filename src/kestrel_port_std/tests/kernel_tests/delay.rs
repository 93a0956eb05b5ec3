//! A delayed task is woken after exactly the requested number of ticks and
//! preempts a lower-priority task.
use kestrel_kernel::{System, TaskAttr};
use kestrel_port_std::PortInstance;

use crate::{Driver, KernelTest, SeqTracker};

pub struct App;

static SEQ: SeqTracker = SeqTracker::new();

impl KernelTest for App {
    fn startup<Traits: PortInstance, D: Driver>() {
        System::<Traits>::create_task(TaskAttr::new(task1_body::<Traits, D>).priority(2)).unwrap();
        System::<Traits>::create_task(TaskAttr::new(task2_body::<Traits, D>).priority(1)).unwrap();
    }
}

fn task1_body<Traits: PortInstance, D: Driver>(_: usize) {
    SEQ.expect_and_replace(0, 1);

    let start = System::<Traits>::tick_count();
    System::<Traits>::delay(3).unwrap();
    assert_eq!(System::<Traits>::tick_count(), start.wrapping_add(3));

    SEQ.expect_and_replace(2, 3);
}

fn task2_body<Traits: PortInstance, D: Driver>(_: usize) {
    SEQ.expect_and_replace(1, 2);

    let mut ticks = 0;
    while SEQ.get() == 2 {
        kestrel_port_std::pend_tick::<Traits>();
        ticks += 1;
        assert!(ticks <= 3, "`task1` didn't wake up in time");
    }
    assert_eq!(ticks, 3);

    SEQ.expect_and_replace(3, 4);
    D::success();
}
