//! A context switch requested in a critical section, and an interrupt pended
//! in one, are deferred until the outermost critical section ends.
use kestrel_kernel::{System, TaskAttr};
use kestrel_port_std::PortInstance;

use crate::{Driver, KernelTest, SeqTracker};

pub struct App;

static SEQ: SeqTracker = SeqTracker::new();

impl KernelTest for App {
    fn startup<Traits: PortInstance, D: Driver>() {
        System::<Traits>::create_task(TaskAttr::new(task1_body::<Traits, D>).priority(1)).unwrap();
    }
}

fn task1_body<Traits: PortInstance, D: Driver>(_: usize) {
    SEQ.expect_and_replace(0, 1);

    System::<Traits>::enter_critical();
    System::<Traits>::enter_critical();
    assert_eq!(System::<Traits>::critical_nesting(), 2);

    // Kernel services can be called in a critical section
    System::<Traits>::create_task(TaskAttr::new(task2_body::<Traits, D>).priority(2)).unwrap();
    SEQ.expect_and_replace(1, 2);

    // Interrupts stay masked
    kestrel_port_std::pend_interrupt::<Traits>(0, isr::<Traits>);
    kestrel_port_std::interrupt_point::<Traits>();
    assert_eq!(SEQ.get(), 2);

    // Blocking is not allowed, though
    assert_eq!(
        System::<Traits>::delay(1),
        Err(kestrel_kernel::DelayError::BadContext)
    );

    System::<Traits>::exit_critical();
    assert_eq!(System::<Traits>::critical_nesting(), 1);
    kestrel_port_std::interrupt_point::<Traits>();
    SEQ.expect_and_replace(2, 3);

    // `isr` and then `task2` run here
    System::<Traits>::exit_critical();
    SEQ.expect_and_replace(5, 6);
    assert_eq!(System::<Traits>::critical_nesting(), 0);

    D::success();
}

fn isr<Traits: PortInstance>() {
    SEQ.expect_and_replace(3, 4);
}

fn task2_body<Traits: PortInstance, D: Driver>(_: usize) {
    SEQ.expect_and_replace(4, 5);
    assert_eq!(System::<Traits>::critical_nesting(), 0);
}
