//! A periodic task wakes up at fixed intervals, and a missed deadline doesn't
//! block.
use kestrel_kernel::{System, TaskAttr};
use kestrel_port_std::PortInstance;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::{Driver, KernelTest};

pub struct App;

static DONE: AtomicBool = AtomicBool::new(false);

impl KernelTest for App {
    fn startup<Traits: PortInstance, D: Driver>() {
        System::<Traits>::create_task(TaskAttr::new(periodic_body::<Traits, D>).priority(2)).unwrap();
        System::<Traits>::create_task(TaskAttr::new(ticker_body::<Traits, D>).priority(1)).unwrap();
    }
}

fn periodic_body<Traits: PortInstance, D: Driver>(_: usize) {
    let mut prev_wake = System::<Traits>::tick_count();
    let start = prev_wake;

    for i in 1..=3 {
        assert_eq!(System::<Traits>::delay_until(&mut prev_wake, 5), Ok(true));
        assert_eq!(prev_wake, start.wrapping_add(5 * i));
        assert_eq!(System::<Traits>::tick_count(), prev_wake);
    }

    // The wake time is in the past
    let mut stale = System::<Traits>::tick_count().wrapping_sub(20);
    assert_eq!(System::<Traits>::delay_until(&mut stale, 5), Ok(false));

    DONE.store(true, Ordering::Relaxed);
    D::success();
}

fn ticker_body<Traits: PortInstance, D: Driver>(_: usize) {
    while !DONE.load(Ordering::Relaxed) {
        kestrel_port_std::pend_tick::<Traits>();
    }
}
