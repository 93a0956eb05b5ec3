//! Two high-priority tasks made Ready together preempt both cores.
use kestrel_kernel::{System, TaskAttr};
use kestrel_port_std::PortInstance;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::{Driver, KernelTest};

pub struct App;

static LOW_STARTED: [AtomicBool; 2] = [AtomicBool::new(false), AtomicBool::new(false)];
static HIGH_STARTED: [AtomicBool; 2] = [AtomicBool::new(false), AtomicBool::new(false)];

impl KernelTest for App {
    fn startup<Traits: PortInstance, D: Driver>() {
        for i in 0..2 {
            System::<Traits>::create_task(
                TaskAttr::new(low_body::<Traits, D>).priority(1).param(i),
            )
            .unwrap();
        }
    }
}

fn spin_until<Traits: PortInstance>(flag: &AtomicBool) {
    while !flag.load(Ordering::Relaxed) {
        kestrel_port_std::interrupt_point::<Traits>();
        std::hint::spin_loop();
    }
}

fn low_body<Traits: PortInstance, D: Driver>(i: usize) {
    LOW_STARTED[i].store(true, Ordering::Relaxed);
    spin_until::<Traits>(&LOW_STARTED[1 - i]);

    if i == 0 {
        // Both tasks become Ready before either core switches
        System::<Traits>::suspend_all().unwrap();
        for k in 0..2 {
            System::<Traits>::create_task(
                TaskAttr::new(high_body::<Traits, D>).priority(5).param(k),
            )
            .unwrap();
        }
        System::<Traits>::resume_all().unwrap();
    }

    // Only runs again if a core is left for it
    loop {
        kestrel_port_std::interrupt_point::<Traits>();
        std::hint::spin_loop();
    }
}

fn high_body<Traits: PortInstance, D: Driver>(k: usize) {
    HIGH_STARTED[k].store(true, Ordering::Relaxed);

    // Completes only if the other high-priority task holds the other core
    spin_until::<Traits>(&HIGH_STARTED[1 - k]);

    if k == 0 {
        D::success();
    }
    loop {
        kestrel_port_std::interrupt_point::<Traits>();
        std::hint::spin_loop();
    }
}
