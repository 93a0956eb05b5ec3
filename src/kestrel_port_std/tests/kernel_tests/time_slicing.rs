//! Tasks of equal priority share the processor through time slicing.
use kestrel_kernel::{System, TaskAttr};
use kestrel_port_std::PortInstance;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{Driver, KernelTest};

pub struct App;

static COUNTERS: [AtomicUsize; 2] = [AtomicUsize::new(0), AtomicUsize::new(0)];

impl KernelTest for App {
    fn startup<Traits: PortInstance, D: Driver>() {
        for i in 0..2 {
            System::<Traits>::create_task(
                TaskAttr::new(task_body::<Traits, D>).priority(1).param(i),
            )
            .unwrap();
        }
    }
}

fn task_body<Traits: PortInstance, D: Driver>(i: usize) {
    // Neither task blocks or yields. They can only make progress in turn if
    // the tick rotates them.
    loop {
        COUNTERS[i].fetch_add(1, Ordering::Relaxed);
        if i == 0 && COUNTERS[1].load(Ordering::Relaxed) > 0 {
            break;
        }
        kestrel_port_std::interrupt_point::<Traits>();
    }

    // Wait until `task1` gets another slice
    let seen = COUNTERS[1].load(Ordering::Relaxed);
    while COUNTERS[1].load(Ordering::Relaxed) == seen {
        kestrel_port_std::interrupt_point::<Traits>();
    }

    D::success();
}
