//! Two tasks run on different cores at the same time.
use kestrel_kernel::{System, TaskAttr};
use kestrel_port_std::PortInstance;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::{Driver, KernelTest};

pub struct App;

static FLAGS: [AtomicBool; 2] = [AtomicBool::new(false), AtomicBool::new(false)];

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
    FLAGS[i].store(true, Ordering::Relaxed);

    // This completes only if the other task is running concurrently; there
    // is no tick to switch between them
    while !FLAGS[1 - i].load(Ordering::Relaxed) {
        kestrel_port_std::interrupt_point::<Traits>();
        std::hint::spin_loop();
    }

    // Kernel services work from both cores
    let me = System::<Traits>::current_task().unwrap();
    assert_eq!(System::<Traits>::priority(me), Ok(1));

    if i == 0 {
        D::success();
    }
}
