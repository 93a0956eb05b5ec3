//! `yield_now` rotates tasks of equal priority in FIFO order.
use kestrel_kernel::{System, TaskAttr};
use kestrel_port_std::PortInstance;

use crate::{Driver, KernelTest, SeqTracker};

pub struct App;

static SEQ: SeqTracker = SeqTracker::new();

const NUM_TASKS: usize = 3;
const NUM_ROUNDS: usize = 3;

impl KernelTest for App {
    fn startup<Traits: PortInstance, D: Driver>() {
        for i in 0..NUM_TASKS {
            System::<Traits>::create_task(
                TaskAttr::new(task_body::<Traits, D>).priority(1).param(i),
            )
            .unwrap();
        }
    }
}

fn task_body<Traits: PortInstance, D: Driver>(i: usize) {
    for round in 0..NUM_ROUNDS {
        let step = round * NUM_TASKS + i;
        SEQ.expect_and_replace(step, step + 1);
        System::<Traits>::yield_now().unwrap();
    }

    if i == NUM_TASKS - 1 {
        SEQ.expect_and_replace(NUM_TASKS * NUM_ROUNDS, NUM_TASKS * NUM_ROUNDS + 1);
        D::success();
    }
}
