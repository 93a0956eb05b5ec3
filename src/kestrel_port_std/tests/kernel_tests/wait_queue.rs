//! Waking tasks blocked on a `WaitQueue`, and waiting with a timeout.
use kestrel_kernel::{System, TaskAttr, WaitQueue, WaitTimeoutError};
use kestrel_port_std::PortInstance;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    OnceLock,
};

use crate::{Driver, KernelTest, SeqTracker};

pub struct App;

static SEQ: SeqTracker = SeqTracker::new();
static DONE: AtomicBool = AtomicBool::new(false);

/// `WaitQueue` is generic over the system type, so it's stored type-erased
fn queue<Traits: PortInstance>() -> &'static WaitQueue<Traits> {
    static QUEUE: OnceLock<Box<dyn std::any::Any + Send + Sync>> = OnceLock::new();
    QUEUE
        .get_or_init(|| Box::new(WaitQueue::<Traits>::new().unwrap()))
        .downcast_ref()
        .unwrap()
}

impl KernelTest for App {
    fn startup<Traits: PortInstance, D: Driver>() {
        queue::<Traits>();
        System::<Traits>::create_task(TaskAttr::new(waker_body::<Traits, D>).priority(1)).unwrap();
        System::<Traits>::create_task(TaskAttr::new(waiter_body::<Traits, D>).priority(3).param(0))
            .unwrap();
        System::<Traits>::create_task(TaskAttr::new(waiter_body::<Traits, D>).priority(2).param(1))
            .unwrap();
        System::<Traits>::create_task(TaskAttr::new(waiter_body::<Traits, D>).priority(2).param(2))
            .unwrap();
    }
}

fn waiter_body<Traits: PortInstance, D: Driver>(i: usize) {
    // Block in order of priority, then creation
    SEQ.expect_and_replace(i, i + 1);
    queue::<Traits>().wait(None).unwrap();

    // Woken by `wake_one` (0) or `wake_all` (1, 2)
    let step = [5, 7, 8][i];
    SEQ.expect_and_replace(step, step + 1);
}

fn waker_body<Traits: PortInstance, D: Driver>(_: usize) {
    let queue = queue::<Traits>();
    SEQ.expect_and_replace(3, 4);
    assert_eq!(queue.num_waiters(), Ok(3));
    SEQ.expect_and_replace(4, 5);

    // Wakes the longest-waiting task, which preempts `waker`
    assert_eq!(queue.wake_one(), Ok(true));
    SEQ.expect_and_replace(6, 7);

    // Wakes the rest in blocking order
    assert_eq!(queue.wake_all(), Ok(2));
    SEQ.expect_and_replace(9, 10);

    assert_eq!(queue.num_waiters(), Ok(0));
    assert_eq!(queue.wake_one(), Ok(false));

    // Zero timeout
    assert_eq!(queue.wait(Some(0)), Err(WaitTimeoutError::Timeout));

    // Nobody wakes `waker`, but `ticker` drives the tick
    System::<Traits>::create_task(TaskAttr::new(ticker_body::<Traits, D>).priority(1)).unwrap();
    let start = System::<Traits>::tick_count();
    assert_eq!(queue.wait(Some(2)), Err(WaitTimeoutError::Timeout));
    assert!(System::<Traits>::tick_count().wrapping_sub(start) >= 2);
    assert_eq!(queue.num_waiters(), Ok(0));

    // `poll` is satisfied by another task
    assert_eq!(
        queue.wait_until(Some(100), || DONE.load(Ordering::Relaxed).then_some(42)),
        Ok(42)
    );

    D::success();
}

fn ticker_body<Traits: PortInstance, D: Driver>(_: usize) {
    let mut ticks = 0;
    while !DONE.load(Ordering::Relaxed) {
        kestrel_port_std::pend_tick::<Traits>();
        ticks += 1;

        // `waker` is now blocked in `wait_until`
        if ticks == 10 {
            DONE.store(true, Ordering::Relaxed);
            queue::<Traits>().wake_one().unwrap();
        }
    }
}
