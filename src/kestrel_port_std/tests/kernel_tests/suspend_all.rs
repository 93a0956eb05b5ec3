//! While the scheduler is suspended, context switches and ticks are deferred
//! and replayed on resumption. The tick hook still runs once per tick.
use kestrel_kernel::{SchedulerLockError, System, TaskAttr};
use kestrel_port_std::PortInstance;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::{Driver, KernelTest, SeqTracker};

pub struct App;

static SEQ: SeqTracker = SeqTracker::new();
static START: AtomicU32 = AtomicU32::new(0);
static TICK_HOOK_CALLS: AtomicU32 = AtomicU32::new(0);

impl KernelTest for App {
    fn startup<Traits: PortInstance, D: Driver>() {
        System::<Traits>::create_task(TaskAttr::new(task1_body::<Traits, D>).priority(1)).unwrap();
    }

    fn tick_hook() {
        TICK_HOOK_CALLS.fetch_add(1, Ordering::Relaxed);
    }
}

fn task1_body<Traits: PortInstance, D: Driver>(_: usize) {
    SEQ.expect_and_replace(0, 1);
    assert_eq!(
        System::<Traits>::resume_all(),
        Err(SchedulerLockError::BadContext)
    );

    let start = System::<Traits>::tick_count();
    START.store(start, Ordering::Relaxed);

    System::<Traits>::suspend_all().unwrap();
    System::<Traits>::suspend_all().unwrap();
    assert!(System::<Traits>::is_scheduler_suspended());

    // Doesn't preempt `task1` yet
    System::<Traits>::create_task(TaskAttr::new(task2_body::<Traits, D>).priority(2)).unwrap();

    // The ticks are counted but not processed yet
    kestrel_port_std::pend_tick::<Traits>();
    kestrel_port_std::pend_tick::<Traits>();
    assert_eq!(System::<Traits>::tick_count(), start);
    assert_eq!(TICK_HOOK_CALLS.load(Ordering::Relaxed), 2);

    // Blocking is not allowed
    assert_eq!(
        System::<Traits>::delay(1),
        Err(kestrel_kernel::DelayError::BadContext)
    );

    // The inner call doesn't resume anything
    assert_eq!(System::<Traits>::resume_all(), Ok(false));
    SEQ.expect_and_replace(1, 2);

    // `task2` runs here
    assert_eq!(System::<Traits>::resume_all(), Ok(true));
    SEQ.expect_and_replace(3, 4);
    assert!(!System::<Traits>::is_scheduler_suspended());

    // Replaying doesn't call the hook again
    assert_eq!(TICK_HOOK_CALLS.load(Ordering::Relaxed), 2);

    D::success();
}

fn task2_body<Traits: PortInstance, D: Driver>(_: usize) {
    SEQ.expect_and_replace(2, 3);
    let start = START.load(Ordering::Relaxed);
    assert_eq!(System::<Traits>::tick_count(), start.wrapping_add(2));
}
