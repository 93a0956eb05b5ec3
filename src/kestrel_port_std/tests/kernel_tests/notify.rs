//! Direct-to-task notifications from a task and from an interrupt handler.
use kestrel_kernel::{NotifyAction, NotifyError, System, TaskAttr, TaskId, WaitTimeoutError};
use kestrel_port_std::PortInstance;
use std::sync::OnceLock;

use crate::{Driver, KernelTest, SeqTracker};

pub struct App;

static SEQ: SeqTracker = SeqTracker::new();
static RECEIVER: OnceLock<TaskId> = OnceLock::new();

impl KernelTest for App {
    fn startup<Traits: PortInstance, D: Driver>() {
        let receiver =
            System::<Traits>::create_task(TaskAttr::new(receiver_body::<Traits, D>).priority(2))
                .unwrap();
        RECEIVER.set(receiver).unwrap();
        System::<Traits>::create_task(TaskAttr::new(sender_body::<Traits, D>).priority(1)).unwrap();
    }
}

fn receiver_body<Traits: PortInstance, D: Driver>(_: usize) {
    SEQ.expect_and_replace(0, 1);

    // Nothing is pending
    assert_eq!(
        System::<Traits>::notify_take(true, Some(0)),
        Err(WaitTimeoutError::Timeout)
    );

    // Woken by `sender`
    assert_eq!(System::<Traits>::notify_take(false, None), Ok(1));
    SEQ.expect_and_replace(2, 3);

    // Woken by the interrupt handler
    assert_eq!(System::<Traits>::notify_take(true, None), Ok(1));
    SEQ.expect_and_replace(4, 5);

    // Woken by `sender`
    assert_eq!(System::<Traits>::notify_wait(0, u32::MAX, None), Ok(0b100));
    SEQ.expect_and_replace(6, 7);

    // Nothing is pending anymore
    assert_eq!(
        System::<Traits>::notify_wait(0, 0, Some(0)),
        Err(WaitTimeoutError::Timeout)
    );

    let me = System::<Traits>::current_task().unwrap();
    System::<Traits>::suspend_task(me).unwrap();
    unreachable!();
}

fn sender_body<Traits: PortInstance, D: Driver>(_: usize) {
    SEQ.expect_and_replace(1, 2);
    let receiver = *RECEIVER.get().unwrap();

    // Preempted by `receiver`
    System::<Traits>::notify_give(receiver).unwrap();
    SEQ.expect_and_replace(3, 4);

    // The handler must not consume this task's notification
    let me = System::<Traits>::current_task().unwrap();
    System::<Traits>::notify_give(me).unwrap();

    // Preempted by `receiver` after the handler returns
    kestrel_port_std::pend_interrupt::<Traits>(0, isr::<Traits>);
    SEQ.expect_and_replace(5, 6);
    assert_eq!(System::<Traits>::notify_take(true, Some(0)), Ok(1));

    // `receiver` is waiting in `notify_wait`
    System::<Traits>::notify(receiver, NotifyAction::SetBits(0b100)).unwrap();
    SEQ.expect_and_replace(7, 8);

    // `receiver` is suspended now. Overwrite protection:
    System::<Traits>::notify(receiver, NotifyAction::SetValueWithoutOverwrite(1)).unwrap();
    assert_eq!(
        System::<Traits>::notify(receiver, NotifyAction::SetValueWithoutOverwrite(2)),
        Err(NotifyError::QueueOverflow)
    );
    assert_eq!(System::<Traits>::notify_state_clear(receiver), Ok(true));
    assert_eq!(System::<Traits>::notify_state_clear(receiver), Ok(false));

    D::success();
}

fn isr<Traits: PortInstance>() {
    // Can't block in an interrupt handler
    assert_eq!(
        System::<Traits>::delay(1),
        Err(kestrel_kernel::DelayError::BadContext)
    );

    // Only tasks can receive notifications, even without blocking
    assert_eq!(
        System::<Traits>::notify_take(true, Some(0)),
        Err(WaitTimeoutError::BadContext)
    );
    assert_eq!(
        System::<Traits>::notify_wait(0, u32::MAX, Some(0)),
        Err(WaitTimeoutError::BadContext)
    );

    System::<Traits>::notify_give(*RECEIVER.get().unwrap()).unwrap();
}
