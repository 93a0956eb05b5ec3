//! Trace hooks report task lifecycle events and context switches, and
//! tasks can be enumerated.
use kestrel_kernel::{System, TaskAttr, TaskId, Tick};
use kestrel_port_std::PortInstance;
use std::sync::{Mutex, OnceLock};

use crate::{Driver, KernelTest};

pub struct App;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Create(TaskId),
    Delete(TaskId),
    Ready(TaskId),
    Out(TaskId),
    In(TaskId),
    Tick(Tick),
}

static EVENTS: Mutex<Vec<Event>> = Mutex::new(Vec::new());
static TASK1: OnceLock<TaskId> = OnceLock::new();

fn record(e: Event) {
    EVENTS.lock().unwrap().push(e);
}

fn take_events() -> Vec<Event> {
    std::mem::take(&mut *EVENTS.lock().unwrap())
}

impl KernelTest for App {
    fn startup<Traits: PortInstance, D: Driver>() {
        System::<Traits>::create_task(TaskAttr::new(task1_body::<Traits, D>).priority(1)).unwrap();
    }

    fn trace_task_create(task: TaskId) {
        record(Event::Create(task));
    }

    fn trace_task_delete(task: TaskId) {
        record(Event::Delete(task));
    }

    fn trace_moved_to_ready(task: TaskId) {
        record(Event::Ready(task));
    }

    fn trace_task_switched_out(task: TaskId) {
        record(Event::Out(task));
    }

    fn trace_task_switched_in(task: TaskId) {
        record(Event::In(task));
    }

    fn trace_increment_tick(tick_count: Tick) {
        record(Event::Tick(tick_count));
    }
}

fn task1_body<Traits: PortInstance, D: Driver>(_: usize) {
    let task1 = System::<Traits>::current_task().unwrap();
    TASK1.set(task1).unwrap();
    take_events();

    // Preempted by `task2` until it suspends itself
    let task2 =
        System::<Traits>::create_task(TaskAttr::new(task2_body::<Traits>).priority(2)).unwrap();
    assert_eq!(take_events(), [Event::Out(task2), Event::In(task1)]);

    kestrel_port_std::pend_tick::<Traits>();
    assert_eq!(take_events(), [Event::Tick(1)]);

    // `task2` runs to completion
    System::<Traits>::resume_task(task2).unwrap();
    assert_eq!(
        take_events(),
        [
            Event::Ready(task2),
            Event::Out(task1),
            Event::In(task2),
            Event::Delete(task2),
            Event::Out(task2),
            Event::In(task1),
        ]
    );

    // `task1` and the idle task remain
    assert_eq!(System::<Traits>::task_count(), 2);
    let mut tasks = [task2; 4];
    assert_eq!(System::<Traits>::enumerate_tasks(&mut tasks), 2);
    assert!(tasks[..2].contains(&task1));
    assert!(!tasks[..2].contains(&task2));

    D::success();
}

fn task2_body<Traits: PortInstance>(_: usize) {
    let task1 = *TASK1.get().unwrap();
    let task2 = System::<Traits>::current_task().unwrap();
    assert_eq!(
        take_events(),
        [
            Event::Create(task2),
            Event::Ready(task2),
            Event::Out(task1),
            Event::In(task2),
        ]
    );

    System::<Traits>::suspend_task(task2).unwrap();
}
