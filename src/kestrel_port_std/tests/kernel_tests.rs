//! Runs the kernel test cases on the simulator.
use kestrel_kernel::{TaskId, Tick};
use kestrel_port_std::PortInstance;
use std::{
    panic,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

/// The time after which a test is considered deadlocked.
const TIMEOUT: Duration = Duration::from_secs(30);

struct KernelTestUtil {
    is_successful: AtomicBool,
}

impl KernelTestUtil {
    const fn new() -> Self {
        Self {
            is_successful: AtomicBool::new(false),
        }
    }

    fn success<Traits: PortInstance>(&self) {
        self.is_successful.store(true, Ordering::Relaxed);
        kestrel_port_std::shutdown::<Traits>();
    }

    fn run(&self, boot: fn()) {
        let _ = env_logger::try_init();

        let (send, recv) = mpsc::channel();
        thread::spawn(move || {
            let _ = send.send(panic::catch_unwind(boot));
        });

        match recv.recv_timeout(TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(panic_info)) => panic::resume_unwind(panic_info),
            Err(_) => panic!("The program deadlocked without calling `success`"),
        }

        assert!(
            self.is_successful.load(Ordering::Relaxed),
            "The program shut down without calling `success`"
        );
    }
}

/// The interface between a test case and the test harness.
pub trait Driver: 'static {
    /// Signal the successful completion of the test case and stop the system.
    fn success();
}

/// A test case. Implemented by the `App` type of each test module.
pub trait KernelTest {
    /// Create the initial tasks.
    fn startup<Traits: PortInstance, D: Driver>();

    fn stack_overflow_hook<Traits: PortInstance, D: Driver>(task: TaskId, name: &'static str) -> ! {
        panic!("stack overflow in {task:?} ({name:?})")
    }

    fn tick_hook() {}

    fn trace_task_create(_task: TaskId) {}
    fn trace_task_delete(_task: TaskId) {}
    fn trace_moved_to_ready(_task: TaskId) {}
    fn trace_task_switched_out(_task: TaskId) {}
    fn trace_task_switched_in(_task: TaskId) {}
    fn trace_increment_tick(_tick_count: Tick) {}
}

/// An atomic counter for checking an execution sequence.
pub struct SeqTracker {
    counter: AtomicUsize,
}

impl SeqTracker {
    pub const fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }

    pub fn get(&self) -> usize {
        self.counter.load(Ordering::Relaxed)
    }

    /// Assert that the counter is equal to `old` and then replace it with
    /// `new`.
    #[track_caller]
    pub fn expect_and_replace(&self, old: usize, new: usize) {
        log::debug!("{} (expected: {}) → {}", self.get(), old, new);
        let got = self
            .counter
            .compare_exchange(old, new, Ordering::Relaxed, Ordering::Relaxed)
            .unwrap_or_else(|x| x);
        assert_eq!(got, old, "expected {old}, got {got}");
    }
}

mod kernel_tests {
    pub mod basic;
    pub mod create_preempts;
    pub mod critical_section;
    pub mod delay;
    pub mod delay_until;
    pub mod delete;
    pub mod notify;
    pub mod smp;
    pub mod smp_ready_burst;
    pub mod stack_overflow;
    pub mod suspend;
    pub mod suspend_all;
    pub mod time_slicing;
    pub mod trace;
    pub mod wait_queue;
    pub mod yield_rotation;
}

macro_rules! instantiate_kernel_tests {
    ( $(
        { path: $path:path, name_ident: $name_ident:ident, port: ($($port_opts:tt)*), },
    )* ) => {$(
        mod $name_ident {
            use kestrel_kernel::{KernelCfg, State, TaskId, Tick};
            use $path as test_case;
            use super::KernelTest;

            kestrel_port_std::use_port!(unsafe struct SystemTraits $($port_opts)*);

            struct Driver;
            static TEST_UTIL: super::KernelTestUtil = super::KernelTestUtil::new();

            impl super::Driver for Driver {
                fn success() {
                    TEST_UTIL.success::<SystemTraits>();
                }
            }

            impl KernelCfg for SystemTraits {
                const NUM_PRIORITIES: usize = 8;

                fn state() -> &'static State<Self> {
                    static STATE: State<SystemTraits> = State::new();
                    &STATE
                }

                fn startup() {
                    test_case::App::startup::<SystemTraits, Driver>();
                }

                fn stack_overflow_hook(task: TaskId, name: &'static str) -> ! {
                    test_case::App::stack_overflow_hook::<SystemTraits, Driver>(task, name)
                }

                fn tick_hook() {
                    test_case::App::tick_hook()
                }

                fn trace_task_create(task: TaskId) {
                    test_case::App::trace_task_create(task)
                }

                fn trace_task_delete(task: TaskId) {
                    test_case::App::trace_task_delete(task)
                }

                fn trace_moved_to_ready(task: TaskId) {
                    test_case::App::trace_moved_to_ready(task)
                }

                fn trace_task_switched_out(task: TaskId) {
                    test_case::App::trace_task_switched_out(task)
                }

                fn trace_task_switched_in(task: TaskId) {
                    test_case::App::trace_task_switched_in(task)
                }

                fn trace_increment_tick(tick_count: Tick) {
                    test_case::App::trace_increment_tick(tick_count)
                }
            }

            #[test]
            fn run() {
                TEST_UTIL.run(kestrel_port_std::boot::<SystemTraits>);
            }
        }
    )*};
}

instantiate_kernel_tests!(
    { path: crate::kernel_tests::basic, name_ident: basic, port: (), },
    { path: crate::kernel_tests::create_preempts, name_ident: create_preempts, port: (, tick_period = None), },
    { path: crate::kernel_tests::critical_section, name_ident: critical_section, port: (, tick_period = None), },
    { path: crate::kernel_tests::delay, name_ident: delay, port: (, tick_period = None), },
    { path: crate::kernel_tests::delay_until, name_ident: delay_until, port: (, tick_period = None), },
    { path: crate::kernel_tests::delete, name_ident: delete, port: (), },
    { path: crate::kernel_tests::notify, name_ident: notify, port: (, tick_period = None), },
    { path: crate::kernel_tests::smp, name_ident: smp, port: (, num_cores = 2, tick_period = None), },
    { path: crate::kernel_tests::smp_ready_burst, name_ident: smp_ready_burst, port: (, num_cores = 2, tick_period = None), },
    { path: crate::kernel_tests::stack_overflow, name_ident: stack_overflow, port: (, tick_period = None), },
    { path: crate::kernel_tests::suspend, name_ident: suspend, port: (, tick_period = None), },
    { path: crate::kernel_tests::suspend_all, name_ident: suspend_all, port: (, tick_period = None), },
    { path: crate::kernel_tests::time_slicing, name_ident: time_slicing, port: (), },
    { path: crate::kernel_tests::trace, name_ident: trace, port: (, tick_period = None), },
    { path: crate::kernel_tests::wait_queue, name_ident: wait_queue, port: (, tick_period = None), },
    { path: crate::kernel_tests::yield_rotation, name_ident: yield_rotation, port: (, tick_period = None), },
);
