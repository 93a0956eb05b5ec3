//! Result codes and per-operation error types
use core::{fmt, mem::transmute};

use crate::{task::TaskId, utils::intrusive_list::ListError};

/// The macro to define [`ResultCode`].
macro_rules! define_result_code {
    (
        $( #[$meta:meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident = $vd:expr
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta] )*
                $vname = $vd
            ),*
        }

        impl ResultCode {
            /// Get the short name of the result code.
            ///
            /// # Examples
            ///
            /// ```
            /// use kestrel_kernel::ResultCode;
            /// assert_eq!(ResultCode::BadObjectState.as_str(), "BadObjectState");
            /// ```
            pub fn as_str(self) -> &'static str {
                match self {
                    $(
                        Self::$vname => stringify!($vname),
                    )*
                }
            }

            fn fmt(self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl fmt::Debug for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                (*self).fmt(f)
            }
        }
    };
}

define_result_code! {
    /// All result codes (including success) that the kernel API can return.
    ///
    /// The numeric values follow the μITRON 4.0 error codes they are closest
    /// to.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(i8)]
    pub enum ResultCode {
        /// The operation was successful. No additional information is available.
        Success = 0,
        /// A parameter is invalid in a way that is no covered by any other error
        /// codes.
        BadParam = -17,
        /// The specified object identifier is invalid, e.g., because the task
        /// it referred to has been deleted and its slot was reused.
        NoAccess = -18,
        /// The current context disallows the operation.
        BadContext = -25,
        /// Memory for a kernel object couldn't be allocated.
        OutOfMemory = -33,
        /// A target object is in a state that disallows the operation.
        BadObjectState = -41,
        /// A notification couldn't be delivered because another one is still
        /// pending.
        QueueOverflow = -43,
        /// The wait operation was forcibly ended, e.g., by [`abort_delay`] or
        /// by the suspension of the waiting task.
        ///
        /// [`abort_delay`]: crate::System::abort_delay
        Interrupted = -49,
        /// The operation timed out.
        Timeout = -50,
    }
}

impl ResultCode {
    /// Get a flag indicating whether the code represents a failure.
    ///
    /// Failure codes have negative values.
    #[inline]
    pub fn is_err(self) -> bool {
        (self as i8) < 0
    }

    /// Get a flag indicating whether the code represents a success.
    ///
    /// Success codes have non-negative values.
    #[inline]
    pub fn is_ok(self) -> bool {
        !self.is_err()
    }
}

macro_rules! define_error {
    (
        mod $mod_name:ident {}
        $( #[$meta:meta] )*
        $vis:vis enum $name:ident $(: $($subty:ident),* $(,)*)? {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        ///
        /// See [`ResultCode`] for all result codes and generic descriptions.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i8)]
        $vis enum $name {
            $(
                $( #[$vmeta] )*
                // Use the same discriminants as `ResultCode` for cost-free
                // conversion
                $vname = ResultCode::$vname as i8
            ),*
        }

        impl fmt::Debug for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl From<Result<(), $name>> for ResultCode {
            #[inline]
            fn from(x: Result<(), $name>) -> Self {
                match x {
                    Ok(()) => Self::Success,
                    Err(e) => Self::from(e),
                }
            }
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                // Safety: `ResultCode` and `$name` has the same representation
                //         type, and the representation of `ResultCode` is a
                //         superset of `x`.
                unsafe { transmute(x) }
            }
        }

        #[cfg(test)]
        mod $mod_name {
            use super::*;

            #[test]
            fn to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from($name::$vname),
                    );
                )*
            }

            #[test]
            fn result_to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from(Err($name::$vname)),
                    );
                )*
                assert_eq!(
                    ResultCode::Success,
                    ResultCode::from(Result::<(), $name>::Ok(())),
                );
            }
        }

        $($(
            $subty!(impl From<_> for $name);
        )*)?

        #[allow(unused_macros)]
        macro_rules! $name {
            (impl From<_> for $dest_ty:ty) => {
                impl From<$name> for $dest_ty {
                    #[inline]
                    fn from(x: $name) -> Self {
                        match x {
                            $(
                                $name::$vname => Self::$vname,
                            )*
                        }
                    }
                }
            };
        }
    };
}

define_error! {
    mod bad_context_error {}
    /// `BadContext`
    pub enum BadContextError {
        BadContext,
    }
}

define_error! {
    mod no_access_error {}
    /// `NoAccess`
    pub enum NoAccessError {
        NoAccess,
    }
}

define_error! {
    mod create_task_error {}
    /// Error type for [`System::create_task`].
    ///
    /// [`System::create_task`]: crate::System::create_task
    pub enum CreateTaskError: BadContextError {
        /// CPU Lock is active.
        BadContext,
        /// The priority is out of range, or the stack is too small to hold an
        /// initial frame.
        BadParam,
        /// The control block or the stack couldn't be allocated.
        OutOfMemory,
    }
}

define_error! {
    mod delete_task_error {}
    /// Error type for [`System::delete_task`].
    ///
    /// [`System::delete_task`]: crate::System::delete_task
    pub enum DeleteTaskError: BadContextError, NoAccessError {
        /// Invalid task handle.
        NoAccess,
        /// CPU Lock is active, or the caller tried to delete itself from an
        /// interrupt context or while the scheduler is suspended.
        BadContext,
        /// The task is the idle task.
        BadObjectState,
    }
}

define_error! {
    mod exit_task_error {}
    /// Error type for [`System::exit_task`].
    ///
    /// [`System::exit_task`]: crate::System::exit_task
    pub enum ExitTaskError: BadContextError {
        /// The current context is not a task context, CPU Lock is active, or
        /// the scheduler is suspended.
        BadContext,
    }
}

define_error! {
    mod suspend_task_error {}
    /// Error type for [`System::suspend_task`].
    ///
    /// [`System::suspend_task`]: crate::System::suspend_task
    pub enum SuspendTaskError: BadContextError, NoAccessError {
        /// Invalid task handle.
        NoAccess,
        /// CPU Lock is active, or the caller tried to suspend itself from a
        /// context where it can't block.
        BadContext,
        /// The task is already suspended, or is the idle task.
        BadObjectState,
    }
}

define_error! {
    mod resume_task_error {}
    /// Error type for [`System::resume_task`].
    ///
    /// [`System::resume_task`]: crate::System::resume_task
    pub enum ResumeTaskError: BadContextError, NoAccessError {
        /// Invalid task handle.
        NoAccess,
        /// CPU Lock is active.
        BadContext,
        /// The task is not suspended.
        BadObjectState,
    }
}

define_error! {
    mod get_current_task_error {}
    /// Error type for [`System::current_task`].
    ///
    /// [`System::current_task`]: crate::System::current_task
    pub enum GetCurrentTaskError: BadContextError {
        /// CPU Lock is active, or the scheduler hasn't started yet.
        BadContext,
    }
}

define_error! {
    mod yield_error {}
    /// Error type for [`System::yield_now`].
    ///
    /// [`System::yield_now`]: crate::System::yield_now
    pub enum YieldError: BadContextError {
        /// The current context is not a task context.
        BadContext,
    }
}

define_error! {
    mod delay_error {}
    /// Error type for [`System::delay`] and [`System::delay_until`].
    ///
    /// [`System::delay`]: crate::System::delay
    /// [`System::delay_until`]: crate::System::delay_until
    pub enum DelayError: BadContextError {
        /// The current context can't block.
        BadContext,
        /// The delay was cut short by [`System::abort_delay`] or by the
        /// suspension of the task.
        ///
        /// [`System::abort_delay`]: crate::System::abort_delay
        Interrupted,
    }
}

define_error! {
    mod abort_delay_error {}
    /// Error type for [`System::abort_delay`].
    ///
    /// [`System::abort_delay`]: crate::System::abort_delay
    pub enum AbortDelayError: BadContextError, NoAccessError {
        /// Invalid task handle.
        NoAccess,
        /// CPU Lock is active.
        BadContext,
        /// The task is not blocked.
        BadObjectState,
    }
}

define_error! {
    mod set_task_priority_error {}
    /// Error type for [`System::set_priority`], [`System::raise_priority`],
    /// and [`System::restore_priority`].
    ///
    /// [`System::set_priority`]: crate::System::set_priority
    /// [`System::raise_priority`]: crate::System::raise_priority
    /// [`System::restore_priority`]: crate::System::restore_priority
    pub enum SetTaskPriorityError: BadContextError, NoAccessError {
        /// Invalid task handle.
        NoAccess,
        /// CPU Lock is active.
        BadContext,
        /// The priority is out of range.
        BadParam,
        /// The task is deleted.
        BadObjectState,
    }
}

define_error! {
    mod get_task_info_error {}
    /// Error type for the task query functions such as [`System::priority`].
    ///
    /// [`System::priority`]: crate::System::priority
    pub enum GetTaskInfoError: BadContextError, NoAccessError {
        /// Invalid task handle.
        NoAccess,
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    mod scheduler_lock_error {}
    /// Error type for [`System::suspend_all`] and [`System::resume_all`].
    ///
    /// [`System::suspend_all`]: crate::System::suspend_all
    /// [`System::resume_all`]: crate::System::resume_all
    pub enum SchedulerLockError: BadContextError {
        /// The current context is not a task context, CPU Lock is active, or
        /// (for `resume_all`) the scheduler is not suspended.
        BadContext,
    }
}

define_error! {
    mod create_wait_queue_error {}
    /// Error type for [`WaitQueue::new`].
    ///
    /// [`WaitQueue::new`]: crate::WaitQueue::new
    pub enum CreateWaitQueueError: BadContextError {
        /// CPU Lock is active.
        BadContext,
        /// The wait queue table couldn't be grown.
        OutOfMemory,
    }
}

define_error! {
    mod wake_error {}
    /// Error type for [`WaitQueue::wake_one`] and [`WaitQueue::wake_all`].
    ///
    /// [`WaitQueue::wake_one`]: crate::WaitQueue::wake_one
    /// [`WaitQueue::wake_all`]: crate::WaitQueue::wake_all
    pub enum WakeError: BadContextError {
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    mod wait_timeout_error {}
    /// Error type for blocking operations with an optional timeout, such as
    /// [`WaitQueue::wait`] and [`System::notify_take`].
    ///
    /// [`WaitQueue::wait`]: crate::WaitQueue::wait
    /// [`System::notify_take`]: crate::System::notify_take
    pub enum WaitTimeoutError: BadContextError {
        /// The current context can't block: it's an interrupt context, CPU
        /// Lock is active, or the scheduler is suspended.
        BadContext,
        /// The wait was forcibly ended.
        Interrupted,
        /// The timeout elapsed before the awaited event.
        Timeout,
    }
}

define_error! {
    mod notify_error {}
    /// Error type for [`System::notify`].
    ///
    /// [`System::notify`]: crate::System::notify
    pub enum NotifyError: BadContextError, NoAccessError {
        /// Invalid task handle.
        NoAccess,
        /// CPU Lock is active.
        BadContext,
        /// [`NotifyAction::SetValueWithoutOverwrite`] was requested while a
        /// previous notification is still pending.
        ///
        /// [`NotifyAction::SetValueWithoutOverwrite`]: crate::NotifyAction::SetValueWithoutOverwrite
        QueueOverflow,
    }
}

/// Unrecoverable kernel errors. They are reported to
/// [`KernelCfg::fatal_hook`], which must not return.
///
/// [`KernelCfg::fatal_hook`]: crate::KernelCfg::fatal_hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fatal {
    /// A kernel data structure was found in a state that its invariants rule
    /// out, e.g., a task was removed from a list it isn't a member of.
    ContractViolation(&'static str),
    /// The stack canary of the outgoing task was overwritten.
    StackOverflow { task: TaskId, name: &'static str },
    /// The scheduler found no task to run. The idle task must always be
    /// Ready.
    NoReadyTask,
    /// `exit_critical` was called more times than `enter_critical`.
    CriticalUnderflow,
    /// A spinlock was released by a core that doesn't own it, or its
    /// recursion count overflowed.
    SpinlockMisuse,
}

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ContractViolation(what) => write!(f, "kernel contract violation: {what}"),
            Self::StackOverflow { task, name } => {
                write!(f, "stack overflow detected in task {task:?} ({name:?})")
            }
            Self::NoReadyTask => f.write_str("no task is Ready"),
            Self::CriticalUnderflow => f.write_str("critical section nesting underflow"),
            Self::SpinlockMisuse => f.write_str("spinlock misuse"),
        }
    }
}

impl From<ListError> for Fatal {
    fn from(e: ListError) -> Self {
        Self::ContractViolation(match e {
            ListError::AlreadyLinked => "task is already a member of a list",
            ListError::NotLinked => "task is not a member of the list",
            ListError::Inconsistent => "task list is corrupted",
        })
    }
}
