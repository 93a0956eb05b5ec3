//! The ready queue: one FIFO list per priority level, plus a bitmap of
//! non-empty levels.
use core::fmt;

use super::{state_list, TaskIndex, TaskPool};
use crate::{
    sched::StateList,
    utils::{intrusive_list::ListHead, Init, PrioBitmap, PRIO_BITMAP_MAX_LEN},
    Fatal,
};

/// The result of [`crate::sched::Scheduler::choose_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleDecision<T> {
    /// Keep running the current task.
    Keep,
    /// Switch to the specified task.
    SwitchTo(T),
}

pub(crate) struct ReadyQueue {
    /// Bit `i` is set iff `levels[i]` is non-empty.
    bitmap: PrioBitmap,
    levels: [ListHead<TaskIndex>; PRIO_BITMAP_MAX_LEN],
}

impl Init for ReadyQueue {
    const INIT: Self = Self::new();
}

impl fmt::Debug for ReadyQueue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ReadyQueue")
            .field("bitmap", &self.bitmap)
            .finish_non_exhaustive()
    }
}

impl ReadyQueue {
    pub(crate) const fn new() -> Self {
        Self {
            bitmap: PrioBitmap::INIT,
            levels: [ListHead::new(); PRIO_BITMAP_MAX_LEN],
        }
    }

    /// Get the highest non-empty level.
    #[inline]
    pub(crate) fn highest_level(&self) -> Option<usize> {
        self.bitmap.find_set()
    }

    #[inline]
    pub(crate) fn is_level_empty(&self, level: usize) -> bool {
        !self.bitmap.get(level)
    }

    /// Append a task to the tail of the level matching its effective
    /// priority.
    pub(crate) fn push_back<P>(&mut self, tasks: &TaskPool<P>, i: TaskIndex) -> Result<(), Fatal> {
        let task_cb = &tasks[i];
        let level = task_cb.effective_priority.get();
        if task_cb.state_list.get() != StateList::Detached {
            return Err(Fatal::ContractViolation("readying a task that is still queued"));
        }

        state_list(&mut self.levels[level], tasks).push_back(i)?;
        task_cb.state_list.set(StateList::Ready(level));
        self.bitmap.set(level);
        Ok(())
    }

    /// Remove a task from the level it's queued on.
    pub(crate) fn remove<P>(&mut self, tasks: &TaskPool<P>, i: TaskIndex) -> Result<(), Fatal> {
        let task_cb = &tasks[i];
        let StateList::Ready(level) = task_cb.state_list.get() else {
            return Err(Fatal::ContractViolation("task is not in the ready queue"));
        };

        let mut list = state_list(&mut self.levels[level], tasks);
        list.remove(i)?;
        if list.is_empty() {
            self.bitmap.clear(level);
        }
        task_cb.state_list.set(StateList::Detached);
        Ok(())
    }

    /// Find the first task on the highest level that `core` can take. A task
    /// still running on another core (i.e., its context is not saved yet) is
    /// skipped.
    pub(crate) fn find_eligible<P>(
        &mut self,
        tasks: &TaskPool<P>,
        core: usize,
    ) -> Result<Option<TaskIndex>, Fatal> {
        for level in (0..PRIO_BITMAP_MAX_LEN).rev() {
            if self.is_level_empty(level) {
                continue;
            }
            let list = state_list(&mut self.levels[level], tasks);
            for i in list.iter() {
                let i = i?;
                match tasks[i].running_on.get() {
                    Some(other) if other != core => {}
                    _ => return Ok(Some(i)),
                }
            }
        }
        Ok(None)
    }

    /// Collect a level's tasks in queue order.
    #[cfg(test)]
    pub(crate) fn level<P>(&mut self, tasks: &TaskPool<P>, level: usize) -> Vec<TaskIndex> {
        state_list(&mut self.levels[level], tasks)
            .iter()
            .map(Result::unwrap)
            .collect()
    }
}
