//! Recursive spinlocks guarding the kernel state on multi-core systems
//!
//! Two locks are used. The *task lock* serializes task-level critical sections
//! across cores; the *ISR lock* is additionally taken by interrupt handlers.
//! A task-level critical section takes both (task lock first), so it excludes
//! other cores' tasks and interrupt handlers alike, while an interrupt handler
//! only contends on the ISR lock.
//!
//! Spinlocks must only be acquired with local interrupts masked; otherwise an
//! interrupt handler on the same core could spin on a lock its own core holds
//! in a different nesting level.
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::Fatal;

const NO_OWNER: usize = usize::MAX;

/// The maximum recursion depth of [`RecursiveSpinlock`].
pub const MAX_RECURSION: u8 = u8::MAX - 1;

/// A spinlock that may be re-acquired by the core already holding it.
///
/// Cores are identified by the index passed to [`Self::lock`], which must be
/// less than `usize::MAX`.
#[derive(Debug)]
pub struct RecursiveSpinlock {
    owner: AtomicUsize,
    /// Only modified by the owner.
    count: AtomicU8,
}

impl RecursiveSpinlock {
    pub const fn new() -> Self {
        Self {
            owner: AtomicUsize::new(NO_OWNER),
            count: AtomicU8::new(0),
        }
    }

    /// Acquire the lock on behalf of `core`, spinning until it becomes
    /// available.
    pub fn lock(&self, core: usize) -> Result<(), Fatal> {
        debug_assert_ne!(core, NO_OWNER);

        if self.owner.load(Ordering::Relaxed) == core {
            let count = self.count.load(Ordering::Relaxed);
            if count >= MAX_RECURSION {
                return Err(Fatal::SpinlockMisuse);
            }
            self.count.store(count + 1, Ordering::Relaxed);
            return Ok(());
        }

        #[cfg(target_has_atomic = "ptr")]
        while self
            .owner
            .compare_exchange_weak(NO_OWNER, core, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }

        // Targets without CAS (e.g., Armv6-M) are single-core, and the caller
        // has interrupts masked, so the lock can't be contended
        #[cfg(not(target_has_atomic = "ptr"))]
        {
            if self.owner.load(Ordering::Relaxed) != NO_OWNER {
                return Err(Fatal::SpinlockMisuse);
            }
            self.owner.store(core, Ordering::Relaxed);
        }

        // A fresh acquisition must observe a zero count
        if self.count.load(Ordering::Relaxed) != 0 {
            return Err(Fatal::SpinlockMisuse);
        }
        self.count.store(1, Ordering::Relaxed);
        Ok(())
    }

    /// Release one level of the lock held by `core`.
    pub fn unlock(&self, core: usize) -> Result<(), Fatal> {
        if self.owner.load(Ordering::Relaxed) != core {
            return Err(Fatal::SpinlockMisuse);
        }

        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return Err(Fatal::SpinlockMisuse);
        }
        self.count.store(count - 1, Ordering::Relaxed);

        if count == 1 {
            self.owner.store(NO_OWNER, Ordering::Release);
        }
        Ok(())
    }

    /// Get the core currently holding the lock.
    pub fn owner(&self) -> Option<usize> {
        match self.owner.load(Ordering::Relaxed) {
            NO_OWNER => None,
            x => Some(x),
        }
    }

    /// Get the recursion count. Only meaningful to the owner.
    pub fn recursion_count(&self) -> u8 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for RecursiveSpinlock {
    fn default() -> Self {
        Self::new()
    }
}

/// The task/ISR lock pair.
#[derive(Debug, Default)]
pub struct SpinlockPair {
    pub task: RecursiveSpinlock,
    pub isr: RecursiveSpinlock,
}

impl SpinlockPair {
    pub const fn new() -> Self {
        Self {
            task: RecursiveSpinlock::new(),
            isr: RecursiveSpinlock::new(),
        }
    }

    /// Take the locks for a task-level critical section.
    pub fn lock_task_level(&self, core: usize) -> Result<(), Fatal> {
        self.task.lock(core)?;
        self.isr.lock(core)
    }

    /// Release the locks taken by [`Self::lock_task_level`].
    pub fn unlock_task_level(&self, core: usize) -> Result<(), Fatal> {
        self.isr.unlock(core)?;
        self.task.unlock(core)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn recursion() {
        let lock = RecursiveSpinlock::new();
        lock.lock(1).unwrap();
        lock.lock(1).unwrap();
        assert_eq!(lock.owner(), Some(1));
        assert_eq!(lock.recursion_count(), 2);

        lock.unlock(1).unwrap();
        assert_eq!(lock.owner(), Some(1));
        lock.unlock(1).unwrap();
        assert_eq!(lock.owner(), None);
    }

    #[test]
    fn release_by_non_owner() {
        let lock = RecursiveSpinlock::new();
        assert_eq!(lock.unlock(0), Err(Fatal::SpinlockMisuse));
        lock.lock(0).unwrap();
        assert_eq!(lock.unlock(1), Err(Fatal::SpinlockMisuse));
        lock.unlock(0).unwrap();
    }

    #[test]
    fn recursion_overflow() {
        let lock = RecursiveSpinlock::new();
        for _ in 0..MAX_RECURSION {
            lock.lock(0).unwrap();
        }
        assert_eq!(lock.lock(0), Err(Fatal::SpinlockMisuse));
    }

    #[test]
    fn pair_order() {
        let pair = SpinlockPair::new();
        pair.lock_task_level(0).unwrap();
        // An interrupt handler on the same core nests on the ISR lock
        pair.isr.lock(0).unwrap();
        pair.isr.unlock(0).unwrap();
        pair.unlock_task_level(0).unwrap();
        assert_eq!(pair.task.owner(), None);
        assert_eq!(pair.isr.owner(), None);
    }

    /// Simulated cores increment a counter non-atomically inside the
    /// critical section. Lost updates would show up as a short count.
    #[test]
    fn mutual_exclusion() {
        let _ = env_logger::try_init();

        const NUM_CORES: usize = 4;
        const NUM_ITERATIONS: usize = 2000;

        let pair = Arc::new(SpinlockPair::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..NUM_CORES)
            .map(|core| {
                let pair = Arc::clone(&pair);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for i in 0..NUM_ITERATIONS {
                        if i % 2 == 0 {
                            pair.lock_task_level(core).unwrap();
                        } else {
                            pair.isr.lock(core).unwrap();
                        }

                        let x = counter.load(Ordering::Relaxed);
                        std::hint::spin_loop();
                        counter.store(x + 1, Ordering::Relaxed);

                        if i % 2 == 0 {
                            pair.unlock_task_level(core).unwrap();
                        } else {
                            pair.isr.unlock(core).unwrap();
                        }
                    }
                    log::debug!("core {core} done");
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::Relaxed), NUM_CORES * NUM_ITERATIONS);
    }
}
