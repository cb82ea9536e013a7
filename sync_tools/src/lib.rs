//! # Sync Tools
//! Small helpers shared by the blocking primitives of the workspace: extension traits over
//! `Mutex`/`Condvar` that never surface lock poisoning.
//!
//! Lock poisoning only happens when a thread panics while holding the guard. The primitives built on
//! these helpers never run user code under their locks, so the protected data is always consistent
//! and recovering the guard is sound.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Poison-tolerant locking.
pub trait LockExt<T> {
    /// Locks the mutex, recovering the guard if a previous holder panicked.
    fn locked(&self) -> MutexGuard<'_, T>;
}

impl<T> LockExt<T> for Mutex<T> {
    fn locked(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Poison-tolerant waiting on a condition variable.
pub trait CondvarExt {
    /// Blocks until notified. Spurious wake-ups are possible, callers re-check their condition.
    fn wait_on<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T>;

    /// Blocks until notified or until `deadline`. The returned flag is `true` once the deadline is reached.
    fn wait_until<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        deadline: Instant,
    ) -> (MutexGuard<'a, T>, bool);
}

impl CondvarExt for Condvar {
    fn wait_on<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_until<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        deadline: Instant,
    ) -> (MutexGuard<'a, T>, bool) {
        let now = Instant::now();
        if now >= deadline {
            return (guard, true);
        }
        let (guard, result) = self
            .wait_timeout(guard, deadline - now)
            .unwrap_or_else(PoisonError::into_inner);
        (guard, result.timed_out() || Instant::now() >= deadline)
    }
}
