//! Cooperative synchronization primitives.
//!
//! # Module Overview
//!
//! - [`Mutex`]: mutual exclusion between cooperative threads;
//! - [`Semaphore`]: a counting semaphore with a post ceiling, the wake
//!   mechanism for worker threads.
//!
//! Blocking is always cooperative: a waiter spins through
//! [`Scheduler::yield_now`] until the condition holds, so every operation
//! that can suspend takes the scheduler explicitly. The non-blocking
//! operations ([`Semaphore::signal`], [`Semaphore::try_wait`],
//! [`Mutex::try_lock`]) are single lock-free atomic steps and safe to call
//! from any context, interrupt handlers included.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crate::clock::Delay;
use crate::scheduler::Scheduler;

/// A mutex whose waiters yield instead of blocking the hardware thread.
///
/// The holder must not yield while the lock is held: with cooperative
/// scheduling every other thread waiting on the same lock would spin until
/// the holder runs again, which it only does voluntarily.
pub struct Mutex<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// Exclusion is enforced by the atomic flag; the value moves between
// cooperative threads only.
unsafe impl<T: Send> Sync for Mutex<T> {}
unsafe impl<T: Send> Send for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, yielding until it is free.
    pub fn lock(&self, sched: &Scheduler) -> MutexGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            sched.yield_now();
        }
    }

    /// Acquires the lock only if it is free right now. A single atomic
    /// step; never suspends.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.locked.store(false, Ordering::Release);
    }
}

/// Largest count/limit a semaphore accepts; constructor arguments above it
/// are clamped.
pub const MAX_SEMAPHORE_COUNT: i32 = i32::MAX / 2;

/// A counting semaphore with a post ceiling.
///
/// Signals arriving while the count sits at the ceiling are dropped, which
/// is what makes a `Semaphore::new(0, 1)` a binary wake flag: any number of
/// wake requests collapse into one pending wake.
pub struct Semaphore {
    count: AtomicI32,
    limit: i32,
}

impl Semaphore {
    /// Creates a semaphore with the given initial count and ceiling. Both
    /// are clamped to `0..=MAX_SEMAPHORE_COUNT`, and the initial count is
    /// clamped to the ceiling.
    pub fn new(initial: i32, limit: i32) -> Self {
        let limit = limit.clamp(0, MAX_SEMAPHORE_COUNT);
        let initial = initial.clamp(0, limit);
        Self {
            count: AtomicI32::new(initial),
            limit,
        }
    }

    /// Increments the count unless it already sits at the ceiling. A single
    /// atomic step; never suspends, callable from any context.
    pub fn signal(&self) {
        let mut cur = self.count.load(Ordering::Relaxed);
        while cur < self.limit {
            match self.count.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(now) => cur = now,
            }
        }
    }

    /// Takes one count if available. A single atomic step; never suspends.
    pub fn try_wait(&self) -> bool {
        let mut cur = self.count.load(Ordering::Relaxed);
        while cur > 0 {
            match self.count.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(now) => cur = now,
            }
        }
        false
    }

    /// Waits for a count, yielding until one arrives or the delay elapses.
    /// Returns whether a count was taken. `Millis(0)` tests once.
    pub fn wait(&self, sched: &Scheduler, delay: Delay) -> bool {
        self.wait_ticks(sched, delay.to_ticks(sched.clock()))
    }

    /// [`Semaphore::wait`] with the timeout already in ticks; `None` waits
    /// forever.
    pub fn wait_ticks(&self, sched: &Scheduler, timeout: Option<u32>) -> bool {
        if self.try_wait() {
            return true;
        }
        let start = sched.clock().ticks();
        loop {
            if let Some(ticks) = timeout {
                if sched.clock().ticks().wrapping_sub(start) >= ticks {
                    return self.try_wait();
                }
            }
            sched.yield_now();
            if self.try_wait() {
                return true;
            }
        }
    }

    /// Current count. Racy by nature; useful for diagnostics and tests.
    pub fn count(&self) -> i32 {
        self.count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semaphore_signals_saturate_at_limit() {
        let sem = Semaphore::new(0, 1);
        sem.signal();
        sem.signal();
        sem.signal();
        assert_eq!(sem.count(), 1);
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
    }

    #[test]
    fn semaphore_clamps_constructor_arguments() {
        let sem = Semaphore::new(10, 3);
        assert_eq!(sem.count(), 3);
        let sem = Semaphore::new(-5, 3);
        assert_eq!(sem.count(), 0);
        let sem = Semaphore::new(i32::MAX, i32::MAX);
        assert_eq!(sem.count(), MAX_SEMAPHORE_COUNT);
    }

    #[test]
    fn mutex_try_lock_excludes() {
        let m = Mutex::new(5);
        let g = m.try_lock().expect("lock is free");
        assert!(m.is_locked());
        assert!(m.try_lock().is_none());
        drop(g);
        assert!(!m.is_locked());
        assert_eq!(*m.try_lock().expect("lock is free again"), 5);
    }

    #[test]
    fn mutex_into_inner() {
        let m = Mutex::new([1, 2, 3]);
        assert_eq!(m.into_inner(), [1, 2, 3]);
    }
}
