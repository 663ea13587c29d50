//! Platform abstraction for the internal locking and sharing types.
//!
//! Provides unified `Arc`, `Mutex` and `MutexGuard` types that work in both
//! `std` and `no_std` environments. With the `std` feature enabled the lock is
//! `parking_lot::Mutex`; without it, `spin::Mutex`.
//!
//! These locks protect scheduler and timer bookkeeping only. They are never
//! held across a context switch and are distinct from the cooperative
//! [`Mutex`](crate::primitives::Mutex) exposed to application threads.

#[cfg(not(feature = "std"))]
pub use alloc::sync::Arc;
#[cfg(feature = "std")]
pub use std::sync::Arc;

#[cfg(feature = "std")]
pub type MutexGuard<'a, T> = parking_lot::MutexGuard<'a, T>;
#[cfg(not(feature = "std"))]
pub type MutexGuard<'a, T> = spin::MutexGuard<'a, T>;

/// Platform-agnostic mutex wrapper for internal bookkeeping state.
pub struct Mutex<T> {
    #[cfg(feature = "std")]
    inner: parking_lot::Mutex<T>,
    #[cfg(not(feature = "std"))]
    inner: spin::Mutex<T>,
}

impl<T> Mutex<T> {
    /// Creates a new mutex protecting the given value.
    pub const fn new(value: T) -> Self {
        Self {
            #[cfg(feature = "std")]
            inner: parking_lot::Mutex::new(value),
            #[cfg(not(feature = "std"))]
            inner: spin::Mutex::new(value),
        }
    }

    /// Acquires the mutex, blocking until it becomes available.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }
}
