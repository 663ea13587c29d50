//! Cooperative user-space threading for bare environments.
//!
//! `coop` multiplexes logical threads over a single hardware thread with no
//! operating-system support and no preemption: a thread runs until it yields
//! or blocks, and control then passes to the longest-waiting ready thread.
//! The intended hosts are bare-metal targets and minimal runtimes that need
//! "threads" for structuring, not for parallelism.
//!
//! # Crate layout
//!
//! - [`scheduler`]: the [`Scheduler`] object, spawn/yield/join/sleep;
//! - [`thread`]: spawn configuration and thread identity;
//! - [`context`]: the context-switch backend seam and its native
//!   implementation;
//! - [`primitives`]: cooperative [`Mutex`] and [`Semaphore`];
//! - [`clock`]: the wrapping tick source abstraction.
//!
//! # Quick start
//!
//! ```no_run
//! use coop::{Scheduler, ThreadConfig};
//!
//! let sched = Scheduler::new();
//! let worker = sched
//!     .spawn(ThreadConfig::new(), || {
//!         // runs when the spawner yields
//!         42
//!     })
//!     .expect("spawn");
//! sched.yield_now();
//! assert_eq!(worker.join(), Ok(42));
//! ```

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod clock;
pub mod context;
pub mod platform;
pub mod primitives;
pub mod scheduler;
pub mod thread;

#[cfg(feature = "std")]
pub use clock::StdClock;
pub use clock::{Clock, Delay};
pub use context::{Context, ContextBackend, NativeBackend, RawEntry};
pub use primitives::{Mutex, MutexGuard, Semaphore, MAX_SEMAPHORE_COUNT};
pub use scheduler::{JoinError, JoinHandle, Scheduler, SpawnError};
pub use thread::{
    ExitCode, Priority, StackRegion, ThreadConfig, ThreadId, DEFAULT_STACK_SIZE, MIN_STACK_SIZE,
};
