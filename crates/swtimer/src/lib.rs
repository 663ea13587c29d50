//! Software timers that fire in thread context.
//!
//! `swtimer` provides one-shot and periodic timers on top of a [`coop`]
//! scheduler. Timer callbacks never run in an interrupt: they run on a
//! lazily-spawned cooperative worker thread, or inside an explicit
//! [`TimerEngine::poll`] call on hosts without a spare thread. This makes
//! callbacks unrestricted: they can take locks, allocate, and operate on
//! the timers themselves. The cost is firing accuracy, which is limited by
//! how often the host yields.
//!
//! # Quick start
//!
//! ```no_run
//! use coop::{Delay, Scheduler};
//! use swtimer::TimerEngine;
//!
//! let sched = Scheduler::new();
//! let timers = TimerEngine::new(sched.clone());
//!
//! let tick = timers.create();
//! timers
//!     .start(tick, true, Delay::Millis(100), || println!("tick"))
//!     .expect("arm");
//!
//! // ... the worker fires it while other threads yield ...
//!
//! timers.destroy(tick);
//! timers.shutdown();
//! ```

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod engine;
mod timer;

pub use engine::{EngineConfig, JabHandle, ServiceMode, TimerEngine};
pub use timer::{Timer, TimerCallback, TimerError};
