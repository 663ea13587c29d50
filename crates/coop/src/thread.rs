//! Thread control blocks and spawn configuration.
//!
//! # Module Overview
//!
//! - [`ThreadConfig`]: builder-style spawn parameters (stack size, caller
//!   stack, priority hint);
//! - [`Priority`]: the accepted-but-ignored priority hint;
//! - [`ThreadId`]: opaque identity of a running thread;
//! - [`Tcb`]: the control block the scheduler queues and switches between.
//!
//! Control blocks are heap-allocated and referenced by raw pointer from the
//! scheduler's queues; ownership rules are documented on
//! [`Scheduler`](crate::scheduler::Scheduler).

use core::mem::MaybeUninit;

use alloc::boxed::Box;

use crate::context::Context;

/// Value a thread's body returns, reported to a joiner.
pub type ExitCode = usize;

pub(crate) type ThreadBody = Box<dyn FnOnce() -> ExitCode + 'static>;

/// Smallest stack a thread may run on. Spawn requests below this are
/// silently raised to it, replacing any caller-provided region that is
/// too small with a freshly allocated one.
pub const MIN_STACK_SIZE: usize = 4096;

/// Stack size used when [`ThreadConfig`] does not specify one.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Scheduling priority hint.
///
/// The cooperative scheduler runs a single FIFO ready queue and does not
/// act on priorities; the hint is accepted so portable callers can express
/// intent and is recorded in the control block for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Opaque identity of a thread, unique while the thread is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub(crate) usize);

/// A caller-supplied stack region. Must outlive the thread running on it;
/// the scheduler never frees it.
pub type StackRegion = &'static mut [MaybeUninit<u8>];

/// Spawn parameters, consumed by [`Scheduler::spawn`](crate::scheduler::Scheduler::spawn).
pub struct ThreadConfig {
    pub(crate) stack_size: usize,
    pub(crate) stack: Option<StackRegion>,
    pub(crate) priority: Priority,
}

impl ThreadConfig {
    pub fn new() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            stack: None,
            priority: Priority::default(),
        }
    }

    /// Requested stack size in bytes. Values below [`MIN_STACK_SIZE`] are
    /// raised at spawn time.
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Runs the thread on a caller-provided stack region instead of an
    /// owned allocation. The region's length becomes the stack size.
    pub fn with_stack(mut self, region: StackRegion) -> Self {
        self.stack_size = region.len();
        self.stack = Some(region);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a thread's stack memory came from, and so who frees it.
pub(crate) enum StackStorage {
    /// Allocated at spawn time, freed when the control block is reclaimed.
    Owned(Box<[MaybeUninit<u8>]>),
    /// Caller-provided region; never freed by the scheduler.
    Caller { base: *mut u8, len: usize },
    /// The bootstrap thread runs on whatever stack called
    /// [`Scheduler`](crate::scheduler::Scheduler) into existence.
    Native,
}

/// A thread control block.
pub(crate) struct Tcb {
    pub(crate) context: Context,
    pub(crate) body: Option<ThreadBody>,
    #[allow(dead_code)]
    pub(crate) stack: StackStorage,
    #[allow(dead_code)]
    pub(crate) priority: Priority,
    /// Set once the body has returned; a dead control block is never
    /// queued as ready again.
    pub(crate) dead: bool,
    /// Set by a joiner before it starts polling. A dead control block with
    /// this flag set is left for the joiner to reclaim.
    pub(crate) join_waited: bool,
    /// Set when the handle is dropped without joining; lets the scheduler
    /// reclaim the control block after death.
    pub(crate) detached: bool,
    pub(crate) exit_code: ExitCode,
    /// Back-pointer for the entry shim; valid while the thread can run
    /// (the scheduler outlives its threads by contract).
    pub(crate) sched: *const crate::scheduler::Scheduler,
}

impl Tcb {
    pub(crate) fn id(&self) -> ThreadId {
        ThreadId(self as *const Tcb as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let cfg = ThreadConfig::new();
        assert_eq!(cfg.stack_size, DEFAULT_STACK_SIZE);
        assert!(cfg.stack.is_none());
        assert_eq!(cfg.priority, Priority::Normal);
    }

    #[test]
    fn caller_stack_sets_size() {
        let region: StackRegion = Box::leak(Box::new_uninit_slice(8192));
        let cfg = ThreadConfig::new().with_stack(region);
        assert_eq!(cfg.stack_size, 8192);
        assert!(cfg.stack.is_some());
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
    }
}
