//! The cooperative scheduler.
//!
//! # Module Overview
//!
//! - [`Scheduler`]: an explicit scheduler object owning the ready queue, the
//!   current-thread slot and the context-switch backend;
//! - [`JoinHandle`]: per-thread handle returned by [`Scheduler::spawn`];
//! - [`SpawnError`], [`JoinError`]: the error surface of the two fallible
//!   operations.
//!
//! Threads run on one hardware thread and are never preempted: control moves
//! only at [`Scheduler::yield_now`] and the blocking operations built on it.
//! The ready queue is plain FIFO. The thread that creates the scheduler (the
//! bootstrap thread) is adopted as a schedulable thread with no private
//! stack; it must outlive the scheduler and every thread spawned on it.
//!
//! # Ownership of control blocks
//!
//! Control blocks are heap boxes referenced by raw pointer from the ready
//! and dead queues and from [`JoinHandle`]s. A block is freed exactly once,
//! by whichever side loses interest last: the joiner frees it after reading
//! the exit code, and a block whose handle was dropped is freed by the
//! scheduler once it is both dead and detached.

use core::fmt;
use core::mem::{ManuallyDrop, MaybeUninit};
use core::ptr::NonNull;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use log::{debug, error};

use crate::clock::{Clock, Delay};
use crate::context::{Context, ContextBackend, NativeBackend};
use crate::platform::{Arc, Mutex};
use crate::thread::{
    ExitCode, StackStorage, Tcb, ThreadConfig, ThreadId, MIN_STACK_SIZE,
};

/// Spawning failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// The thread's stack could not be allocated.
    OutOfMemory,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::OutOfMemory => write!(f, "insufficient memory for thread stack"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for SpawnError {}

/// Joining failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    /// A thread tried to join itself; waiting would never finish.
    Deadlock,
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Deadlock => write!(f, "thread attempted to join itself"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for JoinError {}

struct SchedInner {
    ready: VecDeque<NonNull<Tcb>>,
    /// Dead, not-yet-reclaimed control blocks whose handles may still be
    /// live. Freed once the matching handle is joined or dropped.
    dead: Vec<NonNull<Tcb>>,
    current: NonNull<Tcb>,
    main: NonNull<Tcb>,
}

/// The cooperative scheduler. Created once, shared by reference counting,
/// passed explicitly to every operation that may suspend the caller.
pub struct Scheduler {
    backend: Box<dyn ContextBackend>,
    clock: Arc<dyn Clock>,
    inner: Mutex<SchedInner>,
}

impl Scheduler {
    /// Creates a scheduler with the native context-switch backend and the
    /// wall-clock tick source, adopting the calling thread as bootstrap.
    #[cfg(feature = "std")]
    pub fn new() -> Arc<Self> {
        Self::with_parts(Box::new(NativeBackend), Arc::new(crate::clock::StdClock::new()))
    }

    /// Creates a scheduler with the native backend and the given tick source.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Arc<Self> {
        Self::with_parts(Box::new(NativeBackend), clock)
    }

    /// Creates a scheduler from explicit parts. The calling thread becomes
    /// the bootstrap thread; it runs on its native stack and cannot exit.
    pub fn with_parts(backend: Box<dyn ContextBackend>, clock: Arc<dyn Clock>) -> Arc<Self> {
        let main = Box::into_raw(Box::new(Tcb {
            context: Context::empty(),
            body: None,
            stack: StackStorage::Native,
            priority: crate::thread::Priority::Normal,
            dead: false,
            join_waited: false,
            detached: false,
            exit_code: 0,
            sched: core::ptr::null(),
        }));
        let main = NonNull::new(main).expect("Box::into_raw never returns null");
        Arc::new(Scheduler {
            backend,
            clock,
            inner: Mutex::new(SchedInner {
                ready: VecDeque::new(),
                dead: Vec::new(),
                current: main,
                main,
            }),
        })
    }

    /// The scheduler's tick source.
    pub fn clock(&self) -> &dyn Clock {
        &*self.clock
    }

    /// Spawns a cooperative thread running `body` and appends it to the
    /// tail of the ready queue. The new thread does not run until the
    /// caller yields.
    ///
    /// A requested stack smaller than [`MIN_STACK_SIZE`] is raised to that
    /// minimum; a caller-provided region that is too small is replaced by an
    /// owned allocation.
    pub fn spawn(
        self: &Arc<Self>,
        config: ThreadConfig,
        body: impl FnOnce() -> ExitCode + 'static,
    ) -> Result<JoinHandle, SpawnError> {
        let ThreadConfig {
            stack_size,
            stack,
            priority,
        } = config;

        let (storage, base, len) = match stack {
            Some(region) if region.len() >= MIN_STACK_SIZE => {
                let base = region.as_mut_ptr() as *mut u8;
                let len = region.len();
                (StackStorage::Caller { base, len }, base, len)
            }
            _ => {
                let len = stack_size.max(MIN_STACK_SIZE);
                let mut buf: Vec<MaybeUninit<u8>> = Vec::new();
                buf.try_reserve_exact(len)
                    .map_err(|_| SpawnError::OutOfMemory)?;
                buf.resize_with(len, MaybeUninit::uninit);
                let mut boxed = buf.into_boxed_slice();
                let base = boxed.as_mut_ptr() as *mut u8;
                (StackStorage::Owned(boxed), base, len)
            }
        };

        let tcb = Box::into_raw(Box::new(Tcb {
            context: Context::empty(),
            body: Some(Box::new(body)),
            stack: storage,
            priority,
            dead: false,
            join_waited: false,
            detached: false,
            exit_code: 0,
            sched: Arc::as_ptr(self),
        }));
        unsafe {
            (*tcb).context = self.backend.prepare(base, len, thread_start, tcb as *mut ());
        }
        let tcb = NonNull::new(tcb).expect("Box::into_raw never returns null");

        debug!(
            "spawned thread {:#x} (stack {} bytes)",
            tcb.as_ptr() as usize,
            len
        );
        self.inner.lock().ready.push_back(tcb);

        Ok(JoinHandle {
            tcb,
            sched: Arc::clone(self),
        })
    }

    /// Passes control to the longest-waiting ready thread, if any. Returns
    /// once this thread is scheduled again. With nothing else ready this is
    /// a no-op.
    pub fn yield_now(&self) {
        let save: *mut Context;
        let resume: *const Context;
        {
            let mut inner = self.inner.lock();
            Self::reclaim_locked(&mut inner);
            let cur = inner.current;
            inner.ready.push_back(cur);
            let Some(next) = inner.ready.pop_front() else {
                return;
            };
            if next == cur {
                return;
            }
            inner.current = next;
            save = unsafe { &raw mut (*cur.as_ptr()).context };
            resume = unsafe { &raw const (*next.as_ptr()).context };
        }
        // The lock is released before switching; the resumed thread takes
        // it afresh for its own bookkeeping.
        unsafe { self.backend.switch(save, resume) };
    }

    /// Identity of the running thread.
    pub fn current(&self) -> ThreadId {
        let inner = self.inner.lock();
        unsafe { inner.current.as_ref().id() }
    }

    /// Number of threads that are ready to run or running, including the
    /// caller. Yielding does not change this count.
    pub fn runnable_threads(&self) -> usize {
        self.inner.lock().ready.len() + 1
    }

    /// Suspends the caller for at least the given delay, yielding in a loop
    /// until the tick counter has advanced far enough. `Millis(0)` yields
    /// exactly once; [`Delay::Forever`] never returns.
    pub fn sleep(&self, delay: Delay) {
        match delay.to_ticks(&*self.clock) {
            None => loop {
                self.yield_now();
            },
            Some(0) => self.yield_now(),
            Some(ticks) => {
                let start = self.clock.ticks();
                while self.clock.ticks().wrapping_sub(start) < ticks {
                    self.yield_now();
                }
            }
        }
    }

    fn join(&self, target: NonNull<Tcb>) -> Result<ExitCode, JoinError> {
        {
            let mut inner = self.inner.lock();
            if inner.current == target {
                // Waiting on ourselves would never finish. The handle is
                // consumed, so mark the block for reclamation at exit.
                unsafe { (*target.as_ptr()).detached = true };
                return Err(JoinError::Deadlock);
            }
            unsafe { (*target.as_ptr()).join_waited = true };
            // The target may already have died before this handle was
            // joined; claim its block out of the scheduler's dead list.
            inner.dead.retain(|&t| t != target);
        }
        loop {
            {
                let _inner = self.inner.lock();
                if unsafe { (*target.as_ptr()).dead } {
                    break;
                }
            }
            self.yield_now();
        }
        let code = unsafe { (*target.as_ptr()).exit_code };
        unsafe { drop(Box::from_raw(target.as_ptr())) };
        Ok(code)
    }

    fn detach(&self, target: NonNull<Tcb>) {
        let mut inner = self.inner.lock();
        unsafe { (*target.as_ptr()).detached = true };
        Self::reclaim_locked(&mut inner);
    }

    /// Frees dead control blocks nobody will join. Called with the
    /// scheduler lock held, on every yield and detach.
    fn reclaim_locked(inner: &mut SchedInner) {
        let mut i = 0;
        while i < inner.dead.len() {
            let t = inner.dead[i];
            if unsafe { (*t.as_ptr()).detached } {
                inner.dead.swap_remove(i);
                unsafe { drop(Box::from_raw(t.as_ptr())) };
            } else {
                i += 1;
            }
        }
    }

    /// Terminal path for a spawned thread. Marks the block dead, hands
    /// control to the next ready thread and never returns.
    fn exit_current(&self, code: ExitCode) -> ! {
        let mut grave = Context::empty();
        let resume: *const Context;
        {
            let mut inner = self.inner.lock();
            let cur = inner.current;
            unsafe {
                let t = cur.as_ptr();
                (*t).dead = true;
                (*t).exit_code = code;
                if !(*t).join_waited {
                    inner.dead.push(cur);
                }
            }
            match inner.ready.pop_front() {
                Some(next) => {
                    inner.current = next;
                    resume = unsafe { &raw const (*next.as_ptr()).context };
                }
                None => {
                    drop(inner);
                    exhausted();
                }
            }
        }
        // The context saved here is never resumed; the stack it lives on
        // is reclaimed with the control block.
        unsafe { self.backend.switch(&mut grave, resume) };
        unreachable!("dead thread resumed")
    }
}

impl Drop for Scheduler {
    /// Must run on the bootstrap thread after every spawned thread has
    /// finished; any thread still queued is freed without running.
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        for t in inner.dead.drain(..) {
            unsafe { drop(Box::from_raw(t.as_ptr())) };
        }
        while let Some(t) = inner.ready.pop_front() {
            if t != inner.main {
                unsafe { drop(Box::from_raw(t.as_ptr())) };
            }
        }
        let main = inner.main;
        drop(inner);
        unsafe { drop(Box::from_raw(main.as_ptr())) };
    }
}

/// All threads have exited and nothing is left to run. The execution model
/// has no way back onto a stack, so this is terminal.
fn exhausted() -> ! {
    error!("last runnable thread exited; nothing left to schedule");
    #[cfg(feature = "std")]
    std::process::exit(0);
    #[cfg(not(feature = "std"))]
    panic!("scheduler exhausted");
}

/// Entry shim for spawned threads. Runs the body with panics contained,
/// then exits through the scheduler.
extern "C" fn thread_start(arg: *mut ()) -> ! {
    let tcb = arg as *mut Tcb;
    let sched = unsafe { &*(*tcb).sched };
    let body = unsafe { (*tcb).body.take() }.expect("fresh thread carries its body");
    let code = run_body(body);
    sched.exit_current(code)
}

#[cfg(feature = "std")]
fn run_body(body: crate::thread::ThreadBody) -> ExitCode {
    // A panic must not unwind into the entry shim; there is no frame
    // beneath it.
    match std::panic::catch_unwind(core::panic::AssertUnwindSafe(body)) {
        Ok(code) => code,
        Err(_) => {
            error!("thread body panicked");
            ExitCode::MAX
        }
    }
}

#[cfg(not(feature = "std"))]
fn run_body(body: crate::thread::ThreadBody) -> ExitCode {
    body()
}

/// Owned handle to a spawned thread.
///
/// Dropping the handle detaches the thread: it keeps running and its
/// control block is reclaimed by the scheduler once it exits.
pub struct JoinHandle {
    tcb: NonNull<Tcb>,
    sched: Arc<Scheduler>,
}

impl JoinHandle {
    /// Identity of the thread behind this handle.
    pub fn id(&self) -> ThreadId {
        ThreadId(self.tcb.as_ptr() as usize)
    }

    /// Waits (cooperatively, by yielding) until the thread exits and
    /// returns its exit code. Joining the calling thread's own handle
    /// fails with [`JoinError::Deadlock`] instead of hanging.
    pub fn join(self) -> Result<ExitCode, JoinError> {
        let this = ManuallyDrop::new(self);
        // Move the scheduler reference out without running Drop, which
        // would detach the thread we are about to join.
        let sched = unsafe { core::ptr::read(&this.sched) };
        sched.join(this.tcb)
    }
}

impl Drop for JoinHandle {
    fn drop(&mut self) {
        self.sched.detach(self.tcb);
    }
}
