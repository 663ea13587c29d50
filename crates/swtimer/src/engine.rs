//! The timer engine: arming, firing and the service loop.
//!
//! # Module Overview
//!
//! - [`TimerEngine`]: the public API (create/start/stop/jab/destroy);
//! - [`EngineConfig`], [`ServiceMode`]: construction-time choices;
//! - the scan loop shared by the worker thread and [`TimerEngine::poll`].
//!
//! All callbacks run in thread context, never in an interrupt: either on a
//! dedicated cooperative worker thread (the default) or inside the caller
//! of [`TimerEngine::poll`] on hosts that cannot spare a thread. The engine
//! holds its registry lock only for bookkeeping; a callback is always
//! invoked with the lock released, so callbacks may freely start, stop,
//! jab or destroy timers, including their own.
//!
//! A scan pass walks the scheduled ring in arming order and fires at most
//! one timer, then restarts from the head, until a pass completes with
//! nothing due. Only such a clean pass advances the engine's scan horizon,
//! which keeps deadline checks wrap-safe on the 32-bit tick counter.

use core::sync::atomic::{AtomicBool, Ordering};

use log::{debug, trace};

use coop::platform::{Arc, Mutex};
use coop::scheduler::Scheduler;
use coop::thread::{Priority, ThreadConfig};
use coop::{Delay, ExitCode, Semaphore};

use crate::timer::{time_is_within, Registry, SlotAtomics, Timer, TimerCallback, TimerError};

/// How callbacks get their thread context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceMode {
    /// A dedicated cooperative worker thread, spawned lazily on the first
    /// timer start, sleeps until the earliest deadline and runs callbacks.
    Worker,
    /// No thread is spawned; the host calls [`TimerEngine::poll`] from its
    /// own loop and callbacks run inside that call.
    Polling,
}

/// Construction-time engine parameters.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    mode: ServiceMode,
    worker_stack: usize,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self {
            mode: ServiceMode::Worker,
            worker_stack: coop::DEFAULT_STACK_SIZE,
        }
    }

    pub fn with_mode(mut self, mode: ServiceMode) -> Self {
        self.mode = mode;
        self
    }

    /// Stack size for the worker thread, in worker mode.
    pub fn with_worker_stack(mut self, bytes: usize) -> Self {
        self.worker_stack = bytes;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

struct EngineShared {
    sched: Arc<Scheduler>,
    registry: Mutex<Registry>,
    /// Binary wake flag for the worker: any number of nudges collapse
    /// into one pending wake.
    wake: Semaphore,
    /// Polling-mode counterpart of the wake semaphore: forces the next
    /// [`TimerEngine::poll`] to scan regardless of the recorded deadline.
    forced: AtomicBool,
    mode: ServiceMode,
    worker_stack: usize,
}

impl EngineShared {
    /// Tells the service loop a deadline may have moved earlier. A single
    /// lock-free step in either mode, so it is callable from any context.
    fn nudge(&self) {
        match self.mode {
            ServiceMode::Worker => self.wake.signal(),
            ServiceMode::Polling => self.forced.store(true, Ordering::Release),
        }
    }
}

/// Software timers driven by a cooperative scheduler's tick source.
///
/// Cheap to clone; clones share one registry and one service loop.
#[derive(Clone)]
pub struct TimerEngine {
    shared: Arc<EngineShared>,
}

impl TimerEngine {
    /// Creates an engine in worker mode with default parameters.
    pub fn new(sched: Arc<Scheduler>) -> Self {
        Self::with_config(sched, EngineConfig::new())
    }

    pub fn with_config(sched: Arc<Scheduler>, config: EngineConfig) -> Self {
        let now = sched.clock().ticks();
        TimerEngine {
            shared: Arc::new(EngineShared {
                sched,
                registry: Mutex::new(Registry::new(now)),
                wake: Semaphore::new(0, 1),
                forced: AtomicBool::new(false),
                mode: config.mode,
                worker_stack: config.worker_stack,
            }),
        }
    }

    /// Creates a timer. It does nothing until started.
    pub fn create(&self) -> Timer {
        self.shared.registry.lock().alloc()
    }

    /// Destroys a timer, cancelling it if scheduled. Destroying an
    /// already-destroyed timer is a no-op, so teardown paths need no
    /// bookkeeping of their own.
    pub fn destroy(&self, timer: Timer) {
        let mut reg = self.shared.registry.lock();
        if let Ok(index) = reg.index_of(timer) {
            reg.unlink(index);
            reg.release(index);
        }
    }

    /// Arms a timer: after `delay` it fires `callback` in thread context,
    /// then either disarms (one-shot) or keeps firing every `delay`
    /// (periodic). Starting an armed timer re-arms it with the new
    /// parameters. `Delay::Forever` arms the timer indefinitely; it fires
    /// only when jabbed, and a periodic forever timer stays armed across
    /// jabs.
    pub fn start(
        &self,
        timer: Timer,
        periodic: bool,
        delay: Delay,
        callback: impl Fn() + 'static,
    ) -> Result<(), TimerError> {
        self.ensure_worker()?;

        let mut reg = self.shared.registry.lock();
        let index = reg.index_of(timer)?;
        reg.unlink(index);

        let now = self.shared.sched.clock().ticks();
        let (infinite, period, due) = match delay.to_ticks(self.shared.sched.clock()) {
            // Sentinel period keeps a jabbed periodic-forever timer from
            // being treated as fire-every-scan.
            None => (true, u32::MAX, now),
            Some(ticks) => (false, ticks, now.wrapping_add(ticks)),
        };

        {
            let slot = &mut reg.slots[index as usize];
            slot.callback = Some(Arc::new(callback) as TimerCallback);
            slot.periodic = periodic;
            slot.infinite = infinite;
            slot.flags.jabbed.store(false, Ordering::Relaxed);
            slot.period = period;
            slot.due = due;
        }
        reg.link_tail(index);
        debug!(
            "timer {} armed ({}, {:?})",
            index,
            if periodic { "periodic" } else { "one-shot" },
            delay
        );

        if !infinite {
            self.shared.nudge();
        }
        Ok(())
    }

    /// Cancels a scheduled timer. The timer itself survives and can be
    /// started again. Cancelling an idle timer is a no-op.
    pub fn stop(&self, timer: Timer) -> Result<(), TimerError> {
        let mut reg = self.shared.registry.lock();
        let index = reg.index_of(timer)?;
        reg.unlink(index);
        reg.slots[index as usize]
            .flags
            .jabbed
            .store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Whether the timer is currently scheduled to fire.
    pub fn is_active(&self, timer: Timer) -> bool {
        let reg = self.shared.registry.lock();
        match reg.index_of(timer) {
            Ok(index) => reg.slots[index as usize].scheduled,
            Err(_) => false,
        }
    }

    /// Makes a scheduled timer fire as soon as possible, ahead of its
    /// deadline. A periodic timer's cadence is unaffected.
    ///
    /// Takes the registry lock to validate the handle; from interrupt
    /// context use a prearranged [`JabHandle`] instead.
    pub fn jab(&self, timer: Timer) -> Result<(), TimerError> {
        let reg = self.shared.registry.lock();
        let index = reg.index_of(timer)?;
        reg.slots[index as usize]
            .flags
            .jabbed
            .store(true, Ordering::Release);
        drop(reg);
        self.shared.nudge();
        Ok(())
    }

    /// Prearranges a lock-free jab path for the timer. Call this in thread
    /// context; the returned handle can then jab from any context,
    /// interrupt handlers included.
    pub fn jab_handle(&self, timer: Timer) -> Result<JabHandle, TimerError> {
        let reg = self.shared.registry.lock();
        let index = reg.index_of(timer)?;
        Ok(JabHandle {
            flags: Arc::clone(&reg.slots[index as usize].flags),
            gen: timer.gen,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Runs due callbacks on the calling thread. Only meaningful in
    /// [`ServiceMode::Polling`]; in worker mode it is a no-op. Returns
    /// quickly when nothing can be due yet.
    pub fn poll(&self) {
        if self.shared.mode != ServiceMode::Polling {
            return;
        }
        // A pending nudge (new arming, jab) bypasses the deadline check.
        // Consuming it while a scan is in progress is harmless: the jab
        // flag itself is re-examined by the running scan's next pass.
        if !self.shared.forced.swap(false, Ordering::Acquire) {
            let reg = self.shared.registry.lock();
            if reg.scanning {
                return;
            }
            let Some(timeout) = reg.next_timeout else {
                return;
            };
            let now = self.shared.sched.clock().ticks();
            if now.wrapping_sub(reg.last_scan) < timeout {
                return;
            }
        }
        scan(&self.shared);
    }

    /// Stops the service loop. In worker mode the worker thread exits at
    /// its next wake; armed timers stop firing. Meant for orderly host
    /// teardown, after which the engine should be dropped.
    pub fn shutdown(&self) {
        self.shared.registry.lock().stopping = true;
        self.shared.wake.signal();
    }

    /// Lazily brings up the worker thread in worker mode.
    fn ensure_worker(&self) -> Result<(), TimerError> {
        if self.shared.mode != ServiceMode::Worker {
            return Ok(());
        }
        {
            let mut reg = self.shared.registry.lock();
            if reg.worker_up {
                return Ok(());
            }
            reg.worker_up = true;
        }
        let shared = Arc::clone(&self.shared);
        let config = ThreadConfig::new()
            .with_stack_size(self.shared.worker_stack)
            .with_priority(Priority::High);
        match self.shared.sched.spawn(config, move || worker_loop(shared)) {
            Ok(handle) => {
                debug!("timer worker thread {:?} started", handle.id());
                drop(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.registry.lock().worker_up = false;
                Err(TimerError::Worker(e))
            }
        }
    }
}

/// Lock-free jab path, prearranged by [`TimerEngine::jab_handle`].
///
/// Jabbing through the handle is a generation check, an atomic flag store
/// and a lock-free wake: no lock is taken at any point, so a handler that
/// interrupts a thread holding the registry lock cannot deadlock. If the
/// timer is destroyed between the check and the store, the stray flag
/// lands on a vacant slot the scan never visits and is cleared on reuse.
pub struct JabHandle {
    flags: Arc<SlotAtomics>,
    gen: u32,
    shared: Arc<EngineShared>,
}

impl JabHandle {
    /// Makes the timer fire as soon as possible. Returns `false` once the
    /// timer has been destroyed.
    pub fn jab(&self) -> bool {
        if self.flags.gen.load(Ordering::Relaxed) != self.gen {
            return false;
        }
        self.flags.jabbed.store(true, Ordering::Release);
        self.shared.nudge();
        true
    }
}

fn worker_loop(shared: Arc<EngineShared>) -> ExitCode {
    loop {
        let timeout = {
            let reg = shared.registry.lock();
            if reg.stopping {
                break;
            }
            reg.next_timeout
        };
        shared.wake.wait_ticks(&shared.sched, timeout);
        if shared.registry.lock().stopping {
            break;
        }
        scan(&shared);
    }
    debug!("timer worker thread exiting");
    0
}

/// One full scan: fire everything due, restart from the head after every
/// firing, finish on a pass where nothing fires. Recomputes the earliest
/// pending deadline as a side effect.
fn scan(shared: &EngineShared) {
    {
        let mut reg = shared.registry.lock();
        if reg.scanning {
            return;
        }
        reg.scanning = true;
    }
    loop {
        let mut fired: Option<TimerCallback> = None;
        {
            let mut reg = shared.registry.lock();
            let now = shared.sched.clock().ticks();
            let last = reg.last_scan;
            reg.next_timeout = None;
            if let Some(head) = reg.head {
                let mut at = head;
                loop {
                    let slot = &reg.slots[at as usize];
                    let jabbed = slot.flags.jabbed.load(Ordering::Acquire);
                    let infinite = slot.infinite;
                    let periodic = slot.periodic;
                    let period = slot.period;
                    let due = slot.due;
                    if jabbed || (!infinite && time_is_within(due, last, now)) {
                        trace!("timer {} due at tick {} (jabbed: {})", at, now, jabbed);
                        // A zero-period timer cannot sustain a cadence, so
                        // a periodic zero-delay arm degenerates to one-shot.
                        if periodic && period != 0 {
                            if !infinite {
                                // Catch up past any missed periods so the
                                // next deadline lies strictly in the future.
                                let missed =
                                    now.wrapping_add(period).wrapping_sub(due) / period;
                                reg.slots[at as usize].due =
                                    due.wrapping_add(missed.wrapping_mul(period));
                            }
                            reg.slots[at as usize]
                                .flags
                                .jabbed
                                .store(false, Ordering::Relaxed);
                            fired = reg.slots[at as usize].callback.clone();
                        } else {
                            reg.unlink(at);
                            let slot = &mut reg.slots[at as usize];
                            slot.flags.jabbed.store(false, Ordering::Relaxed);
                            slot.infinite = false;
                            fired = slot.callback.take();
                        }
                        break;
                    }
                    if !infinite {
                        let remain = due.wrapping_sub(now);
                        reg.next_timeout = Some(match reg.next_timeout {
                            Some(t) => t.min(remain),
                            None => remain,
                        });
                    }
                    at = reg.slots[at as usize].next;
                    if at == head {
                        break;
                    }
                }
            }
            // The horizon only moves after a pass that fired nothing;
            // otherwise a deadline between `last` and `now` could be
            // skipped by the restarted walk.
            if fired.is_none() {
                reg.last_scan = now;
            }
        }
        match fired {
            Some(callback) => callback(),
            None => break,
        }
    }
    shared.registry.lock().scanning = false;
}
