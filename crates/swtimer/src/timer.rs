//! Timer handles and the slot registry.
//!
//! # Module Overview
//!
//! - [`Timer`]: a small copyable handle (slot index plus generation);
//! - [`TimerError`]: the error surface of the handle-taking operations;
//! - [`Registry`]: the slot arena and the circular ring of scheduled slots.
//!
//! Timers live in a slot arena indexed by `u32`. A handle carries the slot
//! index and the generation the slot had when the timer was created; freeing
//! a slot bumps its generation, so a handle kept past `destroy` is detected
//! as stale instead of aliasing a recycled slot.
//!
//! Scheduled slots are additionally threaded onto a circular doubly-linked
//! ring (in arming order) that the scan walks.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use alloc::vec::Vec;

use coop::platform::Arc;
use coop::SpawnError;

/// Invoked in thread context when a timer fires. Shared so the engine can
/// call it with no registry lock held.
pub type TimerCallback = Arc<dyn Fn() + 'static>;

/// Handle to a timer slot. Copyable; all operations taking one verify it
/// still names a live timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timer {
    pub(crate) index: u32,
    pub(crate) gen: u32,
}

/// A timer operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerError {
    /// The handle names a timer that has been destroyed (or a recycled
    /// slot from a destroyed timer).
    StaleHandle,
    /// The service thread could not be spawned.
    Worker(SpawnError),
}

impl fmt::Display for TimerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerError::StaleHandle => write!(f, "timer handle is stale"),
            TimerError::Worker(e) => write!(f, "timer service thread unavailable: {e}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for TimerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TimerError::StaleHandle => None,
            TimerError::Worker(e) => Some(e),
        }
    }
}

/// Wrap-safe "does `x` lie in the closed interval [`start`, `end`]" on a
/// circular tick counter.
pub(crate) fn time_is_within(x: u32, start: u32, end: u32) -> bool {
    if end >= start {
        x >= start && x <= end
    } else {
        x >= start || x <= end
    }
}

/// The slot state that lock-free paths touch. Shared by `Arc` so a
/// [`crate::JabHandle`] stays valid, and detectably stale, across slot
/// reuse.
pub(crate) struct SlotAtomics {
    /// Bumped on release; a handle whose recorded generation no longer
    /// matches is stale.
    pub(crate) gen: AtomicU32,
    /// Fire-as-soon-as-possible request, settable from any context.
    pub(crate) jabbed: AtomicBool,
}

pub(crate) struct Slot {
    pub(crate) flags: Arc<SlotAtomics>,
    pub(crate) live: bool,
    pub(crate) callback: Option<TimerCallback>,
    /// Absolute tick at which the timer fires next.
    pub(crate) due: u32,
    /// Tick distance between firings; `u32::MAX` marks an armed-forever
    /// timer that only fires when jabbed.
    pub(crate) period: u32,
    pub(crate) scheduled: bool,
    pub(crate) periodic: bool,
    pub(crate) infinite: bool,
    pub(crate) next: u32,
    pub(crate) prev: u32,
}

impl Slot {
    fn fresh() -> Self {
        Slot {
            flags: Arc::new(SlotAtomics {
                gen: AtomicU32::new(0),
                jabbed: AtomicBool::new(false),
            }),
            live: false,
            callback: None,
            due: 0,
            period: 0,
            scheduled: false,
            periodic: false,
            infinite: false,
            next: 0,
            prev: 0,
        }
    }
}

/// The slot arena plus the ring of scheduled slots. Always manipulated
/// under the engine's registry lock.
pub(crate) struct Registry {
    pub(crate) slots: Vec<Slot>,
    free: Vec<u32>,
    pub(crate) head: Option<u32>,
    /// Tick up to which every scheduled slot has been examined. Advanced
    /// only after a scan pass that fired nothing.
    pub(crate) last_scan: u32,
    /// Ticks from `last_scan` to the earliest pending deadline, `None`
    /// when nothing can expire.
    pub(crate) next_timeout: Option<u32>,
    /// Re-entry guard: set while a scan (and its callbacks) is running.
    pub(crate) scanning: bool,
    pub(crate) worker_up: bool,
    pub(crate) stopping: bool,
}

impl Registry {
    pub(crate) fn new(now: u32) -> Self {
        Registry {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            last_scan: now,
            next_timeout: None,
            scanning: false,
            worker_up: false,
            stopping: false,
        }
    }

    /// Claims a slot and returns a fresh handle for it.
    pub(crate) fn alloc(&mut self) -> Timer {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot::fresh());
                index
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.live = true;
        Timer {
            index,
            gen: slot.flags.gen.load(Ordering::Relaxed),
        }
    }

    /// Frees a slot. The generation bump invalidates every outstanding
    /// handle to it; the shared atomics survive so stale lock-free
    /// handles can still observe the bump.
    pub(crate) fn release(&mut self, index: u32) {
        let slot = &mut self.slots[index as usize];
        slot.flags.gen.fetch_add(1, Ordering::Relaxed);
        slot.flags.jabbed.store(false, Ordering::Relaxed);
        slot.live = false;
        slot.callback = None;
        slot.due = 0;
        slot.period = 0;
        slot.scheduled = false;
        slot.periodic = false;
        slot.infinite = false;
        slot.next = 0;
        slot.prev = 0;
        self.free.push(index);
    }

    /// Resolves a handle to its slot index, rejecting stale handles.
    pub(crate) fn index_of(&self, timer: Timer) -> Result<u32, TimerError> {
        match self.slots.get(timer.index as usize) {
            Some(slot) if slot.live && slot.flags.gen.load(Ordering::Relaxed) == timer.gen => {
                Ok(timer.index)
            }
            _ => Err(TimerError::StaleHandle),
        }
    }

    /// Appends a slot to the tail of the scheduled ring.
    pub(crate) fn link_tail(&mut self, index: u32) {
        match self.head {
            None => {
                self.slots[index as usize].next = index;
                self.slots[index as usize].prev = index;
                self.head = Some(index);
            }
            Some(head) => {
                let tail = self.slots[head as usize].prev;
                self.slots[tail as usize].next = index;
                self.slots[index as usize].prev = tail;
                self.slots[index as usize].next = head;
                self.slots[head as usize].prev = index;
            }
        }
        self.slots[index as usize].scheduled = true;
    }

    /// Removes a slot from the scheduled ring.
    pub(crate) fn unlink(&mut self, index: u32) {
        let slot = &self.slots[index as usize];
        if !slot.scheduled {
            return;
        }
        // A slot linked to itself is the ring's sole member.
        if slot.next == index {
            self.head = None;
        } else {
            let (next, prev) = (slot.next, slot.prev);
            self.slots[prev as usize].next = next;
            self.slots[next as usize].prev = prev;
            if self.head == Some(index) {
                self.head = Some(next);
            }
        }
        self.slots[index as usize].scheduled = false;
    }
}
