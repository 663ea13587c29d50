//! Tick source abstraction.
//!
//! The scheduler and the timer layer never read time directly; they consume a
//! [`Clock`], a free-running tick counter that wraps silently at the end of
//! its numeric range. The absolute tick value is meaningless; only wrapping
//! differences between two readings carry information, so all tick
//! arithmetic in this workspace is `wrapping_*`.

/// A free-running, wrapping tick counter plus a milliseconds conversion.
pub trait Clock: Send + Sync {
    /// Current tick value. Wraps silently; compare readings only through
    /// wrapping subtraction, never `t1 + period <= t2`.
    fn ticks(&self) -> u32;

    /// Converts a duration in milliseconds to a tick count.
    fn ticks_from_millis(&self, ms: u32) -> u32;
}

/// A delay used by blocking waits, sleeps and timer arming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    /// Elapses after the given number of milliseconds. `Millis(0)` means
    /// "do not suspend": the operation tests once and returns.
    Millis(u32),
    /// The infinite sentinel: never elapses on its own.
    Forever,
}

impl Delay {
    /// Tick count for this delay, or `None` for [`Delay::Forever`].
    pub fn to_ticks(self, clock: &dyn Clock) -> Option<u32> {
        match self {
            Delay::Millis(ms) => Some(clock.ticks_from_millis(ms)),
            Delay::Forever => None,
        }
    }
}

/// Wall-clock tick source running at 1 kHz (1 tick = 1 ms).
#[cfg(feature = "std")]
pub struct StdClock {
    origin: std::time::Instant,
}

#[cfg(feature = "std")]
impl StdClock {
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

#[cfg(feature = "std")]
impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl Clock for StdClock {
    fn ticks(&self) -> u32 {
        self.origin.elapsed().as_millis() as u32
    }

    fn ticks_from_millis(&self, ms: u32) -> u32 {
        ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_conversion() {
        let clock = StdClock::new();
        assert_eq!(Delay::Millis(25).to_ticks(&clock), Some(25));
        assert_eq!(Delay::Millis(0).to_ticks(&clock), Some(0));
        assert_eq!(Delay::Forever.to_ticks(&clock), None);
    }

    #[test]
    fn std_clock_advances() {
        let clock = StdClock::new();
        let t0 = clock.ticks();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(clock.ticks().wrapping_sub(t0) >= 5);
    }
}
