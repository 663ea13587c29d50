//! Timer engine behavior under a hand-advanced tick source: deadlines,
//! catch-up, jabs, wraparound and callback re-entry, plus one end-to-end
//! worker-mode run.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use coop::{Clock, Delay, Scheduler, ThreadConfig};
use swtimer::{EngineConfig, ServiceMode, TimerEngine, TimerError};

/// Tick source the test advances by hand; 1 tick = 1 ms.
struct MockClock {
    now: AtomicU32,
}

impl MockClock {
    fn starting_at(start: u32) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicU32::new(start),
        })
    }

    fn advance(&self, ticks: u32) {
        self.now.fetch_add(ticks, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn ticks(&self) -> u32 {
        self.now.load(Ordering::SeqCst)
    }

    fn ticks_from_millis(&self, ms: u32) -> u32 {
        ms
    }
}

fn polling_engine(start: u32) -> (Arc<MockClock>, TimerEngine) {
    let clock = MockClock::starting_at(start);
    let sched = Scheduler::with_clock(clock.clone());
    let engine = TimerEngine::with_config(
        sched,
        EngineConfig::new().with_mode(ServiceMode::Polling),
    );
    (clock, engine)
}

fn counter() -> (Arc<AtomicUsize>, impl Fn() + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let cb = {
        let count = Arc::clone(&count);
        move || {
            count.fetch_add(1, Ordering::SeqCst);
        }
    };
    (count, cb)
}

#[test]
fn one_shot_fires_once_and_disarms() {
    let (clock, engine) = polling_engine(0);
    let (count, cb) = counter();

    let t = engine.create();
    engine.start(t, false, Delay::Millis(10), cb).expect("arm");
    assert!(engine.is_active(t));

    engine.poll();
    assert_eq!(count.load(Ordering::SeqCst), 0, "not due yet");

    clock.advance(10);
    engine.poll();
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(!engine.is_active(t));

    clock.advance(100);
    engine.poll();
    assert_eq!(count.load(Ordering::SeqCst), 1, "one-shot must not refire");
}

#[test]
fn late_periodic_fires_once_and_resynchronizes() {
    let (clock, engine) = polling_engine(0);
    let (count, cb) = counter();

    let t = engine.create();
    engine.start(t, true, Delay::Millis(10), cb).expect("arm");
    engine.poll();

    // Two whole periods pass unobserved; the backlog collapses into a
    // single firing and the cadence snaps back onto the original grid.
    clock.advance(25);
    engine.poll();
    assert_eq!(count.load(Ordering::SeqCst), 1);

    clock.advance(4);
    engine.poll();
    assert_eq!(count.load(Ordering::SeqCst), 1, "next deadline is t=30");

    clock.advance(1);
    engine.poll();
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[test]
fn periodic_fires_once_per_elapsed_period() {
    let (clock, engine) = polling_engine(0);
    let (count, cb) = counter();

    let t = engine.create();
    engine.start(t, true, Delay::Millis(7), cb).expect("arm");

    for _ in 0..50 {
        clock.advance(1);
        engine.poll();
    }
    // Deadlines at 7, 14, ..., 49.
    assert_eq!(count.load(Ordering::SeqCst), 50 / 7);
    assert!(engine.is_active(t));
}

#[test]
fn forever_one_shot_fires_only_when_jabbed() {
    let (clock, engine) = polling_engine(0);
    let (count, cb) = counter();

    let t = engine.create();
    engine.start(t, false, Delay::Forever, cb).expect("arm");

    clock.advance(10_000);
    engine.poll();
    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert!(engine.is_active(t));

    engine.jab(t).expect("jab");
    engine.poll();
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(!engine.is_active(t), "a jabbed one-shot disarms");
}

#[test]
fn forever_periodic_survives_jabs() {
    let (_clock, engine) = polling_engine(0);
    let (count, cb) = counter();

    let t = engine.create();
    engine.start(t, true, Delay::Forever, cb).expect("arm");

    for _ in 0..3 {
        engine.jab(t).expect("jab");
        engine.poll();
    }
    assert_eq!(count.load(Ordering::SeqCst), 3);
    assert!(engine.is_active(t), "periodic-forever stays armed");
}

#[test]
fn jab_does_not_shift_periodic_cadence() {
    let (clock, engine) = polling_engine(0);
    let (count, cb) = counter();

    let t = engine.create();
    engine.start(t, true, Delay::Millis(100), cb).expect("arm");
    engine.poll();

    clock.advance(10);
    engine.jab(t).expect("jab");
    engine.poll();
    assert_eq!(count.load(Ordering::SeqCst), 1, "jab fires early");

    clock.advance(90);
    engine.poll();
    assert_eq!(
        count.load(Ordering::SeqCst),
        2,
        "regular deadline at t=100 is unaffected by the jab"
    );
}

#[test]
fn zero_delay_periodic_degenerates_to_one_shot() {
    let (clock, engine) = polling_engine(0);
    let (count, cb) = counter();

    let t = engine.create();
    engine.start(t, true, Delay::Millis(0), cb).expect("arm");

    // A zero period cannot sustain a cadence: one firing, then disarmed.
    for _ in 0..5 {
        clock.advance(1);
        engine.poll();
    }
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(!engine.is_active(t));
}

#[test]
fn jab_handle_fires_and_goes_stale_after_destroy() {
    let (_clock, engine) = polling_engine(0);
    let (count, cb) = counter();

    let t = engine.create();
    engine.start(t, true, Delay::Forever, cb).expect("arm");
    let jab = engine.jab_handle(t).expect("prearrange");

    assert!(jab.jab());
    engine.poll();
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(engine.is_active(t), "periodic-forever stays armed");

    engine.destroy(t);
    assert!(!jab.jab(), "handle goes stale with the timer");
    engine.poll();
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(engine.jab_handle(t).is_err());
}

#[test]
fn callback_may_destroy_its_own_timer() {
    let (clock, engine) = polling_engine(0);
    let fired = Arc::new(AtomicUsize::new(0));

    let t = engine.create();
    let inner_engine = engine.clone();
    let inner_fired = Arc::clone(&fired);
    engine
        .start(t, true, Delay::Millis(5), move || {
            inner_fired.fetch_add(1, Ordering::SeqCst);
            inner_engine.destroy(t);
        })
        .expect("arm");

    clock.advance(5);
    engine.poll();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(!engine.is_active(t));

    clock.advance(50);
    engine.poll();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn callback_armed_zero_delay_timer_fires_in_same_poll() {
    let (clock, engine) = polling_engine(0);
    let chained = Arc::new(AtomicUsize::new(0));

    let first = engine.create();
    let second = engine.create();
    let inner_engine = engine.clone();
    let inner_count = Arc::clone(&chained);
    engine
        .start(first, false, Delay::Millis(5), move || {
            let count = Arc::clone(&inner_count);
            inner_engine
                .start(second, false, Delay::Millis(0), move || {
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .expect("arm chained");
        })
        .expect("arm");

    clock.advance(5);
    engine.poll();
    assert_eq!(
        chained.load(Ordering::SeqCst),
        1,
        "zero-delay timer armed mid-scan fires before the scan finishes"
    );
}

#[test]
fn deadlines_survive_tick_counter_wraparound() {
    let (clock, engine) = polling_engine(u32::MAX - 10);
    let (count, cb) = counter();

    let t = engine.create();
    engine.start(t, true, Delay::Millis(30), cb).expect("arm");
    engine.poll();

    // Deadline sits at 19 after the counter wraps.
    clock.advance(30);
    engine.poll();
    assert_eq!(count.load(Ordering::SeqCst), 1);

    clock.advance(30);
    engine.poll();
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[test]
fn stop_cancels_and_is_idempotent() {
    let (clock, engine) = polling_engine(0);
    let (count, cb) = counter();

    let t = engine.create();
    engine.start(t, true, Delay::Millis(10), cb).expect("arm");
    engine.stop(t).expect("stop");
    assert!(!engine.is_active(t));
    engine.stop(t).expect("stopping an idle timer is a no-op");

    clock.advance(100);
    engine.poll();
    assert_eq!(count.load(Ordering::SeqCst), 0);

    // The timer object survives a stop and can be re-armed.
    let (count2, cb2) = counter();
    engine.start(t, false, Delay::Millis(10), cb2).expect("re-arm");
    clock.advance(10);
    engine.poll();
    assert_eq!(count2.load(Ordering::SeqCst), 1);
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn destroyed_timer_handle_goes_stale() {
    let (_clock, engine) = polling_engine(0);
    let t = engine.create();
    engine.destroy(t);

    assert_eq!(
        engine.start(t, false, Delay::Millis(1), || {}),
        Err(TimerError::StaleHandle)
    );
    assert_eq!(engine.stop(t), Err(TimerError::StaleHandle));
    assert_eq!(engine.jab(t), Err(TimerError::StaleHandle));
    assert!(!engine.is_active(t));
    engine.destroy(t); // second destroy is a no-op

    // A recycled slot must not resurrect the stale handle.
    let fresh = engine.create();
    assert!(!engine.is_active(t));
    assert_ne!(fresh, t);
}

#[test]
fn worker_mode_fires_through_the_scheduler() {
    let clock = MockClock::starting_at(0);
    let sched = Scheduler::with_clock(clock.clone());
    let engine = TimerEngine::new(Arc::clone(&sched));
    let (count, cb) = counter();

    let t = engine.create();
    engine.start(t, false, Delay::Millis(10), cb).expect("arm");

    // Let the worker come up and compute its deadline.
    for _ in 0..10 {
        sched.yield_now();
    }
    assert_eq!(count.load(Ordering::SeqCst), 0);

    clock.advance(10);
    let mut yields = 0;
    while count.load(Ordering::SeqCst) == 0 && yields < 1000 {
        sched.yield_now();
        yields += 1;
    }
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(!engine.is_active(t));

    engine.destroy(t);
    engine.shutdown();
    // Give the worker a chance to observe the shutdown and exit.
    for _ in 0..10 {
        sched.yield_now();
    }

    // Spawning still works afterwards; the scheduler itself is unaffected.
    let h = sched
        .spawn(ThreadConfig::new(), || 5)
        .expect("spawn after shutdown");
    assert_eq!(h.join(), Ok(5));
}
