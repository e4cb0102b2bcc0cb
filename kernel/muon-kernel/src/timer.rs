//! Tick clock and sleep timer.
//!
//! Counts timer interrupts since boot and owns the set of sleeping
//! threads, ordered by wake tick. The periodic handler advances the
//! clock, drives the scheduler's per-tick work (slice accounting and,
//! under MLFQS, the decay schedule), and wakes every sleeper that has
//! come due.

use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use muon_core::SleepQueue;

use crate::config::TIMER_FREQ;
use crate::sync::IntrCell;
use crate::{intr, kprint, kprintln, thread};

/// Ticks elapsed since the timer started.
static TICKS: AtomicI64 = AtomicI64::new(0);

/// Threads waiting for a wake tick.
static SLEEPERS: IntrCell<SleepQueue> = IntrCell::new(SleepQueue::new());

/// Busy-wait iterations per timer tick, set by [`calibrate`].
static LOOPS_PER_TICK: AtomicU64 = AtomicU64::new(0);

/// The IRQ vector the platform routes its periodic timer to.
const TIMER_VECTOR: u8 = 0x20;

/// Registers the tick handler with the interrupt registry.
///
/// The platform programs its timer hardware to [`TIMER_FREQ`] Hz and
/// points the [`TIMER_VECTOR`] stub at [`intr::dispatch`].
pub fn init() {
    intr::register_external(TIMER_VECTOR, interrupt_handler, "timer");
}

/// Ticks since the timer started.
pub fn ticks() -> i64 {
    TICKS.load(Ordering::Acquire)
}

/// Ticks elapsed since `then`, a value previously returned by
/// [`ticks`].
pub fn elapsed(then: i64) -> i64 {
    ticks() - then
}

/// Suspends the running thread for at least `n` ticks.
///
/// Non-positive values return immediately. The thread becomes ready no
/// earlier than `n` ticks from now; when it runs again depends on its
/// priority.
pub fn sleep(n: i64) {
    if n <= 0 {
        return;
    }
    assert!(!intr::in_external(), "sleep inside an interrupt handler");

    let wake = ticks() + n;
    let old = intr::disable();
    let cur = thread::current();
    SLEEPERS.with(|q| q.push(wake, cur));
    thread::block();
    intr::set_level(old);
}

/// Suspends the running thread for at least `ms` milliseconds.
pub fn msleep(ms: i64) {
    real_time_sleep(ms, 1_000);
}

/// Suspends the running thread for at least `us` microseconds.
pub fn usleep(us: i64) {
    real_time_sleep(us, 1_000_000);
}

/// Suspends the running thread for at least `ns` nanoseconds.
pub fn nsleep(ns: i64) {
    real_time_sleep(ns, 1_000_000_000);
}

/// Prints the tick count.
pub fn print_stats() {
    kprintln!("Timer: {} ticks", ticks());
}

// ---------------------------------------------------------------------------
// Periodic handler
// ---------------------------------------------------------------------------

/// Ticks between MLFQS priority recomputations.
const PRIORITY_RECALC_INTERVAL: i64 = 4;

// The per-second MLFQS pass must coincide with a recomputation tick.
muon_core::static_assert!(TIMER_FREQ % PRIORITY_RECALC_INTERVAL == 0);

/// The periodic interrupt handler, run once per tick.
fn interrupt_handler() {
    let now = TICKS.fetch_add(1, Ordering::AcqRel) + 1;

    // Slice accounting and tick statistics.
    thread::tick();

    // Wake every sleeper that has come due. `thread::unblock` requests a
    // yield-on-return by itself if a woken thread outranks the running
    // one.
    loop {
        let due = SLEEPERS.with(|q| q.pop_due(now));
        match due {
            Some(id) => thread::unblock(id),
            None => break,
        }
    }

    // MLFQS decay schedule. The per-second pass updates load_avg before
    // any recent_cpu; the priority pass below then runs for this tick
    // too, since TIMER_FREQ is a multiple of the recalc interval.
    thread::with_sched(|s| {
        s.mlfqs_tick();
        if now % TIMER_FREQ == 0 {
            s.mlfqs_update_load_and_recent();
        }
        if now % PRIORITY_RECALC_INTERVAL == 0 && s.mlfqs_recompute_priorities() {
            intr::yield_on_return();
        }
    });
}

// ---------------------------------------------------------------------------
// Sub-tick delays
// ---------------------------------------------------------------------------

/// Sleeps for approximately `num / denom` seconds.
fn real_time_sleep(num: i64, denom: i64) {
    // (num / denom) s * (TIMER_FREQ ticks / 1 s), rounded down.
    let ticks_to_sleep = num * TIMER_FREQ / denom;

    assert_eq!(intr::get_level(), intr::Level::On, "timed sleep with interrupts off");
    if ticks_to_sleep > 0 {
        // At least one full tick: yield the CPU to other threads.
        sleep(ticks_to_sleep);
    } else {
        // Sub-tick: busy-wait for better accuracy. Scale the numerator
        // and denominator down by 1000 to avoid overflow.
        assert!(denom % 1000 == 0);
        let loops = LOOPS_PER_TICK.load(Ordering::Relaxed) as i64;
        busy_wait(loops * num / 1000 * TIMER_FREQ / (denom / 1000));
    }
}

/// Measures `LOOPS_PER_TICK`, for sub-tick busy-waits.
///
/// Call once after [`thread::start`], with interrupts on and the timer
/// running.
pub fn calibrate() {
    assert_eq!(intr::get_level(), intr::Level::On, "calibrating with interrupts off");
    kprint!("Calibrating timer...  ");

    // Rough power-of-two estimate below one tick.
    let mut loops_per_tick: u64 = 1 << 10;
    while !too_many_loops(loops_per_tick << 1) {
        loops_per_tick <<= 1;
        assert!(loops_per_tick != 0);
    }

    // Refine the next 8 bits.
    let high_bit = loops_per_tick;
    let mut test_bit = high_bit >> 1;
    while test_bit != high_bit >> 10 {
        if !too_many_loops(high_bit | test_bit) {
            loops_per_tick |= test_bit;
        }
        test_bit >>= 1;
    }

    LOOPS_PER_TICK.store(loops_per_tick, Ordering::Relaxed);
    kprintln!("{} loops/s.", loops_per_tick * TIMER_FREQ as u64);
}

/// Returns `true` if `loops` iterations run longer than one tick.
fn too_many_loops(loops: u64) -> bool {
    // Wait for a tick edge.
    let start = ticks();
    while ticks() == start {
        core::hint::spin_loop();
    }

    let start = ticks();
    busy_wait(loops as i64);
    start != ticks()
}

/// Spins for `loops` iterations.
///
/// Kept out-of-line so code alignment does not skew the calibration.
#[inline(never)]
fn busy_wait(loops: i64) {
    let mut remaining = loops;
    while remaining > 0 {
        core::hint::spin_loop();
        remaining -= 1;
    }
}
