//! Sleep timer tests.

use muon_core::Priority;

use super::OrderLog;
use crate::kernel_test;
use crate::ktest::TestPolicy;
use crate::sync::{IntrCell, Semaphore};
use crate::{thread, timer};

kernel_test! {
    /// Non-positive durations return immediately.
    [TestPolicy::Donation]
    fn alarm_nonpositive() {
        let before = timer::ticks();
        timer::sleep(0);
        timer::sleep(-100);
        assert!(timer::elapsed(before) <= 1, "sleep(<=0) must not wait");
    }
}

kernel_test! {
    /// Five sleepers with staggered durations wake in duration order.
    [TestPolicy::Donation]
    fn alarm_order() {
        static LOG: OrderLog = OrderLog::new();
        static DONE: Semaphore = Semaphore::new(0);

        for i in 1..=5u8 {
            thread::create(
                "sleeper",
                Priority::DEFAULT,
                |arg| {
                    timer::sleep(arg as i64 * 10);
                    LOG.push(arg as u8);
                    DONE.up();
                },
                i as usize,
            )
            .expect("creating sleeper");
        }

        // The sleepers run (and start their naps) once we block.
        for _ in 0..5 {
            DONE.down();
        }
        assert_eq!(LOG.take(), [1, 2, 3, 4, 5]);
    }
}

kernel_test! {
    /// Sleepers sharing a wake tick all wake on that tick.
    [TestPolicy::Donation]
    fn alarm_simultaneous() {
        static WAKE_TICKS: IntrCell<[i64; 3]> = IntrCell::new([0; 3]);
        static DONE: Semaphore = Semaphore::new(0);

        for i in 0..3 {
            thread::create(
                "simul",
                Priority::DEFAULT,
                |arg| {
                    timer::sleep(20);
                    let now = timer::ticks();
                    WAKE_TICKS.with(|w| w[arg] = now);
                    DONE.up();
                },
                i,
            )
            .expect("creating sleeper");
        }
        for _ in 0..3 {
            DONE.down();
        }

        let ticks = WAKE_TICKS.with(|w| *w);
        let min = ticks.iter().min().copied().unwrap_or(0);
        let max = ticks.iter().max().copied().unwrap_or(0);
        assert!(
            max - min <= 2,
            "equal sleeps should wake together, got {ticks:?}"
        );
    }
}

kernel_test! {
    /// A sleeping thread never becomes ready before its wake tick.
    [TestPolicy::Donation]
    fn alarm_not_early() {
        let before = timer::ticks();
        timer::sleep(25);
        assert!(timer::elapsed(before) >= 25, "woke early");
    }
}
