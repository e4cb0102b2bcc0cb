//! MLFQS policy tests (run under an MLFQS boot).

use core::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use muon_core::Priority;

use crate::kernel_test;
use crate::ktest::TestPolicy;
use crate::sync::Semaphore;
use crate::{thread, timer};

kernel_test! {
    /// set_priority is silently ignored under MLFQS.
    [TestPolicy::Mlfqs]
    fn mlfqs_set_priority_ignored() {
        thread::set_priority(Priority::MIN);
        assert!(
            thread::get_priority() > Priority::MIN,
            "a mostly idle thread cannot be at the floor"
        );
    }
}

kernel_test! {
    /// Niceness is clamped and round-trips.
    [TestPolicy::Mlfqs]
    fn mlfqs_nice_clamps() {
        thread::set_nice(100);
        assert_eq!(thread::get_nice(), 20);
        thread::set_nice(-100);
        assert_eq!(thread::get_nice(), -20);
        thread::set_nice(0);
        assert_eq!(thread::get_nice(), 0);
    }
}

kernel_test! {
    /// Three CPU-bound threads: lower niceness means higher priority,
    /// more CPU, and a bigger recent_cpu; the system load average rises.
    [TestPolicy::Mlfqs]
    fn mlfqs_ladder() {
        static STOP: AtomicBool = AtomicBool::new(false);
        static RECENT: [AtomicI64; 3] = [AtomicI64::new(0), AtomicI64::new(0), AtomicI64::new(0)];
        static TICK_SHARE: [AtomicI64; 3] =
            [AtomicI64::new(0), AtomicI64::new(0), AtomicI64::new(0)];
        static DONE: Semaphore = Semaphore::new(0);

        for (slot, nice) in [(0usize, 0), (1, 5), (2, 10)] {
            thread::create(
                "spinner",
                Priority::DEFAULT,
                |arg| {
                    let slot = arg / 100;
                    let nice = (arg % 100) as i32;
                    thread::set_nice(nice);
                    let mut last = timer::ticks();
                    while !STOP.load(Ordering::Acquire) {
                        // Count the ticks observed while running.
                        let now = timer::ticks();
                        if now != last {
                            TICK_SHARE[slot].fetch_add(now - last, Ordering::Relaxed);
                            last = now;
                        }
                        core::hint::spin_loop();
                    }
                    RECENT[slot].store(thread::get_recent_cpu(), Ordering::Release);
                    DONE.up();
                },
                slot * 100 + nice as usize,
            )
            .expect("creating spinner");
        }

        // Let the spinners compete for a few seconds of ticks.
        timer::sleep(3 * crate::config::TIMER_FREQ);
        STOP.store(true, Ordering::Release);
        for _ in 0..3 {
            DONE.down();
        }

        let share0 = TICK_SHARE[0].load(Ordering::Relaxed);
        let share2 = TICK_SHARE[2].load(Ordering::Relaxed);
        assert!(
            share0 > share2,
            "nice 0 ({share0} ticks) must outrun nice 10 ({share2} ticks)"
        );

        let rc0 = RECENT[0].load(Ordering::Acquire);
        let rc2 = RECENT[2].load(Ordering::Acquire);
        assert!(rc0 > rc2, "recent_cpu: nice 0 {rc0} vs nice 10 {rc2}");

        assert!(
            thread::get_load_avg() > 5,
            "three busy threads must raise load_avg, got {}",
            thread::get_load_avg()
        );
    }
}
