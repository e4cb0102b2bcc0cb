//! Semaphore wake-order tests.

use muon_core::Priority;

use super::OrderLog;
use crate::kernel_test;
use crate::ktest::TestPolicy;
use crate::sync::Semaphore;
use crate::thread;

kernel_test! {
    /// Ten waiters wake strictly highest-priority first.
    [TestPolicy::Donation]
    fn sema_priority_wake_order() {
        static S: Semaphore = Semaphore::new(0);
        static LOG: OrderLog = OrderLog::new();

        for p in 10..20u8 {
            thread::create(
                "waiter",
                Priority::new(p),
                |arg| {
                    S.down();
                    LOG.push(arg as u8);
                },
                p as usize,
            )
            .expect("creating waiter");
        }

        // Step aside so every waiter runs and parks on the semaphore,
        // then hand out permits one at a time.
        thread::set_priority(Priority::new(5));
        for _ in 0..10 {
            S.up();
        }
        thread::set_priority(Priority::DEFAULT);

        let expected: alloc::vec::Vec<u8> = (10..20u8).rev().collect();
        assert_eq!(LOG.take(), expected);
    }
}

kernel_test! {
    /// try_down never blocks and reports the value it saw.
    [TestPolicy::Donation]
    fn sema_try_down() {
        static S: Semaphore = Semaphore::new(1);

        assert!(S.try_down());
        assert!(!S.try_down());
        S.up();
        assert!(S.try_down());
        S.up();
    }
}

kernel_test! {
    /// Control ping-pongs between two threads through two semaphores.
    [TestPolicy::Donation]
    fn sema_ping_pong() {
        static PING: Semaphore = Semaphore::new(0);
        static PONG: Semaphore = Semaphore::new(0);

        thread::create(
            "pong",
            Priority::DEFAULT,
            |_| {
                for _ in 0..10 {
                    PING.down();
                    PONG.up();
                }
            },
            0,
        )
        .expect("creating thread");

        for _ in 0..10 {
            PING.up();
            PONG.down();
        }
    }
}
