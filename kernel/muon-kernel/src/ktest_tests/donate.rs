//! Priority scheduling and donation tests.

use muon_core::Priority;

use super::OrderLog;
use crate::kernel_test;
use crate::ktest::TestPolicy;
use crate::sync::{Lock, Semaphore};
use crate::thread;

kernel_test! {
    /// A newly created higher-priority thread runs before create returns.
    [TestPolicy::Donation]
    fn priority_preempt() {
        static LOG: OrderLog = OrderLog::new();

        thread::create("hi", Priority::new(40), |_| LOG.push(b'h'), 0)
            .expect("creating thread");
        LOG.push(b'm');
        assert_eq!(LOG.take(), [b'h', b'm']);
    }
}

kernel_test! {
    /// Dropping below the ready head yields immediately.
    [TestPolicy::Donation]
    fn priority_drop_yields() {
        static LOG: OrderLog = OrderLog::new();

        thread::create("mid", Priority::new(25), |_| LOG.push(b'x'), 0)
            .expect("creating thread");
        LOG.push(b'1');
        thread::set_priority(Priority::new(20));
        LOG.push(b'2');
        thread::set_priority(Priority::DEFAULT);
        assert_eq!(LOG.take(), [b'1', b'x', b'2']);
    }
}

kernel_test! {
    /// Two waiters donate; release runs them highest-first.
    [TestPolicy::Donation]
    fn donate_basic() {
        static LOCK: Lock = Lock::new();
        static LOG: OrderLog = OrderLog::new();

        LOCK.acquire();
        thread::create(
            "a",
            Priority::new(32),
            |_| {
                LOCK.acquire();
                LOG.push(b'a');
                LOCK.release();
            },
            0,
        )
        .expect("creating thread");
        assert_eq!(thread::get_priority(), Priority::new(32), "donation from a");

        thread::create(
            "b",
            Priority::new(33),
            |_| {
                LOCK.acquire();
                LOG.push(b'b');
                LOCK.release();
            },
            0,
        )
        .expect("creating thread");
        assert_eq!(thread::get_priority(), Priority::new(33), "donation from b");

        LOCK.release();
        assert_eq!(LOG.take(), [b'b', b'a'], "release wakes highest first");
        assert_eq!(thread::get_priority(), Priority::DEFAULT, "donations revoked");
    }
}

kernel_test! {
    /// Revocation is per lock: releasing one lock keeps the donations
    /// earned through the other.
    [TestPolicy::Donation]
    fn donate_multiple_locks() {
        static LA: Lock = Lock::new();
        static LB: Lock = Lock::new();

        LA.acquire();
        LB.acquire();

        thread::create(
            "a",
            Priority::new(32),
            |_| {
                LA.acquire();
                LA.release();
            },
            0,
        )
        .expect("creating thread");
        thread::create(
            "b",
            Priority::new(33),
            |_| {
                LB.acquire();
                LB.release();
            },
            0,
        )
        .expect("creating thread");
        assert_eq!(thread::get_priority(), Priority::new(33));

        LB.release();
        assert_eq!(thread::get_priority(), Priority::new(32), "a's donation survives");
        LA.release();
        assert_eq!(thread::get_priority(), Priority::DEFAULT);
    }
}

kernel_test! {
    /// Donation propagates through a chain of lock holders.
    [TestPolicy::Donation]
    fn donate_nested_chain() {
        static A: Lock = Lock::new();
        static B: Lock = Lock::new();
        static LOG: OrderLog = OrderLog::new();

        A.acquire();
        thread::create(
            "medium",
            Priority::new(32),
            |_| {
                B.acquire();
                A.acquire();
                LOG.push(b'm');
                A.release();
                B.release();
            },
            0,
        )
        .expect("creating thread");
        assert_eq!(thread::get_priority(), Priority::new(32), "direct donation");

        thread::create(
            "high",
            Priority::new(33),
            |_| {
                B.acquire();
                LOG.push(b'h');
                B.release();
            },
            0,
        )
        .expect("creating thread");
        assert_eq!(
            thread::get_priority(),
            Priority::new(33),
            "nested donation through medium"
        );

        A.release();
        assert_eq!(LOG.take(), [b'm', b'h']);
        assert_eq!(thread::get_priority(), Priority::DEFAULT);
    }
}

kernel_test! {
    /// Donated priority also decides semaphore wake order.
    [TestPolicy::Donation]
    fn donate_sema_interplay() {
        static LOCK: Lock = Lock::new();
        static S: Semaphore = Semaphore::new(0);
        static LOG: OrderLog = OrderLog::new();

        thread::create(
            "l",
            Priority::new(32),
            |_| {
                LOCK.acquire();
                S.down();
                LOCK.release();
                LOG.push(b'l');
            },
            0,
        )
        .expect("creating thread");
        thread::create(
            "m",
            Priority::new(34),
            |_| {
                S.down();
                LOG.push(b'm');
            },
            0,
        )
        .expect("creating thread");
        thread::create(
            "h",
            Priority::new(36),
            |_| {
                LOCK.acquire();
                LOG.push(b'h');
                LOCK.release();
            },
            0,
        )
        .expect("creating thread");

        // l holds the lock and sleeps on S at effective priority 36
        // (h's donation); m sleeps on S at 34. The first up must pick l.
        S.up();
        S.up();
        assert_eq!(LOG.take(), [b'h', b'l', b'm']);
    }
}
