//! Mutual-exclusion lock with priority donation.
//!
//! A lock is a binary semaphore with an owner: at most one holder, the
//! same thread must acquire and release, and re-acquiring while held is
//! an error. Under the donation policy, a contended acquire donates the
//! waiter's effective priority to the holder (transitively, through the
//! donation engine in `muon-core`); release revokes exactly the
//! donations earned through this lock.

use muon_core::LockId;

use super::Semaphore;
use crate::{intr, thread};

/// A mutual-exclusion lock.
///
/// The lock's address is its identity in the scheduler's holder and
/// donation bookkeeping, so a lock must not be moved while it is held or
/// contended. Locks are created at rest and may be dropped once no
/// thread holds or waits on them.
pub struct Lock {
    sema: Semaphore,
}

impl Lock {
    /// Creates an unowned lock.
    pub const fn new() -> Self {
        Self {
            sema: Semaphore::new(1),
        }
    }

    fn id(&self) -> LockId {
        LockId::new(self as *const Self as usize)
    }

    /// Acquires the lock, sleeping until it is available.
    ///
    /// Donates priority to the current holder when contended (donation
    /// policy only). Must not be called from an interrupt handler, and
    /// the caller must not already hold this lock.
    pub fn acquire(&self) {
        assert!(!intr::in_external(), "lock acquire inside a handler");
        let old = intr::disable();
        assert!(
            !self.held_by_current(),
            "recursive lock acquisition by {}",
            thread::name()
        );

        let id = self.id();
        let contended = thread::with_sched(|s| s.lock_holder(id).is_some());
        if contended {
            thread::with_sched(|s| s.lock_contended(id));
        }
        self.sema.down();
        thread::with_sched(|s| s.lock_granted(id));
        intr::set_level(old);
    }

    /// Acquires the lock only if it is free; returns `true` on success.
    ///
    /// Never donates: no waiting happens. Safe from interrupt handlers.
    pub fn try_acquire(&self) -> bool {
        let old = intr::disable();
        assert!(!self.held_by_current(), "recursive lock acquisition");
        let ok = self.sema.try_down();
        if ok {
            thread::with_sched(|s| s.lock_granted(self.id()));
        }
        intr::set_level(old);
        ok
    }

    /// Releases the lock, revoking the donations it earned and waking
    /// the highest-priority waiter.
    ///
    /// Must be called by the holder.
    pub fn release(&self) {
        let old = intr::disable();
        assert!(
            self.held_by_current(),
            "releasing a lock not held by {}",
            thread::name()
        );
        thread::with_sched(|s| s.lock_released(self.id()));
        self.sema.up();
        intr::set_level(old);
    }

    /// Returns `true` if the running thread holds this lock.
    ///
    /// (Asking about another thread's ownership would be racy.)
    pub fn held_by_current(&self) -> bool {
        let id = self.id();
        thread::with_sched(|s| s.lock_holder(id) == Some(s.current()))
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}
