//! Priority donation engine.
//!
//! When a thread blocks acquiring a lock whose holder has lower effective
//! priority, the holder inherits the waiter's priority so it can finish
//! and release sooner (avoiding priority inversion). Donations propagate
//! transitively along the "waits on lock → lock's holder" chain up to
//! [`DONATION_DEPTH_LIMIT`], and are revoked selectively on release: only
//! donors that were waiting on the released lock are dropped.
//!
//! All of this is bookkeeping on the [`Scheduler`] table; the kernel's
//! lock calls in here around its semaphore operations.

use core::mem;

use crate::id::{LockId, ThreadId};
use crate::sched::{Policy, Scheduler, ThreadState};

/// Maximum number of waits-on/holds edges a single donation walks.
///
/// Bounds the cost of the walk inside an interrupt-disabled region and
/// breaks accidental cycles. This is a correctness constant, not a
/// tunable.
pub const DONATION_DEPTH_LIMIT: usize = 8;

impl Scheduler {
    /// Returns the thread holding `lock`, if any.
    pub fn lock_holder(&self, lock: LockId) -> Option<ThreadId> {
        self.lock_holders.get(&lock).copied()
    }

    /// Records that the running thread must wait for `lock`.
    ///
    /// Under the donation policy this registers the thread as a donor of
    /// the holder and propagates its priority along the chain. Under
    /// MLFQS donation is disabled and this does nothing.
    ///
    /// The caller blocks on the lock's semaphore afterwards.
    pub fn lock_contended(&mut self, lock: LockId) {
        let cur = self.current();
        let holder = self.lock_holder(lock).expect("contended lock has no holder");
        assert_ne!(holder, cur, "recursive lock acquisition");
        match self.policy {
            Policy::Mlfqs { .. } => {}
            Policy::Donation => {
                self.record_mut(cur).waiting_on = Some(lock);
                self.propagate_donation(cur);
            }
        }
    }

    /// Records that the running thread now owns `lock`.
    ///
    /// Called after a successful semaphore down (or a successful
    /// try-acquire, in which case no donation ever happened).
    pub fn lock_granted(&mut self, lock: LockId) {
        let cur = self.current();
        self.record_mut(cur).waiting_on = None;
        let prev = self.lock_holders.insert(lock, cur);
        debug_assert!(prev.is_none(), "granting a lock that still has a holder");
        self.record_mut(cur).held_locks.push(lock);
    }

    /// Records that the running thread released `lock`, revoking exactly
    /// the donations that were earned through it.
    ///
    /// Donors waiting on *other* locks held by the releaser remain; a
    /// thread holding several contended locks must not lose the
    /// donations the others earned. The caller ups the lock's semaphore
    /// afterwards.
    pub fn lock_released(&mut self, lock: LockId) {
        let cur = self.current();
        let holder = self.lock_holders.remove(&lock);
        assert_eq!(holder, Some(cur), "releasing a lock not held by the running thread");

        let held = &mut self.record_mut(cur).held_locks;
        if let Some(pos) = held.iter().position(|&l| l == lock) {
            held.remove(pos);
        }

        if let Policy::Donation = self.policy {
            let mut donors = mem::take(&mut self.record_mut(cur).donors);
            donors.retain(|&d| self.record(d).waiting_on != Some(lock));
            self.record_mut(cur).donors = donors;
            self.recompute_effective(cur);
        }
    }

    /// Walks the waits-on/holds chain starting from `donor`, raising each
    /// holder to the donor's effective priority.
    ///
    /// Stops when a holder's priority does not change (nothing further
    /// can rise), when the chain ends, or after
    /// [`DONATION_DEPTH_LIMIT`] hops.
    fn propagate_donation(&mut self, donor: ThreadId) {
        let mut donor = donor;
        for _ in 0..DONATION_DEPTH_LIMIT {
            let Some(lock) = self.record(donor).waiting_on else {
                break;
            };
            let Some(holder) = self.lock_holder(lock) else {
                break;
            };

            // Re-register the donor so the holder's donor list reflects
            // the donor's current effective priority.
            self.reinsert_donor(holder, donor);

            let before = self.effective_priority(holder);
            self.recompute_effective(holder);
            if self.effective_priority(holder) == before {
                break;
            }
            if self.state(holder) == ThreadState::Ready {
                self.reposition_ready(holder);
            }
            donor = holder;
        }
    }

    /// Removes `donor` from `holder`'s donor list if present, then
    /// re-inserts it at its priority position.
    fn reinsert_donor(&mut self, holder: ThreadId, donor: ThreadId) {
        let mut donors = mem::take(&mut self.record_mut(holder).donors);
        if let Some(pos) = donors.iter().position(|&d| d == donor) {
            donors.remove(pos);
        }
        self.ordered_insert(&mut donors, donor);
        self.record_mut(holder).donors = donors;
    }

    /// The thread's donors, highest priority first (for tests and
    /// diagnostics).
    pub fn donors_of(&self, id: ThreadId) -> &[ThreadId] {
        &self.record(id).donors
    }

    /// The lock the thread is blocked acquiring, if any.
    pub fn waiting_on(&self, id: ThreadId) -> Option<LockId> {
        self.record(id).waiting_on
    }

    /// The locks the thread currently owns.
    pub fn held_locks(&self, id: ThreadId) -> &[LockId] {
        &self.record(id).held_locks
    }
}
