//! Mesa-style condition variable.
//!
//! Each waiter blocks on a private binary semaphore that lives in its
//! own stack frame; the condition keeps a list of those semaphores,
//! tagged with the waiter's effective priority as of the moment it began
//! waiting. Signalling wakes the highest tag. Because signalling and
//! waking are not atomic, the caller must re-check its predicate after
//! every wake.

use alloc::vec::Vec;

use muon_core::Priority;

use super::{IntrCell, Lock, Semaphore};
use crate::{intr, thread};

struct Waiter {
    /// The waiter's effective priority, snapshotted at wait time.
    ///
    /// Deliberately not refreshed: a donation received *after* the
    /// thread began waiting on the condition does not reorder the signal
    /// queue. (The waiter is blocked and cannot re-tag itself.)
    tag: Priority,
    /// The waiter's private semaphore, on the waiting thread's stack.
    sema: *const Semaphore,
}

// SAFETY: The semaphore outlives its entry — the waiting thread is
// blocked inside `down` until `signal` removes the entry and ups it, so
// the stack frame cannot unwind while the pointer is in the list.
unsafe impl Send for Waiter {}

/// A condition variable, used with a [`Lock`].
///
/// One lock may serve any number of conditions; each condition is used
/// with one lock at a time.
pub struct Condvar {
    waiters: IntrCell<Vec<Waiter>>,
}

impl Condvar {
    /// Creates a condition variable with no waiters.
    pub const fn new() -> Self {
        Self {
            waiters: IntrCell::new(Vec::new()),
        }
    }

    /// Atomically releases `lock` and waits to be signalled, then
    /// re-acquires `lock` before returning.
    ///
    /// The caller must hold `lock` and must re-check the condition after
    /// waking. Must not be called from an interrupt handler.
    pub fn wait(&self, lock: &Lock) {
        assert!(!intr::in_external(), "condition wait inside a handler");
        assert!(
            lock.held_by_current(),
            "condition wait without holding the lock"
        );

        let old = intr::disable();
        let sema = Semaphore::new(0);
        self.enqueue(thread::get_priority(), &sema);
        lock.release();
        sema.down();
        lock.acquire();
        intr::set_level(old);
    }

    /// Inserts a waiter at its tag position, descending; equal tags keep
    /// arrival order.
    fn enqueue(&self, tag: Priority, sema: *const Semaphore) {
        self.waiters.with(|waiters| {
            let pos = waiters
                .iter()
                .position(|w| w.tag < tag)
                .unwrap_or(waiters.len());
            waiters.insert(pos, Waiter { tag, sema });
        });
    }

    /// Wakes the highest-tagged waiter, if any.
    ///
    /// The caller must hold `lock`.
    pub fn signal(&self, lock: &Lock) {
        assert!(!intr::in_external(), "condition signal inside a handler");
        assert!(
            lock.held_by_current(),
            "condition signal without holding the lock"
        );
        self.signal_one();
    }

    /// Wakes every waiter.
    ///
    /// The caller must hold `lock`.
    pub fn broadcast(&self, lock: &Lock) {
        assert!(!intr::in_external(), "condition broadcast inside a handler");
        assert!(
            lock.held_by_current(),
            "condition broadcast without holding the lock"
        );
        while self.signal_one() {}
    }

    fn signal_one(&self) -> bool {
        let old = intr::disable();
        let woken = self.waiters.with(|waiters| {
            if waiters.is_empty() {
                None
            } else {
                // Tags are wait-time snapshots; the sort keeps arrival
                // order among equals.
                waiters.sort_by(|a, b| b.tag.cmp(&a.tag));
                Some(waiters.remove(0))
            }
        });
        let any = woken.is_some();
        if let Some(waiter) = woken {
            // SAFETY: The entry was just removed, so the waiting thread
            // is still blocked in `down` and its semaphore is live.
            unsafe { (*waiter.sema).up() };
        }
        intr::set_level(old);
        any
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util;

    #[test]
    fn signal_without_waiters_is_a_no_op() {
        let _t = test_util::with_thread_system();
        let lock = Lock::new();
        let cond = Condvar::new();
        lock.acquire();
        cond.signal(&lock);
        cond.broadcast(&lock);
        lock.release();
    }

    #[test]
    #[should_panic(expected = "without holding the lock")]
    fn signalling_unheld_lock_is_fatal() {
        let _t = test_util::with_thread_system();
        let lock = Lock::new();
        let cond = Condvar::new();
        cond.signal(&lock);
    }

    #[test]
    fn signal_pops_highest_tag_first() {
        let _t = test_util::with_thread_system();
        let cond = Condvar::new();
        let low = Semaphore::new(0);
        let high = Semaphore::new(0);
        cond.enqueue(muon_core::Priority::new(10), &low);
        cond.enqueue(muon_core::Priority::new(20), &high);

        assert!(cond.signal_one());
        assert_eq!(high.value(), 1, "higher tag signalled first");
        assert_eq!(low.value(), 0);
        assert!(cond.signal_one());
        assert_eq!(low.value(), 1);
        assert!(!cond.signal_one());
    }

    #[test]
    fn equal_tags_wake_in_arrival_order() {
        let _t = test_util::with_thread_system();
        let cond = Condvar::new();
        let first = Semaphore::new(0);
        let second = Semaphore::new(0);
        cond.enqueue(muon_core::Priority::new(15), &first);
        cond.enqueue(muon_core::Priority::new(15), &second);

        cond.signal_one();
        assert_eq!(first.value(), 1);
        assert_eq!(second.value(), 0);
    }

    #[test]
    fn cond_tag_ignores_later_donation() {
        // The signal queue orders by the tag captured at wait time. A
        // waiter whose effective priority rises afterwards (e.g. through
        // a donation) keeps its old place.
        let _t = test_util::with_thread_system();
        let cond = Condvar::new();
        let donated = Semaphore::new(0);
        let steady = Semaphore::new(0);
        // `donated` went to sleep at priority 10, `steady` at 20. Even if
        // the first waiter's live priority later rises to 40, the stored
        // tag decides.
        cond.enqueue(muon_core::Priority::new(10), &donated);
        cond.enqueue(muon_core::Priority::new(20), &steady);

        cond.signal_one();
        assert_eq!(steady.value(), 1, "snapshot tag wins over later donations");
        assert_eq!(donated.value(), 0);
    }
}
