//! Counting semaphore.
//!
//! A non-negative counter with two atomic operations: `down` waits for
//! the value to become positive and decrements it; `up` increments it
//! and wakes the highest-priority waiter. The wait set is re-sorted at
//! wake time because waiters' effective priorities may have changed
//! (donation, MLFQS recomputation) while they slept.

use alloc::vec::Vec;

use muon_core::ThreadId;

use super::IntrCell;
use crate::{intr, thread};

struct Inner {
    value: u32,
    /// Blocked threads, kept in effective-priority order.
    waiters: Vec<ThreadId>,
}

/// A counting semaphore.
pub struct Semaphore {
    inner: IntrCell<Inner>,
}

impl Semaphore {
    /// Creates a semaphore with the given initial value.
    pub const fn new(value: u32) -> Self {
        Self {
            inner: IntrCell::new(Inner {
                value,
                waiters: Vec::new(),
            }),
        }
    }

    /// Waits until the value is positive, then decrements it.
    ///
    /// May block, so it must not be called from an interrupt handler. It
    /// may be called with interrupts disabled; if it blocks, the next
    /// scheduled thread will normally re-enable them.
    pub fn down(&self) {
        assert!(!intr::in_external(), "semaphore down inside a handler");
        let old = intr::disable();
        loop {
            let acquired = self.inner.with(|sema| {
                if sema.value > 0 {
                    sema.value -= 1;
                    true
                } else {
                    let cur = thread::current();
                    thread::with_sched(|s| s.ordered_insert(&mut sema.waiters, cur));
                    false
                }
            });
            if acquired {
                break;
            }
            // Still inside the interrupt-disabled section, so the insert
            // and the state change are atomic. Re-check on wake: another
            // thread may have taken the value first.
            thread::block();
        }
        intr::set_level(old);
    }

    /// Decrements the value if it is positive, without waiting.
    ///
    /// Returns `true` on success. Safe to call from interrupt handlers.
    pub fn try_down(&self) -> bool {
        self.inner.with(|sema| {
            if sema.value > 0 {
                sema.value -= 1;
                true
            } else {
                false
            }
        })
    }

    /// Increments the value and wakes the highest-priority waiter.
    ///
    /// If the woken thread outranks the caller, yields — or, from an
    /// interrupt handler, requests a yield at interrupt return. Safe to
    /// call from interrupt handlers.
    pub fn up(&self) {
        let old = intr::disable();
        let woken = self.inner.with(|sema| {
            sema.value += 1;
            if sema.waiters.is_empty() {
                None
            } else {
                // Priorities may have moved while the waiters slept.
                thread::with_sched(|s| s.resort_waiters(&mut sema.waiters));
                Some(sema.waiters.remove(0))
            }
        });

        if let Some(id) = woken {
            let outranked = thread::with_sched(|s| {
                s.unblock(id);
                s.effective_priority(id) > s.get_priority()
            });
            if outranked {
                if intr::in_external() {
                    intr::yield_on_return();
                } else {
                    thread::yield_now();
                }
            }
        }
        intr::set_level(old);
    }

    /// The current value (racy outside an interrupt-disabled section;
    /// for diagnostics and tests).
    pub fn value(&self) -> u32 {
        self.inner.with(|sema| sema.value)
    }
}
