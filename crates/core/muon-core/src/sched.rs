//! Thread table, ready queue, and scheduling state machine.
//!
//! [`Scheduler`] is the bookkeeping half of the thread system: it owns one
//! [`ThreadRecord`] per live thread and the priority-ordered ready queue,
//! and enforces the state machine (`Running` / `Ready` / `Blocked` /
//! `Dying`). It never touches stacks or frames — the kernel drives it with
//! interrupts disabled and performs the actual context switch using the
//! token stored in each record.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use crate::fixed::Fixed;
use crate::id::{LockId, ThreadId};
use crate::mlfqs;
use crate::priority::{Nice, Priority};

/// Scheduling state of a thread.
///
/// A thread is in exactly one of: the ready queue (`Ready`), the wait set
/// of one synchronization primitive or the sleep set (`Blocked`), or on
/// the CPU (`Running`). `Dying` threads are in none and are reaped on the
/// next dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// On the CPU.
    Running,
    /// Runnable, waiting in the ready queue.
    Ready,
    /// Waiting for a wake-up (sleep, semaphore, lock, or condition).
    Blocked,
    /// Exited; the page is reclaimed by the next dispatch.
    Dying,
}

/// The priority policy, fixed at boot.
///
/// The two policies share the `effective_priority` field but update it by
/// different rules; selecting the policy through this variant keeps the
/// donation paths unreachable under MLFQS by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Static priorities raised by donation from blocked waiters.
    Donation,
    /// Multilevel feedback queue: priorities recomputed from decayed CPU
    /// usage and niceness.
    Mlfqs {
        /// System load average, updated once per second.
        load_avg: Fixed,
    },
}

impl Policy {
    /// The MLFQS policy in its boot state (`load_avg = 0`).
    pub const fn mlfqs() -> Self {
        Self::Mlfqs {
            load_avg: Fixed::ZERO,
        }
    }
}

/// Per-thread scheduling record.
#[derive(Debug)]
pub struct ThreadRecord {
    pub(crate) state: ThreadState,
    /// Configured priority; never changed by donation.
    pub(crate) base_priority: Priority,
    /// Priority used by the scheduler. Invariant: the maximum of
    /// `base_priority` and the effective priorities of all `donors`.
    pub(crate) effective_priority: Priority,
    /// Threads that have donated to this one, sorted by effective
    /// priority descending at insertion time.
    pub(crate) donors: Vec<ThreadId>,
    /// Locks currently owned.
    pub(crate) held_locks: Vec<LockId>,
    /// The lock this thread is blocked acquiring, if any.
    pub(crate) waiting_on: Option<LockId>,
    /// Niceness, used only by MLFQS.
    pub(crate) nice: Nice,
    /// Decayed CPU usage, used only by MLFQS.
    pub(crate) recent_cpu: Fixed,
    /// Opaque kernel cookie (the control-block address).
    pub(crate) token: usize,
}

/// The scheduling core.
pub struct Scheduler {
    pub(crate) policy: Policy,
    pub(crate) threads: BTreeMap<ThreadId, ThreadRecord>,
    /// Ready queue, ordered by effective priority descending; equal
    /// priorities keep insertion order.
    pub(crate) ready: VecDeque<ThreadId>,
    /// Lock holders, tracked so the donation walk can follow
    /// waits-on/holds edges.
    pub(crate) lock_holders: BTreeMap<LockId, ThreadId>,
    running: Option<ThreadId>,
    idle: Option<ThreadId>,
    next_id: u32,
}

impl Scheduler {
    /// Creates an empty scheduler with the given policy.
    pub const fn new(policy: Policy) -> Self {
        Self {
            policy,
            threads: BTreeMap::new(),
            ready: VecDeque::new(),
            lock_holders: BTreeMap::new(),
            running: None,
            idle: None,
            next_id: 1,
        }
    }

    /// Returns the active policy.
    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Returns `true` when running under MLFQS.
    pub fn is_mlfqs(&self) -> bool {
        matches!(self.policy, Policy::Mlfqs { .. })
    }

    fn allocate_id(&mut self) -> ThreadId {
        let id = ThreadId::new(self.next_id);
        self.next_id += 1;
        id
    }

    fn new_record(&self, priority: Priority, token: usize) -> ThreadRecord {
        let mut record = ThreadRecord {
            state: ThreadState::Blocked,
            base_priority: priority,
            effective_priority: priority,
            donors: Vec::new(),
            held_locks: Vec::new(),
            waiting_on: None,
            nice: Nice::DEFAULT,
            recent_cpu: Fixed::ZERO,
            token,
        };
        if self.is_mlfqs() {
            // New threads inherit the creator's niceness and CPU history,
            // then compute their own priority immediately. The requested
            // priority is ignored under MLFQS.
            if let Some(creator) = self.running.and_then(|id| self.threads.get(&id)) {
                record.nice = creator.nice;
                record.recent_cpu = creator.recent_cpu;
            }
            let p = mlfqs::priority_for(record.recent_cpu, record.nice);
            record.base_priority = p;
            record.effective_priority = p;
        }
        record
    }

    /// Registers a new thread in the `Blocked` state and returns its id.
    ///
    /// The caller unblocks it once the control block is ready.
    pub fn create_thread(&mut self, priority: Priority, token: usize) -> ThreadId {
        let record = self.new_record(priority, token);
        let id = self.allocate_id();
        self.threads.insert(id, record);
        id
    }

    /// Registers the already-running boot thread.
    ///
    /// Called once at initialization, before any other thread exists.
    pub fn bootstrap_running(&mut self, priority: Priority, token: usize) -> ThreadId {
        assert!(self.running.is_none(), "boot thread already registered");
        let mut record = self.new_record(priority, token);
        record.state = ThreadState::Running;
        let id = self.allocate_id();
        self.threads.insert(id, record);
        self.running = Some(id);
        id
    }

    /// Removes a reaped thread's record.
    pub fn remove_thread(&mut self, id: ThreadId) {
        let record = self.threads.remove(&id).expect("removing unknown thread");
        assert_eq!(record.state, ThreadState::Dying, "reaping a live thread");
    }

    /// Marks `id` as the idle thread.
    ///
    /// The idle thread never enters the ready queue; the dispatcher falls
    /// back to it when the queue is empty, and the MLFQS recomputations
    /// skip it. It is pinned to the minimum priority so every other
    /// thread outranks it.
    pub fn set_idle(&mut self, id: ThreadId) {
        let record = self.threads.get_mut(&id).expect("unknown idle thread");
        record.base_priority = Priority::MIN;
        record.effective_priority = Priority::MIN;
        self.idle = Some(id);
    }

    /// Returns the idle thread, once registered.
    pub fn idle(&self) -> Option<ThreadId> {
        self.idle
    }

    /// Returns the running thread, if the scheduler has been bootstrapped.
    pub fn running(&self) -> Option<ThreadId> {
        self.running
    }

    /// Returns the running thread, panicking before bootstrap.
    pub fn current(&self) -> ThreadId {
        self.running.expect("no running thread")
    }

    pub(crate) fn record(&self, id: ThreadId) -> &ThreadRecord {
        self.threads.get(&id).expect("unknown thread")
    }

    pub(crate) fn record_mut(&mut self, id: ThreadId) -> &mut ThreadRecord {
        self.threads.get_mut(&id).expect("unknown thread")
    }

    /// Returns `true` if `id` names a live thread.
    pub fn contains(&self, id: ThreadId) -> bool {
        self.threads.contains_key(&id)
    }

    /// Returns the thread's scheduling state.
    pub fn state(&self, id: ThreadId) -> ThreadState {
        self.record(id).state
    }

    /// Returns the opaque kernel token stored at creation.
    pub fn token(&self, id: ThreadId) -> usize {
        self.record(id).token
    }

    /// Returns the thread's effective (scheduling) priority.
    pub fn effective_priority(&self, id: ThreadId) -> Priority {
        self.record(id).effective_priority
    }

    /// Returns the thread's configured base priority.
    pub fn base_priority(&self, id: ThreadId) -> Priority {
        self.record(id).base_priority
    }

    // -----------------------------------------------------------------------
    // Ready queue
    // -----------------------------------------------------------------------

    /// Inserts into the ready queue at the priority position; equal
    /// priorities go behind existing entries (FIFO ties).
    fn insert_ready(&mut self, id: ThreadId) {
        let prio = self.effective_priority(id);
        let pos = self
            .ready
            .iter()
            .position(|&other| self.effective_priority(other) < prio)
            .unwrap_or(self.ready.len());
        self.ready.insert(pos, id);
    }

    /// Re-inserts a ready thread after its effective priority changed.
    pub(crate) fn reposition_ready(&mut self, id: ThreadId) {
        debug_assert_eq!(self.state(id), ThreadState::Ready);
        if let Some(pos) = self.ready.iter().position(|&other| other == id) {
            self.ready.remove(pos);
            self.insert_ready(id);
        }
    }

    /// Re-sorts the whole ready queue by current effective priority,
    /// keeping insertion order among equals.
    pub(crate) fn resort_ready(&mut self) {
        let mut keyed: Vec<(Priority, ThreadId)> = self
            .ready
            .iter()
            .map(|&id| (self.effective_priority(id), id))
            .collect();
        // sort_by is stable, so FIFO order among equals survives.
        keyed.sort_by(|a, b| b.0.cmp(&a.0));
        self.ready = keyed.into_iter().map(|(_, id)| id).collect();
    }

    /// The ready queue head, if any.
    pub fn ready_head(&self) -> Option<ThreadId> {
        self.ready.front().copied()
    }

    /// The ready queue contents, highest priority first (for diagnostics
    /// and tests).
    pub fn ready_ids(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.ready.iter().copied()
    }

    /// Returns `true` if the ready head outranks the running thread.
    ///
    /// Callers decide how to act on this: regular code yields, interrupt
    /// handlers request a yield at interrupt return.
    pub fn needs_preempt(&self) -> bool {
        let (Some(head), Some(running)) = (self.ready_head(), self.running) else {
            return false;
        };
        self.effective_priority(head) > self.effective_priority(running)
    }

    // -----------------------------------------------------------------------
    // State transitions
    // -----------------------------------------------------------------------

    /// Moves a `Blocked` thread into the ready queue.
    ///
    /// Does not preempt; see [`needs_preempt`](Self::needs_preempt).
    pub fn unblock(&mut self, id: ThreadId) {
        let record = self.record_mut(id);
        assert_eq!(record.state, ThreadState::Blocked, "unblocking a non-blocked thread");
        record.state = ThreadState::Ready;
        self.insert_ready(id);
    }

    /// Transitions the running thread to `Ready`, re-queueing it unless it
    /// is the idle thread.
    pub fn yield_running(&mut self) {
        let cur = self.current();
        self.record_mut(cur).state = ThreadState::Ready;
        if Some(cur) != self.idle {
            self.insert_ready(cur);
        }
    }

    /// Transitions the running thread to `Blocked`.
    pub fn block_running(&mut self) {
        let cur = self.current();
        self.record_mut(cur).state = ThreadState::Blocked;
    }

    /// Transitions the running thread to `Dying`.
    pub fn exit_running(&mut self) {
        let cur = self.current();
        self.record_mut(cur).state = ThreadState::Dying;
    }

    /// Picks the next thread to run: the ready head, or the idle thread
    /// when the queue is empty. Marks it `Running`.
    ///
    /// The departing thread must already have left the `Running` state via
    /// one of the transitions above.
    pub fn pick_next(&mut self) -> ThreadId {
        if let Some(cur) = self.running {
            debug_assert_ne!(self.state(cur), ThreadState::Running, "dispatch from Running");
        }
        let next = self
            .ready
            .pop_front()
            .or(self.idle)
            .expect("nothing to run and no idle thread");
        self.record_mut(next).state = ThreadState::Running;
        self.running = Some(next);
        next
    }

    // -----------------------------------------------------------------------
    // Priorities
    // -----------------------------------------------------------------------

    /// Recomputes a thread's effective priority as the maximum of its base
    /// priority and its donors' effective priorities.
    pub(crate) fn recompute_effective(&mut self, id: ThreadId) {
        let record = self.record(id);
        let mut max = record.base_priority;
        for &donor in &record.donors {
            let p = self.record(donor).effective_priority;
            if p > max {
                max = p;
            }
        }
        self.record_mut(id).effective_priority = max;
    }

    /// Sets the running thread's base priority.
    ///
    /// Ignored under MLFQS. Returns `true` if the ready head now outranks
    /// the running thread (the caller should yield).
    pub fn set_priority(&mut self, priority: Priority) -> bool {
        match self.policy {
            Policy::Mlfqs { .. } => false,
            Policy::Donation => {
                let cur = self.current();
                self.record_mut(cur).base_priority = priority;
                self.recompute_effective(cur);
                self.needs_preempt()
            }
        }
    }

    /// Returns the running thread's effective priority.
    pub fn get_priority(&self) -> Priority {
        self.effective_priority(self.current())
    }

    // -----------------------------------------------------------------------
    // Ordered waiter lists (shared with the kernel's wait sets)
    // -----------------------------------------------------------------------

    /// Inserts `id` into `list` at its effective-priority position,
    /// descending; equal priorities keep insertion order.
    pub fn ordered_insert(&self, list: &mut Vec<ThreadId>, id: ThreadId) {
        let prio = self.effective_priority(id);
        let pos = list
            .iter()
            .position(|&other| self.effective_priority(other) < prio)
            .unwrap_or(list.len());
        list.insert(pos, id);
    }

    /// Stably re-sorts `list` by current effective priority, descending.
    ///
    /// Wait sets re-sort before waking because priorities may have changed
    /// (donation, MLFQS recomputation) while the waiters slept.
    pub fn resort_waiters(&self, list: &mut [ThreadId]) {
        let mut keyed: Vec<(Priority, ThreadId)> = list
            .iter()
            .map(|&id| (self.effective_priority(id), id))
            .collect();
        // sort_by is stable, so FIFO order among equals survives.
        keyed.sort_by(|a, b| b.0.cmp(&a.0));
        for (slot, (_, id)) in list.iter_mut().zip(keyed) {
            *slot = id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn donation_sched() -> Scheduler {
        Scheduler::new(Policy::Donation)
    }

    /// Bootstraps a running main thread at the default priority.
    fn with_main(sched: &mut Scheduler) -> ThreadId {
        sched.bootstrap_running(Priority::DEFAULT, 0)
    }

    fn spawn_ready(sched: &mut Scheduler, prio: u8) -> ThreadId {
        let id = sched.create_thread(Priority::new(prio), 0);
        sched.unblock(id);
        id
    }

    // -----------------------------------------------------------------------
    // Creation and bootstrap
    // -----------------------------------------------------------------------

    #[test]
    fn ids_are_monotonic_from_one() {
        let mut s = donation_sched();
        let main = with_main(&mut s);
        let a = s.create_thread(Priority::DEFAULT, 0);
        let b = s.create_thread(Priority::DEFAULT, 0);
        assert_eq!(main.as_u32(), 1);
        assert_eq!(a.as_u32(), 2);
        assert_eq!(b.as_u32(), 3);
    }

    #[test]
    fn created_threads_start_blocked() {
        let mut s = donation_sched();
        with_main(&mut s);
        let t = s.create_thread(Priority::new(10), 0);
        assert_eq!(s.state(t), ThreadState::Blocked);
        assert_eq!(s.effective_priority(t), Priority::new(10));
        assert_eq!(s.base_priority(t), Priority::new(10));
    }

    #[test]
    fn bootstrap_thread_is_running() {
        let mut s = donation_sched();
        let main = with_main(&mut s);
        assert_eq!(s.state(main), ThreadState::Running);
        assert_eq!(s.current(), main);
    }

    #[test]
    #[should_panic(expected = "boot thread already registered")]
    fn bootstrap_twice_panics() {
        let mut s = donation_sched();
        with_main(&mut s);
        with_main(&mut s);
    }

    #[test]
    fn tokens_are_preserved() {
        let mut s = donation_sched();
        with_main(&mut s);
        let t = s.create_thread(Priority::DEFAULT, 0xfeed_f000);
        assert_eq!(s.token(t), 0xfeed_f000);
    }

    // -----------------------------------------------------------------------
    // Ready queue ordering
    // -----------------------------------------------------------------------

    #[test]
    fn ready_orders_by_priority_descending() {
        let mut s = donation_sched();
        with_main(&mut s);
        let low = spawn_ready(&mut s, 5);
        let high = spawn_ready(&mut s, 50);
        let mid = spawn_ready(&mut s, 20);

        let order: Vec<_> = s.ready_ids().collect();
        assert_eq!(order, [high, mid, low]);
    }

    #[test]
    fn equal_priorities_keep_insertion_order() {
        let mut s = donation_sched();
        with_main(&mut s);
        let a = spawn_ready(&mut s, 20);
        let b = spawn_ready(&mut s, 20);
        let c = spawn_ready(&mut s, 20);

        let order: Vec<_> = s.ready_ids().collect();
        assert_eq!(order, [a, b, c]);
    }

    #[test]
    fn equal_priorities_insert_behind_not_ahead() {
        let mut s = donation_sched();
        with_main(&mut s);
        let a = spawn_ready(&mut s, 20);
        let hi = spawn_ready(&mut s, 40);
        let b = spawn_ready(&mut s, 20);

        let order: Vec<_> = s.ready_ids().collect();
        assert_eq!(order, [hi, a, b]);
    }

    #[test]
    fn needs_preempt_only_for_strictly_higher() {
        let mut s = donation_sched();
        with_main(&mut s); // priority 31
        spawn_ready(&mut s, 31);
        assert!(!s.needs_preempt(), "equal priority must not preempt");
        spawn_ready(&mut s, 32);
        assert!(s.needs_preempt());
    }

    // -----------------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------------

    #[test]
    fn yield_requeues_and_picks_highest() {
        let mut s = donation_sched();
        let main = with_main(&mut s);
        let hi = spawn_ready(&mut s, 40);

        s.yield_running();
        let next = s.pick_next();
        assert_eq!(next, hi);
        assert_eq!(s.state(hi), ThreadState::Running);
        assert_eq!(s.state(main), ThreadState::Ready);
        assert_eq!(s.ready_ids().collect::<Vec<_>>(), [main]);
    }

    #[test]
    fn block_then_unblock_roundtrip() {
        let mut s = donation_sched();
        let main = with_main(&mut s);
        let idle = s.create_thread(Priority::MIN, 0);
        s.set_idle(idle);

        s.block_running();
        let next = s.pick_next();
        assert_eq!(next, idle, "empty ready queue falls back to idle");

        s.unblock(main);
        assert_eq!(s.state(main), ThreadState::Ready);
        assert!(s.needs_preempt(), "main outranks idle");
    }

    #[test]
    fn idle_is_never_requeued_on_yield() {
        let mut s = donation_sched();
        with_main(&mut s);
        let idle = s.create_thread(Priority::MIN, 0);
        s.set_idle(idle);

        s.block_running();
        assert_eq!(s.pick_next(), idle);
        s.yield_running();
        assert_eq!(s.ready_ids().count(), 0, "idle must not enter the ready queue");
        assert_eq!(s.pick_next(), idle);
    }

    #[test]
    fn exited_threads_are_reaped_once() {
        let mut s = donation_sched();
        with_main(&mut s);
        let idle = s.create_thread(Priority::MIN, 0);
        s.set_idle(idle);
        let t = spawn_ready(&mut s, 40);

        s.yield_running();
        assert_eq!(s.pick_next(), t);
        s.exit_running();
        assert_eq!(s.state(t), ThreadState::Dying);
        s.pick_next();
        s.remove_thread(t);
        assert!(!s.contains(t));
    }

    #[test]
    #[should_panic(expected = "unblocking a non-blocked thread")]
    fn unblock_ready_thread_panics() {
        let mut s = donation_sched();
        with_main(&mut s);
        let t = spawn_ready(&mut s, 10);
        s.unblock(t);
    }

    #[test]
    #[should_panic(expected = "reaping a live thread")]
    fn reaping_live_thread_panics() {
        let mut s = donation_sched();
        with_main(&mut s);
        let t = s.create_thread(Priority::DEFAULT, 0);
        s.remove_thread(t);
    }

    // -----------------------------------------------------------------------
    // set_priority / get_priority
    // -----------------------------------------------------------------------

    #[test]
    fn lowering_priority_below_ready_head_requests_yield() {
        let mut s = donation_sched();
        with_main(&mut s); // 31
        spawn_ready(&mut s, 25);

        assert!(!s.set_priority(Priority::new(30)), "still above the head");
        assert!(s.set_priority(Priority::new(20)), "now below the head");
        assert_eq!(s.get_priority(), Priority::new(20));
    }

    #[test]
    fn raising_priority_never_requests_yield() {
        let mut s = donation_sched();
        with_main(&mut s);
        spawn_ready(&mut s, 25);
        assert!(!s.set_priority(Priority::new(63)));
        assert_eq!(s.get_priority(), Priority::MAX);
    }

    #[test]
    fn set_priority_is_ignored_under_mlfqs() {
        let mut s = Scheduler::new(Policy::mlfqs());
        let main = s.bootstrap_running(Priority::DEFAULT, 0);
        let before = s.effective_priority(main);
        assert!(!s.set_priority(Priority::new(3)));
        assert_eq!(s.effective_priority(main), before);
    }

    // -----------------------------------------------------------------------
    // Ordered waiter lists (semaphore wake order at the list level)
    // -----------------------------------------------------------------------

    #[test]
    fn waiter_list_wakes_highest_first() {
        let mut s = donation_sched();
        with_main(&mut s);

        // Ten waiters with priorities 10..=19, registered in ascending
        // order; wake order must be 19, 18, .., 10.
        let mut waiters = Vec::new();
        let mut ids = Vec::new();
        for p in 10..20 {
            let t = s.create_thread(Priority::new(p), 0);
            ids.push((t, p));
            s.ordered_insert(&mut waiters, t);
        }
        let expected: Vec<ThreadId> = {
            let mut v = ids.clone();
            v.sort_by(|a, b| b.1.cmp(&a.1));
            v.into_iter().map(|(t, _)| t).collect()
        };
        assert_eq!(waiters, expected);
    }

    #[test]
    fn resort_waiters_tracks_priority_changes() {
        let mut s = donation_sched();
        with_main(&mut s);
        let a = s.create_thread(Priority::new(10), 0);
        let b = s.create_thread(Priority::new(20), 0);
        let mut waiters = Vec::new();
        s.ordered_insert(&mut waiters, a);
        s.ordered_insert(&mut waiters, b);
        assert_eq!(waiters, [b, a]);

        // a's priority rises (as donation would do) while it waits.
        s.record_mut(a).effective_priority = Priority::new(30);
        s.resort_waiters(&mut waiters);
        assert_eq!(waiters, [a, b]);
    }

    #[test]
    fn resort_waiters_is_stable() {
        let mut s = donation_sched();
        with_main(&mut s);
        let a = s.create_thread(Priority::new(15), 0);
        let b = s.create_thread(Priority::new(15), 0);
        let mut waiters = Vec::new();
        s.ordered_insert(&mut waiters, a);
        s.ordered_insert(&mut waiters, b);
        s.resort_waiters(&mut waiters);
        assert_eq!(waiters, [a, b], "ties keep arrival order across re-sorts");
    }
}
