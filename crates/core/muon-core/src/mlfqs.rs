//! Multilevel feedback queue policy.
//!
//! Under [`Policy::Mlfqs`] priorities are not set by threads but computed
//! from decayed CPU usage (`recent_cpu`) and niceness:
//!
//! ```text
//! priority   = PRI_MAX - recent_cpu/4 - 2*nice          (every 4 ticks)
//! load_avg   = (59/60)*load_avg + (1/60)*ready_count    (every second)
//! recent_cpu = (2*load_avg)/(2*load_avg + 1)*recent_cpu + nice
//! ```
//!
//! The timer interrupt drives all three updates; the per-second pass
//! recomputes `load_avg` before touching any `recent_cpu`. The idle
//! thread is excluded from the recomputations and from `ready_count`.

use alloc::vec::Vec;

use crate::fixed::Fixed;
use crate::priority::{Nice, Priority};
use crate::sched::{Policy, Scheduler};

/// Computes the MLFQS priority for the given CPU usage and niceness,
/// clamped to the valid priority range. The division truncates toward
/// zero.
pub fn priority_for(recent_cpu: Fixed, nice: Nice) -> Priority {
    let raw =
        Priority::MAX.as_u8() as i64 - recent_cpu.div_int(4).trunc() - 2 * nice.as_i8() as i64;
    Priority::clamped(raw as i32)
}

/// One per-second `load_avg` step.
pub fn decay_load_avg(load_avg: Fixed, ready_count: i64) -> Fixed {
    Fixed::from_ratio(59, 60).mul(load_avg) + Fixed::from_ratio(1, 60).mul_int(ready_count)
}

/// One per-second `recent_cpu` step.
pub fn decay_recent_cpu(recent_cpu: Fixed, load_avg: Fixed, nice: Nice) -> Fixed {
    let twice = load_avg.mul_int(2);
    twice
        .div(twice.add_int(1))
        .mul(recent_cpu)
        .add_int(nice.as_i8() as i64)
}

impl Scheduler {
    /// Per-tick accounting: charges one tick of CPU to the running thread
    /// unless it is the idle thread. No-op under the donation policy.
    pub fn mlfqs_tick(&mut self) {
        if !self.is_mlfqs() {
            return;
        }
        let Some(cur) = self.running() else { return };
        if Some(cur) == self.idle() {
            return;
        }
        let record = self.record_mut(cur);
        record.recent_cpu = record.recent_cpu.add_int(1);
    }

    /// Every-fourth-tick pass: recomputes every live thread's priority
    /// (except idle) and re-sorts the ready queue.
    ///
    /// Returns `true` if the ready head now outranks the running thread;
    /// the timer handler then requests a yield at interrupt return.
    pub fn mlfqs_recompute_priorities(&mut self) -> bool {
        if !self.is_mlfqs() {
            return false;
        }
        let idle = self.idle();
        let ids: Vec<_> = self.threads.keys().copied().collect();
        for id in ids {
            if Some(id) == idle {
                continue;
            }
            let record = self.record_mut(id);
            let p = priority_for(record.recent_cpu, record.nice);
            record.base_priority = p;
            record.effective_priority = p;
        }
        self.resort_ready();
        self.needs_preempt()
    }

    /// Per-second pass: updates `load_avg` from the current ready count,
    /// then decays every live thread's `recent_cpu` (except idle).
    pub fn mlfqs_update_load_and_recent(&mut self) {
        let ready_count = self.mlfqs_ready_count();
        let Policy::Mlfqs { load_avg } = &mut self.policy else {
            return;
        };
        *load_avg = decay_load_avg(*load_avg, ready_count);
        let load = *load_avg;

        let idle = self.idle();
        let ids: Vec<_> = self.threads.keys().copied().collect();
        for id in ids {
            if Some(id) == idle {
                continue;
            }
            let record = self.record_mut(id);
            record.recent_cpu = decay_recent_cpu(record.recent_cpu, load, record.nice);
        }
    }

    /// Threads competing for the CPU: the ready queue plus the running
    /// thread when it is not idle. (Idle never enters the ready queue.)
    fn mlfqs_ready_count(&self) -> i64 {
        let running = match self.running() {
            Some(cur) if Some(cur) != self.idle() => 1,
            _ => 0,
        };
        self.ready.len() as i64 + running
    }

    /// Sets the running thread's niceness, clamped to `[-20, 20]`.
    ///
    /// Under MLFQS the thread's priority is recomputed immediately;
    /// returns `true` if it should now yield to the ready head.
    pub fn set_nice(&mut self, nice: Nice) -> bool {
        let cur = self.current();
        self.record_mut(cur).nice = nice;
        match self.policy {
            Policy::Donation => false,
            Policy::Mlfqs { .. } => {
                let record = self.record(cur);
                let p = priority_for(record.recent_cpu, record.nice);
                let record = self.record_mut(cur);
                record.base_priority = p;
                record.effective_priority = p;
                self.needs_preempt()
            }
        }
    }

    /// Returns the thread's niceness.
    pub fn nice_of(&self, id: crate::id::ThreadId) -> Nice {
        self.record(id).nice
    }

    /// Returns the thread's decayed CPU usage.
    pub fn recent_cpu_of(&self, id: crate::id::ThreadId) -> Fixed {
        self.record(id).recent_cpu
    }

    /// 100 times the system load average, rounded to nearest.
    pub fn load_avg_x100(&self) -> i64 {
        match self.policy {
            Policy::Donation => 0,
            Policy::Mlfqs { load_avg } => load_avg.mul_int(100).round(),
        }
    }

    /// 100 times the thread's `recent_cpu`, rounded to nearest.
    pub fn recent_cpu_x100(&self, id: crate::id::ThreadId) -> i64 {
        self.recent_cpu_of(id).mul_int(100).round()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ThreadId;
    use crate::sched::ThreadState;

    const TIMER_FREQ: i64 = 100;
    const TIME_SLICE: i64 = 4;

    // -----------------------------------------------------------------------
    // Formula units
    // -----------------------------------------------------------------------

    #[test]
    fn fresh_thread_gets_max_priority() {
        assert_eq!(priority_for(Fixed::ZERO, Nice::DEFAULT), Priority::MAX);
    }

    #[test]
    fn niceness_costs_two_priority_points_each() {
        assert_eq!(
            priority_for(Fixed::ZERO, Nice::clamped(5)),
            Priority::new(53)
        );
        assert_eq!(
            priority_for(Fixed::ZERO, Nice::clamped(10)),
            Priority::new(43)
        );
    }

    #[test]
    fn priority_clamps_at_both_ends() {
        assert_eq!(priority_for(Fixed::from_int(1000), Nice::MAX), Priority::MIN);
        assert_eq!(priority_for(Fixed::ZERO, Nice::MIN), Priority::MAX);
    }

    #[test]
    fn recent_cpu_division_truncates() {
        // recent_cpu = 7 -> 7/4 = 1.75 -> 1, priority 62.
        assert_eq!(
            priority_for(Fixed::from_int(7), Nice::DEFAULT),
            Priority::new(62)
        );
    }

    #[test]
    fn load_avg_step_from_zero() {
        // One update with one runnable thread: 1/60 = 0.0167 -> 2 (x100).
        let load = decay_load_avg(Fixed::ZERO, 1);
        assert_eq!(load.mul_int(100).round(), 2);
    }

    #[test]
    fn load_avg_converges_toward_ready_count() {
        let mut load = Fixed::ZERO;
        for _ in 0..600 {
            load = decay_load_avg(load, 2);
        }
        let x100 = load.mul_int(100).round();
        assert!((195..=200).contains(&x100), "load_avg {x100} should approach 2.00");
    }

    #[test]
    fn recent_cpu_decay_adds_nice() {
        // With load_avg = 0 the decay coefficient is 0, leaving only nice.
        let rc = decay_recent_cpu(Fixed::from_int(40), Fixed::ZERO, Nice::clamped(3));
        assert_eq!(rc, Fixed::from_int(3));
    }

    #[test]
    fn recent_cpu_decays_harder_under_light_load() {
        let heavy = decay_recent_cpu(Fixed::from_int(60), Fixed::from_int(10), Nice::DEFAULT);
        let light = decay_recent_cpu(Fixed::from_int(60), Fixed::from_ratio(1, 2), Nice::DEFAULT);
        assert!(heavy > light);
        assert!(heavy < Fixed::from_int(60));
    }

    // -----------------------------------------------------------------------
    // Scheduler integration
    // -----------------------------------------------------------------------

    fn mlfqs_sched() -> Scheduler {
        Scheduler::new(Policy::mlfqs())
    }

    #[test]
    fn tick_charges_running_thread_only() {
        let mut s = mlfqs_sched();
        let main = s.bootstrap_running(Priority::DEFAULT, 0);
        let other = s.create_thread(Priority::DEFAULT, 0);
        s.unblock(other);

        s.mlfqs_tick();
        s.mlfqs_tick();
        assert_eq!(s.recent_cpu_of(main), Fixed::from_int(2));
        assert_eq!(s.recent_cpu_of(other), Fixed::ZERO);
    }

    #[test]
    fn tick_skips_idle() {
        let mut s = mlfqs_sched();
        s.bootstrap_running(Priority::DEFAULT, 0);
        let idle = s.create_thread(Priority::MIN, 0);
        s.set_idle(idle);
        s.block_running();
        assert_eq!(s.pick_next(), idle);

        s.mlfqs_tick();
        assert_eq!(s.recent_cpu_of(idle), Fixed::ZERO);
    }

    #[test]
    fn donation_policy_ignores_mlfqs_hooks() {
        let mut s = Scheduler::new(Policy::Donation);
        let main = s.bootstrap_running(Priority::DEFAULT, 0);
        s.mlfqs_tick();
        s.mlfqs_update_load_and_recent();
        assert!(!s.mlfqs_recompute_priorities());
        assert_eq!(s.recent_cpu_of(main), Fixed::ZERO);
        assert_eq!(s.load_avg_x100(), 0);
    }

    #[test]
    fn new_threads_inherit_nice_and_recent_cpu() {
        let mut s = mlfqs_sched();
        s.bootstrap_running(Priority::DEFAULT, 0);
        s.set_nice(Nice::clamped(4));
        let cur = s.current();
        s.record_mut(cur).recent_cpu = Fixed::from_int(8);

        let child = s.create_thread(Priority::DEFAULT, 0);
        assert_eq!(s.nice_of(child), Nice::clamped(4));
        assert_eq!(s.recent_cpu_of(child), Fixed::from_int(8));
        // 63 - 8/4 - 2*4 = 53, computed at creation.
        assert_eq!(s.effective_priority(child), Priority::new(53));
    }

    #[test]
    fn set_nice_recomputes_and_reports_preemption() {
        let mut s = mlfqs_sched();
        s.bootstrap_running(Priority::DEFAULT, 0);
        let other = s.create_thread(Priority::DEFAULT, 0);
        s.unblock(other); // priority 63

        // Dropping our own priority below the ready head demands a yield.
        assert!(s.set_nice(Nice::clamped(5)));
        assert_eq!(s.get_priority(), Priority::new(53));
    }

    #[test]
    fn recompute_resorts_ready_queue() {
        let mut s = mlfqs_sched();
        s.bootstrap_running(Priority::DEFAULT, 0);
        let a = s.create_thread(Priority::DEFAULT, 0);
        let b = s.create_thread(Priority::DEFAULT, 0);
        s.unblock(a);
        s.unblock(b);

        // b has burned CPU; after recomputation a must lead the queue.
        s.record_mut(b).recent_cpu = Fixed::from_int(40);
        s.mlfqs_recompute_priorities();
        assert_eq!(s.ready_ids().collect::<Vec<_>>(), [a, b]);
    }

    // -----------------------------------------------------------------------
    // Ladder scenario: three CPU-bound threads, nice 0 / 5 / 10
    // -----------------------------------------------------------------------

    /// Drives the scheduler the way the timer interrupt would for
    /// `ticks` ticks, counting how many each thread receives.
    fn simulate(s: &mut Scheduler, ticks: i64, counts: &mut alloc::collections::BTreeMap<ThreadId, i64>) {
        for t in 1..=ticks {
            let cur = s.current();
            *counts.entry(cur).or_insert(0) += 1;
            s.mlfqs_tick();
            if t % TIMER_FREQ == 0 {
                s.mlfqs_update_load_and_recent();
            }
            if t % TIME_SLICE == 0 {
                s.mlfqs_recompute_priorities();
                // Slice expired: round-robin among the top priority.
                s.yield_running();
                s.pick_next();
            }
        }
    }

    #[test]
    fn ladder_ranks_by_niceness() {
        let mut s = mlfqs_sched();
        s.bootstrap_running(Priority::DEFAULT, 0);
        let idle = s.create_thread(Priority::MIN, 0);
        s.set_idle(idle);

        let nice0 = s.create_thread(Priority::DEFAULT, 0);
        let nice5 = s.create_thread(Priority::DEFAULT, 0);
        let nice10 = s.create_thread(Priority::DEFAULT, 0);
        s.record_mut(nice5).nice = Nice::clamped(5);
        s.record_mut(nice10).nice = Nice::clamped(10);
        s.unblock(nice0);
        s.unblock(nice5);
        s.unblock(nice10);

        // The boot thread steps aside, as a main thread blocking on a
        // semaphore would.
        s.block_running();
        s.pick_next();

        let mut counts = alloc::collections::BTreeMap::new();
        simulate(&mut s, 10 * TIMER_FREQ, &mut counts);

        let p0 = s.effective_priority(nice0);
        let p5 = s.effective_priority(nice5);
        let p10 = s.effective_priority(nice10);
        assert!(p0 >= p5 && p5 >= p10, "priorities follow niceness: {p0} {p5} {p10}");
        assert!(p0 > p10);

        let c0 = counts.get(&nice0).copied().unwrap_or(0);
        let c10 = counts.get(&nice10).copied().unwrap_or(0);
        assert!(c0 > c10, "nice 0 ({c0} ticks) must outrun nice 10 ({c10} ticks)");

        assert!(
            s.recent_cpu_x100(nice0) > s.recent_cpu_x100(nice10),
            "the busiest thread accumulates the most recent_cpu"
        );

        // Three CPU-bound threads, ten decay steps from zero:
        // load_avg = 3 * (1 - (59/60)^10), about 0.46.
        let load = s.load_avg_x100();
        assert!((40..=55).contains(&load), "load_avg_x100 {load} out of range");

        assert_eq!(s.state(idle), ThreadState::Blocked, "idle never competed");
    }
}
