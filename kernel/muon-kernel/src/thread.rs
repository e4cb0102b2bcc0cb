//! Thread lifecycle and dispatch.
//!
//! Each thread owns one page: its control block sits at the page base and
//! its kernel stack grows down from the page top. The scheduling state
//! (priorities, donors, run state) lives in the `muon-core`
//! [`Scheduler`]; this module owns the execution state — pages, frames,
//! the current-thread slot, and the context switch — and keeps the two in
//! lock step under the interrupt-disable discipline.
//!
//! ```text
//!      4 kB page
//!   +--------------+ <- page + PAGE_SIZE (initial stack pointer)
//!   |    stack     |
//!   |      |       |    grows downward
//!   |      v       |
//!   +--------------+
//!   | ControlBlock |    sentinel at the tail, in the stack's path
//!   +--------------+ <- page base
//! ```

use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};

use alloc::vec::Vec;

use muon_core::{static_assert, Nice, Policy, Priority, Scheduler, ThreadId, ThreadState};

use crate::arch::ContextFrame;
use crate::config::{NAME_MAX, PAGE_SIZE, STACK_SENTINEL, TIME_SLICE};
use crate::kprintln;
use crate::sync::{IntrCell, Semaphore};
use crate::{intr, platform};

/// A thread's entry function.
pub type ThreadFn = fn(usize);

/// Thread creation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateError {
    /// The page allocator had no page for the control block and stack.
    OutOfPages,
}

impl fmt::Display for CreateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfPages => write!(f, "out of thread pages"),
        }
    }
}

/// Per-thread execution state, at the base of the thread's page.
#[repr(C)]
struct ControlBlock {
    id: ThreadId,
    name: [u8; NAME_MAX + 1],
    /// Address-space token passed to the activation hook (0 = kernel).
    user_token: usize,
    /// Saved execution context.
    frame: ContextFrame,
    /// Must equal [`STACK_SENTINEL`]; the stack grows toward this field,
    /// so corruption here means the stack overflowed.
    sentinel: u32,
}

// Leave the stack the lion's share of the page.
static_assert!(core::mem::size_of::<ControlBlock>() <= PAGE_SIZE / 4);

// ---------------------------------------------------------------------------
// Global state
// ---------------------------------------------------------------------------

static SCHED: IntrCell<Option<Scheduler>> = IntrCell::new(None);

/// The running thread's control block (single CPU, so a single slot).
static CURRENT: AtomicPtr<ControlBlock> = AtomicPtr::new(core::ptr::null_mut());

/// The boot thread; its page is never reclaimed.
static INITIAL: AtomicPtr<ControlBlock> = AtomicPtr::new(core::ptr::null_mut());

/// Ticks consumed by the running thread in its current slice.
static SLICE_TICKS: AtomicU32 = AtomicU32::new(0);

/// Pages of dead threads, reclaimed at the head of the next dispatch.
/// A dying thread cannot free its own page: its stack lives there until
/// the switch completes.
static REAP_QUEUE: IntrCell<Vec<(ThreadId, usize)>> = IntrCell::new(Vec::new());

static IDLE_TICKS: AtomicU64 = AtomicU64::new(0);
static KERNEL_TICKS: AtomicU64 = AtomicU64::new(0);
static USER_TICKS: AtomicU64 = AtomicU64::new(0);

static IDLE_STARTED: Semaphore = Semaphore::new(0);

/// Runs `f` on the scheduler with interrupts disabled.
pub(crate) fn with_sched<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    SCHED.with(|s| f(s.as_mut().expect("thread system not initialized")))
}

// ---------------------------------------------------------------------------
// Initialization
// ---------------------------------------------------------------------------

/// Turns the running boot code into the first thread and fixes the
/// scheduling policy for the lifetime of the kernel.
///
/// Must be called with interrupts disabled, after the platform hooks are
/// registered and before any other call into this module. The boot
/// thread keeps the stack it booted on; only its control block lives in
/// the allocated page.
pub fn init(policy: Policy) {
    assert_eq!(intr::get_level(), intr::Level::Off, "init with interrupts enabled");
    let page = platform::alloc_zeroed_page().expect("no page for the boot thread");
    SCHED.with(|slot| {
        assert!(slot.is_none(), "thread system initialized twice");
        *slot = Some(Scheduler::new(policy));
    });
    let id = with_sched(|s| s.bootstrap_running(Priority::DEFAULT, page.as_ptr() as usize));
    let block = init_block(page, id, "main");
    CURRENT.store(block.as_ptr(), Ordering::Release);
    INITIAL.store(block.as_ptr(), Ordering::Release);
}

/// Creates the idle thread and starts preemptive scheduling.
///
/// Returns once the idle thread has announced itself, so callers may
/// rely on the dispatcher always having a fallback from here on.
pub fn start() {
    create("idle", Priority::MIN, idle_thread, 0).expect("no page for the idle thread");
    intr::enable();
    IDLE_STARTED.down();
}

/// Writes a fresh control block at the base of `page`.
fn init_block(page: NonNull<u8>, id: ThreadId, name: &str) -> NonNull<ControlBlock> {
    let block = page.cast::<ControlBlock>();
    // SAFETY: The page is freshly allocated, zeroed, page-aligned, and
    // large enough for the control block (static-asserted above).
    unsafe {
        block.as_ptr().write(ControlBlock {
            id,
            name: copy_name(name),
            user_token: 0,
            frame: ContextFrame::zeroed(),
            sentinel: STACK_SENTINEL,
        });
    }
    block
}

/// Truncates `name` to [`NAME_MAX`] bytes, padded with NULs.
fn copy_name(name: &str) -> [u8; NAME_MAX + 1] {
    let mut buf = [0u8; NAME_MAX + 1];
    let mut len = name.len().min(NAME_MAX);
    // Don't split a multi-byte character.
    while !name.is_char_boundary(len) {
        len -= 1;
    }
    buf[..len].copy_from_slice(&name.as_bytes()[..len]);
    buf
}

// ---------------------------------------------------------------------------
// Current thread
// ---------------------------------------------------------------------------

/// Returns the running thread's control block, verifying its sentinel.
fn current_block() -> NonNull<ControlBlock> {
    let ptr = CURRENT.load(Ordering::Acquire);
    let block = NonNull::new(ptr).expect("thread system not initialized");
    // SAFETY: CURRENT always points at a live control block.
    let sentinel = unsafe { (*block.as_ptr()).sentinel };
    assert_eq!(sentinel, STACK_SENTINEL, "stack overflow likely");
    block
}

/// Returns the running thread's id.
pub fn current() -> ThreadId {
    // SAFETY: current_block() verified the block.
    unsafe { (*current_block().as_ptr()).id }
}

/// Returns the running thread's name.
pub fn name() -> &'static str {
    let block = current_block();
    // SAFETY: The block is live and the name bytes were written from a
    // valid &str prefix; the page outlives the running thread's use of it.
    unsafe {
        let bytes = &(*block.as_ptr()).name;
        let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        core::str::from_utf8_unchecked(&bytes[..len])
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Creates a kernel thread running `entry(arg)` and makes it runnable.
///
/// If the new thread outranks the creator, the creator yields before
/// returning. Under MLFQS the requested priority is ignored; the thread
/// inherits the creator's niceness and CPU history instead.
pub fn create(
    name: &str,
    priority: Priority,
    entry: ThreadFn,
    arg: usize,
) -> Result<ThreadId, CreateError> {
    let page = platform::alloc_zeroed_page().ok_or(CreateError::OutOfPages)?;

    let old = intr::disable();
    let id = with_sched(|s| s.create_thread(priority, page.as_ptr() as usize));
    let block = init_block(page, id, name);
    // SAFETY: The block was just initialized and is not yet visible to
    // the dispatcher (the thread is still Blocked).
    unsafe {
        (*block.as_ptr()).frame = ContextFrame::kernel_entry(
            thread_entry_trampoline as usize,
            entry as usize as u64,
            arg as u64,
            page.as_ptr() as usize + PAGE_SIZE,
        );
    }
    let preempt = with_sched(|s| {
        s.unblock(id);
        s.needs_preempt()
    });
    intr::set_level(old);

    if preempt && !intr::in_external() {
        yield_now();
    }
    Ok(id)
}

/// First code every kernel thread runs, by way of its fabricated frame.
extern "C" fn thread_entry_trampoline(entry: u64, arg: u64) -> ! {
    // The dispatcher runs with interrupts off; hand them back before
    // entering thread code.
    intr::enable();
    // SAFETY: `entry` was produced from a `ThreadFn` in create().
    let entry: ThreadFn = unsafe { core::mem::transmute(entry as usize) };
    entry(arg as usize);
    exit()
}

/// Yields the CPU; the thread stays runnable and may be rescheduled
/// immediately.
pub fn yield_now() {
    assert!(!intr::in_external(), "yield inside an interrupt handler");
    let old = intr::disable();
    with_sched(|s| s.yield_running());
    dispatch();
    intr::set_level(old);
}

/// Blocks the running thread until [`unblock`] names it.
///
/// Must be called with interrupts disabled; the next scheduled thread
/// will normally re-enable them. Prefer the synchronization primitives
/// over calling this directly.
pub fn block() {
    assert!(!intr::in_external(), "blocking inside an interrupt handler");
    assert_eq!(intr::get_level(), intr::Level::Off, "block with interrupts enabled");
    with_sched(|s| s.block_running());
    dispatch();
}

/// Makes a blocked thread runnable again.
///
/// Never switches threads itself — the caller decides whether to yield,
/// so it can unblock atomically with other updates under its own
/// interrupt-disabled section. From interrupt context, where the caller
/// cannot yield, a deferred yield is requested when the woken thread
/// outranks the running one.
pub fn unblock(id: ThreadId) {
    let old = intr::disable();
    let preempt = with_sched(|s| {
        s.unblock(id);
        s.needs_preempt()
    });
    if preempt && intr::in_external() {
        intr::yield_on_return();
    }
    intr::set_level(old);
}

/// Exits the running thread. Its page is reclaimed by a later dispatch.
pub fn exit() -> ! {
    assert!(!intr::in_external(), "exit inside an interrupt handler");
    intr::disable();
    with_sched(|s| s.exit_running());
    dispatch();
    unreachable!("dispatched back into a dying thread");
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Switches to the next runnable thread (or idle).
///
/// Entered with interrupts disabled and the running thread already
/// transitioned out of `Running`. Returns when the departing thread is
/// eventually scheduled back in.
fn dispatch() {
    debug_assert_eq!(intr::get_level(), intr::Level::Off);

    reap();

    let prev = current_block();
    // SAFETY: current_block() verified the block.
    let prev_id = unsafe { (*prev.as_ptr()).id };
    let (prev_state, next_id, next_token) = with_sched(|s| {
        let prev_state = s.state(prev_id);
        let next = s.pick_next();
        (prev_state, next, s.token(next))
    });

    // Fresh slice for the incoming thread.
    SLICE_TICKS.store(0, Ordering::Release);

    if next_id == prev_id {
        return;
    }

    let next = next_token as *mut ControlBlock;
    // SAFETY: Tokens in the scheduler always point at live control blocks.
    unsafe {
        platform::activate_address_space((*next).user_token);
    }
    CURRENT.store(next, Ordering::Release);

    if prev_state == ThreadState::Dying && prev.as_ptr() != INITIAL.load(Ordering::Acquire) {
        // The page is still this stack; queue it for the next dispatch.
        REAP_QUEUE.with(|q| q.push((prev_id, prev.as_ptr() as usize)));
    }

    // SAFETY: Both frames live in control blocks that survive the switch
    // (a dying thread's page is reclaimed only by a later dispatch), and
    // interrupts are disabled.
    unsafe {
        platform::switch_context(&mut (*prev.as_ptr()).frame, &(*next).frame);
    }
}

/// Frees pages queued by dead threads and drops their records.
fn reap() {
    let victims = REAP_QUEUE.with(core::mem::take);
    for (id, page) in victims {
        with_sched(|s| s.remove_thread(id));
        platform::free_page(NonNull::new(page as *mut u8).expect("null page queued for reap"));
    }
}

// ---------------------------------------------------------------------------
// Idle thread
// ---------------------------------------------------------------------------

/// Runs when nothing else is ready: registers itself, then blocks until
/// the dispatcher falls back to it, halting the CPU between interrupts.
fn idle_thread(_arg: usize) {
    let id = current();
    let old = intr::disable();
    with_sched(|s| s.set_idle(id));
    intr::set_level(old);
    IDLE_STARTED.up();

    loop {
        // Block until the dispatcher has nothing else; it resumes us with
        // interrupts still disabled, and enable_and_halt turns them back
        // on atomically with the halt.
        intr::disable();
        block();
        crate::arch::enable_and_halt();
    }
}

// ---------------------------------------------------------------------------
// Priorities and MLFQS observables
// ---------------------------------------------------------------------------

/// Sets the running thread's base priority, yielding if it no longer
/// outranks the ready queue. Silently ignored under MLFQS.
pub fn set_priority(priority: Priority) {
    let old = intr::disable();
    let should_yield = with_sched(|s| s.set_priority(priority));
    intr::set_level(old);
    if should_yield {
        yield_now();
    }
}

/// Returns the running thread's effective priority.
pub fn get_priority() -> Priority {
    let old = intr::disable();
    let p = with_sched(|s| s.get_priority());
    intr::set_level(old);
    p
}

/// Sets the running thread's niceness (clamped to `[-20, 20]`) and, under
/// MLFQS, recomputes its priority, yielding if it lost the CPU claim.
pub fn set_nice(nice: i32) {
    let old = intr::disable();
    let should_yield = with_sched(|s| s.set_nice(Nice::clamped(nice)));
    intr::set_level(old);
    if should_yield {
        yield_now();
    }
}

/// Returns the running thread's niceness.
pub fn get_nice() -> i32 {
    let old = intr::disable();
    let n = with_sched(|s| {
        let cur = s.current();
        s.nice_of(cur)
    });
    intr::set_level(old);
    n.as_i8() as i32
}

/// Returns 100 times the system load average, rounded to nearest.
pub fn get_load_avg() -> i64 {
    let old = intr::disable();
    let load = with_sched(|s| s.load_avg_x100());
    intr::set_level(old);
    load
}

/// Returns 100 times the running thread's `recent_cpu`, rounded to
/// nearest.
pub fn get_recent_cpu() -> i64 {
    let old = intr::disable();
    let rc = with_sched(|s| {
        let cur = s.current();
        s.recent_cpu_x100(cur)
    });
    intr::set_level(old);
    rc
}

// ---------------------------------------------------------------------------
// Timer integration and statistics
// ---------------------------------------------------------------------------

/// Per-tick bookkeeping, called by the timer interrupt handler: charges
/// the tick to a statistics bucket and enforces the time slice.
pub(crate) fn tick() {
    let ptr = CURRENT.load(Ordering::Acquire);
    if ptr.is_null() {
        return;
    }
    // SAFETY: CURRENT points at a live control block.
    let (id, user) = unsafe { ((*ptr).id, (*ptr).user_token != 0) };

    let is_idle = with_sched(|s| s.idle() == Some(id));
    if is_idle {
        IDLE_TICKS.fetch_add(1, Ordering::Relaxed);
    } else if user {
        USER_TICKS.fetch_add(1, Ordering::Relaxed);
    } else {
        KERNEL_TICKS.fetch_add(1, Ordering::Relaxed);
    }

    if SLICE_TICKS.fetch_add(1, Ordering::AcqRel) + 1 >= TIME_SLICE {
        intr::yield_on_return();
    }
}

/// Best-effort identification of the running thread for the panic path.
///
/// Unlike [`current`], never asserts: a corrupted sentinel is reported,
/// not re-panicked on.
pub(crate) fn dump_for_panic() {
    let ptr = CURRENT.load(Ordering::Acquire);
    if ptr.is_null() {
        return;
    }
    // SAFETY: CURRENT points at a live control block; reads only.
    unsafe {
        let block = &*ptr;
        let sentinel = if block.sentinel == STACK_SENTINEL {
            "intact"
        } else {
            "CORRUPT (stack overflow likely)"
        };
        let len = block.name.iter().position(|&b| b == 0).unwrap_or(block.name.len());
        let name = core::str::from_utf8(&block.name[..len]).unwrap_or("<bad utf8>");
        kprintln!("thread {} ({name}), sentinel {sentinel}", block.id);
        kprintln!("last saved context:\n{:?}", block.frame);
    }
}

/// Prints per-kind tick counts.
pub fn print_stats() {
    kprintln!(
        "Thread: {} idle ticks, {} kernel ticks, {} user ticks",
        IDLE_TICKS.load(Ordering::Relaxed),
        KERNEL_TICKS.load(Ordering::Relaxed),
        USER_TICKS.load(Ordering::Relaxed),
    );
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

/// Wipes all thread-system state so each host test starts clean.
/// Thread pages still referenced by the old scheduler leak; tests don't
/// care.
#[cfg(test)]
pub(crate) fn reset_for_tests() {
    SCHED.with(|s| *s = None);
    CURRENT.store(core::ptr::null_mut(), Ordering::Release);
    INITIAL.store(core::ptr::null_mut(), Ordering::Release);
    REAP_QUEUE.with(|q| q.clear());
    SLICE_TICKS.store(0, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util;

    fn fresh() -> impl Drop {
        test_util::with_thread_system()
    }

    #[test]
    fn boot_thread_is_current() {
        let _t = fresh();
        assert_eq!(current().as_u32(), 1);
        assert_eq!(name(), "main");
        assert_eq!(get_priority(), Priority::DEFAULT);
    }

    #[test]
    fn create_lower_priority_does_not_switch() {
        let _t = fresh();
        let before = current();
        let id = create("worker", Priority::new(10), |_| {}, 0).unwrap();
        assert_eq!(current(), before, "creator keeps the CPU");
        let (state, head) = with_sched(|s| (s.state(id), s.ready_head()));
        assert_eq!(state, ThreadState::Ready);
        assert_eq!(head, Some(id));
    }

    #[test]
    fn create_allocates_monotonic_ids() {
        let _t = fresh();
        let a = create("a", Priority::new(5), |_| {}, 0).unwrap();
        let b = create("b", Priority::new(5), |_| {}, 0).unwrap();
        assert!(b > a);
    }

    #[test]
    fn create_reports_page_exhaustion() {
        let _t = fresh();
        platform::set_page_allocator(|| None, |_| {});
        let err = create("doomed", Priority::DEFAULT, |_| {}, 0).unwrap_err();
        assert_eq!(err, CreateError::OutOfPages);
    }

    #[test]
    fn long_names_are_truncated() {
        let _t = fresh();
        let buf = copy_name("a-very-long-thread-name");
        assert_eq!(&buf[..NAME_MAX], b"a-very-long-thr");
        assert_eq!(buf[NAME_MAX], 0);

        let exact = copy_name("short");
        assert_eq!(&exact[..5], b"short");
        assert!(exact[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn unblock_inserts_by_priority_without_preempting() {
        let _t = fresh();
        let lo = create("lo", Priority::new(5), |_| {}, 0).unwrap();
        let hi = create("hi", Priority::new(20), |_| {}, 0).unwrap();
        let order: Vec<_> = with_sched(|s| s.ready_ids().collect());
        assert_eq!(order, [hi, lo]);
        assert_eq!(current().as_u32(), 1, "unblock never preempts by itself");
    }

    #[test]
    #[should_panic(expected = "stack overflow likely")]
    fn corrupted_sentinel_is_fatal() {
        let _t = fresh();
        let block = CURRENT.load(Ordering::Acquire);
        // SAFETY: Deliberately corrupting the sentinel to provoke the check.
        unsafe {
            (*block).sentinel = 0xdead_beef;
        }
        let _ = current();
    }

    #[test]
    #[should_panic(expected = "initialized twice")]
    fn double_init_is_fatal() {
        let _t = fresh();
        intr::disable();
        init(Policy::Donation);
    }

    #[test]
    fn slice_expiry_requests_yield_on_return() {
        let _t = fresh();
        // Simulate TIME_SLICE timer ticks from interrupt context.
        for _ in 0..TIME_SLICE {
            test_util::fake_external(|| tick());
        }
        assert!(test_util::take_yield_requested());
    }

    #[test]
    fn stats_classify_kernel_ticks() {
        let _t = fresh();
        let before = KERNEL_TICKS.load(Ordering::Relaxed);
        test_util::fake_external(|| tick());
        assert!(KERNEL_TICKS.load(Ordering::Relaxed) > before);
    }
}
