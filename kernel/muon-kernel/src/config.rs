//! Compile-time configuration.
//!
//! A single source of truth for the scheduler's constants. The priority
//! range lives on [`Priority`]; the donation walk bound lives in
//! `muon-core` and is re-exported here.

use muon_core::static_assert;

pub use muon_core::DONATION_DEPTH_LIMIT;

/// Timer interrupts per second.
///
/// The platform programs its timer hardware to this rate and calls the
/// registered tick handler once per interrupt.
pub const TIMER_FREQ: i64 = 100;

// The classic PIT cannot divide below 19 Hz, and above 1000 Hz the tick
// overhead dominates.
static_assert!(TIMER_FREQ >= 19, "timer frequency too low");
static_assert!(TIMER_FREQ <= 1000, "timer frequency too high");

/// Timer ticks each thread runs before the tick handler forces a yield.
pub const TIME_SLICE: u32 = 4;

/// Size of the page holding a thread's control block and kernel stack.
pub const PAGE_SIZE: usize = 4096;

/// Maximum thread name length, excluding the NUL-style padding.
pub const NAME_MAX: usize = 15;

/// Sentinel written at the tail of every control block ("muon" in ASCII).
///
/// The kernel stack grows down toward the control block, so a stack
/// overflow corrupts this field first; every access to the current
/// thread checks it.
pub const STACK_SENTINEL: u32 = 0x6d75_6f6e;
