//! Core scheduling types and policies for the Muon kernel.
//!
//! This crate contains the host-testable half of the thread system: the
//! priority types, the 17.14 fixed-point arithmetic, the ready-queue and
//! sleep-queue disciplines, the priority-donation engine, and the MLFQS
//! policy. Everything here operates on opaque [`ThreadId`](id::ThreadId) /
//! [`LockId`](id::LockId) handles; the kernel crate binds those handles to
//! real control blocks and performs the actual context switches.
//!
//! By living outside the kernel crate, this logic can be tested with plain
//! `cargo test` on the host without a kernel target.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod donate;
pub mod fixed;
pub mod id;
pub mod mlfqs;
pub mod priority;
pub mod sched;
pub mod sleep;
mod static_assert;

pub use donate::DONATION_DEPTH_LIMIT;
pub use fixed::Fixed;
pub use id::{LockId, ThreadId};
pub use priority::{Nice, Priority};
pub use sched::{Policy, Scheduler, ThreadState};
pub use sleep::SleepQueue;
