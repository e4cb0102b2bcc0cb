//! Interrupt levels, external-handler dispatch, and deferred yields.
//!
//! Every kernel data structure shared with interrupt handlers is mutated
//! only with interrupts disabled; this module owns that discipline. It
//! also carries the registry the platform's IRQ stubs dispatch through,
//! and the "yield on return" flag handlers use instead of switching
//! threads directly.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::arch::{self, RFlags};
use crate::sync::IntrCell;

/// Interrupt state, as saved and restored around critical sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Interrupts are deliverable.
    On,
    /// Interrupts are masked.
    Off,
}

/// Returns `true` if interrupts are currently deliverable.
pub fn enabled() -> bool {
    arch::interrupts_enabled()
}

/// Returns the current interrupt level.
pub fn get_level() -> Level {
    if enabled() { Level::On } else { Level::Off }
}

/// Disables interrupts and returns the previous level.
pub fn disable() -> Level {
    let flags = arch::save_flags_and_cli();
    if flags & RFlags::INTERRUPT_FLAG.bits() != 0 {
        Level::On
    } else {
        Level::Off
    }
}

/// Enables interrupts and returns the previous level.
///
/// Must not be called from an external handler: the handler's own return
/// path restores the interrupted context's level.
pub fn enable() -> Level {
    assert!(!in_external(), "enabling interrupts inside a handler");
    let old = get_level();
    arch::restore_flags(RFlags::INTERRUPT_FLAG.bits());
    old
}

/// Restores a previously returned level.
pub fn set_level(level: Level) -> Level {
    match level {
        Level::On => enable(),
        Level::Off => disable(),
    }
}

// ---------------------------------------------------------------------------
// External handler context
// ---------------------------------------------------------------------------

/// Set for the duration of an external (device) interrupt handler.
static IN_EXTERNAL: AtomicBool = AtomicBool::new(false);

/// Deferred-yield flag, honored when the outermost handler returns.
static YIELD_ON_RETURN: AtomicBool = AtomicBool::new(false);

/// Spurious interrupts observed and ignored.
static SPURIOUS: AtomicU64 = AtomicU64::new(0);

/// Returns `true` while an external interrupt handler is running.
///
/// Code that may block asserts this is `false`; handlers never block.
pub fn in_external() -> bool {
    IN_EXTERNAL.load(Ordering::Acquire)
}

/// Requests a yield when the current external handler returns.
///
/// Handlers cannot switch threads directly (the interrupted context is
/// still live on the stack), so preemption from interrupt context is
/// deferred to the dispatch tail.
pub fn yield_on_return() {
    assert!(in_external(), "yield_on_return outside a handler");
    YIELD_ON_RETURN.store(true, Ordering::Release);
}

// ---------------------------------------------------------------------------
// External handler registry
// ---------------------------------------------------------------------------

/// Number of interrupt vectors.
const VECTORS: usize = 256;

/// First and last vector the platform routes device IRQs to.
const EXTERNAL_FIRST: u8 = 0x20;
const EXTERNAL_LAST: u8 = 0x2f;

/// Vectors the legacy PIC raises spuriously; ignored rather than fatal.
const SPURIOUS_VECTORS: [u8; 2] = [0x27, 0x2f];

#[derive(Clone, Copy)]
struct Registration {
    handler: fn(),
    name: &'static str,
}

static HANDLERS: IntrCell<[Option<Registration>; VECTORS]> =
    IntrCell::new([None; VECTORS]);

/// Registers `handler` for an external interrupt vector.
///
/// The platform's IDT stub for that vector is expected to call
/// [`dispatch`]. Registering a vector twice is a bug.
pub fn register_external(vector: u8, handler: fn(), name: &'static str) {
    assert!(
        (EXTERNAL_FIRST..=EXTERNAL_LAST).contains(&vector),
        "vector {vector:#04x} is not an external IRQ vector"
    );
    HANDLERS.with(|table| {
        let slot = &mut table[vector as usize];
        assert!(slot.is_none(), "vector {vector:#04x} registered twice");
        *slot = Some(Registration { handler, name });
    });
}

/// Entry point for the platform's interrupt stubs.
///
/// Called with interrupts disabled and the interrupted context saved by
/// the stub. Runs the registered handler, then honors a pending deferred
/// yield — the context switch happens here, and the stub completes its
/// return once the interrupted thread is scheduled back in.
///
/// Unregistered vectors are fatal unless known-spurious.
pub fn dispatch(vector: u8) {
    debug_assert!(!enabled(), "dispatch with interrupts deliverable");
    assert!(!in_external(), "nested external interrupt");

    IN_EXTERNAL.store(true, Ordering::Release);
    let registered = HANDLERS.with(|table| table[vector as usize]);
    match registered {
        Some(reg) => (reg.handler)(),
        None if SPURIOUS_VECTORS.contains(&vector) => {
            SPURIOUS.fetch_add(1, Ordering::Relaxed);
        }
        None => {
            panic!("unexpected interrupt {vector:#04x}");
        }
    }
    IN_EXTERNAL.store(false, Ordering::Release);

    if YIELD_ON_RETURN.swap(false, Ordering::AcqRel) {
        crate::thread::yield_now();
    }
}

/// Returns the name a vector was registered under, for diagnostics.
pub fn handler_name(vector: u8) -> Option<&'static str> {
    HANDLERS.with(|table| table[vector as usize].map(|r| r.name))
}

/// Number of spurious interrupts silently ignored so far.
pub fn spurious_count() -> u64 {
    SPURIOUS.load(Ordering::Relaxed)
}

/// Clears external-context state left behind by a panicking test.
#[cfg(test)]
pub(crate) fn reset_for_tests() {
    IN_EXTERNAL.store(false, Ordering::Release);
    YIELD_ON_RETURN.store(false, Ordering::Release);
    arch::restore_flags(RFlags::INTERRUPT_FLAG.bits());
}

#[cfg(test)]
pub(crate) fn enter_external_for_tests() {
    IN_EXTERNAL.store(true, Ordering::Release);
}

#[cfg(test)]
pub(crate) fn leave_external_for_tests() {
    IN_EXTERNAL.store(false, Ordering::Release);
}

#[cfg(test)]
pub(crate) fn take_yield_for_tests() -> bool {
    YIELD_ON_RETURN.swap(false, Ordering::AcqRel)
}
