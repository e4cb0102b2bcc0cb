//! CPU flags, interrupt gating, and the saved execution frame.
//!
//! Everything here compiles on the host as well: the flag operations fall
//! back to a simulated interrupt-enable bit so the discipline in
//! [`crate::intr`] stays testable with `cargo test`. The context switch
//! itself is not implemented here — capturing and resuming frames is the
//! platform's job, registered through [`crate::platform`].

use core::fmt;

bitflags::bitflags! {
    /// CPU flags (RFLAGS register).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RFlags: u64 {
        /// Carry flag.
        const CARRY          = 1 << 0;
        /// Zero flag.
        const ZERO           = 1 << 6;
        /// Sign flag.
        const SIGN           = 1 << 7;
        /// Trap flag (single-step).
        const TRAP           = 1 << 8;
        /// Interrupt enable flag.
        const INTERRUPT_FLAG = 1 << 9;
        /// Direction flag.
        const DIRECTION      = 1 << 10;
        /// Overflow flag.
        const OVERFLOW       = 1 << 11;
    }
}

/// A captured execution context.
///
/// The platform's context-switch primitive stores the departing thread's
/// registers into one frame and resumes from another. For a brand-new
/// thread the frame is fabricated by [`ContextFrame::kernel_entry`] so
/// that the first resume lands in the thread's entry trampoline.
#[derive(Clone)]
#[repr(C)]
#[allow(missing_docs)]
pub struct ContextFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    /// Second argument register.
    pub rsi: u64,
    /// First argument register.
    pub rdi: u64,
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    /// Resume address.
    pub rip: u64,
    /// Flags to restore on resume.
    pub rflags: u64,
    /// Stack pointer to restore on resume.
    pub rsp: u64,
}

impl ContextFrame {
    /// An all-zero frame; filled in by the first capture.
    pub const fn zeroed() -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            rip: 0,
            rflags: 0,
            rsp: 0,
        }
    }

    /// Fabricates the first frame of a kernel thread.
    ///
    /// Resuming it calls `entry(arg0, arg1)` on an empty stack with
    /// interrupts enabled.
    pub fn kernel_entry(entry: usize, arg0: u64, arg1: u64, stack_top: usize) -> Self {
        let mut frame = Self::zeroed();
        frame.rip = entry as u64;
        frame.rdi = arg0;
        frame.rsi = arg1;
        frame.rflags = RFlags::INTERRUPT_FLAG.bits();
        // Keep the ABI-mandated alignment: a call would have pushed a
        // return address, so enter with rsp ≡ 8 (mod 16).
        frame.rsp = (stack_top - 8) as u64;
        frame
    }
}

impl fmt::Debug for ContextFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "rip={:#018x} rsp={:#018x} rflags={:#x}",
            self.rip, self.rsp, self.rflags
        )?;
        writeln!(
            f,
            "rax={:#018x} rbx={:#018x} rcx={:#018x} rdx={:#018x}",
            self.rax, self.rbx, self.rcx, self.rdx
        )?;
        writeln!(
            f,
            "rsi={:#018x} rdi={:#018x} rbp={:#018x} r8 ={:#018x}",
            self.rsi, self.rdi, self.rbp, self.r8
        )?;
        write!(
            f,
            "r9 ={:#018x} r10={:#018x} r11={:#018x} r12={:#018x}",
            self.r9, self.r10, self.r11, self.r12
        )
    }
}

// ---------------------------------------------------------------------------
// Flag save/restore — the all-or-nothing critical-section primitive
// ---------------------------------------------------------------------------

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[inline]
pub(crate) fn save_flags_and_cli() -> u64 {
    let flags: u64;
    // SAFETY: Reading RFLAGS and disabling interrupts is safe in kernel mode.
    unsafe {
        core::arch::asm!(
            "pushfq",
            "pop {}",
            "cli",
            out(reg) flags,
            options(nomem),
        );
    }
    flags
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[inline]
pub(crate) fn restore_flags(flags: u64) {
    // Only the IF bit matters; everything else was preserved by `cli`.
    if flags & RFlags::INTERRUPT_FLAG.bits() != 0 {
        // SAFETY: Re-enabling interrupts restores a previously observed state.
        unsafe {
            core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
        }
    }
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[inline]
pub(crate) fn interrupts_enabled() -> bool {
    let flags: u64;
    // SAFETY: Reading RFLAGS has no side effects.
    unsafe {
        core::arch::asm!("pushfq", "pop {}", out(reg) flags, options(nomem));
    }
    flags & RFlags::INTERRUPT_FLAG.bits() != 0
}

/// Re-enables interrupts and halts until the next one arrives.
///
/// `sti` holds interrupts off until the instruction after it completes,
/// so the pair executes atomically: an interrupt cannot slip in between
/// re-enabling and halting (which would waste up to a full tick).
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[inline]
pub fn enable_and_halt() {
    // SAFETY: Halting with interrupts enabled is the idle loop's whole job.
    unsafe {
        core::arch::asm!("sti", "hlt", options(nomem, nostack));
    }
}

// ---------------------------------------------------------------------------
// Host fallbacks: a simulated interrupt-enable bit
// ---------------------------------------------------------------------------

#[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
mod host {
    use core::sync::atomic::AtomicBool;

    pub(super) static SIMULATED_IF: AtomicBool = AtomicBool::new(true);
}

#[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
#[inline]
pub(crate) fn save_flags_and_cli() -> u64 {
    if host::SIMULATED_IF.swap(false, core::sync::atomic::Ordering::AcqRel) {
        RFlags::INTERRUPT_FLAG.bits()
    } else {
        0
    }
}

#[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
#[inline]
pub(crate) fn restore_flags(flags: u64) {
    if flags & RFlags::INTERRUPT_FLAG.bits() != 0 {
        host::SIMULATED_IF.store(true, core::sync::atomic::Ordering::Release);
    }
}

#[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
#[inline]
pub(crate) fn interrupts_enabled() -> bool {
    host::SIMULATED_IF.load(core::sync::atomic::Ordering::Acquire)
}

/// Host stand-in for the idle halt; spins briefly instead.
#[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
#[inline]
pub fn enable_and_halt() {
    restore_flags(RFlags::INTERRUPT_FLAG.bits());
    core::hint::spin_loop();
}
