//! In-kernel test harness.
//!
//! Compiled only with `--cfg ktest`. Tests register themselves with the
//! [`kernel_test!`] macro, which places a descriptor into the
//! `.muon_kernel_tests` linker section; the platform's test boot calls
//! [`run_all`] after `thread::start`, once the timer is firing. Each
//! descriptor names the boot policy it needs — donation and MLFQS are
//! mutually exclusive, so full coverage takes one boot per policy.
//!
//! A failing assertion panics; the panic handler reports the current
//! test and exits the emulator with the failure code.

use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use muon_core::Policy;

use crate::kprintln;

/// Which boot policy a test requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPolicy {
    /// Static priorities with donation.
    Donation,
    /// Multilevel feedback queue.
    Mlfqs,
}

/// One registered kernel test.
pub struct KernelTestDescriptor {
    /// Test name, as reported on the console.
    pub name: &'static str,
    /// Boot policy the test requires.
    pub policy: TestPolicy,
    /// The test body; panics on failure.
    pub run: fn(),
}

muon_linkset::declare_linkset! {
    /// Returns all registered kernel test descriptors.
    pub fn kernel_test_entries() -> [KernelTestDescriptor],
    section = "muon_kernel_tests"
}

/// Registers a kernel test.
///
/// ```ignore
/// kernel_test! {
///     /// Sleepers wake in wake-tick order.
///     [TestPolicy::Donation]
///     fn alarm_order() {
///         ...
///     }
/// }
/// ```
#[macro_export]
macro_rules! kernel_test {
    (
        $(#[$meta:meta])*
        [$policy:expr]
        fn $name:ident() $body:block
    ) => {
        $(#[$meta])*
        fn $name() $body

        const _: () = {
            muon_linkset::linkset_entry!(
                "muon_kernel_tests",
                ENTRY: $crate::ktest::KernelTestDescriptor =
                    $crate::ktest::KernelTestDescriptor {
                        name: stringify!($name),
                        policy: $policy,
                        run: $name,
                    }
            );
        };
    };
}

// ---------------------------------------------------------------------------
// Current test tracking (for the panic handler)
// ---------------------------------------------------------------------------

static CURRENT_TEST: AtomicPtr<u8> = AtomicPtr::new(core::ptr::null_mut());
static CURRENT_TEST_LEN: AtomicUsize = AtomicUsize::new(0);
static PASSED: AtomicU32 = AtomicU32::new(0);

fn set_current_test(name: &'static str) {
    CURRENT_TEST.store(name.as_ptr() as *mut u8, Ordering::Release);
    CURRENT_TEST_LEN.store(name.len(), Ordering::Release);
}

fn current_test_name() -> Option<&'static str> {
    let ptr = CURRENT_TEST.load(Ordering::Acquire);
    if ptr.is_null() {
        return None;
    }
    let len = CURRENT_TEST_LEN.load(Ordering::Acquire);
    // SAFETY: The pointer and length come from a &'static str stored in
    // set_current_test.
    Some(unsafe {
        core::str::from_utf8_unchecked(core::slice::from_raw_parts(ptr, len))
    })
}

/// Reports the failing test from the panic handler and exits.
pub(crate) fn report_panic_and_exit() -> ! {
    match current_test_name() {
        Some(name) => kprintln!("test {name} ... FAILED"),
        None => kprintln!("panic outside any test"),
    }
    qemu::exit_qemu(qemu::FAILURE)
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Runs every registered test matching the booted `policy`, then exits
/// the emulator.
///
/// Call from the platform's test boot after [`crate::thread::start`].
pub fn run_all(policy: Policy) -> ! {
    let wanted = match policy {
        Policy::Donation => TestPolicy::Donation,
        Policy::Mlfqs { .. } => TestPolicy::Mlfqs,
    };

    let tests = kernel_test_entries();
    let selected = tests.iter().filter(|t| t.policy == wanted);

    for test in selected {
        kprintln!("test {} ...", test.name);
        set_current_test(test.name);
        (test.run)();
        kprintln!("test {} ... ok", test.name);
        PASSED.fetch_add(1, Ordering::Relaxed);
    }

    kprintln!(
        "{} kernel tests passed ({:?} policy)",
        PASSED.load(Ordering::Relaxed),
        wanted
    );
    crate::thread::print_stats();
    crate::timer::print_stats();
    qemu::exit_qemu(qemu::SUCCESS)
}

// ---------------------------------------------------------------------------
// QEMU exit interface (isa-debug-exit device)
// ---------------------------------------------------------------------------

/// QEMU exit interface for the `isa-debug-exit` device.
pub mod qemu {
    /// Exit code indicating all tests passed (process exit code 33).
    pub const SUCCESS: u32 = 0x10;
    /// Exit code indicating a test failure (process exit code 35).
    pub const FAILURE: u32 = 0x11;

    /// Exits QEMU via the `isa-debug-exit` device.
    ///
    /// QEMU computes the process exit code as `(value << 1) | 1`.
    #[cfg(all(target_os = "none", target_arch = "x86_64"))]
    pub fn exit_qemu(code: u32) -> ! {
        // SAFETY: Writing to the isa-debug-exit I/O port makes QEMU exit.
        unsafe {
            core::arch::asm!(
                "out dx, eax",
                in("dx") 0xf4u16,
                in("eax") code,
                options(nomem, nostack, preserves_flags),
            );
        }
        loop {
            core::hint::spin_loop();
        }
    }

    /// Host stand-in so `--cfg ktest` still type-checks off-target.
    #[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
    pub fn exit_qemu(code: u32) -> ! {
        panic!("exit_qemu({code:#x}) outside QEMU");
    }
}
