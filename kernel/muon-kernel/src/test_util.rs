//! Shared plumbing for host tests.
//!
//! The interrupt discipline and the thread system are per-CPU global
//! state; host tests that exercise them must not interleave. Every such
//! test takes the serialization lock, and the ones that need threads
//! install a heap-backed page allocator and reset the thread system.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard};

use crate::config::PAGE_SIZE;
use crate::platform;

static SERIAL: Mutex<()> = Mutex::new(());

/// Takes the global test lock and resets the interrupt state.
pub(crate) fn serial() -> MutexGuard<'static, ()> {
    let guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    crate::intr::reset_for_tests();
    guard
}

fn page_layout() -> Layout {
    Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).expect("bad page layout")
}

fn test_alloc_page() -> Option<NonNull<u8>> {
    // SAFETY: The layout is non-zero-sized.
    NonNull::new(unsafe { std::alloc::alloc_zeroed(page_layout()) })
}

fn test_free_page(page: NonNull<u8>) {
    // SAFETY: The page came from test_alloc_page with the same layout.
    unsafe { std::alloc::dealloc(page.as_ptr(), page_layout()) }
}

unsafe fn test_switch(
    _save: *mut crate::arch::ContextFrame,
    _resume: *const crate::arch::ContextFrame,
) {
    panic!("host tests must not reach a context switch");
}

/// Installs heap-backed platform hooks for thread tests.
pub(crate) fn install_test_platform() {
    platform::set_page_allocator(test_alloc_page, test_free_page);
    platform::set_context_switch(test_switch);
    platform::set_address_space_hook(|_| {});
}

/// Serializes, installs the heap-backed platform, and boots a fresh
/// thread system under the donation policy.
pub(crate) fn with_thread_system() -> MutexGuard<'static, ()> {
    let guard = serial();
    install_test_platform();
    crate::thread::reset_for_tests();
    crate::intr::disable();
    crate::thread::init(muon_core::Policy::Donation);
    crate::intr::enable();
    guard
}

/// Runs `f` as if inside an external interrupt handler.
pub(crate) fn fake_external(f: impl FnOnce()) {
    crate::intr::enter_external_for_tests();
    f();
    crate::intr::leave_external_for_tests();
}

/// Reads and clears the deferred-yield flag.
pub(crate) fn take_yield_requested() -> bool {
    crate::intr::take_yield_for_tests()
}
