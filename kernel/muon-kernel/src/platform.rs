//! External collaborators, registered by the embedding platform.
//!
//! The scheduler consumes four interfaces it deliberately does not
//! implement: a page allocator for thread pages, the context-switch
//! primitive, an optional address-space activation hook for user
//! threads, and (via [`crate::log`]) a console. The platform registers
//! them once at boot, before [`crate::thread::init`].
//!
//! Registration follows the same atomic-function-pointer scheme as the
//! log facility; the hooks must be safe to call from any context.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::arch::ContextFrame;

/// Allocates one zeroed page, or `None` when memory is exhausted.
pub type AllocPageFn = fn() -> Option<NonNull<u8>>;

/// Returns a page obtained from [`AllocPageFn`].
pub type FreePageFn = fn(NonNull<u8>);

/// Captures the current execution context into `save` and resumes from
/// `resume` atomically.
///
/// The call returns only when the saved context is scheduled again. Both
/// pointers stay valid for the lifetime of their threads' pages.
pub type SwitchContextFn = unsafe fn(save: *mut ContextFrame, resume: *const ContextFrame);

/// Activates the address space of the incoming thread.
///
/// Receives the thread's user-space token (0 for pure kernel threads).
pub type ActivateFn = fn(usize);

fn missing_alloc() -> Option<NonNull<u8>> {
    panic!("page allocator not registered");
}

fn missing_free(_page: NonNull<u8>) {
    panic!("page allocator not registered");
}

unsafe fn missing_switch(_save: *mut ContextFrame, _resume: *const ContextFrame) {
    panic!("context switch not registered");
}

fn null_activate(_token: usize) {}

static ALLOC_FN: AtomicPtr<()> = AtomicPtr::new(missing_alloc as *mut ());
static FREE_FN: AtomicPtr<()> = AtomicPtr::new(missing_free as *mut ());
static SWITCH_FN: AtomicPtr<()> = AtomicPtr::new(missing_switch as *mut ());
static ACTIVATE_FN: AtomicPtr<()> = AtomicPtr::new(null_activate as *mut ());

/// Registers the page allocator.
pub fn set_page_allocator(alloc: AllocPageFn, free: FreePageFn) {
    ALLOC_FN.store(alloc as *mut (), Ordering::Release);
    FREE_FN.store(free as *mut (), Ordering::Release);
}

/// Registers the context-switch primitive.
pub fn set_context_switch(f: SwitchContextFn) {
    SWITCH_FN.store(f as *mut (), Ordering::Release);
}

/// Registers the address-space activation hook.
///
/// When registered, it is invoked with the incoming thread's user token
/// on every dispatch.
pub fn set_address_space_hook(f: ActivateFn) {
    ACTIVATE_FN.store(f as *mut (), Ordering::Release);
}

/// Allocates one zeroed page through the registered allocator.
pub(crate) fn alloc_zeroed_page() -> Option<NonNull<u8>> {
    let ptr = ALLOC_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `AllocPageFn` pointers are ever stored.
    let f: AllocPageFn = unsafe { core::mem::transmute(ptr) };
    f()
}

/// Returns a page through the registered allocator.
pub(crate) fn free_page(page: NonNull<u8>) {
    let ptr = FREE_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `FreePageFn` pointers are ever stored.
    let f: FreePageFn = unsafe { core::mem::transmute(ptr) };
    f(page)
}

/// Switches execution contexts through the registered primitive.
///
/// # Safety
///
/// `save` and `resume` must point at live, correctly initialized frames;
/// interrupts must be disabled; the caller must not rely on any borrow
/// held across the switch.
pub(crate) unsafe fn switch_context(save: *mut ContextFrame, resume: *const ContextFrame) {
    let ptr = SWITCH_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `SwitchContextFn` pointers are ever stored; the
    // caller upholds the frame and interrupt preconditions.
    unsafe {
        let f: SwitchContextFn = core::mem::transmute(ptr);
        f(save, resume);
    }
}

/// Invokes the address-space hook for the incoming thread.
pub(crate) fn activate_address_space(user_token: usize) {
    let ptr = ACTIVATE_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `ActivateFn` pointers are ever stored.
    let f: ActivateFn = unsafe { core::mem::transmute(ptr) };
    f(user_token)
}
