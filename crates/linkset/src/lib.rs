//! Safe wrappers for linker-section-based data.
//!
//! This crate encapsulates the unsafe patterns required to read typed data
//! from linker sections behind safe declarative macros:
//!
//! - [`declare_linkset!`] — declares a function that returns a typed
//!   `&'static [T]` from a linker section bounded by
//!   `__<section>_start` / `__<section>_end` symbols.
//! - [`linkset_entry!`] — places a typed static into the matching linker
//!   section.
//!
//! The kernel test harness uses this to collect its test descriptors
//! without a central registration list.

#![no_std]
#![warn(missing_docs)]

/// Declares a function that returns a typed slice from a linker section.
///
/// The linker script must define `__<section>_start` and `__<section>_end`
/// symbols bounding the section.
///
/// # Examples
///
/// ```ignore
/// muon_linkset::declare_linkset! {
///     /// Returns all registered kernel test descriptors.
///     pub fn kernel_test_entries() -> [KernelTestDescriptor],
///     section = "muon_kernel_tests"
/// }
/// ```
#[macro_export]
macro_rules! declare_linkset {
    (
        $(#[$meta:meta])*
        $vis:vis fn $name:ident() -> [$ty:ty],
        section = $section:literal
    ) => {
        $(#[$meta])*
        $vis fn $name() -> &'static [$ty] {
            unsafe extern "C" {
                #[link_name = concat!("__", $section, "_start")]
                static LINKSET_START: u8;
                #[link_name = concat!("__", $section, "_end")]
                static LINKSET_END: u8;
            }

            // SAFETY: The linker script defines these symbols at the boundaries
            // of the named section. The section contains only `T` values placed
            // by `linkset_entry!`. The symbols remain valid for the lifetime of
            // the kernel image.
            unsafe {
                let start = ::core::ptr::addr_of!(LINKSET_START).cast::<$ty>();
                let end = ::core::ptr::addr_of!(LINKSET_END).cast::<$ty>();
                let count = end.offset_from(start) as usize;
                if count == 0 {
                    return &[];
                }
                ::core::slice::from_raw_parts(start, count)
            }
        }
    };
}

/// Places a typed static into the named linker section.
///
/// # Examples
///
/// ```ignore
/// muon_linkset::linkset_entry!("muon_kernel_tests",
///     ALARM_SINGLE: KernelTestDescriptor = KernelTestDescriptor { ... }
/// );
/// ```
#[macro_export]
macro_rules! linkset_entry {
    ($section:literal, $name:ident : $ty:ty = $expr:expr) => {
        #[used]
        #[unsafe(link_section = concat!(".", $section))]
        static $name: $ty = $expr;
    };
}
