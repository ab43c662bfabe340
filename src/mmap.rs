//! Memory protection operations used while patching pointer sections
//!
//! Pointer sections in `__DATA_CONST` are mapped read-only once dyld finishes
//! binding. Rewriting a slot there needs a read probe of the current
//! protection, a temporary switch to read-write and a restore of exactly the
//! flags observed before. This module abstracts those primitives so that the
//! patcher works the same on every platform and can be driven by a fake
//! backend in tests.
//!
//! # Safety
//! Changing page protection affects every user of those pages in the process.
//! Callers must restore what they change and must not remove permissions from
//! memory they do not own.

#[cfg(target_vendor = "apple")]
pub use crate::os::DefaultMmap;

use crate::Result;
use bitflags::bitflags;
use core::{
    ffi::{c_int, c_void},
    ptr::NonNull,
};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    /// Memory protection flags for controlling access permissions.
    ///
    /// These flags determine what operations can be performed on a mapped memory region.
    /// They can be combined using bitwise OR operations.
    pub struct ProtFlags: c_int {
        /// No access allowed.
        const PROT_NONE = 0;

        /// Allow reading from the memory region.
        const PROT_READ = 1;

        /// Allow writing to the memory region.
        const PROT_WRITE = 2;

        /// Allow executing code in the memory region.
        const PROT_EXEC = 4;
    }
}

/// A trait for the page protection primitives the patcher relies on.
///
/// # Example
/// ```rust,ignore
/// struct MyMmap;
///
/// impl Mmap for MyMmap {
///     fn page_size() -> usize {
///         0x4000
///     }
///
///     unsafe fn protection(addr: usize) -> Result<ProtFlags> {
///         // Platform-specific implementation
///         todo!()
///     }
///
///     unsafe fn mprotect(addr: NonNull<c_void>, len: usize, prot: ProtFlags) -> Result<()> {
///         todo!()
///     }
/// }
/// ```
pub trait Mmap {
    /// Returns the page size protection changes are rounded to.
    fn page_size() -> usize;

    /// Queries the protection of the page containing `addr`.
    ///
    /// # Safety
    /// `addr` must point into the address space of the current process.
    unsafe fn protection(addr: usize) -> Result<ProtFlags>;

    /// Changes the protection of a memory region.
    ///
    /// # Arguments
    /// * `addr` - Pointer to the start of the region (page-aligned).
    /// * `len` - Size of the region in bytes (a multiple of [`Mmap::page_size`]).
    /// * `prot` - New protection flags to apply.
    ///
    /// # Safety
    /// Changing permissions can affect running code. `addr` must be page-aligned
    /// and the whole range must belong to a single loaded image.
    unsafe fn mprotect(addr: NonNull<c_void>, len: usize, prot: ProtFlags) -> Result<()>;
}

/// Rounds `addr..addr + len` out to page boundaries, returning `(start, len)`.
///
/// Returns `None` when the rounded range does not fit in the address space.
#[inline]
pub(crate) fn page_range(addr: usize, len: usize, page_size: usize) -> Option<(usize, usize)> {
    debug_assert!(page_size.is_power_of_two());
    let mask = !(page_size - 1);
    let start = addr & mask;
    let end = addr
        .checked_add(len.max(1))?
        .checked_add(page_size - 1)?
        & mask;
    Some((start, end - start))
}
