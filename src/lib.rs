//! # macho_rebind
//! Rebind dynamically linked symbols in a running Mach-O process.
//!
//! Calls an image makes into other images go through pointer slots that
//! dyld fills in: the lazy and non-lazy symbol pointer sections of `__DATA`
//! and `__DATA_CONST`. This crate finds the slots bound to a given symbol in
//! every loaded image and overwrites them with a replacement, optionally
//! handing back the previously bound address so the replacement can forward
//! to it. Nothing on disk is touched.
//!
//! ## Usage
//! Global rebindings are registered once and stay in force for the life of
//! the process, including for images loaded later. One-image rebindings patch
//! exactly the image given and leave no state behind.
//!
//! ```rust,ignore
//! use core::sync::atomic::AtomicPtr;
//! use macho_rebind::{Rebinding, rebind_symbols};
//!
//! static ORIGINAL_CLOSE: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());
//!
//! extern "C" fn my_close(fd: i32) -> i32 {
//!     let original: extern "C" fn(i32) -> i32 =
//!         unsafe { core::mem::transmute(ORIGINAL_CLOSE.load(core::sync::atomic::Ordering::Acquire)) };
//!     original(fd)
//! }
//!
//! unsafe {
//!     rebind_symbols(&[
//!         Rebinding::new("close", my_close as *const ()).with_replaced(&ORIGINAL_CLOSE),
//!     ])
//! }
//! .unwrap();
//! ```
//!
//! ## Platforms
//! The loader and protection primitives are abstracted behind the
//! [`dyld::Dyld`] and [`mmap::Mmap`] traits. Apple targets get
//! `dyld::DefaultDyld` and `mmap::DefaultMmap`; elsewhere both backends have
//! to be supplied by the caller.
#![no_std]
extern crate alloc;

pub mod dyld;
mod error;
mod layout;
mod macho;
pub mod mmap;
mod os;
mod patch;
mod reader;
mod rebinder;
mod registry;

pub use error::{Error, mmap_error};
pub use rebinder::{NotifierState, Rebinder, notifier_state};
pub use registry::Rebinding;

/// The result type used throughout this crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Rebinds `rebindings` in every image loaded now or later.
///
/// Shorthand for [`Rebinder::register`] with the default dyld and mach
/// backends.
///
/// # Safety
/// See [`Rebinder::register`].
#[cfg(target_vendor = "apple")]
pub unsafe fn rebind_symbols(rebindings: &[Rebinding<'static>]) -> Result<()> {
    unsafe { Rebinder::<dyld::DefaultDyld, mmap::DefaultMmap>::new().register(rebindings) }
}

/// Rebinds `rebindings` in the single image whose header is at `header`.
///
/// Shorthand for [`Rebinder::register_for_image`] with the default dyld and
/// mach backends.
///
/// # Safety
/// See [`Rebinder::register_for_image`].
#[cfg(target_vendor = "apple")]
pub unsafe fn rebind_symbols_image(
    header: *const core::ffi::c_void,
    slide: isize,
    rebindings: &[Rebinding<'_>],
) -> Result<()> {
    unsafe {
        Rebinder::<dyld::DefaultDyld, mmap::DefaultMmap>::new()
            .register_for_image(dyld::LoadedImage::new(header, slide), rebindings)
    }
}
