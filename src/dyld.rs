//! The dynamic loader services consumed by the rebinder

#[cfg(target_vendor = "apple")]
pub use crate::os::DefaultDyld;

use core::ffi::c_void;

/// Callback invoked by the loader once per mapped image.
///
/// The signature matches dyld's `_dyld_register_func_for_add_image`:
/// the image's `mach_header` address and its slide.
pub type AddImageCallback = extern "C" fn(header: *const c_void, slide: isize);

/// An image mapped into the current process.
///
/// The image is owned by the host process; this crate only reads its metadata
/// and rewrites its symbol pointer slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadedImage {
    base: usize,
    slide: isize,
}

impl LoadedImage {
    /// Creates an image from its header address and load-time slide.
    #[inline]
    pub fn new(header: *const c_void, slide: isize) -> Self {
        LoadedImage {
            base: header as usize,
            slide,
        }
    }

    /// Address of the image's `mach_header`.
    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Offset added to every file-relative virtual address of the image.
    #[inline]
    pub fn slide(&self) -> isize {
        self.slide
    }
}

/// A trait for the loader services the rebinder needs.
///
/// On Apple platforms [`DefaultDyld`] forwards to the `_dyld_*` functions.
/// Other implementations exist mostly for testing with synthetic images.
pub trait Dyld {
    /// Number of images currently loaded.
    fn image_count() -> u32;

    /// The image at `index`, or `None` if it went away.
    fn image(index: u32) -> Option<LoadedImage>;

    /// Subscribes `callback` for every future image load.
    ///
    /// Implementations must also invoke `callback` synchronously, once per
    /// image that is already loaded, before returning.
    fn register_add_image(callback: AddImageCallback);

    /// Whether `addr` belongs to an image the loader knows about.
    fn contains(addr: usize) -> bool;
}
