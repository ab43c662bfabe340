use alloc::borrow::Cow;
use core::fmt::{Debug, Display};

/// Error types used throughout the `macho_rebind` library.
///
/// Only [`Error::Alloc`] ever reaches the caller of a registration. The other
/// variants describe per-image and per-section problems that are logged and
/// skipped so that one odd image never stops the rest of the process from
/// being rebound.
#[derive(Debug)]
pub enum Error {
    /// The registry could not allocate storage for a new batch.
    ///
    /// Registration is atomic: when this is returned nothing was linked in.
    Alloc {
        /// A descriptive message about the allocation failure.
        msg: Cow<'static, str>,
    },

    /// A memory protection query or change failed.
    ///
    /// This error typically indicates issues such as:
    /// * The page containing a pointer section is not mapped
    /// * The kernel refused to make a read-only page writable
    /// * The previous protection could not be restored
    Mmap {
        /// A descriptive message about the protection error.
        msg: Cow<'static, str>,
    },

    /// The image does not carry the layout metadata needed for rebinding.
    ///
    /// This error typically indicates issues such as:
    /// * A header magic that does not match the host's Mach-O class
    /// * A load command whose declared size runs past the command area
    /// * A missing `__LINKEDIT`, `LC_SYMTAB` or `LC_DYSYMTAB`
    ParseLayout {
        /// A descriptive message about the layout problem.
        msg: Cow<'static, str>,
    },
}

impl Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Alloc { msg } => write!(f, "Allocation error: {msg}"),
            Error::Mmap { msg } => write!(f, "Memory protection error: {msg}"),
            Error::ParseLayout { msg } => write!(f, "Image layout error: {msg}"),
        }
    }
}

impl core::error::Error for Error {}

/// Creates an allocation error with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn alloc_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Alloc { msg: msg.into() }
}

/// Creates a memory protection error with the specified message.
///
/// Public so that custom [`Mmap`](crate::mmap::Mmap) backends can report
/// failures the same way the built-in ones do.
#[cold]
#[inline(never)]
pub fn mmap_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Mmap { msg: msg.into() }
}

/// Creates an image layout error with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn parse_layout_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::ParseLayout { msg: msg.into() }
}
