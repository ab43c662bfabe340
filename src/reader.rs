//! Bounds-checked access to in-memory Mach-O records
//!
//! The loader hands us nothing but a header address. Everything past it is
//! decoded from byte slices whose extent comes from the image's own declared
//! sizes (`sizeofcmds`, `cmdsize`, `nsyms`, ...). Every read checks that the
//! requested record fits in the slice, so a malformed image yields `None`
//! instead of a read past the metadata it describes.

/// A native-endian view over a region of a loaded image.
#[derive(Clone, Copy)]
pub(crate) struct Bytes<'a>(&'a [u8]);

impl<'a> Bytes<'a> {
    #[inline]
    pub(crate) const fn new(data: &'a [u8]) -> Self {
        Bytes(data)
    }

    /// Builds a view over `len` bytes starting at `addr`.
    ///
    /// # Safety
    /// `addr..addr + len` must be mapped and readable for `'a`.
    #[inline]
    pub(crate) unsafe fn from_raw(addr: usize, len: usize) -> Self {
        if len == 0 {
            return Bytes(&[]);
        }
        Bytes(unsafe { core::slice::from_raw_parts(addr as *const u8, len) })
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns the sub-view `offset..offset + len`.
    #[inline]
    pub(crate) fn sub(&self, offset: usize, len: usize) -> Option<Bytes<'a>> {
        let end = offset.checked_add(len)?;
        self.0.get(offset..end).map(Bytes)
    }

    #[inline]
    pub(crate) fn read_u32(&self, offset: usize) -> Option<u32> {
        let bytes = self.sub(offset, 4)?.0;
        Some(u32::from_ne_bytes(bytes.try_into().ok()?))
    }

    /// Reads a pointer-width field (`u64` on 64-bit hosts, `u32` otherwise).
    #[inline]
    pub(crate) fn read_word(&self, offset: usize) -> Option<usize> {
        const WORD: usize = size_of::<usize>();
        let bytes = self.sub(offset, WORD)?.0;
        Some(usize::from_ne_bytes(bytes.try_into().ok()?))
    }

    /// Reads a fixed-width, NUL-padded name such as `segname`.
    #[inline]
    pub(crate) fn read_fixed_name(&self, offset: usize, width: usize) -> Option<&'a [u8]> {
        let raw = self.sub(offset, width)?.0;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Some(&raw[..end])
    }

    /// Reads a NUL-terminated string starting at `offset`.
    ///
    /// The terminator must lie inside the view.
    #[inline]
    pub(crate) fn read_cstr(&self, offset: usize) -> Option<&'a [u8]> {
        let tail = self.0.get(offset..)?;
        let end = tail.iter().position(|&b| b == 0)?;
        Some(&tail[..end])
    }
}
