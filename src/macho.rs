//! Mach-O format definitions for the host pointer width.
//!
//! Images rebound by this crate are always mapped into the current process, so
//! their class always matches the host: 64-bit hosts only ever see
//! `mach_header_64`/`LC_SEGMENT_64`/`section_64`/`nlist_64`, 32-bit hosts only
//! the narrow variants. The record layouts below are decoded field by field
//! through [`Bytes`](crate::reader::Bytes) instead of being reinterpreted in
//! place.

pub(crate) use object::macho::{
    INDIRECT_SYMBOL_ABS, INDIRECT_SYMBOL_LOCAL, LC_DYSYMTAB, LC_SYMTAB, S_LAZY_SYMBOL_POINTERS,
    S_NON_LAZY_SYMBOL_POINTERS, SECTION_TYPE, SEG_DATA, SEG_LINKEDIT,
};

/// Segment that holds pointers made read-only once dyld finishes binding.
pub(crate) const SEG_DATA_CONST: &str = "__DATA_CONST";

/// Size of the fixed part shared by every load command (`cmd`, `cmdsize`).
pub(crate) const LOAD_COMMAND_SIZE: usize = 8;

/// `symtab_command`
pub(crate) const SYMTAB_COMMAND_SIZE: usize = 24;
pub(crate) const SYMTAB_SYMOFF: usize = 8;
pub(crate) const SYMTAB_NSYMS: usize = 12;
pub(crate) const SYMTAB_STROFF: usize = 16;
pub(crate) const SYMTAB_STRSIZE: usize = 20;

/// `dysymtab_command`
pub(crate) const DYSYMTAB_COMMAND_SIZE: usize = 80;
pub(crate) const DYSYMTAB_INDIRECTSYMOFF: usize = 56;
pub(crate) const DYSYMTAB_NINDIRECTSYMS: usize = 60;

/// Offset of the 16-byte segment name in both segment command layouts.
pub(crate) const SEGMENT_SEGNAME: usize = 8;
/// Offset of the 16-byte segment name in both section layouts.
pub(crate) const SECTION_SEGNAME: usize = 16;
/// Width of the fixed, NUL-padded name fields.
pub(crate) const NAME_SIZE: usize = 16;

/// Offset of `n_strx` in both nlist layouts.
pub(crate) const NLIST_STRX: usize = 0;

/// Size of one entry in the indirect symbol table.
pub(crate) const INDIRECT_ENTRY_SIZE: usize = 4;

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        pub(crate) const MH_MAGIC: u32 = object::macho::MH_MAGIC_64;
        pub(crate) const LC_SEGMENT: u32 = object::macho::LC_SEGMENT_64;

        /// `mach_header_64`
        pub(crate) const HEADER_SIZE: usize = 32;

        /// `segment_command_64`
        pub(crate) const SEGMENT_COMMAND_SIZE: usize = 72;
        pub(crate) const SEGMENT_VMADDR: usize = 24;
        pub(crate) const SEGMENT_FILEOFF: usize = 40;
        pub(crate) const SEGMENT_NSECTS: usize = 64;

        /// `section_64`
        pub(crate) const SECTION_SIZE: usize = 80;
        pub(crate) const SECTION_ADDR: usize = 32;
        pub(crate) const SECTION_SIZE_FIELD: usize = 40;
        pub(crate) const SECTION_FLAGS: usize = 64;
        pub(crate) const SECTION_RESERVED1: usize = 68;

        /// `nlist_64`
        pub(crate) const NLIST_SIZE: usize = 16;
    } else {
        pub(crate) const MH_MAGIC: u32 = object::macho::MH_MAGIC;
        pub(crate) const LC_SEGMENT: u32 = object::macho::LC_SEGMENT;

        /// `mach_header`
        pub(crate) const HEADER_SIZE: usize = 28;

        /// `segment_command`
        pub(crate) const SEGMENT_COMMAND_SIZE: usize = 56;
        pub(crate) const SEGMENT_VMADDR: usize = 24;
        pub(crate) const SEGMENT_FILEOFF: usize = 32;
        pub(crate) const SEGMENT_NSECTS: usize = 48;

        /// `section`
        pub(crate) const SECTION_SIZE: usize = 68;
        pub(crate) const SECTION_ADDR: usize = 32;
        pub(crate) const SECTION_SIZE_FIELD: usize = 36;
        pub(crate) const SECTION_FLAGS: usize = 56;
        pub(crate) const SECTION_RESERVED1: usize = 60;

        /// `nlist`
        pub(crate) const NLIST_SIZE: usize = 12;
    }
}

/// Offset of `ncmds` in the header (same for both classes).
pub(crate) const HEADER_NCMDS: usize = 16;
/// Offset of `sizeofcmds` in the header (same for both classes).
pub(crate) const HEADER_SIZEOFCMDS: usize = 20;

/// Whether an indirect symbol table entry names no importable symbol.
#[inline]
pub(crate) fn is_unnamed_indirect(index: u32) -> bool {
    index == INDIRECT_SYMBOL_ABS
        || index == INDIRECT_SYMBOL_LOCAL
        || index == (INDIRECT_SYMBOL_LOCAL | INDIRECT_SYMBOL_ABS)
}

/// Whether a section's type tag marks it as a lazy or non-lazy symbol pointer section.
#[inline]
pub(crate) fn is_symbol_pointer_section(flags: u32) -> bool {
    let ty = flags & SECTION_TYPE;
    ty == S_LAZY_SYMBOL_POINTERS || ty == S_NON_LAZY_SYMBOL_POINTERS
}
