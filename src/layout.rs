//! Locating the symbol tables and pointer sections of a loaded image
//!
//! A mapped Mach-O image starts with its header followed by `sizeofcmds`
//! bytes of load commands. Three of them matter here: the `__LINKEDIT`
//! segment, `LC_SYMTAB` and `LC_DYSYMTAB`. The offsets they record are file
//! offsets into `__LINKEDIT`; rebasing them with
//! `slide + linkedit.vmaddr - linkedit.fileoff` gives their runtime address.
//! The candidate slots live in the lazy and non-lazy symbol pointer sections
//! of `__DATA` and `__DATA_CONST`.

use crate::{
    Result,
    dyld::LoadedImage,
    error::parse_layout_error,
    macho::*,
    reader::Bytes,
};

/// One load command, bounded by its declared `cmdsize`.
#[derive(Clone, Copy)]
struct LoadCommand<'a> {
    cmd: u32,
    data: Bytes<'a>,
}

/// Walks the load command area, advancing by each command's `cmdsize`.
struct LoadCommands<'a> {
    rest: Bytes<'a>,
    remaining: u32,
}

impl<'a> Iterator for LoadCommands<'a> {
    type Item = Result<LoadCommand<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let parsed = self.parse_next();
        if parsed.is_err() {
            self.remaining = 0;
        }
        Some(parsed)
    }
}

impl<'a> LoadCommands<'a> {
    fn parse_next(&mut self) -> Result<LoadCommand<'a>> {
        let cmd = self
            .rest
            .read_u32(0)
            .ok_or_else(|| parse_layout_error("load command past sizeofcmds"))?;
        let cmdsize = self.rest.read_u32(4).unwrap_or(0) as usize;
        if cmdsize < LOAD_COMMAND_SIZE {
            return Err(parse_layout_error("load command smaller than its header"));
        }
        let data = self
            .rest
            .sub(0, cmdsize)
            .ok_or_else(|| parse_layout_error("load command runs past sizeofcmds"))?;
        self.rest = self
            .rest
            .sub(cmdsize, self.rest.len() - cmdsize)
            .unwrap_or(Bytes::new(&[]));
        Ok(LoadCommand { cmd, data })
    }
}

impl<'a> LoadCommand<'a> {
    fn segment_name(&self) -> Option<&'a [u8]> {
        if self.cmd != LC_SEGMENT {
            return None;
        }
        self.data.read_fixed_name(SEGMENT_SEGNAME, NAME_SIZE)
    }

    fn require(&self, size: usize, what: &'static str) -> Result<()> {
        if self.data.len() < size {
            return Err(parse_layout_error(what));
        }
        Ok(())
    }

    /// Decodes the section records that follow a segment command.
    fn sections(&self) -> impl Iterator<Item = PointerSection<'a>> + use<'a> {
        let nsects = self.data.read_u32(SEGMENT_NSECTS).unwrap_or(0) as usize;
        let records = nsects
            .checked_mul(SECTION_SIZE)
            .and_then(|len| self.data.sub(SEGMENT_COMMAND_SIZE, len));
        #[cfg(feature = "log")]
        if records.is_none() {
            log::debug!("[Layout] segment declares {} sections past its cmdsize", nsects);
        }
        let count = if records.is_some() { nsects } else { 0 };
        let records = records.unwrap_or(Bytes::new(&[]));
        (0..count).filter_map(move |j| {
            PointerSection::decode(records.sub(j * SECTION_SIZE, SECTION_SIZE)?)
        })
    }
}

/// A lazy or non-lazy symbol pointer section.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PointerSection<'a> {
    segname: &'a [u8],
    addr: usize,
    size: usize,
    flags: u32,
    /// Index of the section's first slot in the indirect symbol table.
    reserved1: u32,
}

impl<'a> PointerSection<'a> {
    fn decode(record: Bytes<'a>) -> Option<Self> {
        Some(PointerSection {
            segname: record.read_fixed_name(SECTION_SEGNAME, NAME_SIZE)?,
            addr: record.read_word(SECTION_ADDR)?,
            size: record.read_word(SECTION_SIZE_FIELD)?,
            flags: record.read_u32(SECTION_FLAGS)?,
            reserved1: record.read_u32(SECTION_RESERVED1)?,
        })
    }

    /// Whether the section lives in the segment dyld makes read-only after binding.
    #[inline]
    pub(crate) fn is_data_const(&self) -> bool {
        self.segname == SEG_DATA_CONST.as_bytes()
    }

    /// Runtime address of the first slot.
    #[inline]
    pub(crate) fn runtime_addr(&self, slide: isize) -> usize {
        self.addr.wrapping_add_signed(slide)
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub(crate) fn first_indirect_index(&self) -> usize {
        self.reserved1 as usize
    }
}

/// The symbol, string and indirect symbol tables of one image.
pub(crate) struct SymbolTables<'a> {
    symbols: Bytes<'a>,
    strings: Bytes<'a>,
    indirect: Bytes<'a>,
}

impl<'a> SymbolTables<'a> {
    /// Symbol table index recorded for the indirect entry `index`.
    #[inline]
    pub(crate) fn indirect_symbol(&self, index: usize) -> Option<u32> {
        self.indirect.read_u32(index.checked_mul(INDIRECT_ENTRY_SIZE)?)
    }

    /// Raw name of symbol `index`, including the leading ABI prefix.
    #[inline]
    pub(crate) fn symbol_name(&self, index: u32) -> Option<&'a [u8]> {
        let record = self
            .symbols
            .sub((index as usize).checked_mul(NLIST_SIZE)?, NLIST_SIZE)?;
        let strx = record.read_u32(NLIST_STRX)? as usize;
        self.strings.read_cstr(strx)
    }
}

/// The decoded layout of one loaded image.
pub(crate) struct ImageLayout<'a> {
    commands: Bytes<'a>,
    ncmds: u32,
    tables: SymbolTables<'a>,
}

impl<'a> ImageLayout<'a> {
    /// Decodes the layout of `image`.
    ///
    /// # Safety
    /// `image.base()` must be the header of a Mach-O image mapped in this
    /// process, and its linkedit tables must be mapped at the addresses its
    /// load commands describe.
    pub(crate) unsafe fn parse(image: &LoadedImage) -> Result<Self> {
        let base = image.base();
        if base == 0 {
            return Err(parse_layout_error("null image header"));
        }
        let header = unsafe { Bytes::from_raw(base, HEADER_SIZE) };
        if header.read_u32(0) != Some(MH_MAGIC) {
            return Err(parse_layout_error("header magic does not match the host"));
        }
        let ncmds = header.read_u32(HEADER_NCMDS).unwrap_or(0);
        let sizeofcmds = header.read_u32(HEADER_SIZEOFCMDS).unwrap_or(0) as usize;
        let commands = unsafe { Bytes::from_raw(base + HEADER_SIZE, sizeofcmds) };

        let mut linkedit = None;
        let mut symtab = None;
        let mut dysymtab = None;
        for command in (LoadCommands {
            rest: commands,
            remaining: ncmds,
        }) {
            let command = command?;
            match command.cmd {
                LC_SEGMENT => {
                    if command.segment_name() == Some(SEG_LINKEDIT.as_bytes()) {
                        command.require(SEGMENT_COMMAND_SIZE, "truncated __LINKEDIT segment")?;
                        linkedit = Some(command);
                    }
                }
                LC_SYMTAB => {
                    command.require(SYMTAB_COMMAND_SIZE, "truncated LC_SYMTAB")?;
                    symtab = Some(command);
                }
                LC_DYSYMTAB => {
                    command.require(DYSYMTAB_COMMAND_SIZE, "truncated LC_DYSYMTAB")?;
                    dysymtab = Some(command);
                }
                _ => {}
            }
        }

        let linkedit = linkedit.ok_or_else(|| parse_layout_error("missing __LINKEDIT"))?;
        let symtab = symtab.ok_or_else(|| parse_layout_error("missing LC_SYMTAB"))?;
        let dysymtab = dysymtab.ok_or_else(|| parse_layout_error("missing LC_DYSYMTAB"))?;

        let nindirectsyms = field(dysymtab, DYSYMTAB_NINDIRECTSYMS) as usize;
        if nindirectsyms == 0 {
            return Err(parse_layout_error("no indirect symbols"));
        }

        let vmaddr = linkedit.data.read_word(SEGMENT_VMADDR).unwrap_or(0);
        let fileoff = linkedit.data.read_word(SEGMENT_FILEOFF).unwrap_or(0);
        let table_base = vmaddr.wrapping_add_signed(image.slide()).wrapping_sub(fileoff);

        let symoff = field(symtab, SYMTAB_SYMOFF) as usize;
        let nsyms = field(symtab, SYMTAB_NSYMS) as usize;
        let stroff = field(symtab, SYMTAB_STROFF) as usize;
        let strsize = field(symtab, SYMTAB_STRSIZE) as usize;
        let indirectsymoff = field(dysymtab, DYSYMTAB_INDIRECTSYMOFF) as usize;

        let symbols_len = nsyms
            .checked_mul(NLIST_SIZE)
            .ok_or_else(|| parse_layout_error("symbol table size overflows"))?;
        let indirect_len = nindirectsyms
            .checked_mul(INDIRECT_ENTRY_SIZE)
            .ok_or_else(|| parse_layout_error("indirect symbol table size overflows"))?;

        #[cfg(feature = "log")]
        log::trace!(
            "[Layout] image: 0x{:x}, slide: 0x{:x}, linkedit base: 0x{:x}, nsyms: {}, strsize: {}, nindirectsyms: {}",
            base,
            image.slide(),
            table_base,
            nsyms,
            strsize,
            nindirectsyms
        );

        let tables = unsafe {
            SymbolTables {
                symbols: Bytes::from_raw(table_base.wrapping_add(symoff), symbols_len),
                strings: Bytes::from_raw(table_base.wrapping_add(stroff), strsize),
                indirect: Bytes::from_raw(table_base.wrapping_add(indirectsymoff), indirect_len),
            }
        };

        Ok(ImageLayout {
            commands,
            ncmds,
            tables,
        })
    }

    #[inline]
    pub(crate) fn tables(&self) -> &SymbolTables<'a> {
        &self.tables
    }

    /// Every lazy and non-lazy symbol pointer section in `__DATA` and `__DATA_CONST`.
    pub(crate) fn pointer_sections(&self) -> impl Iterator<Item = PointerSection<'a>> + use<'a> {
        LoadCommands {
            rest: self.commands,
            remaining: self.ncmds,
        }
        .filter_map(Result::ok)
        .filter(|command| {
            command.segment_name().is_some_and(|name| {
                name == SEG_DATA.as_bytes() || name == SEG_DATA_CONST.as_bytes()
            })
        })
        .flat_map(|segment| segment.sections())
        .filter(|section| is_symbol_pointer_section(section.flags))
    }
}

#[inline]
fn field(command: LoadCommand<'_>, offset: usize) -> u32 {
    // Sizes were checked with `require` when the command was picked up.
    command.data.read_u32(offset).unwrap_or(0)
}
