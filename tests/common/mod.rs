#![allow(dead_code)]

use macho_rebind::{
    Result,
    dyld::{AddImageCallback, Dyld, LoadedImage},
    mmap::{Mmap, ProtFlags},
    mmap_error,
};
use object::macho::{
    INDIRECT_SYMBOL_ABS, INDIRECT_SYMBOL_LOCAL, LC_DYSYMTAB, LC_SEGMENT_64, LC_SYMTAB, MH_DYLIB,
    MH_MAGIC_64, N_EXT, N_UNDF, SEG_LINKEDIT,
};
use std::{
    cell::{Cell, RefCell},
    ffi::c_void,
    ptr::NonNull,
    sync::Mutex,
};

pub use object::macho::{
    S_LAZY_SYMBOL_POINTERS as LAZY, S_NON_LAZY_SYMBOL_POINTERS as NON_LAZY, SEG_DATA,
};
pub const SEG_DATA_CONST: &str = "__DATA_CONST";

pub const PAGE_SIZE: usize = 4096;

const HEADER_SIZE: usize = 32;
const SEGMENT_SIZE: usize = 72;
const SECTION_SIZE: usize = 80;
const SYMTAB_SIZE: usize = 24;
const DYSYMTAB_SIZE: usize = 80;
const NLIST_SIZE: usize = 16;

/// One pointer slot of a synthetic section.
#[derive(Clone, Copy, Debug)]
pub enum Slot {
    /// Bound to `_name`, currently holding `value`.
    Import(&'static str, usize),
    /// Bound to a symbol whose recorded name is exactly the given bytes.
    Raw(&'static str, usize),
    /// An `INDIRECT_SYMBOL_LOCAL` entry.
    Local(usize),
    /// An `INDIRECT_SYMBOL_ABS` entry.
    Abs(usize),
}

impl Slot {
    fn value(&self) -> usize {
        match *self {
            Slot::Import(_, value) | Slot::Raw(_, value) | Slot::Local(value) | Slot::Abs(value) => {
                value
            }
        }
    }
}

struct SectionSpec {
    segname: &'static str,
    kind: u32,
    slots: Vec<Slot>,
}

/// Lays out a 64-bit Mach-O image in memory the way dyld leaves one mapped.
///
/// Every segment uses vmaddr == file offset == buffer offset, so the slide of
/// the built image is its buffer address.
#[derive(Default)]
pub struct ImageBuilder {
    sections: Vec<SectionSpec>,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn section(mut self, segname: &'static str, kind: u32, slots: &[Slot]) -> Self {
        self.sections.push(SectionSpec {
            segname,
            kind,
            slots: slots.to_vec(),
        });
        self
    }

    pub fn build(self) -> Image {
        // Segments in first-seen order, each with the sections that name it.
        let mut segments: Vec<(&'static str, Vec<usize>)> = Vec::new();
        for (idx, section) in self.sections.iter().enumerate() {
            match segments.iter_mut().find(|(name, _)| *name == section.segname) {
                Some((_, members)) => members.push(idx),
                None => segments.push((section.segname, vec![idx])),
            }
        }

        let mut strings = b" \0".to_vec();
        let mut symbols: Vec<(Vec<u8>, u32)> = Vec::new();
        let mut indirect: Vec<u32> = Vec::new();
        let mut first_indirect = Vec::new();
        for section in &self.sections {
            first_indirect.push(indirect.len() as u32);
            for slot in &section.slots {
                let raw = match *slot {
                    Slot::Import(name, _) => format!("_{name}").into_bytes(),
                    Slot::Raw(name, _) => name.as_bytes().to_vec(),
                    Slot::Local(_) => {
                        indirect.push(INDIRECT_SYMBOL_LOCAL);
                        continue;
                    }
                    Slot::Abs(_) => {
                        indirect.push(INDIRECT_SYMBOL_ABS);
                        continue;
                    }
                };
                let index = match symbols.iter().position(|(name, _)| *name == raw) {
                    Some(index) => index,
                    None => {
                        let strx = strings.len() as u32;
                        strings.extend_from_slice(&raw);
                        strings.push(0);
                        symbols.push((raw, strx));
                        symbols.len() - 1
                    }
                };
                indirect.push(index as u32);
            }
        }

        let sizeofcmds = segments
            .iter()
            .map(|(_, members)| SEGMENT_SIZE + SECTION_SIZE * members.len())
            .sum::<usize>()
            + SEGMENT_SIZE
            + SYMTAB_SIZE
            + DYSYMTAB_SIZE;
        let ncmds = segments.len() + 3;

        let mut cursor = align8(HEADER_SIZE + sizeofcmds);
        let mut slot_offsets = Vec::new();
        for section in &self.sections {
            slot_offsets.push(cursor);
            cursor += section.slots.len() * 8;
        }
        let linkedit = align8(cursor);
        let symoff = linkedit;
        let indirectsymoff = symoff + symbols.len() * NLIST_SIZE;
        let stroff = indirectsymoff + indirect.len() * 4;
        let total = align8(stroff + strings.len());

        let mut w = Writer(vec![0; total]);
        w.u32(0, MH_MAGIC_64);
        w.u32(12, MH_DYLIB);
        w.u32(16, ncmds as u32);
        w.u32(20, sizeofcmds as u32);

        let mut records = vec![0; self.sections.len()];
        let mut at = HEADER_SIZE;
        for (segname, members) in &segments {
            let cmdsize = SEGMENT_SIZE + SECTION_SIZE * members.len();
            w.u32(at, LC_SEGMENT_64);
            w.u32(at + 4, cmdsize as u32);
            w.name(at + 8, segname);
            let lo = members.iter().map(|&i| slot_offsets[i]).min().unwrap_or(0);
            let hi = members
                .iter()
                .map(|&i| slot_offsets[i] + self.sections[i].slots.len() * 8)
                .max()
                .unwrap_or(0);
            w.u64(at + 24, lo as u64);
            w.u64(at + 32, (hi - lo) as u64);
            w.u64(at + 40, lo as u64);
            w.u64(at + 48, (hi - lo) as u64);
            w.u32(at + 56, 3);
            w.u32(at + 60, 3);
            w.u32(at + 64, members.len() as u32);
            let mut sect = at + SEGMENT_SIZE;
            for &i in members {
                let section = &self.sections[i];
                records[i] = sect;
                w.name(sect, "__ptrs");
                w.name(sect + 16, segname);
                w.u64(sect + 32, slot_offsets[i] as u64);
                w.u64(sect + 40, (section.slots.len() * 8) as u64);
                w.u32(sect + 48, slot_offsets[i] as u32);
                w.u32(sect + 52, 3);
                w.u32(sect + 64, section.kind);
                w.u32(sect + 68, first_indirect[i]);
                for (j, slot) in section.slots.iter().enumerate() {
                    w.u64(slot_offsets[i] + j * 8, slot.value() as u64);
                }
                sect += SECTION_SIZE;
            }
            at += cmdsize;
        }

        w.u32(at, LC_SEGMENT_64);
        w.u32(at + 4, SEGMENT_SIZE as u32);
        w.name(at + 8, SEG_LINKEDIT);
        w.u64(at + 24, linkedit as u64);
        w.u64(at + 32, (total - linkedit) as u64);
        w.u64(at + 40, linkedit as u64);
        w.u64(at + 48, (total - linkedit) as u64);
        w.u32(at + 56, 1);
        w.u32(at + 60, 1);
        at += SEGMENT_SIZE;

        w.u32(at, LC_SYMTAB);
        w.u32(at + 4, SYMTAB_SIZE as u32);
        w.u32(at + 8, symoff as u32);
        w.u32(at + 12, symbols.len() as u32);
        w.u32(at + 16, stroff as u32);
        w.u32(at + 20, strings.len() as u32);
        at += SYMTAB_SIZE;

        w.u32(at, LC_DYSYMTAB);
        w.u32(at + 4, DYSYMTAB_SIZE as u32);
        w.u32(at + 56, indirectsymoff as u32);
        w.u32(at + 60, indirect.len() as u32);

        for (i, (_, strx)) in symbols.iter().enumerate() {
            let nlist = symoff + i * NLIST_SIZE;
            w.u32(nlist, *strx);
            w.0[nlist + 4] = N_UNDF | N_EXT;
        }
        for (i, entry) in indirect.iter().enumerate() {
            w.u32(indirectsymoff + i * 4, *entry);
        }
        w.0[stroff..stroff + strings.len()].copy_from_slice(&strings);

        let mut buf = vec![0u64; total / 8];
        for (word, bytes) in buf.iter_mut().zip(w.0.chunks_exact(8)) {
            *word = u64::from_ne_bytes(bytes.try_into().unwrap());
        }
        Image {
            buf,
            slot_offsets,
            records,
        }
    }
}

fn align8(value: usize) -> usize {
    (value + 7) & !7
}

struct Writer(Vec<u8>);

impl Writer {
    fn u32(&mut self, at: usize, value: u32) {
        self.0[at..at + 4].copy_from_slice(&value.to_ne_bytes());
    }

    fn u64(&mut self, at: usize, value: u64) {
        self.0[at..at + 8].copy_from_slice(&value.to_ne_bytes());
    }

    fn name(&mut self, at: usize, name: &str) {
        self.0[at..at + name.len()].copy_from_slice(name.as_bytes());
    }
}

/// A synthetic image living in a heap buffer.
pub struct Image {
    buf: Vec<u64>,
    slot_offsets: Vec<usize>,
    records: Vec<usize>,
}

impl Image {
    pub fn base(&self) -> usize {
        self.buf.as_ptr() as usize
    }

    pub fn loaded(&self) -> LoadedImage {
        LoadedImage::new(self.buf.as_ptr().cast(), self.base() as isize)
    }

    pub fn slot_addr(&self, section: usize, index: usize) -> usize {
        self.base() + self.slot_offsets[section] + index * 8
    }

    pub fn slot(&self, section: usize, index: usize) -> usize {
        unsafe { (self.slot_addr(section, index) as *const usize).read_volatile() }
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        let bytes = unsafe { std::slice::from_raw_parts(self.buf.as_ptr().cast::<u8>(), self.buf.len() * 8) };
        u32::from_ne_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(self.buf.as_mut_ptr().cast::<u8>(), self.buf.len() * 8)
        };
        bytes[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) {
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(self.buf.as_mut_ptr().cast::<u8>(), self.buf.len() * 8)
        };
        bytes[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
    }

    /// Buffer offset of the `section_64` record describing `section`.
    pub fn section_record(&self, section: usize) -> usize {
        self.records[section]
    }

    /// Buffer offset of the first load command with the given `cmd`.
    pub fn command_offset(&self, cmd: u32) -> Option<usize> {
        let ncmds = self.read_u32(16);
        let mut at = HEADER_SIZE;
        for _ in 0..ncmds {
            if self.read_u32(at) == cmd {
                return Some(at);
            }
            at += self.read_u32(at + 4) as usize;
        }
        None
    }

    /// Makes the image known to [`FakeDyld`] without notifying anyone.
    pub fn register(&self) {
        IMAGES.lock().unwrap().push(self.loaded());
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        let base = self.base();
        IMAGES.lock().unwrap().retain(|image| image.base() != base);
    }
}

static IMAGES: Mutex<Vec<LoadedImage>> = Mutex::new(Vec::new());
static CALLBACK: Mutex<Option<AddImageCallback>> = Mutex::new(None);

/// A loader whose image list is whatever the test registered.
pub struct FakeDyld;

impl Dyld for FakeDyld {
    fn image_count() -> u32 {
        IMAGES.lock().unwrap().len() as u32
    }

    fn image(index: u32) -> Option<LoadedImage> {
        IMAGES.lock().unwrap().get(index as usize).copied()
    }

    fn register_add_image(callback: AddImageCallback) {
        *CALLBACK.lock().unwrap() = Some(callback);
        let images = IMAGES.lock().unwrap().clone();
        for image in images {
            callback(image.base() as *const c_void, image.slide());
        }
    }

    fn contains(addr: usize) -> bool {
        IMAGES.lock().unwrap().iter().any(|image| image.base() == addr)
    }
}

/// Registers `image` and runs the add-image callback for it, if one is installed.
pub fn load_image(image: &Image) {
    image.register();
    let callback = *CALLBACK.lock().unwrap();
    if let Some(callback) = callback {
        let loaded = image.loaded();
        callback(loaded.base() as *const c_void, loaded.slide());
    }
}

thread_local! {
    static MPROTECT_LOG: RefCell<Vec<(usize, usize, ProtFlags)>> = const { RefCell::new(Vec::new()) };
    static QUERY: Cell<Option<ProtFlags>> = const { Cell::new(Some(ProtFlags::PROT_READ)) };
    static REFUSE_WRITE: Cell<bool> = const { Cell::new(false) };
}

/// Records protection changes instead of applying them.
///
/// Test images live on the heap, which is already writable.
pub struct RecordingMmap;

impl RecordingMmap {
    /// Clears the log and restores a readable, writable-on-request backend.
    pub fn reset() {
        MPROTECT_LOG.with(|log| log.borrow_mut().clear());
        Self::set_query(Some(ProtFlags::PROT_READ));
        Self::refuse_write(false);
    }

    /// Sets what the protection query reports; `None` makes it fail.
    pub fn set_query(prot: Option<ProtFlags>) {
        QUERY.with(|query| query.set(prot));
    }

    /// Makes every request for a writable mapping fail.
    pub fn refuse_write(refuse: bool) {
        REFUSE_WRITE.with(|flag| flag.set(refuse));
    }

    pub fn take_log() -> Vec<(usize, usize, ProtFlags)> {
        MPROTECT_LOG.with(|log| log.take())
    }
}

impl Mmap for RecordingMmap {
    fn page_size() -> usize {
        PAGE_SIZE
    }

    unsafe fn protection(_addr: usize) -> Result<ProtFlags> {
        QUERY
            .with(|query| query.get())
            .ok_or_else(|| mmap_error("no region"))
    }

    unsafe fn mprotect(addr: NonNull<c_void>, len: usize, prot: ProtFlags) -> Result<()> {
        if prot.contains(ProtFlags::PROT_WRITE) && REFUSE_WRITE.with(|flag| flag.get()) {
            return Err(mmap_error("refused"));
        }
        MPROTECT_LOG.with(|log| log.borrow_mut().push((addr.as_ptr() as usize, len, prot)));
        Ok(())
    }
}

/// The page-aligned range covering `len` bytes at `addr`.
pub fn pages(addr: usize, len: usize) -> (usize, usize) {
    let start = addr & !(PAGE_SIZE - 1);
    let end = (addr + len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    (start, end - start)
}
