//! Rewriting the slots of one symbol pointer section

use crate::{
    Result,
    error::{mmap_error, parse_layout_error},
    layout::{PointerSection, SymbolTables},
    macho::is_unnamed_indirect,
    mmap::{Mmap, ProtFlags, page_range},
    registry::Batch,
};
use core::{marker::PhantomData, ptr::NonNull, sync::atomic::Ordering};

/// Pages made writable for the duration of one section patch.
struct Unprotected<M: Mmap> {
    start: usize,
    len: usize,
    old: ProtFlags,
    _marker: PhantomData<M>,
}

impl<M: Mmap> Unprotected<M> {
    /// Records the protection covering `addr..addr + size` and makes it writable.
    unsafe fn new(addr: usize, size: usize) -> Result<Self> {
        let old = match unsafe { M::protection(addr) } {
            Ok(prot) => prot,
            Err(_err) => {
                #[cfg(feature = "log")]
                log::debug!(
                    "[Mprotect] query failed at 0x{:x}: {}, assuming read-only",
                    addr,
                    _err
                );
                ProtFlags::PROT_READ
            }
        };
        let (start, len) = page_range(addr, size, M::page_size())
            .ok_or_else(|| mmap_error("section range overflows the address space"))?;
        let ptr = NonNull::new(start as *mut _)
            .ok_or_else(|| mmap_error("section at null page"))?;
        unsafe { M::mprotect(ptr, len, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE) }?;
        #[cfg(feature = "log")]
        log::trace!(
            "[Mprotect] address: 0x{:x}, length: {}, prot: {:?} -> {:?}",
            start,
            len,
            old,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
        );
        Ok(Unprotected {
            start,
            len,
            old,
            _marker: PhantomData,
        })
    }

    /// Puts back exactly the flags observed before the patch.
    unsafe fn restore(self) -> Result<()> {
        // `start` was checked non-null in `new`.
        let ptr = unsafe { NonNull::new_unchecked(self.start as *mut _) };
        unsafe { M::mprotect(ptr, self.len, self.old) }?;
        #[cfg(feature = "log")]
        log::trace!(
            "[Mprotect] address: 0x{:x}, length: {}, prot: {:?}",
            self.start,
            self.len,
            self.old
        );
        Ok(())
    }
}

/// Rewrites every slot of `section` bound to a symbol named in `batch`.
///
/// Returns the number of slots written. A section whose size is not a whole
/// number of pointers, or whose range wraps the address space, is rejected
/// before anything is touched. Sections in `__DATA_CONST` are made
/// writable first; if that fails nothing is written and the error is returned
/// for this section alone. Their previous protection is restored whether or
/// not any slot matched.
///
/// # Safety
/// `section` and `tables` must describe an image mapped in this process with
/// the given `slide`.
pub(crate) unsafe fn patch_section<M: Mmap>(
    section: &PointerSection<'_>,
    tables: &SymbolTables<'_>,
    slide: isize,
    batch: &Batch<'_>,
) -> Result<usize> {
    let addr = section.runtime_addr(slide);
    let size = section.size();
    if size % size_of::<usize>() != 0 {
        return Err(parse_layout_error("section size is not a whole number of pointers"));
    }
    if addr.checked_add(size).is_none() {
        return Err(parse_layout_error("section runs past the end of the address space"));
    }
    let count = size / size_of::<usize>();
    if count == 0 {
        return Ok(0);
    }
    let unprotected = if section.is_data_const() {
        Some(unsafe { Unprotected::<M>::new(addr, size) }?)
    } else {
        None
    };
    let rebound = unsafe { rewrite_slots(section, tables, addr as *mut usize, count, batch) };
    if let Some(unprotected) = unprotected {
        unsafe { unprotected.restore() }?;
    }
    Ok(rebound)
}

unsafe fn rewrite_slots(
    section: &PointerSection<'_>,
    tables: &SymbolTables<'_>,
    slots: *mut usize,
    count: usize,
    batch: &Batch<'_>,
) -> usize {
    let first = section.first_indirect_index();
    let mut rebound = 0;
    for i in 0..count {
        let Some(symbol_index) = first
            .checked_add(i)
            .and_then(|index| tables.indirect_symbol(index))
        else {
            #[cfg(feature = "log")]
            log::debug!("[Rebind] section runs past the indirect symbol table at slot {}", i);
            break;
        };
        if is_unnamed_indirect(symbol_index) {
            continue;
        }
        let Some(name) = tables.symbol_name(symbol_index) else {
            continue;
        };
        // Every recorded name carries a one-byte ABI prefix.
        if name.len() < 2 {
            continue;
        }
        let Some(rebinding) = batch.find(&name[1..]) else {
            continue;
        };
        let slot = unsafe { slots.add(i) };
        let current = unsafe { slot.read_volatile() };
        let replacement = rebinding.replacement() as usize;
        if let Some(cell) = rebinding.replaced() {
            if current != replacement {
                cell.store(current as *mut (), Ordering::Release);
            }
        }
        unsafe { slot.write_volatile(replacement) };
        rebound += 1;
        #[cfg(feature = "log")]
        log::trace!(
            "[Rebind] slot: 0x{:x}, symbol: {}, 0x{:x} -> 0x{:x}",
            slot as usize,
            rebinding.name(),
            current,
            replacement
        );
    }
    rebound
}
