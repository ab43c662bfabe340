use crate::{
    Result,
    dyld::{AddImageCallback, Dyld, LoadedImage},
    error::mmap_error,
    mmap::{Mmap, ProtFlags},
};
use core::{
    ffi::{c_int, c_void},
    ptr::NonNull,
};
use libc::mprotect;
use mach2::{
    kern_return::KERN_SUCCESS,
    message::mach_msg_type_number_t,
    port::{MACH_PORT_NULL, mach_port_t},
    traps::mach_task_self,
    vm::mach_vm_region,
    vm_prot::{VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE, vm_prot_t},
    vm_region::{VM_REGION_BASIC_INFO_64, vm_region_basic_info_64, vm_region_info_t},
    vm_types::{mach_vm_address_t, mach_vm_size_t},
};

/// `VM_REGION_BASIC_INFO_COUNT_64`
const VM_REGION_BASIC_INFO_COUNT_64: mach_msg_type_number_t =
    (size_of::<vm_region_basic_info_64>() / size_of::<c_int>()) as mach_msg_type_number_t;

unsafe extern "C" {
    fn _dyld_image_count() -> u32;
    fn _dyld_get_image_header(image_index: u32) -> *const c_void;
    fn _dyld_get_image_vmaddr_slide(image_index: u32) -> isize;
    fn _dyld_register_func_for_add_image(func: AddImageCallback);
}

/// An implementation of Mmap trait backed by mach2 and libc
pub struct DefaultMmap;

impl Mmap for DefaultMmap {
    fn page_size() -> usize {
        let value = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if value <= 0 { 0x4000 } else { value as usize }
    }

    unsafe fn protection(addr: usize) -> Result<ProtFlags> {
        let mut address = addr as mach_vm_address_t;
        let mut size: mach_vm_size_t = 0;
        let mut info: vm_region_basic_info_64 = unsafe { core::mem::zeroed() };
        let mut count = VM_REGION_BASIC_INFO_COUNT_64;
        let mut object: mach_port_t = MACH_PORT_NULL;
        let kr = unsafe {
            mach_vm_region(
                mach_task_self(),
                &mut address,
                &mut size,
                VM_REGION_BASIC_INFO_64,
                (&mut info as *mut vm_region_basic_info_64) as vm_region_info_t,
                &mut count,
                &mut object,
            )
        };
        if kr != KERN_SUCCESS {
            return Err(mmap_error("mach_vm_region failed"));
        }
        // mach_vm_region rounds up to the next region when addr is unmapped
        if address as usize > addr {
            return Err(mmap_error("address is not mapped"));
        }
        Ok(vm_prot_to_flags(info.protection))
    }

    unsafe fn mprotect(addr: NonNull<c_void>, len: usize, prot: ProtFlags) -> Result<()> {
        let res = unsafe { mprotect(addr.as_ptr(), len, prot.bits()) };
        if res != 0 {
            return Err(mmap_error("mprotect failed"));
        }
        Ok(())
    }
}

#[inline]
fn vm_prot_to_flags(prot: vm_prot_t) -> ProtFlags {
    let mut flags = ProtFlags::PROT_NONE;
    if prot & VM_PROT_READ != 0 {
        flags |= ProtFlags::PROT_READ;
    }
    if prot & VM_PROT_WRITE != 0 {
        flags |= ProtFlags::PROT_WRITE;
    }
    if prot & VM_PROT_EXECUTE != 0 {
        flags |= ProtFlags::PROT_EXEC;
    }
    flags
}

/// An implementation of Dyld trait backed by the `_dyld_*` API
pub struct DefaultDyld;

impl Dyld for DefaultDyld {
    fn image_count() -> u32 {
        unsafe { _dyld_image_count() }
    }

    fn image(index: u32) -> Option<LoadedImage> {
        let header = unsafe { _dyld_get_image_header(index) };
        if header.is_null() {
            return None;
        }
        let slide = unsafe { _dyld_get_image_vmaddr_slide(index) };
        Some(LoadedImage::new(header, slide))
    }

    fn register_add_image(callback: AddImageCallback) {
        unsafe { _dyld_register_func_for_add_image(callback) }
    }

    fn contains(addr: usize) -> bool {
        let mut info: libc::Dl_info = unsafe { core::mem::zeroed() };
        unsafe { libc::dladdr(addr as *const c_void, &mut info) != 0 }
    }
}
