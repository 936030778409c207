use crate::{
    Error, Result,
    os::{MapFlags, Mmap, ProtFlags},
};
use core::{ffi::c_void, ptr::NonNull};
use libc::{mmap, mprotect, munmap};
use std::ffi::CString;

/// The default [`Mmap`] implementation, backed by libc.
pub struct DefaultMmap;

impl Mmap for DefaultMmap {
    unsafe fn mmap_anonymous(
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
    ) -> Result<NonNull<c_void>> {
        let mut raw = libc::MAP_ANON;
        if flags.contains(MapFlags::MAP_PRIVATE) {
            raw |= libc::MAP_PRIVATE;
        }
        let ptr = unsafe { mmap(core::ptr::null_mut(), len, prot.bits(), raw, -1, 0) };
        if core::ptr::eq(ptr, libc::MAP_FAILED) {
            return Err(map_error("mmap anonymous failed"));
        }
        NonNull::new(ptr).ok_or_else(|| map_error("mmap returned a null mapping"))
    }

    unsafe fn munmap(addr: NonNull<c_void>, len: usize) -> Result<()> {
        let res = unsafe { munmap(addr.as_ptr(), len) };
        if res != 0 {
            return Err(map_error("munmap failed"));
        }
        Ok(())
    }

    unsafe fn mprotect(addr: NonNull<c_void>, len: usize, prot: ProtFlags) -> Result<()> {
        let res = unsafe { mprotect(addr.as_ptr(), len, prot.bits()) };
        if res != 0 {
            return Err(map_error("mprotect failed"));
        }
        Ok(())
    }
}

pub(crate) fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 { 4096 } else { size as usize }
}

/// Looks `name` up in the symbols already loaded into the host process.
pub(crate) fn host_symbol(name: &str) -> Option<*const ()> {
    let name = CString::new(name).ok()?;
    let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
    if addr.is_null() {
        None
    } else {
        Some(addr as *const ())
    }
}

#[cold]
#[inline(never)]
fn map_error(msg: &str) -> Error {
    let errno = std::io::Error::last_os_error();
    Error::Mmap {
        msg: format!("{msg}: {errno}").into(),
    }
}
