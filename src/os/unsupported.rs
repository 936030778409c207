use crate::{
    Result,
    error::mmap_error,
    os::{MapFlags, Mmap, ProtFlags},
};
use core::{ffi::c_void, ptr::NonNull};

/// Placeholder backend for hosts without a native memory mapping backend.
///
/// Every operation fails; embedders on such hosts supply their own
/// [`Mmap`] implementation.
pub struct DefaultMmap;

impl Mmap for DefaultMmap {
    unsafe fn mmap_anonymous(
        _len: usize,
        _prot: ProtFlags,
        _flags: MapFlags,
    ) -> Result<NonNull<c_void>> {
        Err(mmap_error("no memory mapping backend for this host"))
    }

    unsafe fn munmap(_addr: NonNull<c_void>, _len: usize) -> Result<()> {
        Err(mmap_error("no memory mapping backend for this host"))
    }

    unsafe fn mprotect(_addr: NonNull<c_void>, _len: usize, _prot: ProtFlags) -> Result<()> {
        Err(mmap_error("no memory mapping backend for this host"))
    }
}

pub(crate) fn page_size() -> usize {
    4096
}

pub(crate) fn host_symbol(_name: &str) -> Option<*const ()> {
    None
}
