use crate::Result;
use bitflags::bitflags;
use core::{
    ffi::{c_int, c_void},
    ptr::NonNull,
};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    /// Memory protection flags for controlling access permissions.
    pub struct ProtFlags: c_int {
        /// No access allowed.
        const PROT_NONE = 0;

        /// Allow reading from the memory region.
        const PROT_READ = 1;

        /// Allow writing to the memory region.
        const PROT_WRITE = 2;

        /// Allow executing code in the memory region.
        const PROT_EXEC = 4;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug)]
    /// Memory mapping configuration flags.
    ///
    /// The values are portable tags; each backend translates them to the
    /// host's constants.
    pub struct MapFlags: c_int {
        /// Create a private copy-on-write mapping.
        const MAP_PRIVATE = 2;

        /// Create an anonymous mapping not backed by any file.
        const MAP_ANONYMOUS = 32;
    }
}

/// A trait for low-level memory mapping operations.
///
/// The section memory manager only ever asks for anonymous read/write
/// pages, changes their protection once relocation is done, and unmaps
/// them on teardown.
///
/// # Safety
/// All methods are unsafe because they manipulate the process's virtual address space.
pub trait Mmap {
    /// Creates an anonymous memory mapping of `len` bytes.
    ///
    /// # Safety
    /// `len` must be a multiple of the page size.
    unsafe fn mmap_anonymous(len: usize, prot: ProtFlags, flags: MapFlags)
    -> Result<NonNull<c_void>>;

    /// Unmaps a memory region created by [`Mmap::mmap_anonymous`].
    ///
    /// # Safety
    /// `addr` and `len` must match the original mapping. The region must not
    /// be accessed afterwards.
    unsafe fn munmap(addr: NonNull<c_void>, len: usize) -> Result<()>;

    /// Changes the protection of a page-aligned memory region.
    ///
    /// # Safety
    /// No code may be executing in the region when execute permission is
    /// removed, and nothing may write to it once write permission is gone.
    unsafe fn mprotect(addr: NonNull<c_void>, len: usize, prot: ProtFlags) -> Result<()>;
}
