//! Section memory management.
//!
//! The loader never owns the pages it copies sections into. It asks a
//! [`MemoryManager`] for them, writes code and data through the returned
//! pointers while relocating, and finally asks the manager to apply the
//! final page protections.

use crate::{
    Result,
    dyld::SectionId,
    error::mmap_error,
    os::{DefaultMmap, MapFlags, Mmap, ProtFlags, page_size},
};
use core::{ffi::c_void, marker::PhantomData, ptr::NonNull};

/// The collaborator that provides backing memory for loaded sections.
///
/// Memory handed out must stay valid and writable until
/// [`MemoryManager::finalize_memory`] is called; after that the manager may
/// change permissions, and the loader will not write to it again.
pub trait MemoryManager {
    /// Allocates memory for an executable section.
    fn allocate_code_section(
        &mut self,
        size: usize,
        alignment: usize,
        section_id: SectionId,
        section_name: &str,
    ) -> Result<NonNull<u8>>;

    /// Allocates memory for a data section. `read_only` sections become
    /// read-only on finalization.
    fn allocate_data_section(
        &mut self,
        size: usize,
        alignment: usize,
        section_id: SectionId,
        section_name: &str,
        read_only: bool,
    ) -> Result<NonNull<u8>>;

    /// Applies the final page permissions to everything allocated so far.
    fn finalize_memory(&mut self) -> Result<()>;

    /// Called once per loaded EH frame section before finalization.
    fn register_eh_frames(&mut self, _addr: NonNull<u8>, _load_addr: u64, _size: usize) {}
}

impl<T: MemoryManager + ?Sized> MemoryManager for Box<T> {
    fn allocate_code_section(
        &mut self,
        size: usize,
        alignment: usize,
        section_id: SectionId,
        section_name: &str,
    ) -> Result<NonNull<u8>> {
        (**self).allocate_code_section(size, alignment, section_id, section_name)
    }

    fn allocate_data_section(
        &mut self,
        size: usize,
        alignment: usize,
        section_id: SectionId,
        section_name: &str,
        read_only: bool,
    ) -> Result<NonNull<u8>> {
        (**self).allocate_data_section(size, alignment, section_id, section_name, read_only)
    }

    fn finalize_memory(&mut self) -> Result<()> {
        (**self).finalize_memory()
    }

    fn register_eh_frames(&mut self, addr: NonNull<u8>, load_addr: u64, size: usize) {
        (**self).register_eh_frames(addr, load_addr, size)
    }
}

const MIN_BLOCK_SIZE: usize = 64 * 1024;

struct MemoryBlock {
    base: NonNull<u8>,
    len: usize,
}

#[derive(Default)]
struct MemoryGroup {
    blocks: Vec<MemoryBlock>,
    /// Index of the first block that has not been protected yet.
    pending: usize,
    /// Bytes used in the last block.
    cursor: usize,
}

impl MemoryGroup {
    fn allocate<M: Mmap>(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        let alignment = alignment.max(16);
        if !alignment.is_power_of_two() {
            return Err(mmap_error(format!(
                "section alignment {alignment} is not a power of two"
            )));
        }
        if self.blocks.len() > self.pending {
            let block = &self.blocks[self.blocks.len() - 1];
            let base = block.base.as_ptr() as usize;
            let fits = (base + self.cursor)
                .checked_next_multiple_of(alignment)
                .map(|start| start - base)
                .and_then(|offset| Some((offset, offset.checked_add(size)?)))
                .filter(|&(_, end)| end <= block.len);
            if let Some((offset, end)) = fits {
                self.cursor = end;
                // SAFETY: offset + size is within the block.
                return Ok(unsafe { NonNull::new_unchecked(block.base.as_ptr().add(offset)) });
            }
        }
        let len = size
            .checked_add(alignment)
            .and_then(|len| len.max(MIN_BLOCK_SIZE).checked_next_multiple_of(page_size()))
            .ok_or_else(|| mmap_error(format!("cannot map {size:#x} bytes for a section")))?;
        let base = unsafe {
            M::mmap_anonymous(
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            )?
        }
        .cast::<u8>();
        #[cfg(feature = "log")]
        log::trace!("mapped memory block [{:p}] of {:#x} bytes", base, len);
        // The block is at least `size + alignment` long.
        let offset = roundup(base.as_ptr() as usize, alignment) - base.as_ptr() as usize;
        self.blocks.push(MemoryBlock { base, len });
        self.cursor = offset + size;
        Ok(unsafe { NonNull::new_unchecked(base.as_ptr().add(offset)) })
    }

    fn protect<M: Mmap>(&mut self, prot: ProtFlags) -> Result<()> {
        for block in &self.blocks[self.pending..] {
            unsafe { M::mprotect(block.base.cast::<c_void>(), block.len, prot)? };
        }
        self.pending = self.blocks.len();
        self.cursor = 0;
        Ok(())
    }

    fn release<M: Mmap>(&mut self) {
        for block in self.blocks.drain(..) {
            let _ = unsafe { M::munmap(block.base.cast::<c_void>(), block.len) };
        }
    }

    fn contains(&self, addr: usize) -> bool {
        self.blocks.iter().any(|block| {
            let base = block.base.as_ptr() as usize;
            (base..base + block.len).contains(&addr)
        })
    }

    fn is_finalized(&self, addr: usize) -> bool {
        self.blocks[..self.pending].iter().any(|block| {
            let base = block.base.as_ptr() as usize;
            (base..base + block.len).contains(&addr)
        })
    }
}

#[inline]
pub(crate) fn roundup(x: usize, align: usize) -> usize {
    (x + align - 1) & !(align - 1)
}

/// A [`MemoryManager`] that carves sections out of anonymous page blocks.
///
/// Code, read-only data and writable data come from separate blocks so that
/// each can receive its own protection. Everything is mapped read/write;
/// [`finalize_memory`](MemoryManager::finalize_memory) switches code blocks to
/// read/execute and read-only data blocks to read. Allocations made after a
/// finalization go to fresh blocks.
pub struct SectionMemoryManager<M: Mmap = DefaultMmap> {
    code: MemoryGroup,
    ro_data: MemoryGroup,
    rw_data: MemoryGroup,
    eh_frames: Vec<(u64, usize)>,
    finalize_count: usize,
    _marker: PhantomData<M>,
}

impl SectionMemoryManager {
    /// Creates a manager backed by [`DefaultMmap`].
    pub fn new() -> Self {
        Self::with_mmap()
    }
}

impl Default for SectionMemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Mmap> SectionMemoryManager<M> {
    /// Creates a manager backed by a custom [`Mmap`] implementation.
    pub fn with_mmap() -> Self {
        Self {
            code: MemoryGroup::default(),
            ro_data: MemoryGroup::default(),
            rw_data: MemoryGroup::default(),
            eh_frames: Vec::new(),
            finalize_count: 0,
            _marker: PhantomData,
        }
    }

    /// How many times [`MemoryManager::finalize_memory`] has run.
    pub fn finalize_count(&self) -> usize {
        self.finalize_count
    }

    /// EH frame sections registered so far, as (target address, size).
    pub fn registered_eh_frames(&self) -> &[(u64, usize)] {
        &self.eh_frames
    }

    /// Returns `true` if `addr` lies in a code block that has already been
    /// made executable.
    pub fn is_executable(&self, addr: *const u8) -> bool {
        self.code.is_finalized(addr as usize)
    }

    /// Returns `true` if `addr` was handed out by this manager.
    pub fn owns(&self, addr: *const u8) -> bool {
        let addr = addr as usize;
        self.code.contains(addr) || self.ro_data.contains(addr) || self.rw_data.contains(addr)
    }
}

impl<M: Mmap> MemoryManager for SectionMemoryManager<M> {
    fn allocate_code_section(
        &mut self,
        size: usize,
        alignment: usize,
        _section_id: SectionId,
        _section_name: &str,
    ) -> Result<NonNull<u8>> {
        self.code.allocate::<M>(size, alignment)
    }

    fn allocate_data_section(
        &mut self,
        size: usize,
        alignment: usize,
        _section_id: SectionId,
        _section_name: &str,
        read_only: bool,
    ) -> Result<NonNull<u8>> {
        if read_only {
            self.ro_data.allocate::<M>(size, alignment)
        } else {
            self.rw_data.allocate::<M>(size, alignment)
        }
    }

    fn finalize_memory(&mut self) -> Result<()> {
        self.code
            .protect::<M>(ProtFlags::PROT_READ | ProtFlags::PROT_EXEC)?;
        self.ro_data.protect::<M>(ProtFlags::PROT_READ)?;
        // Writable data keeps its permissions, but later allocations must
        // not share pages with the sections already handed out.
        let pending = self.rw_data.blocks.len();
        self.rw_data.pending = pending;
        self.rw_data.cursor = 0;
        self.finalize_count += 1;
        Ok(())
    }

    fn register_eh_frames(&mut self, _addr: NonNull<u8>, load_addr: u64, size: usize) {
        self.eh_frames.push((load_addr, size));
    }
}

impl<M: Mmap> Drop for SectionMemoryManager<M> {
    fn drop(&mut self) {
        self.code.release::<M>();
        self.ro_data.release::<M>();
        self.rw_data.release::<M>();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_requests_fail() {
        let mut mm = SectionMemoryManager::new();
        let err = mm
            .allocate_code_section(usize::MAX - 4, 16, SectionId(0), ".text")
            .unwrap_err();
        assert!(matches!(err, crate::Error::Mmap { .. }), "{err}");
    }

    #[cfg(unix)]
    #[test]
    fn oversized_requests_leave_the_block_usable() {
        let mut mm = SectionMemoryManager::new();
        let first = mm
            .allocate_data_section(64, 16, SectionId(0), ".data", false)
            .unwrap();
        assert!(
            mm.allocate_data_section(usize::MAX - 4, 16, SectionId(1), ".bss", false)
                .is_err()
        );
        let second = mm
            .allocate_data_section(64, 16, SectionId(2), ".data", false)
            .unwrap();
        assert_eq!(second.as_ptr() as usize, first.as_ptr() as usize + 64);
    }
}
