//! Running code from a second copy of its sections.
//!
//! [`RemoteTarget`] stands in for a separate process: it owns its own
//! memory for every section, maps each section's target address there, and
//! receives a copy of the relocated bytes once the loader is done. The
//! loader keeps writing to its local copy only.

use crate::{
    Result, RuntimeDyld,
    dyld::SectionId,
    memory::roundup,
    os::{DefaultMmap, MapFlags, Mmap, ProtFlags, page_size},
};
use core::{ffi::c_void, marker::PhantomData, ptr::NonNull};

struct Region {
    id: SectionId,
    base: NonNull<u8>,
    len: usize,
    is_code: bool,
    read_only: bool,
    committed: bool,
}

/// Target memory for sections loaded by a [`RuntimeDyld`].
pub struct RemoteTarget<M: Mmap = DefaultMmap> {
    regions: Vec<Region>,
    _marker: PhantomData<M>,
}

impl RemoteTarget {
    pub fn new() -> Self {
        Self::with_mmap()
    }
}

impl Default for RemoteTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Mmap> RemoteTarget<M> {
    pub fn with_mmap() -> Self {
        Self {
            regions: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Gives every section not mapped yet its own target memory.
    ///
    /// Takes effect on the next relocation pass.
    pub fn map_sections(&mut self, dyld: &mut RuntimeDyld) -> Result<()> {
        let pending: Vec<_> = dyld
            .sections()
            .filter(|view| !self.regions.iter().any(|r| r.id == view.id))
            .map(|view| (view.id, view.local, view.size, view.is_code, view.read_only))
            .collect();
        for (id, local, size, is_code, read_only) in pending {
            let len = roundup(size.max(1), page_size());
            let base = unsafe {
                M::mmap_anonymous(
                    len,
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                    MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
                )?
            }
            .cast::<u8>();
            self.regions.push(Region {
                id,
                base,
                len,
                is_code,
                read_only,
                committed: false,
            });
            #[cfg(feature = "log")]
            log::debug!(
                "section {} mapped from [{:p}] to remote [{:p}]",
                id,
                local,
                base
            );
            dyld.map_section_address(local.as_ptr(), base.as_ptr() as u64)?;
        }
        Ok(())
    }

    /// Copies every relocated section to its target memory and applies the
    /// final permissions there.
    pub fn commit(&mut self, dyld: &RuntimeDyld) -> Result<()> {
        for view in dyld.sections() {
            let Some(region) = self.regions.iter_mut().find(|r| r.id == view.id) else {
                continue;
            };
            if region.committed {
                continue;
            }
            let bytes = view.bytes();
            // SAFETY: the region was sized for the section and is still
            // writable because it has not been committed.
            unsafe {
                core::ptr::copy_nonoverlapping(bytes.as_ptr(), region.base.as_ptr(), bytes.len())
            };
            let prot = if region.is_code {
                ProtFlags::PROT_READ | ProtFlags::PROT_EXEC
            } else if region.read_only {
                ProtFlags::PROT_READ
            } else {
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
            };
            unsafe { M::mprotect(region.base.cast::<c_void>(), region.len, prot)? };
            region.committed = true;
        }
        Ok(())
    }

    /// Returns `true` if `addr` lies in target memory.
    pub fn contains(&self, addr: u64) -> bool {
        self.regions.iter().any(|r| {
            let base = r.base.as_ptr() as u64;
            (base..base + r.len as u64).contains(&addr)
        })
    }

    /// Target address of a section.
    pub fn target_of(&self, id: SectionId) -> Option<u64> {
        self.regions
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.base.as_ptr() as u64)
    }
}

impl<M: Mmap> Drop for RemoteTarget<M> {
    fn drop(&mut self) {
        for region in self.regions.drain(..) {
            let _ = unsafe { M::munmap(region.base.cast::<c_void>(), region.len) };
        }
    }
}
