use core::ptr::NonNull;
use std::fmt::Display;

/// Identifies a loaded section for the lifetime of a [`RuntimeDyld`](crate::RuntimeDyld).
///
/// Ids are dense and assigned in load order across all objects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionId(pub usize);

impl Display for SectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A section copied into memory-manager memory.
pub(crate) struct SectionEntry {
    pub name: String,
    /// Host address of the allocation.
    pub local: NonNull<u8>,
    /// Content size, without the stub area.
    pub size: usize,
    /// Content plus stub area.
    pub alloc_size: usize,
    /// Address the section has where the code will execute.
    pub load_address: u64,
    /// Address of the section inside the object file's own layout.
    pub obj_address: u64,
    /// Start of the stub area.
    pub stub_offset: usize,
    pub is_code: bool,
    pub read_only: bool,
}

impl SectionEntry {
    #[inline]
    pub fn view(&self, id: SectionId) -> SectionView<'_> {
        SectionView {
            id,
            name: &self.name,
            local: self.local,
            load_address: self.load_address,
            size: self.alloc_size,
            is_code: self.is_code,
            read_only: self.read_only,
        }
    }
}

/// Read-only description of a loaded section.
#[derive(Clone, Copy, Debug)]
pub struct SectionView<'a> {
    pub id: SectionId,
    pub name: &'a str,
    /// Host address holding the section's (relocated) bytes.
    pub local: NonNull<u8>,
    /// Address relocations were computed against.
    pub load_address: u64,
    /// Bytes in use, including call stubs and GOT slots.
    pub size: usize,
    pub is_code: bool,
    pub read_only: bool,
}

impl SectionView<'_> {
    /// The section's bytes as currently patched in host memory.
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the allocation stays alive as long as the owning dyld and
        // its memory manager, which this view borrows.
        unsafe { core::slice::from_raw_parts(self.local.as_ptr(), self.size) }
    }
}
