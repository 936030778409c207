//! Relocation records and symbol resolution.

mod value;

pub(crate) use value::{PatchSite, RelocValue, check_signed};

use crate::dyld::SectionId;
use std::{fmt::Display, sync::Arc};

/// A format-specific relocation kind tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RelocKind {
    /// ELF `r_type`.
    Elf(u32),
    /// Mach-O `r_type` with the pc-relative bit and log2 of the field width.
    MachO { r_type: u8, pc_rel: bool, log2_size: u8 },
    /// COFF relocation `Type`.
    Coff(u16),
}

impl Display for RelocKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelocKind::Elf(r_type) => write!(f, "ELF relocation type {r_type}"),
            RelocKind::MachO {
                r_type,
                pc_rel,
                log2_size,
            } => write!(
                f,
                "Mach-O relocation type {r_type} (pcrel: {pc_rel}, length: {log2_size})"
            ),
            RelocKind::Coff(typ) => write!(f, "COFF relocation type {typ:#x}"),
        }
    }
}

/// What a relocation's value refers to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum RelocationValue {
    /// The target address of a loaded section.
    Section(SectionId),
    /// A symbol defined outside every loaded section.
    External(String),
    /// A fixed address.
    Absolute(u64),
}

/// A relocation ready for resolution: a patch site inside a loaded section
/// plus the addend to combine with the referenced value.
#[derive(Clone, Debug)]
pub(crate) struct RelocationEntry {
    /// Section holding the patch site.
    pub section_id: SectionId,
    pub offset: u64,
    pub kind: RelocKind,
    pub addend: i64,
}

impl RelocationEntry {
    #[inline]
    pub fn new(section_id: SectionId, offset: u64, kind: RelocKind, addend: i64) -> Self {
        Self {
            section_id,
            offset,
            kind,
            addend,
        }
    }
}

/// A trait for looking up external symbols during relocation.
///
/// Implement this trait to tell the loader where symbols that no loaded
/// object defines live. Closures work too:
///
/// ```rust
/// use rtdyld::SymbolLookup;
///
/// extern "C" fn host_square(x: i32) -> i32 {
///     x * x
/// }
///
/// let lookup = |name: &str| match name {
///     "square" => Some(host_square as *const ()),
///     _ => None,
/// };
/// assert!(lookup.lookup("square").is_some());
/// ```
pub trait SymbolLookup {
    /// Finds the address of a symbol by its name.
    fn lookup(&self, name: &str) -> Option<*const ()>;
}

impl<F: ?Sized> SymbolLookup for F
where
    F: Fn(&str) -> Option<*const ()>,
{
    fn lookup(&self, name: &str) -> Option<*const ()> {
        self(name)
    }
}

impl<S: SymbolLookup + ?Sized> SymbolLookup for Arc<S> {
    fn lookup(&self, name: &str) -> Option<*const ()> {
        (**self).lookup(name)
    }
}

impl SymbolLookup for () {
    fn lookup(&self, _name: &str) -> Option<*const ()> {
        None
    }
}

/// Looks symbols up in the host process (`dlsym` on unix).
pub struct HostProcess;

impl SymbolLookup for HostProcess {
    fn lookup(&self, name: &str) -> Option<*const ()> {
        crate::os::host_symbol(name)
    }
}
