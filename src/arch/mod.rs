//! Architecture-specific relocation appliers and stub templates.
//!
//! The object format decides which relocation kinds exist and how addends
//! are encoded; the architecture decides how a computed value is stored
//! into the instruction or data word.

pub(crate) mod aarch64;
pub(crate) mod x86;
pub(crate) mod x86_64;

use object::Architecture;

/// Indirection a relocation may need beyond a direct patch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum StubKind {
    /// A branch trampoline, used when the callee is external and may lie
    /// outside the branch instruction's range.
    Call,
    /// An 8-byte slot holding the absolute address, for GOT-relative loads.
    GotSlot,
}

/// Machine code for a call stub and where its absolute target goes.
pub(crate) struct StubTemplate {
    pub code: &'static [u8],
    pub addr_offset: usize,
}

pub(crate) const GOT_SLOT_SIZE: usize = 8;

pub(crate) fn stub_template(arch: Architecture) -> Option<&'static StubTemplate> {
    match arch {
        Architecture::X86_64 => Some(&x86_64::STUB),
        Architecture::Aarch64 => Some(&aarch64::STUB),
        _ => None,
    }
}

/// Bytes a single relocation of `kind` may add to its section's stub area.
pub(crate) fn stub_size(arch: Architecture, kind: StubKind) -> usize {
    match kind {
        StubKind::GotSlot => GOT_SLOT_SIZE,
        StubKind::Call => stub_template(arch).map_or(0, |stub| stub.code.len()),
    }
}

/// Alignment of the stub area at the end of a section.
pub(crate) const STUB_ALIGN: usize = 16;
