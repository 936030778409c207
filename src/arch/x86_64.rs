//! x86-64 relocation kinds and stubs.

use crate::{
    Result,
    arch::{StubKind, StubTemplate},
    error::fatal_error,
    relocation::{PatchSite, RelocValue},
};
use elf::abi::*;

/// `jmp *0(%rip)` followed by the 8-byte absolute target.
pub(crate) const STUB: StubTemplate = StubTemplate {
    code: &[0xff, 0x25, 0x00, 0x00, 0x00, 0x00, 0, 0, 0, 0, 0, 0, 0, 0],
    addr_offset: 6,
};

/// Map x86_64 relocation type value to human readable name.
pub(crate) fn rel_type_to_str(r_type: u32) -> &'static str {
    match r_type {
        R_X86_64_NONE => "R_X86_64_NONE",
        R_X86_64_64 => "R_X86_64_64",
        R_X86_64_PC32 => "R_X86_64_PC32",
        R_X86_64_PLT32 => "R_X86_64_PLT32",
        R_X86_64_GOTPCREL => "R_X86_64_GOTPCREL",
        R_X86_64_GOTPCRELX => "R_X86_64_GOTPCRELX",
        R_X86_64_REX_GOTPCRELX => "R_X86_64_REX_GOTPCRELX",
        R_X86_64_32 => "R_X86_64_32",
        R_X86_64_32S => "R_X86_64_32S",
        R_X86_64_16 => "R_X86_64_16",
        R_X86_64_PC16 => "R_X86_64_PC16",
        R_X86_64_8 => "R_X86_64_8",
        R_X86_64_PC8 => "R_X86_64_PC8",
        R_X86_64_PC64 => "R_X86_64_PC64",
        _ => "UNKNOWN",
    }
}

pub(crate) fn elf_supported(r_type: u32) -> bool {
    rel_type_to_str(r_type) != "UNKNOWN"
}

/// Whether a relocation needs a stub (only when the value is external) or
/// a GOT slot (always).
pub(crate) fn elf_stub_kind(r_type: u32) -> Option<StubKind> {
    match r_type {
        R_X86_64_PLT32 => Some(StubKind::Call),
        R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX | R_X86_64_REX_GOTPCRELX => Some(StubKind::GotSlot),
        _ => None,
    }
}

/// Writes `S + A` (or `S + A - P`) into the patch site.
///
/// For the GOT and PLT kinds `s` is already the address of the slot or
/// stub created for the relocation, so they share the PC32 computation.
pub(crate) fn apply_elf(r_type: u32, site: &PatchSite, s: u64, a: i64) -> Result<()> {
    let value = RelocValue::new(s) + a;
    match r_type {
        R_X86_64_NONE => {}
        R_X86_64_64 => site.write(value)?,
        R_X86_64_PC32
        | R_X86_64_PLT32
        | R_X86_64_GOTPCREL
        | R_X86_64_GOTPCRELX
        | R_X86_64_REX_GOTPCRELX => {
            let val: RelocValue<i32> = (value - site.target).try_into()?;
            site.write(val)?;
        }
        R_X86_64_PC64 => site.write(value - site.target)?,
        R_X86_64_32 => {
            let val: RelocValue<u32> = value.try_into()?;
            site.write(val)?;
        }
        R_X86_64_32S => {
            let val: RelocValue<i32> = value.try_into()?;
            site.write(val)?;
        }
        R_X86_64_16 => {
            let val: RelocValue<u16> = value.try_into()?;
            site.write(val)?;
        }
        R_X86_64_PC16 => {
            let val: RelocValue<i16> = (value - site.target).try_into()?;
            site.write(val)?;
        }
        R_X86_64_8 => {
            let val: RelocValue<u8> = value.try_into()?;
            site.write(val)?;
        }
        R_X86_64_PC8 => {
            let val: RelocValue<i8> = (value - site.target).try_into()?;
            site.write(val)?;
        }
        _ => {
            return Err(fatal_error(format!(
                "unsupported x86_64 relocation type {r_type}"
            )));
        }
    }
    Ok(())
}
