//! i386 relocation kinds. Objects use REL entries, so addends are read
//! from the patched bytes when the object is loaded.

use crate::{
    Result,
    error::fatal_error,
    relocation::{PatchSite, RelocValue},
};
use object::elf::{R_386_32, R_386_NONE, R_386_PC32};

pub(crate) fn rel_type_to_str(r_type: u32) -> &'static str {
    match r_type {
        R_386_NONE => "R_386_NONE",
        R_386_32 => "R_386_32",
        R_386_PC32 => "R_386_PC32",
        _ => "UNKNOWN",
    }
}

pub(crate) fn elf_supported(r_type: u32) -> bool {
    rel_type_to_str(r_type) != "UNKNOWN"
}

pub(crate) fn apply_elf(r_type: u32, site: &PatchSite, s: u64, a: i64) -> Result<()> {
    let value = RelocValue::new(s) + a;
    match r_type {
        R_386_NONE => {}
        R_386_32 => {
            let val: RelocValue<u32> = value.try_into()?;
            site.write(val)?;
        }
        R_386_PC32 => {
            // Addresses of a 32-bit target wrap at 4 GiB.
            site.write(RelocValue((value - site.target).0 as u32))?;
        }
        _ => {
            return Err(fatal_error(format!(
                "unsupported i386 relocation type {r_type}"
            )));
        }
    }
    Ok(())
}
