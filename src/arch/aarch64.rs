//! AArch64 relocation kinds and stubs.

use crate::{
    Result,
    arch::{StubKind, StubTemplate},
    error::{fatal_error, relocate_error},
    relocation::{PatchSite, RelocValue, check_signed},
};
use elf::abi::*;

/// `ldr x16, #8; br x16` followed by the 8-byte absolute target.
pub(crate) const STUB: StubTemplate = StubTemplate {
    code: &[
        0x50, 0x00, 0x00, 0x58, // ldr x16, #8
        0x00, 0x02, 0x1f, 0xd6, // br x16
        0, 0, 0, 0, 0, 0, 0, 0,
    ],
    addr_offset: 8,
};

const IMM12_MASK: u32 = 0xfff << 10;
const ADR_MASK: u32 = (0x3 << 29) | (0x7ffff << 5);
const IMM26_MASK: u32 = 0x03ff_ffff;
const MOVW_MASK: u32 = 0xffff << 5;

pub(crate) fn rel_type_to_str(r_type: u32) -> &'static str {
    match r_type {
        R_AARCH64_NONE => "R_AARCH64_NONE",
        R_AARCH64_ABS64 => "R_AARCH64_ABS64",
        R_AARCH64_ABS32 => "R_AARCH64_ABS32",
        R_AARCH64_PREL32 => "R_AARCH64_PREL32",
        R_AARCH64_PREL64 => "R_AARCH64_PREL64",
        R_AARCH64_CALL26 => "R_AARCH64_CALL26",
        R_AARCH64_JUMP26 => "R_AARCH64_JUMP26",
        R_AARCH64_ADR_PREL_PG_HI21 => "R_AARCH64_ADR_PREL_PG_HI21",
        R_AARCH64_ADD_ABS_LO12_NC => "R_AARCH64_ADD_ABS_LO12_NC",
        R_AARCH64_LDST8_ABS_LO12_NC => "R_AARCH64_LDST8_ABS_LO12_NC",
        R_AARCH64_LDST16_ABS_LO12_NC => "R_AARCH64_LDST16_ABS_LO12_NC",
        R_AARCH64_LDST32_ABS_LO12_NC => "R_AARCH64_LDST32_ABS_LO12_NC",
        R_AARCH64_LDST64_ABS_LO12_NC => "R_AARCH64_LDST64_ABS_LO12_NC",
        R_AARCH64_LDST128_ABS_LO12_NC => "R_AARCH64_LDST128_ABS_LO12_NC",
        R_AARCH64_MOVW_UABS_G0 => "R_AARCH64_MOVW_UABS_G0",
        R_AARCH64_MOVW_UABS_G0_NC => "R_AARCH64_MOVW_UABS_G0_NC",
        R_AARCH64_MOVW_UABS_G1 => "R_AARCH64_MOVW_UABS_G1",
        R_AARCH64_MOVW_UABS_G1_NC => "R_AARCH64_MOVW_UABS_G1_NC",
        R_AARCH64_MOVW_UABS_G2 => "R_AARCH64_MOVW_UABS_G2",
        R_AARCH64_MOVW_UABS_G2_NC => "R_AARCH64_MOVW_UABS_G2_NC",
        R_AARCH64_MOVW_UABS_G3 => "R_AARCH64_MOVW_UABS_G3",
        R_AARCH64_ADR_GOT_PAGE => "R_AARCH64_ADR_GOT_PAGE",
        R_AARCH64_LD64_GOT_LO12_NC => "R_AARCH64_LD64_GOT_LO12_NC",
        _ => "UNKNOWN",
    }
}

pub(crate) fn elf_supported(r_type: u32) -> bool {
    rel_type_to_str(r_type) != "UNKNOWN"
}

pub(crate) fn elf_stub_kind(r_type: u32) -> Option<StubKind> {
    match r_type {
        R_AARCH64_CALL26 | R_AARCH64_JUMP26 => Some(StubKind::Call),
        R_AARCH64_ADR_GOT_PAGE | R_AARCH64_LD64_GOT_LO12_NC => Some(StubKind::GotSlot),
        _ => None,
    }
}

/// Patches a 26-bit branch immediate. Shared with Mach-O `BRANCH26`.
pub(crate) fn write_branch26(site: &PatchSite, value: RelocValue<u64>) -> Result<()> {
    let delta = (value - site.target).0 as i64;
    if delta & 0x3 != 0 {
        return Err(relocate_error(format!("branch target {delta:#x} is misaligned")));
    }
    let delta = check_signed(delta, 28)?;
    site.patch_insn(IMM26_MASK, (delta >> 2) as u32)
}

/// Patches the page delta of an `adrp`. Shared with Mach-O `PAGE21`.
pub(crate) fn write_page21(site: &PatchSite, value: RelocValue<u64>) -> Result<()> {
    let delta = ((value.0 & !0xfff) as i64).wrapping_sub((site.target & !0xfff) as i64);
    let imm = check_signed(delta, 33)? >> 12;
    let immlo = ((imm & 0x3) as u32) << 29;
    let immhi = (((imm >> 2) & 0x7ffff) as u32) << 5;
    site.patch_insn(ADR_MASK, immlo | immhi)
}

/// Patches the low 12 bits of an address into an `add`/`ldr`/`str`
/// immediate, scaled by the access size.
pub(crate) fn write_lo12(site: &PatchSite, value: RelocValue<u64>, scale: u32) -> Result<()> {
    let lo12 = (value.0 & 0xfff) as u32;
    if lo12 & ((1 << scale) - 1) != 0 {
        return Err(relocate_error(format!(
            "low 12 bits {lo12:#x} are not aligned to the {}-byte access",
            1 << scale
        )));
    }
    site.patch_insn(IMM12_MASK, (lo12 >> scale) << 10)
}

/// Infers the access scale of a load/store from its size bits.
pub(crate) fn ldst_scale(insn: u32) -> u32 {
    let size = insn >> 30;
    // 128-bit SIMD loads use size == 0 with opc bit 1 set.
    if size == 0 && (insn >> 23) & 0x1 == 1 && (insn >> 26) & 0x1 == 1 {
        4
    } else {
        size
    }
}

fn write_movw(site: &PatchSite, value: RelocValue<u64>, group: u32, check: bool) -> Result<()> {
    let shift = group * 16;
    if check && group < 3 && value.0 >> (shift + 16) != 0 {
        return Err(relocate_error(format!(
            "value {:#x} does not fit in MOVW group {group}",
            value.0
        )));
    }
    let imm = ((value.0 >> shift) & 0xffff) as u32;
    site.patch_insn(MOVW_MASK, imm << 5)
}

/// Writes the relocation into the patch site. For the GOT kinds and calls
/// routed through a stub, `s` is already the slot or stub address.
pub(crate) fn apply_elf(r_type: u32, site: &PatchSite, s: u64, a: i64) -> Result<()> {
    let value = RelocValue::new(s) + a;
    match r_type {
        R_AARCH64_NONE => {}
        R_AARCH64_ABS64 => site.write(value)?,
        R_AARCH64_ABS32 => {
            let signed = value.0 as i64;
            if !(i32::MIN as i64..=u32::MAX as i64).contains(&signed) {
                return Err(relocate_error(format!(
                    "value {signed:#x} does not fit in R_AARCH64_ABS32"
                )));
            }
            site.write(RelocValue(value.0 as u32))?;
        }
        R_AARCH64_PREL32 => {
            let delta = (value - site.target).0 as i64;
            if !(i32::MIN as i64..=u32::MAX as i64).contains(&delta) {
                return Err(relocate_error(format!(
                    "value {delta:#x} does not fit in R_AARCH64_PREL32"
                )));
            }
            site.write(RelocValue(delta as u32))?;
        }
        R_AARCH64_PREL64 => site.write(value - site.target)?,
        R_AARCH64_CALL26 | R_AARCH64_JUMP26 => write_branch26(site, value)?,
        R_AARCH64_ADR_PREL_PG_HI21 | R_AARCH64_ADR_GOT_PAGE => write_page21(site, value)?,
        R_AARCH64_ADD_ABS_LO12_NC | R_AARCH64_LDST8_ABS_LO12_NC => write_lo12(site, value, 0)?,
        R_AARCH64_LDST16_ABS_LO12_NC => write_lo12(site, value, 1)?,
        R_AARCH64_LDST32_ABS_LO12_NC => write_lo12(site, value, 2)?,
        R_AARCH64_LDST64_ABS_LO12_NC | R_AARCH64_LD64_GOT_LO12_NC => write_lo12(site, value, 3)?,
        R_AARCH64_LDST128_ABS_LO12_NC => write_lo12(site, value, 4)?,
        R_AARCH64_MOVW_UABS_G0 => write_movw(site, value, 0, true)?,
        R_AARCH64_MOVW_UABS_G0_NC => write_movw(site, value, 0, false)?,
        R_AARCH64_MOVW_UABS_G1 => write_movw(site, value, 1, true)?,
        R_AARCH64_MOVW_UABS_G1_NC => write_movw(site, value, 1, false)?,
        R_AARCH64_MOVW_UABS_G2 => write_movw(site, value, 2, true)?,
        R_AARCH64_MOVW_UABS_G2_NC => write_movw(site, value, 2, false)?,
        R_AARCH64_MOVW_UABS_G3 => write_movw(site, value, 3, true)?,
        _ => {
            return Err(fatal_error(format!(
                "unsupported aarch64 relocation type {r_type}"
            )));
        }
    }
    Ok(())
}
