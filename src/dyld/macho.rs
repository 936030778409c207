use crate::{
    ObjectImage, Result,
    arch::{StubKind, aarch64},
    dyld::{
        SectionId,
        linker::{EhFrame, FormatHandler, ResolveContext},
        section::SectionEntry,
    },
    error::{fatal_error, parse_object_error, relocate_error},
    image::{ObjectFormat, RelocationInfo, RelocationTarget, SectionInfo},
    relocation::{PatchSite, RelocKind, RelocValue},
};
use object::{Architecture, macho::*};
use std::borrow::Cow;

/// Mach-O relocatable objects for x86_64 and arm64.
pub(crate) struct MachOHandler {
    arch: Architecture,
}

fn x86_64_name(r_type: u8) -> &'static str {
    match r_type {
        X86_64_RELOC_UNSIGNED => "X86_64_RELOC_UNSIGNED",
        X86_64_RELOC_SIGNED => "X86_64_RELOC_SIGNED",
        X86_64_RELOC_BRANCH => "X86_64_RELOC_BRANCH",
        X86_64_RELOC_GOT_LOAD => "X86_64_RELOC_GOT_LOAD",
        X86_64_RELOC_GOT => "X86_64_RELOC_GOT",
        X86_64_RELOC_SUBTRACTOR => "X86_64_RELOC_SUBTRACTOR",
        X86_64_RELOC_SIGNED_1 => "X86_64_RELOC_SIGNED_1",
        X86_64_RELOC_SIGNED_2 => "X86_64_RELOC_SIGNED_2",
        X86_64_RELOC_SIGNED_4 => "X86_64_RELOC_SIGNED_4",
        X86_64_RELOC_TLV => "X86_64_RELOC_TLV",
        _ => "UNKNOWN",
    }
}

fn arm64_name(r_type: u8) -> &'static str {
    match r_type {
        ARM64_RELOC_UNSIGNED => "ARM64_RELOC_UNSIGNED",
        ARM64_RELOC_SUBTRACTOR => "ARM64_RELOC_SUBTRACTOR",
        ARM64_RELOC_BRANCH26 => "ARM64_RELOC_BRANCH26",
        ARM64_RELOC_PAGE21 => "ARM64_RELOC_PAGE21",
        ARM64_RELOC_PAGEOFF12 => "ARM64_RELOC_PAGEOFF12",
        ARM64_RELOC_GOT_LOAD_PAGE21 => "ARM64_RELOC_GOT_LOAD_PAGE21",
        ARM64_RELOC_GOT_LOAD_PAGEOFF12 => "ARM64_RELOC_GOT_LOAD_PAGEOFF12",
        ARM64_RELOC_ADDEND => "ARM64_RELOC_ADDEND",
        _ => "UNKNOWN",
    }
}

fn sign_extend(raw: u64, width: usize) -> i64 {
    let shift = 64 - width as u32 * 8;
    ((raw << shift) as i64) >> shift
}

impl MachOHandler {
    fn fields(kind: RelocKind) -> Option<(u8, bool, u8)> {
        match kind {
            RelocKind::MachO {
                r_type,
                pc_rel,
                log2_size,
            } => Some((r_type, pc_rel, log2_size)),
            _ => None,
        }
    }

    fn write_unsigned(site: &PatchSite, value: RelocValue<u64>, log2_size: u8) -> Result<()> {
        match log2_size {
            3 => site.write(value),
            2 => {
                let val: RelocValue<u32> = value.try_into()?;
                site.write(val)
            }
            _ => Err(relocate_error(format!(
                "unsigned relocation of {} bytes",
                1u32 << log2_size
            ))),
        }
    }

    fn apply_x86_64(r_type: u8, log2_size: u8, site: &PatchSite, s: u64, a: i64) -> Result<()> {
        let value = RelocValue::new(s) + a;
        match r_type {
            X86_64_RELOC_UNSIGNED => Self::write_unsigned(site, value, log2_size),
            X86_64_RELOC_SIGNED
            | X86_64_RELOC_SIGNED_1
            | X86_64_RELOC_SIGNED_2
            | X86_64_RELOC_SIGNED_4
            | X86_64_RELOC_BRANCH
            | X86_64_RELOC_GOT
            | X86_64_RELOC_GOT_LOAD => {
                // Measured from the end of the 4-byte field. The extra
                // trailing bytes of SIGNED_n are folded into the addend.
                let val: RelocValue<i32> = (value - (site.target + 4)).try_into()?;
                site.write(val)
            }
            _ => Err(fatal_error(format!(
                "unsupported Mach-O x86_64 relocation {}",
                x86_64_name(r_type)
            ))),
        }
    }

    fn apply_arm64(r_type: u8, log2_size: u8, site: &PatchSite, s: u64, a: i64) -> Result<()> {
        let value = RelocValue::new(s) + a;
        match r_type {
            ARM64_RELOC_UNSIGNED => Self::write_unsigned(site, value, log2_size),
            ARM64_RELOC_BRANCH26 => aarch64::write_branch26(site, value),
            ARM64_RELOC_PAGE21 | ARM64_RELOC_GOT_LOAD_PAGE21 => aarch64::write_page21(site, value),
            ARM64_RELOC_PAGEOFF12 | ARM64_RELOC_GOT_LOAD_PAGEOFF12 => {
                let insn = site.read_u32()?;
                let scale = if insn & 0x3b00_0000 == 0x3900_0000 {
                    aarch64::ldst_scale(insn)
                } else {
                    0
                };
                aarch64::write_lo12(site, value, scale)
            }
            _ => Err(fatal_error(format!(
                "unsupported Mach-O arm64 relocation {}",
                arm64_name(r_type)
            ))),
        }
    }
}

impl FormatHandler for MachOHandler {
    const FORMAT: ObjectFormat = ObjectFormat::MachO;

    fn new(arch: Architecture) -> Result<Self> {
        match arch {
            Architecture::X86_64 | Architecture::Aarch64 => Ok(Self { arch }),
            other => Err(parse_object_error(format!(
                "Mach-O objects for {other:?} are not supported"
            ))),
        }
    }

    fn arch(&self) -> Architecture {
        self.arch
    }

    fn is_supported(&self, kind: RelocKind) -> bool {
        let Some((r_type, _, log2_size)) = Self::fields(kind) else {
            return false;
        };
        match self.arch {
            Architecture::X86_64 => match r_type {
                X86_64_RELOC_UNSIGNED => matches!(log2_size, 2 | 3),
                X86_64_RELOC_SIGNED
                | X86_64_RELOC_SIGNED_1
                | X86_64_RELOC_SIGNED_2
                | X86_64_RELOC_SIGNED_4
                | X86_64_RELOC_BRANCH
                | X86_64_RELOC_GOT
                | X86_64_RELOC_GOT_LOAD => log2_size == 2,
                _ => false,
            },
            Architecture::Aarch64 => match r_type {
                ARM64_RELOC_UNSIGNED => matches!(log2_size, 2 | 3),
                ARM64_RELOC_BRANCH26
                | ARM64_RELOC_PAGE21
                | ARM64_RELOC_PAGEOFF12
                | ARM64_RELOC_GOT_LOAD_PAGE21
                | ARM64_RELOC_GOT_LOAD_PAGEOFF12 => true,
                _ => false,
            },
            _ => false,
        }
    }

    fn kind_name(&self, kind: RelocKind) -> Cow<'static, str> {
        let name = match (self.arch, Self::fields(kind)) {
            (Architecture::X86_64, Some((r_type, ..))) => x86_64_name(r_type),
            (Architecture::Aarch64, Some((r_type, ..))) => arm64_name(r_type),
            _ => "UNKNOWN",
        };
        if name == "UNKNOWN" {
            Cow::Owned(kind.to_string())
        } else {
            Cow::Borrowed(name)
        }
    }

    fn stub_kind(&self, kind: RelocKind) -> Option<StubKind> {
        let (r_type, ..) = Self::fields(kind)?;
        match (self.arch, r_type) {
            (Architecture::X86_64, X86_64_RELOC_BRANCH) => Some(StubKind::Call),
            (Architecture::X86_64, X86_64_RELOC_GOT | X86_64_RELOC_GOT_LOAD) => {
                Some(StubKind::GotSlot)
            }
            (Architecture::Aarch64, ARM64_RELOC_BRANCH26) => Some(StubKind::Call),
            (
                Architecture::Aarch64,
                ARM64_RELOC_GOT_LOAD_PAGE21 | ARM64_RELOC_GOT_LOAD_PAGEOFF12,
            ) => Some(StubKind::GotSlot),
            _ => None,
        }
    }

    fn abs64_kind(&self) -> RelocKind {
        RelocKind::MachO {
            r_type: X86_64_RELOC_UNSIGNED,
            pc_rel: false,
            log2_size: 3,
        }
    }

    fn addend(
        &self,
        image: &ObjectImage,
        section: &SectionInfo,
        reloc: &RelocationInfo,
    ) -> Result<i64> {
        let (r_type, pc_rel, log2_size) = Self::fields(reloc.kind)
            .ok_or_else(|| parse_object_error("non Mach-O relocation in a Mach-O object"))?;
        let instruction_kind =
            self.arch == Architecture::Aarch64 && r_type != ARM64_RELOC_UNSIGNED;
        let inplace = if !reloc.implicit_addend {
            reloc.addend
        } else if instruction_kind {
            if r_type == ARM64_RELOC_BRANCH26 {
                let insn = image.read_bytes(section, reloc.offset, 4)?;
                (((insn & 0x03ff_ffff) << 38) as i64) >> 36
            } else {
                0
            }
        } else {
            let width = 1usize << log2_size;
            sign_extend(image.read_bytes(section, reloc.offset, width)?, width)
        };
        let RelocationTarget::Section(index) = reloc.target else {
            return Ok(inplace);
        };
        // Section-relative references store object-layout addresses.
        let target = image.section_by_index(index).ok_or_else(|| {
            parse_object_error(format!("relocation against missing section #{index}"))
        })?;
        let site = section.address + reloc.offset;
        let target_obj = match (self.arch, pc_rel) {
            (Architecture::X86_64, true) => (inplace + site as i64 + 4) as u64,
            (Architecture::Aarch64, true) if r_type == ARM64_RELOC_BRANCH26 => {
                (inplace + site as i64) as u64
            }
            (Architecture::Aarch64, _) if instruction_kind => {
                return Err(fatal_error(format!(
                    "section-relative {} is not supported",
                    arm64_name(r_type)
                )));
            }
            _ => inplace as u64,
        };
        // For x86_64 pc-relative kinds the write subtracts the field end
        // again, so the SIGNED_n displacement bias cancels out here.
        Ok(target_obj.wrapping_sub(target.address) as i64)
    }

    fn apply(
        &self,
        kind: RelocKind,
        site: &PatchSite,
        s: u64,
        a: i64,
        _ctx: &ResolveContext<'_>,
    ) -> Result<()> {
        let Some((r_type, _, log2_size)) = Self::fields(kind) else {
            return Err(fatal_error(format!("{kind} in a Mach-O object")));
        };
        match self.arch {
            Architecture::X86_64 => Self::apply_x86_64(r_type, log2_size, site, s, a),
            Architecture::Aarch64 => Self::apply_arm64(r_type, log2_size, site, s, a),
            other => Err(fatal_error(format!("no Mach-O relocator for {other:?}"))),
        }
    }

    fn fixup_eh_frame(&self, frame: &EhFrame, sections: &[SectionEntry]) -> Result<()> {
        let Some(text) = frame.text else {
            return Ok(());
        };
        let eh = &sections[frame.eh_frame.0];
        let delta = |other: SectionId| -> i64 {
            let other = &sections[other.0];
            let obj_distance = other.obj_address.wrapping_sub(eh.obj_address) as i64;
            let mem_distance = other.load_address.wrapping_sub(eh.load_address) as i64;
            obj_distance.wrapping_sub(mem_distance)
        };
        let delta_for_text = delta(text);
        let delta_for_eh = frame.except_table.map_or(0, delta);

        // SAFETY: the section is live and still writable before finalization.
        let bytes = unsafe { core::slice::from_raw_parts_mut(eh.local.as_ptr(), eh.size) };
        let mut pos = 0usize;
        while pos + 8 <= bytes.len() {
            let length = read_u32(bytes, pos) as usize;
            if length == 0 {
                break;
            }
            let next = pos + 4 + length;
            let cie_offset = read_u32(bytes, pos + 4);
            if cie_offset != 0 && pos + 25 <= bytes.len() {
                let pc_begin = pos + 8;
                let location = read_u64(bytes, pc_begin) as i64;
                write_u64(bytes, pc_begin, location.wrapping_sub(delta_for_text) as u64);
                // Skip the address range.
                let aug = pc_begin + 16;
                if bytes[aug] != 0 && aug + 9 <= bytes.len() {
                    let lsda = read_u64(bytes, aug + 1) as i64;
                    write_u64(bytes, aug + 1, lsda.wrapping_sub(delta_for_eh) as u64);
                }
            }
            pos = next;
        }
        Ok(())
    }
}

fn read_u32(bytes: &[u8], pos: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[pos..pos + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(bytes: &[u8], pos: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[pos..pos + 8]);
    u64::from_le_bytes(raw)
}

fn write_u64(bytes: &mut [u8], pos: usize, value: u64) {
    bytes[pos..pos + 8].copy_from_slice(&value.to_le_bytes());
}
