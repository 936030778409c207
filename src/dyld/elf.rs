use crate::{
    ObjectImage, Result,
    arch::{StubKind, aarch64, x86, x86_64},
    dyld::linker::{FormatHandler, ResolveContext},
    error::{fatal_error, parse_object_error},
    image::{ObjectFormat, RelocationInfo, SectionInfo},
    relocation::{PatchSite, RelocKind},
};
use elf::abi::{R_AARCH64_ABS64, R_X86_64_64};
use object::Architecture;
use std::borrow::Cow;

/// ELF relocatable objects for x86_64, AArch64 and i386.
pub(crate) struct ElfHandler {
    arch: Architecture,
}

impl ElfHandler {
    fn r_type(kind: RelocKind) -> Option<u32> {
        match kind {
            RelocKind::Elf(r_type) => Some(r_type),
            _ => None,
        }
    }
}

impl FormatHandler for ElfHandler {
    const FORMAT: ObjectFormat = ObjectFormat::Elf;

    fn new(arch: Architecture) -> Result<Self> {
        match arch {
            Architecture::X86_64 | Architecture::Aarch64 | Architecture::I386 => Ok(Self { arch }),
            other => Err(parse_object_error(format!(
                "ELF objects for {other:?} are not supported"
            ))),
        }
    }

    fn arch(&self) -> Architecture {
        self.arch
    }

    fn is_supported(&self, kind: RelocKind) -> bool {
        let Some(r_type) = Self::r_type(kind) else {
            return false;
        };
        match self.arch {
            Architecture::X86_64 => x86_64::elf_supported(r_type),
            Architecture::Aarch64 => aarch64::elf_supported(r_type),
            Architecture::I386 => x86::elf_supported(r_type),
            _ => false,
        }
    }

    fn kind_name(&self, kind: RelocKind) -> Cow<'static, str> {
        let name = match (self.arch, Self::r_type(kind)) {
            (Architecture::X86_64, Some(r_type)) => x86_64::rel_type_to_str(r_type),
            (Architecture::Aarch64, Some(r_type)) => aarch64::rel_type_to_str(r_type),
            (Architecture::I386, Some(r_type)) => x86::rel_type_to_str(r_type),
            _ => "UNKNOWN",
        };
        if name == "UNKNOWN" {
            Cow::Owned(kind.to_string())
        } else {
            Cow::Borrowed(name)
        }
    }

    fn stub_kind(&self, kind: RelocKind) -> Option<StubKind> {
        let r_type = Self::r_type(kind)?;
        match self.arch {
            Architecture::X86_64 => x86_64::elf_stub_kind(r_type),
            Architecture::Aarch64 => aarch64::elf_stub_kind(r_type),
            _ => None,
        }
    }

    fn abs64_kind(&self) -> RelocKind {
        match self.arch {
            Architecture::Aarch64 => RelocKind::Elf(R_AARCH64_ABS64),
            _ => RelocKind::Elf(R_X86_64_64),
        }
    }

    fn addend(
        &self,
        image: &ObjectImage,
        section: &SectionInfo,
        reloc: &RelocationInfo,
    ) -> Result<i64> {
        if !reloc.implicit_addend {
            return Ok(reloc.addend);
        }
        // REL entries keep the addend in the patched field.
        let width = match reloc.size {
            8 | 16 | 32 | 64 => reloc.size as usize / 8,
            _ => 4,
        };
        let raw = image.read_bytes(section, reloc.offset, width)?;
        let shift = 64 - width as u32 * 8;
        Ok(((raw << shift) as i64) >> shift)
    }

    fn apply(
        &self,
        kind: RelocKind,
        site: &PatchSite,
        s: u64,
        a: i64,
        _ctx: &ResolveContext<'_>,
    ) -> Result<()> {
        let Some(r_type) = Self::r_type(kind) else {
            return Err(fatal_error(format!("{kind} in an ELF object")));
        };
        match self.arch {
            Architecture::X86_64 => x86_64::apply_elf(r_type, site, s, a),
            Architecture::Aarch64 => aarch64::apply_elf(r_type, site, s, a),
            Architecture::I386 => x86::apply_elf(r_type, site, s, a),
            other => Err(fatal_error(format!("no ELF relocator for {other:?}"))),
        }
    }
}
