use crate::{
    ObjectImage, Result,
    arch::StubKind,
    dyld::linker::{FormatHandler, ResolveContext},
    error::{fatal_error, parse_object_error, relocate_error},
    image::{ObjectFormat, RelocationInfo, SectionInfo},
    relocation::{PatchSite, RelocKind, RelocValue},
};
use object::{Architecture, pe::*};
use std::borrow::Cow;

/// COFF relocatable objects for x86_64.
pub(crate) struct CoffHandler {
    arch: Architecture,
}

fn rel_type_to_str(typ: u16) -> &'static str {
    match typ {
        IMAGE_REL_AMD64_ABSOLUTE => "IMAGE_REL_AMD64_ABSOLUTE",
        IMAGE_REL_AMD64_ADDR64 => "IMAGE_REL_AMD64_ADDR64",
        IMAGE_REL_AMD64_ADDR32 => "IMAGE_REL_AMD64_ADDR32",
        IMAGE_REL_AMD64_ADDR32NB => "IMAGE_REL_AMD64_ADDR32NB",
        IMAGE_REL_AMD64_REL32 => "IMAGE_REL_AMD64_REL32",
        IMAGE_REL_AMD64_REL32_1 => "IMAGE_REL_AMD64_REL32_1",
        IMAGE_REL_AMD64_REL32_2 => "IMAGE_REL_AMD64_REL32_2",
        IMAGE_REL_AMD64_REL32_3 => "IMAGE_REL_AMD64_REL32_3",
        IMAGE_REL_AMD64_REL32_4 => "IMAGE_REL_AMD64_REL32_4",
        IMAGE_REL_AMD64_REL32_5 => "IMAGE_REL_AMD64_REL32_5",
        IMAGE_REL_AMD64_SECTION => "IMAGE_REL_AMD64_SECTION",
        IMAGE_REL_AMD64_SECREL => "IMAGE_REL_AMD64_SECREL",
        _ => "UNKNOWN",
    }
}

impl CoffHandler {
    fn typ(kind: RelocKind) -> Option<u16> {
        match kind {
            RelocKind::Coff(typ) => Some(typ),
            _ => None,
        }
    }
}

impl FormatHandler for CoffHandler {
    const FORMAT: ObjectFormat = ObjectFormat::Coff;

    fn new(arch: Architecture) -> Result<Self> {
        match arch {
            Architecture::X86_64 => Ok(Self { arch }),
            other => Err(parse_object_error(format!(
                "COFF objects for {other:?} are not supported"
            ))),
        }
    }

    fn arch(&self) -> Architecture {
        self.arch
    }

    fn is_supported(&self, kind: RelocKind) -> bool {
        Self::typ(kind).is_some_and(|typ| rel_type_to_str(typ) != "UNKNOWN")
    }

    fn kind_name(&self, kind: RelocKind) -> Cow<'static, str> {
        match Self::typ(kind).map(rel_type_to_str) {
            Some(name) if name != "UNKNOWN" => Cow::Borrowed(name),
            _ => Cow::Owned(kind.to_string()),
        }
    }

    fn stub_kind(&self, kind: RelocKind) -> Option<StubKind> {
        match Self::typ(kind)? {
            IMAGE_REL_AMD64_REL32 => Some(StubKind::Call),
            _ => None,
        }
    }

    fn abs64_kind(&self) -> RelocKind {
        RelocKind::Coff(IMAGE_REL_AMD64_ADDR64)
    }

    fn addend(
        &self,
        image: &ObjectImage,
        section: &SectionInfo,
        reloc: &RelocationInfo,
    ) -> Result<i64> {
        let typ = Self::typ(reloc.kind)
            .ok_or_else(|| parse_object_error("non COFF relocation in a COFF object"))?;
        // COFF keeps every addend in the patched field.
        let raw = match typ {
            IMAGE_REL_AMD64_ABSOLUTE | IMAGE_REL_AMD64_SECTION => return Ok(0),
            IMAGE_REL_AMD64_ADDR64 => image.read_bytes(section, reloc.offset, 8)?,
            _ => image.read_bytes(section, reloc.offset, 4)? as u32 as i32 as u64,
        };
        Ok(raw as i64)
    }

    fn apply(
        &self,
        kind: RelocKind,
        site: &PatchSite,
        s: u64,
        a: i64,
        ctx: &ResolveContext<'_>,
    ) -> Result<()> {
        let Some(typ) = Self::typ(kind) else {
            return Err(fatal_error(format!("{kind} in a COFF object")));
        };
        let value = RelocValue::new(s) + a;
        match typ {
            IMAGE_REL_AMD64_ABSOLUTE => Ok(()),
            IMAGE_REL_AMD64_ADDR64 => site.write(value),
            IMAGE_REL_AMD64_ADDR32 => {
                let val: RelocValue<u32> = value.try_into()?;
                site.write(val)
            }
            IMAGE_REL_AMD64_ADDR32NB => {
                // Relative to the lowest address of the object's image.
                let val: RelocValue<u32> = (value - ctx.image_base).try_into()?;
                site.write(val)
            }
            IMAGE_REL_AMD64_REL32..=IMAGE_REL_AMD64_REL32_5 => {
                let delta = 4 + u64::from(typ - IMAGE_REL_AMD64_REL32);
                let val: RelocValue<i32> = (value - (site.target + delta)).try_into()?;
                site.write(val)
            }
            IMAGE_REL_AMD64_SECTION => {
                let id = ctx
                    .value_section
                    .ok_or_else(|| relocate_error("section index of a symbol outside any section"))?;
                let val: RelocValue<u16> = RelocValue::new(id.0 as u64).try_into()?;
                site.write(val)
            }
            IMAGE_REL_AMD64_SECREL => {
                let id = ctx
                    .value_section
                    .ok_or_else(|| relocate_error("section offset of a symbol outside any section"))?;
                let val: RelocValue<u32> =
                    (value - ctx.sections[id.0].load_address).try_into()?;
                site.write(val)
            }
            _ => Err(fatal_error(format!(
                "unsupported COFF x86_64 relocation {}",
                rel_type_to_str(typ)
            ))),
        }
    }
}
