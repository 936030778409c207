//! Parsed, immutable view of one relocatable object.

use crate::{
    ObjectBuffer, Result,
    error::parse_object_error,
    relocation::RelocKind,
};
use hashbrown::HashMap;
use object::{
    Object, ObjectSection, ObjectSymbol, RelocationFlags, SymbolSection,
};
use std::fmt::Debug;

/// Object file container formats understood by the loader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectFormat {
    Elf,
    MachO,
    Coff,
}

impl ObjectFormat {
    /// Prefix the format's symbol tables put in front of C identifiers.
    pub fn global_prefix(self) -> &'static str {
        match self {
            ObjectFormat::MachO => "_",
            ObjectFormat::Elf | ObjectFormat::Coff => "",
        }
    }
}

/// What a section holds, which decides where and whether it is loaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SectionKind {
    Text,
    Data,
    ReadOnlyData,
    /// Uninitialized data that occupies no bytes in the file.
    ZeroFill,
    /// Thread-local data. The loader does not materialize it.
    Tls,
    /// Debug info, notes, symbol tables and everything else not loaded.
    Other,
}

impl SectionKind {
    #[inline]
    pub fn is_loadable(self) -> bool {
        matches!(
            self,
            SectionKind::Text | SectionKind::Data | SectionKind::ReadOnlyData | SectionKind::ZeroFill
        )
    }
}

#[derive(Clone, Debug)]
pub struct SectionInfo {
    /// Index of the section in the object's section table.
    pub index: usize,
    pub name: String,
    /// Address of the section inside the object's own address layout.
    pub address: u64,
    pub size: u64,
    pub align: u64,
    pub kind: SectionKind,
    file_range: Option<(u64, u64)>,
}

impl SectionInfo {
    #[inline]
    pub fn is_eh_frame(&self) -> bool {
        self.name == ".eh_frame" || self.name == "__eh_frame"
    }
}

/// Where a symbol lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolPlace {
    Undefined,
    Absolute,
    Common,
    Section(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Data,
    Section,
    Other,
}

#[derive(Clone, Debug)]
pub struct SymbolInfo {
    /// Index of the symbol in the object's symbol table.
    pub index: usize,
    pub name: String,
    pub kind: SymbolKind,
    pub place: SymbolPlace,
    /// Symbol value; for section symbols an address in the object layout.
    pub address: u64,
    pub size: u64,
    pub global: bool,
    pub weak: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocationTarget {
    /// Index into [`ObjectImage::symbols`].
    Symbol(usize),
    /// Section table index.
    Section(usize),
    Absolute,
}

#[derive(Clone, Debug)]
pub struct RelocationInfo {
    /// Section table index of the section being patched.
    pub section: usize,
    pub offset: u64,
    pub kind: RelocKind,
    /// Width of the patched field in bits, zero if the format does not say.
    pub size: u8,
    pub target: RelocationTarget,
    /// The explicit addend. Meaningless when `implicit_addend` is set: the
    /// addend is then encoded in the patched bytes.
    pub addend: i64,
    pub implicit_addend: bool,
}

/// A relocatable object parsed once into owned section, symbol and
/// relocation tables.
///
/// The image owns the bytes it was parsed from. None of the tables change
/// after parsing; the loader reads section contents and in-place addends
/// from the pristine bytes, never from loaded memory.
pub struct ObjectImage {
    buffer: ObjectBuffer,
    format: ObjectFormat,
    arch: object::Architecture,
    sections: Vec<SectionInfo>,
    symbols: Vec<SymbolInfo>,
    relocations: Vec<RelocationInfo>,
}

impl ObjectImage {
    /// Parses `buffer`. On failure the buffer is dropped before the error is
    /// returned.
    pub fn parse(buffer: ObjectBuffer) -> Result<Self> {
        let parsed = parse_tables(&buffer)?;
        Ok(Self {
            buffer,
            format: parsed.format,
            arch: parsed.arch,
            sections: parsed.sections,
            symbols: parsed.symbols,
            relocations: parsed.relocations,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.buffer.name()
    }

    #[inline]
    pub fn format(&self) -> ObjectFormat {
        self.format
    }

    #[inline]
    pub fn architecture(&self) -> object::Architecture {
        self.arch
    }

    #[inline]
    pub fn sections(&self) -> &[SectionInfo] {
        &self.sections
    }

    #[inline]
    pub fn symbols(&self) -> &[SymbolInfo] {
        &self.symbols
    }

    #[inline]
    pub fn relocations(&self) -> &[RelocationInfo] {
        &self.relocations
    }

    #[inline]
    pub fn buffer(&self) -> &ObjectBuffer {
        &self.buffer
    }

    pub fn section_by_index(&self, index: usize) -> Option<&SectionInfo> {
        self.sections.iter().find(|s| s.index == index)
    }

    pub fn section_by_name(&self, name: &str) -> Option<&SectionInfo> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// File contents of a section, empty for zero-fill sections.
    pub fn section_data(&self, section: &SectionInfo) -> Result<&[u8]> {
        match section.file_range {
            None => Ok(&[]),
            Some((offset, size)) => {
                let range = usize::try_from(offset)
                    .ok()
                    .zip(usize::try_from(size).ok())
                    .and_then(|(start, len)| Some(start..start.checked_add(len)?));
                range
                    .and_then(|range| self.buffer.as_bytes().get(range))
                    .ok_or_else(|| {
                        parse_object_error(format!(
                            "section [{}] of [{}] extends past the end of the file",
                            section.name,
                            self.name()
                        ))
                    })
            }
        }
    }

    /// Reads `width` little-endian bytes at `offset` of a section from the
    /// pristine object bytes.
    pub(crate) fn read_bytes(&self, section: &SectionInfo, offset: u64, width: usize) -> Result<u64> {
        let data = self.section_data(section)?;
        let bytes = usize::try_from(offset)
            .ok()
            .and_then(|start| data.get(start..start.checked_add(width)?))
            .ok_or_else(|| {
                parse_object_error(format!(
                    "relocation at offset {:#x} lies outside section [{}]",
                    offset, section.name
                ))
            })?;
        let mut raw = [0u8; 8];
        raw[..width].copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }
}

impl Debug for ObjectImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectImage")
            .field("name", &self.name())
            .field("format", &self.format)
            .field("arch", &self.arch)
            .field("sections", &self.sections.len())
            .field("symbols", &self.symbols.len())
            .field("relocations", &self.relocations.len())
            .finish()
    }
}

struct Tables {
    format: ObjectFormat,
    arch: object::Architecture,
    sections: Vec<SectionInfo>,
    symbols: Vec<SymbolInfo>,
    relocations: Vec<RelocationInfo>,
}

fn parse_tables(buffer: &ObjectBuffer) -> Result<Tables> {
    let name = buffer.name();
    let file = object::File::parse(buffer.as_bytes())
        .map_err(|err| parse_object_error(format!("[{name}]: {err}")))?;
    let format = match file.format() {
        object::BinaryFormat::Elf => ObjectFormat::Elf,
        object::BinaryFormat::MachO => ObjectFormat::MachO,
        object::BinaryFormat::Coff => ObjectFormat::Coff,
        other => {
            return Err(parse_object_error(format!(
                "[{name}]: unsupported object format {other:?}"
            )));
        }
    };
    if file.kind() != object::ObjectKind::Relocatable {
        return Err(parse_object_error(format!(
            "[{name}]: not a relocatable object ({:?})",
            file.kind()
        )));
    }
    if !file.is_little_endian() {
        return Err(parse_object_error(format!(
            "[{name}]: big-endian objects are not supported"
        )));
    }
    let arch = file.architecture();

    let mut sections = Vec::new();
    let mut relocations = Vec::new();
    for section in file.sections() {
        let index = section.index().0;
        let sec_name = section
            .name()
            .map_err(|err| parse_object_error(format!("[{name}]: bad section name: {err}")))?;
        let kind = section_kind(section.kind());
        sections.push(SectionInfo {
            index,
            name: sec_name.to_owned(),
            address: section.address(),
            size: section.size(),
            align: section.align().max(1),
            kind,
            file_range: if kind == SectionKind::ZeroFill {
                None
            } else {
                section.file_range()
            },
        });
        for (offset, reloc) in section.relocations() {
            let target = match reloc.target() {
                object::RelocationTarget::Symbol(sym) => RelocationTarget::Symbol(sym.0),
                object::RelocationTarget::Section(sec) => RelocationTarget::Section(sec.0),
                object::RelocationTarget::Absolute => RelocationTarget::Absolute,
                _ => {
                    return Err(parse_object_error(format!(
                        "[{name}]: unsupported relocation target in [{sec_name}]"
                    )));
                }
            };
            relocations.push(RelocationInfo {
                section: index,
                offset,
                kind: reloc_kind(reloc.flags()).ok_or_else(|| {
                    parse_object_error(format!(
                        "[{name}]: unsupported relocation encoding {:?}",
                        reloc.flags()
                    ))
                })?,
                size: reloc.size(),
                target,
                addend: reloc.addend(),
                implicit_addend: reloc.has_implicit_addend(),
            });
        }
    }

    let mut symbols = Vec::new();
    let mut by_index = HashMap::new();
    for symbol in file.symbols() {
        let sym_name = symbol.name().unwrap_or_default();
        let place = match symbol.section() {
            SymbolSection::Section(idx) => SymbolPlace::Section(idx.0),
            SymbolSection::Absolute => SymbolPlace::Absolute,
            SymbolSection::Common => SymbolPlace::Common,
            _ => SymbolPlace::Undefined,
        };
        let kind = match symbol.kind() {
            object::SymbolKind::Text => SymbolKind::Function,
            object::SymbolKind::Data | object::SymbolKind::Tls => SymbolKind::Data,
            object::SymbolKind::Section => SymbolKind::Section,
            _ => SymbolKind::Other,
        };
        by_index.insert(symbol.index().0, symbols.len());
        symbols.push(SymbolInfo {
            index: symbol.index().0,
            name: sym_name.to_owned(),
            kind,
            place,
            address: symbol.address(),
            size: symbol.size(),
            global: symbol.is_global(),
            weak: symbol.is_weak(),
        });
    }
    // Relocations refer to symbols by table index; store positions instead.
    for reloc in &mut relocations {
        if let RelocationTarget::Symbol(idx) = reloc.target {
            match by_index.get(&idx) {
                Some(pos) => reloc.target = RelocationTarget::Symbol(*pos),
                // The ELF null symbol: no target at all.
                None if idx == 0 => reloc.target = RelocationTarget::Absolute,
                None => {
                    return Err(parse_object_error(format!(
                        "[{name}]: relocation references missing symbol #{idx}"
                    )));
                }
            }
        }
    }

    #[cfg(feature = "log")]
    log::debug!(
        "parsed [{}]: {:?} {:?}, {} sections, {} symbols, {} relocations",
        name,
        format,
        arch,
        sections.len(),
        symbols.len(),
        relocations.len()
    );

    Ok(Tables {
        format,
        arch,
        sections,
        symbols,
        relocations,
    })
}

fn section_kind(kind: object::SectionKind) -> SectionKind {
    use object::SectionKind as K;
    match kind {
        K::Text => SectionKind::Text,
        K::Data => SectionKind::Data,
        K::ReadOnlyData | K::ReadOnlyString | K::ReadOnlyDataWithRel => SectionKind::ReadOnlyData,
        K::UninitializedData | K::Common => SectionKind::ZeroFill,
        K::Tls | K::UninitializedTls | K::TlsVariables => SectionKind::Tls,
        _ => SectionKind::Other,
    }
}

fn reloc_kind(flags: RelocationFlags) -> Option<RelocKind> {
    match flags {
        RelocationFlags::Elf { r_type } => Some(RelocKind::Elf(r_type)),
        RelocationFlags::MachO {
            r_type,
            r_pcrel,
            r_length,
        } => Some(RelocKind::MachO {
            r_type,
            pc_rel: r_pcrel,
            log2_size: r_length,
        }),
        RelocationFlags::Coff { typ } => Some(RelocKind::Coff(typ)),
        _ => None,
    }
}
