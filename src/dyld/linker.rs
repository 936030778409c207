//! Format-independent loading and relocation bookkeeping.
//!
//! [`DyldCore`] does everything that is the same for ELF, Mach-O and COFF:
//! staging and allocating sections, building the symbol table, carving call
//! stubs and GOT slots, and keeping relocation lists keyed by what they
//! reference so they can be re-resolved after a remap. The
//! [`FormatHandler`] supplies the per-format and per-architecture parts.

use crate::{
    Error, ObjectImage, Result,
    arch::{STUB_ALIGN, StubKind, stub_size, stub_template},
    dyld::{RuntimeDyldImpl, SectionId, section::SectionEntry},
    error::{fatal_error, parse_object_error, relocate_error, unresolved_symbol},
    image::{
        ObjectFormat, RelocationInfo, RelocationTarget, SectionInfo, SectionKind, SymbolKind,
        SymbolPlace,
    },
    memory::{MemoryManager, roundup},
    relocation::{PatchSite, RelocKind, RelocationEntry, RelocationValue},
};
use core::{ops::Range, ptr::NonNull};
use hashbrown::{HashMap, HashSet};
use object::Architecture;
use std::borrow::Cow;

/// Context handed to [`FormatHandler::apply`] for kinds whose value depends
/// on more than the symbol address.
pub(crate) struct ResolveContext<'a> {
    pub sections: &'a [SectionEntry],
    /// Lowest target address among the sections of the patch site's object.
    pub image_base: u64,
    /// Section the relocation value refers to, when it refers to one.
    pub value_section: Option<SectionId>,
}

/// An EH frame section together with the sections its FDEs describe.
#[derive(Clone, Copy, Debug)]
pub(crate) struct EhFrame {
    pub eh_frame: SectionId,
    pub text: Option<SectionId>,
    pub except_table: Option<SectionId>,
}

/// The per-format, per-architecture half of the loader.
pub(crate) trait FormatHandler: Sized {
    const FORMAT: ObjectFormat;

    fn new(arch: Architecture) -> Result<Self>;

    fn arch(&self) -> Architecture;

    fn is_supported(&self, kind: RelocKind) -> bool;

    fn kind_name(&self, kind: RelocKind) -> Cow<'static, str>;

    /// Indirection the kind needs, if any. [`StubKind::Call`] is only used
    /// when the value is external.
    fn stub_kind(&self, kind: RelocKind) -> Option<StubKind>;

    /// The kind used to fill the absolute address of a stub or GOT slot.
    fn abs64_kind(&self) -> RelocKind;

    /// The addend of `reloc`, read from the pristine object bytes when the
    /// format stores it in place. For references to a section rather than a
    /// symbol the result is relative to that section's start.
    fn addend(&self, image: &ObjectImage, section: &SectionInfo, reloc: &RelocationInfo)
    -> Result<i64>;

    /// Computes the relocated value from `s` (the referenced address) and `a`
    /// and stores it into `site`.
    fn apply(
        &self,
        kind: RelocKind,
        site: &PatchSite,
        s: u64,
        a: i64,
        ctx: &ResolveContext<'_>,
    ) -> Result<()>;

    /// Rewrites an EH frame before it is registered, for formats whose FDEs
    /// carry object-relative addresses without relocations.
    fn fixup_eh_frame(&self, _frame: &EhFrame, _sections: &[SectionEntry]) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct SymbolLoc {
    pub section: SectionId,
    pub offset: u64,
}

/// Everything a load produces, committed only once the load succeeds.
#[derive(Default)]
struct Staged {
    sections: Vec<SectionEntry>,
    ids: HashMap<usize, SectionId>,
    stub_cursor: Vec<usize>,
    stubs: HashMap<(SectionId, RelocationValue, i64, StubKind), usize>,
    commons: HashMap<usize, SymbolLoc>,
    globals: Vec<(String, SymbolLoc)>,
    weak: Vec<String>,
    relocs: Vec<(RelocationEntry, RelocationValue)>,
    eh_frames: Vec<EhFrame>,
}

pub(crate) struct DyldCore<F> {
    handler: F,
    sections: Vec<SectionEntry>,
    /// Section id range of every loaded object, in load order.
    objects: Vec<Range<usize>>,
    globals: HashMap<String, SymbolLoc>,
    weak_externals: HashSet<String>,
    section_relocs: HashMap<SectionId, Vec<RelocationEntry>>,
    external_relocs: HashMap<String, Vec<RelocationEntry>>,
    absolute_relocs: Vec<(RelocationEntry, u64)>,
    eh_frames: Vec<EhFrame>,
    registered_eh_frames: usize,
}

struct CommonLayout {
    /// Symbol index and offset in the block.
    offsets: Vec<(usize, usize)>,
    total: usize,
    align: usize,
}

impl<F: FormatHandler> DyldCore<F> {
    pub(crate) fn new(arch: Architecture) -> Result<Self> {
        Ok(Self {
            handler: F::new(arch)?,
            sections: Vec::new(),
            objects: Vec::new(),
            globals: HashMap::new(),
            weak_externals: HashSet::new(),
            section_relocs: HashMap::new(),
            external_relocs: HashMap::new(),
            absolute_relocs: Vec::new(),
            eh_frames: Vec::new(),
            registered_eh_frames: 0,
        })
    }

    fn stage_sections(
        &self,
        image: &ObjectImage,
        mm: &mut dyn MemoryManager,
        staged: &mut Staged,
    ) -> Result<()> {
        let arch = self.handler.arch();
        let mut stub_bytes: HashMap<usize, usize> = HashMap::new();
        for reloc in image.relocations() {
            if let Some(kind) = self.handler.stub_kind(reloc.kind) {
                *stub_bytes.entry(reloc.section).or_default() +=
                    roundup(stub_size(arch, kind), STUB_ALIGN);
            }
        }

        // Lay every section out and check its file contents before the
        // memory manager hands out anything.
        let mut layouts = Vec::new();
        let commons = self.common_layout(image)?;
        for section in image.sections() {
            if !section.kind.is_loadable() {
                continue;
            }
            let stubs = stub_bytes.get(&section.index).copied().unwrap_or(0);
            let too_large = || {
                parse_object_error(format!(
                    "[{}]: section [{}] is too large to load ({:#x} bytes)",
                    image.name(),
                    section.name,
                    section.size
                ))
            };
            let size = usize::try_from(section.size)
                .ok()
                .filter(|&size| size <= isize::MAX as usize)
                .ok_or_else(too_large)?;
            if size == 0 && stubs == 0 {
                continue;
            }
            let data = image.section_data(section)?;
            let (stub_offset, alloc_size, align) = if stubs == 0 {
                (size, size, section.align as usize)
            } else {
                let stub_offset = size
                    .checked_next_multiple_of(STUB_ALIGN)
                    .ok_or_else(too_large)?;
                (
                    stub_offset,
                    stub_offset.checked_add(stubs).ok_or_else(too_large)?,
                    (section.align as usize).max(STUB_ALIGN),
                )
            };
            layouts.push((section, data, size, stubs, stub_offset, alloc_size, align));
        }

        let base = self.sections.len();
        for (section, data, size, stubs, stub_offset, alloc_size, align) in layouts {
            let id = SectionId(base + staged.sections.len());
            let is_code = section.kind == SectionKind::Text;
            let read_only = section.kind == SectionKind::ReadOnlyData;
            let local = if is_code {
                mm.allocate_code_section(alloc_size, align, id, &section.name)?
            } else {
                mm.allocate_data_section(alloc_size, align, id, &section.name, read_only)?
            };
            // SAFETY: the memory manager handed out `alloc_size` writable bytes.
            unsafe {
                let len = data.len().min(size);
                core::ptr::copy_nonoverlapping(data.as_ptr(), local.as_ptr(), len);
                core::ptr::write_bytes(local.as_ptr().add(len), 0, alloc_size - len);
            }
            #[cfg(feature = "log")]
            log::trace!(
                "[{}] section [{}] {} loaded at [{:p}], size {:#x}, stubs {:#x}",
                image.name(),
                section.name,
                id,
                local,
                size,
                stubs
            );
            staged.ids.insert(section.index, id);
            staged.stub_cursor.push(stub_offset);
            staged.sections.push(SectionEntry {
                name: section.name.clone(),
                local,
                size,
                alloc_size,
                load_address: local.as_ptr() as u64,
                obj_address: section.address,
                stub_offset,
                is_code,
                read_only,
            });
        }

        self.stage_commons(image, commons, mm, staged)?;

        for section in image.sections() {
            if !section.is_eh_frame() {
                continue;
            }
            let Some(&eh_frame) = staged.ids.get(&section.index) else {
                continue;
            };
            let by_name = |names: &[&str]| {
                image
                    .sections()
                    .iter()
                    .find(|s| names.contains(&s.name.as_str()))
                    .and_then(|s| staged.ids.get(&s.index).copied())
            };
            staged.eh_frames.push(EhFrame {
                eh_frame,
                text: by_name(&[".text", "__text"]),
                except_table: by_name(&[".gcc_except_table", "__gcc_except_tab"]),
            });
        }
        Ok(())
    }

    /// Offsets of the object's common symbols inside one zero-filled block,
    /// with the block's size and alignment.
    fn common_layout(&self, image: &ObjectImage) -> Result<CommonLayout> {
        let mut layout = CommonLayout {
            offsets: Vec::new(),
            total: 0,
            align: 16,
        };
        for (pos, symbol) in image.symbols().iter().enumerate() {
            if symbol.place != SymbolPlace::Common || symbol.name.is_empty() {
                continue;
            }
            let align = match image.format() {
                // ELF stores a common symbol's alignment in its value.
                ObjectFormat::Elf if symbol.address.is_power_of_two() => symbol.address as usize,
                _ => 16,
            };
            let end = layout
                .total
                .checked_next_multiple_of(align)
                .and_then(|offset| {
                    let end = offset.checked_add(usize::try_from(symbol.size).ok()?)?;
                    layout.offsets.push((pos, offset));
                    Some(end)
                })
                .filter(|&end| end <= isize::MAX as usize)
                .ok_or_else(|| {
                    parse_object_error(format!(
                        "[{}]: common symbol [{}] is too large",
                        image.name(),
                        symbol.name
                    ))
                })?;
            layout.total = end;
            layout.align = layout.align.max(align);
        }
        Ok(layout)
    }

    /// Common symbols get one zero-filled data section per object.
    fn stage_commons(
        &self,
        image: &ObjectImage,
        commons: CommonLayout,
        mm: &mut dyn MemoryManager,
        staged: &mut Staged,
    ) -> Result<()> {
        let CommonLayout {
            offsets: layout,
            total,
            align,
        } = commons;
        if layout.is_empty() {
            return Ok(());
        }
        let id = SectionId(self.sections.len() + staged.sections.len());
        let local = mm.allocate_data_section(total.max(1), align, id, "<common symbols>", false)?;
        unsafe { core::ptr::write_bytes(local.as_ptr(), 0, total) };
        for (pos, offset) in layout {
            let symbol = &image.symbols()[pos];
            let loc = SymbolLoc {
                section: id,
                offset: offset as u64,
            };
            staged.commons.insert(pos, loc);
            staged.globals.push((symbol.name.clone(), loc));
        }
        staged.stub_cursor.push(total);
        staged.sections.push(SectionEntry {
            name: "<common symbols>".into(),
            local,
            size: total,
            alloc_size: total,
            load_address: local.as_ptr() as u64,
            obj_address: 0,
            stub_offset: total,
            is_code: false,
            read_only: false,
        });
        Ok(())
    }

    fn stage_symbols(&self, image: &ObjectImage, staged: &mut Staged) {
        for symbol in image.symbols() {
            if symbol.name.is_empty() || symbol.kind == SymbolKind::Section {
                continue;
            }
            match symbol.place {
                SymbolPlace::Section(index) if symbol.global => {
                    let (Some(&id), Some(section)) =
                        (staged.ids.get(&index), image.section_by_index(index))
                    else {
                        continue;
                    };
                    staged.globals.push((
                        symbol.name.clone(),
                        SymbolLoc {
                            section: id,
                            offset: symbol.address.wrapping_sub(section.address),
                        },
                    ));
                }
                SymbolPlace::Undefined if symbol.weak => staged.weak.push(symbol.name.clone()),
                _ => {}
            }
        }
    }

    fn staged_section(&self, staged: &Staged, id: SectionId) -> NonNull<u8> {
        staged.sections[id.0 - self.sections.len()].local
    }

    /// Returns the offset of the stub or GOT slot for `value` in `site_id`,
    /// creating and filling it on first use.
    fn get_or_create_stub(
        &self,
        staged: &mut Staged,
        site_id: SectionId,
        value: &RelocationValue,
        value_addend: i64,
        kind: StubKind,
    ) -> Result<usize> {
        let key = (site_id, value.clone(), value_addend, kind);
        if let Some(&offset) = staged.stubs.get(&key) {
            return Ok(offset);
        }
        let slot = site_id.0 - self.sections.len();
        let offset = roundup(staged.stub_cursor[slot], STUB_ALIGN);
        let (code, len, addr_offset): (&[u8], _, _) = match kind {
            StubKind::GotSlot => (&[], crate::arch::GOT_SLOT_SIZE, 0),
            StubKind::Call => {
                let template = stub_template(self.handler.arch()).ok_or_else(|| {
                    fatal_error(format!(
                        "no call stub template for {:?}",
                        self.handler.arch()
                    ))
                })?;
                (template.code, template.code.len(), template.addr_offset)
            }
        };
        if offset + len > staged.sections[slot].alloc_size {
            return Err(relocate_error(format!(
                "stub area of section [{}] is exhausted",
                staged.sections[slot].name
            )));
        }
        let local = self.staged_section(staged, site_id);
        // SAFETY: offset + len lies within the section's allocation.
        unsafe {
            core::ptr::copy_nonoverlapping(code.as_ptr(), local.as_ptr().add(offset), code.len())
        };
        staged.stub_cursor[slot] = offset + len;
        staged.relocs.push((
            RelocationEntry::new(
                site_id,
                (offset + addr_offset) as u64,
                self.handler.abs64_kind(),
                value_addend,
            ),
            value.clone(),
        ));
        staged.stubs.insert(key, offset);
        Ok(offset)
    }

    fn stage_relocations(&self, image: &ObjectImage, staged: &mut Staged) -> Result<()> {
        for reloc in image.relocations() {
            let Some(&site_id) = staged.ids.get(&reloc.section) else {
                continue;
            };
            let section = image
                .section_by_index(reloc.section)
                .ok_or_else(|| parse_object_error("relocation section vanished"))?;
            let site_addend = self.handler.addend(image, section, reloc)?;
            let (value, value_addend) = match reloc.target {
                RelocationTarget::Symbol(pos) => {
                    let symbol = &image.symbols()[pos];
                    match symbol.place {
                        SymbolPlace::Section(index) => {
                            let Some(&id) = staged.ids.get(&index) else {
                                self.unloaded_target(image, index, reloc)?;
                                continue;
                            };
                            let target = image
                                .section_by_index(index)
                                .ok_or_else(|| parse_object_error("symbol section vanished"))?;
                            (
                                RelocationValue::Section(id),
                                symbol.address.wrapping_sub(target.address) as i64,
                            )
                        }
                        SymbolPlace::Common => match staged.commons.get(&pos) {
                            Some(loc) => (RelocationValue::Section(loc.section), loc.offset as i64),
                            None => (RelocationValue::External(symbol.name.clone()), 0),
                        },
                        SymbolPlace::Absolute => (RelocationValue::Absolute(symbol.address), 0),
                        SymbolPlace::Undefined if symbol.name.is_empty() => {
                            (RelocationValue::Absolute(0), 0)
                        }
                        SymbolPlace::Undefined => {
                            (RelocationValue::External(symbol.name.clone()), 0)
                        }
                    }
                }
                RelocationTarget::Section(index) => match staged.ids.get(&index) {
                    Some(&id) => (RelocationValue::Section(id), 0),
                    None => {
                        self.unloaded_target(image, index, reloc)?;
                        continue;
                    }
                },
                RelocationTarget::Absolute => (RelocationValue::Absolute(0), 0),
            };

            match self.handler.stub_kind(reloc.kind) {
                Some(StubKind::Call) if matches!(value, RelocationValue::External(_)) => {
                    let stub =
                        self.get_or_create_stub(staged, site_id, &value, value_addend, StubKind::Call)?;
                    staged.relocs.push((
                        RelocationEntry::new(site_id, reloc.offset, reloc.kind, stub as i64 + site_addend),
                        RelocationValue::Section(site_id),
                    ));
                }
                Some(StubKind::GotSlot) => {
                    let slot = self.get_or_create_stub(
                        staged,
                        site_id,
                        &value,
                        value_addend,
                        StubKind::GotSlot,
                    )?;
                    staged.relocs.push((
                        RelocationEntry::new(site_id, reloc.offset, reloc.kind, slot as i64 + site_addend),
                        RelocationValue::Section(site_id),
                    ));
                }
                _ => staged.relocs.push((
                    RelocationEntry::new(
                        site_id,
                        reloc.offset,
                        reloc.kind,
                        value_addend.wrapping_add(site_addend),
                    ),
                    value,
                )),
            }
        }
        Ok(())
    }

    fn unloaded_target(&self, image: &ObjectImage, index: usize, reloc: &RelocationInfo) -> Result<()> {
        match image.section_by_index(index) {
            Some(target) if target.kind == SectionKind::Tls => Err(fatal_error(format!(
                "[{}]: thread-local section [{}] referenced by {} is not supported",
                image.name(),
                target.name,
                self.handler.kind_name(reloc.kind)
            ))),
            Some(target) if target.kind.is_loadable() && target.size == 0 => Ok(()),
            Some(_target) => {
                #[cfg(feature = "log")]
                log::trace!(
                    "[{}] skipping relocation against unloaded section [{}]",
                    image.name(),
                    _target.name
                );
                Ok(())
            }
            None => Err(parse_object_error(format!(
                "[{}]: relocation references missing section #{index}",
                image.name()
            ))),
        }
    }

    fn commit(&mut self, staged: Staged) {
        let start = self.sections.len();
        self.sections.extend(staged.sections);
        self.objects.push(start..self.sections.len());
        for (name, loc) in staged.globals {
            #[cfg(feature = "log")]
            if self.globals.contains_key(&name) {
                log::warn!("symbol [{name}] redefined, the latest definition wins");
            }
            self.globals.insert(name, loc);
        }
        self.weak_externals.extend(staged.weak);
        for (entry, value) in staged.relocs {
            match value {
                RelocationValue::Section(id) => {
                    self.section_relocs.entry(id).or_default().push(entry)
                }
                RelocationValue::External(name) => {
                    self.external_relocs.entry(name).or_default().push(entry)
                }
                RelocationValue::Absolute(addr) => self.absolute_relocs.push((entry, addr)),
            }
        }
        self.eh_frames.extend(staged.eh_frames);
    }

    fn image_base(&self, id: SectionId) -> u64 {
        self.objects
            .iter()
            .find(|range| range.contains(&id.0))
            .and_then(|range| self.sections[range.clone()].iter().map(|s| s.load_address).min())
            .unwrap_or(0)
    }

    fn resolve_entry(&self, entry: &RelocationEntry, value: u64, value_section: Option<SectionId>) -> Result<()> {
        let section = &self.sections[entry.section_id.0];
        let offset = entry.offset as usize;
        if offset >= section.alloc_size {
            return Err(relocate_error(format!(
                "{} at offset {:#x} lies outside section [{}]",
                self.handler.kind_name(entry.kind),
                offset,
                section.name
            )));
        }
        let site = PatchSite {
            // SAFETY: offset is within the allocation.
            local: unsafe { section.local.as_ptr().add(offset) },
            target: section.load_address.wrapping_add(entry.offset),
            room: section.alloc_size - offset,
        };
        let ctx = ResolveContext {
            sections: &self.sections,
            image_base: self.image_base(entry.section_id),
            value_section,
        };
        self.handler
            .apply(entry.kind, &site, value, entry.addend, &ctx)
            .map_err(|err| self.reloc_error(entry, section, err))
    }

    #[cold]
    fn reloc_error(&self, entry: &RelocationEntry, section: &SectionEntry, err: Error) -> Error {
        match err {
            Error::Relocation { msg } => relocate_error(format!(
                "{} in section [{}] at offset {:#x}: {}",
                self.handler.kind_name(entry.kind),
                section.name,
                entry.offset,
                msg
            )),
            other => other,
        }
    }

    fn resolve_external(&self, name: &str, lookup: &dyn Fn(&str) -> Option<u64>) -> Result<u64> {
        if let Some(loc) = self.globals.get(name) {
            return Ok(self.sections[loc.section.0].load_address + loc.offset);
        }
        if let Some(addr) = lookup(name) {
            #[cfg(feature = "log")]
            log::trace!("binding symbol [{}] to external address [{:#x}]", name, addr);
            return Ok(addr);
        }
        if self.weak_externals.contains(name) {
            return Ok(0);
        }
        Err(unresolved_symbol(name))
    }

    fn section_list(&self, id: SectionId, filter: Option<SectionId>) -> Result<()> {
        let Some(list) = self.section_relocs.get(&id) else {
            return Ok(());
        };
        let value = self.sections[id.0].load_address;
        for entry in list {
            if filter.is_none_or(|site| entry.section_id == site) {
                self.resolve_entry(entry, value, Some(id))?;
            }
        }
        Ok(())
    }
}

impl<F: FormatHandler> RuntimeDyldImpl for DyldCore<F> {
    fn format(&self) -> ObjectFormat {
        F::FORMAT
    }

    fn arch(&self) -> Architecture {
        self.handler.arch()
    }

    fn load_object(&mut self, image: ObjectImage, mm: &mut dyn MemoryManager) -> Result<ObjectImage> {
        if image.format() != F::FORMAT {
            return Err(parse_object_error(format!(
                "[{}]: {:?} object cannot be loaded next to {:?} objects",
                image.name(),
                image.format(),
                F::FORMAT
            )));
        }
        if image.architecture() != self.handler.arch() {
            return Err(parse_object_error(format!(
                "[{}]: {:?} object cannot be loaded next to {:?} objects",
                image.name(),
                image.architecture(),
                self.handler.arch()
            )));
        }
        // Reject unsupported kinds before anything is allocated.
        for reloc in image.relocations() {
            let patches_loaded = image
                .section_by_index(reloc.section)
                .is_some_and(|s| s.kind.is_loadable());
            if patches_loaded && !self.handler.is_supported(reloc.kind) {
                return Err(fatal_error(format!(
                    "[{}]: {} is not supported for {:?}",
                    image.name(),
                    self.handler.kind_name(reloc.kind),
                    self.handler.arch()
                )));
            }
        }

        let mut staged = Staged::default();
        self.stage_sections(&image, mm, &mut staged)?;
        self.stage_symbols(&image, &mut staged);
        self.stage_relocations(&image, &mut staged)?;
        #[cfg(feature = "log")]
        log::debug!(
            "[{}] loaded {} sections, {} relocations",
            image.name(),
            staged.sections.len(),
            staged.relocs.len()
        );
        self.commit(staged);
        Ok(image)
    }

    fn resolve_relocations(&self, lookup: &dyn Fn(&str) -> Option<u64>) -> Result<()> {
        for id in 0..self.sections.len() {
            self.section_list(SectionId(id), None)?;
        }
        for (entry, addr) in &self.absolute_relocs {
            self.resolve_entry(entry, *addr, None)?;
        }
        for (name, list) in &self.external_relocs {
            let addr = self.resolve_external(name, lookup)?;
            for entry in list {
                self.resolve_entry(entry, addr, None)?;
            }
        }
        Ok(())
    }

    fn map_section_address(&mut self, local: *const u8, target: u64) -> Result<SectionId> {
        let Some(id) = self
            .sections
            .iter()
            .position(|s| core::ptr::eq(s.local.as_ptr(), local))
        else {
            return Err(relocate_error(format!(
                "attempting to remap address {local:p} of unknown section"
            )));
        };
        #[cfg(feature = "log")]
        log::trace!(
            "section [{}] mapped to target address [{:#x}]",
            self.sections[id].name,
            target
        );
        self.sections[id].load_address = target;
        Ok(SectionId(id))
    }

    fn reassign_section_address(
        &mut self,
        id: SectionId,
        target: u64,
        lookup: &dyn Fn(&str) -> Option<u64>,
    ) -> Result<()> {
        let section = self
            .sections
            .get_mut(id.0)
            .ok_or_else(|| relocate_error(format!("unknown section {id}")))?;
        section.load_address = target;
        // Everything that refers to the section, and everything patched
        // inside it: PC-relative values also depend on the site's address.
        self.section_list(id, None)?;
        for other in 0..self.sections.len() {
            if other != id.0 {
                self.section_list(SectionId(other), Some(id))?;
            }
        }
        for (entry, addr) in &self.absolute_relocs {
            if entry.section_id == id {
                self.resolve_entry(entry, *addr, None)?;
            }
        }
        for (name, list) in &self.external_relocs {
            let defined_here = self.globals.get(name).is_some_and(|loc| loc.section == id);
            if !defined_here && list.iter().all(|entry| entry.section_id != id) {
                continue;
            }
            let addr = self.resolve_external(name, lookup)?;
            for entry in list {
                if defined_here || entry.section_id == id {
                    self.resolve_entry(entry, addr, None)?;
                }
            }
        }
        Ok(())
    }

    fn symbol(&self, name: &str) -> Option<(SectionId, u64)> {
        self.globals.get(name).map(|loc| (loc.section, loc.offset))
    }

    fn sections(&self) -> &[SectionEntry] {
        &self.sections
    }

    fn eh_frames(&self) -> &[EhFrame] {
        &self.eh_frames
    }

    fn register_eh_frames(&mut self, mm: &mut dyn MemoryManager) -> Result<()> {
        for frame in &self.eh_frames[self.registered_eh_frames..] {
            self.handler.fixup_eh_frame(frame, &self.sections)?;
            let section = &self.sections[frame.eh_frame.0];
            mm.register_eh_frames(section.local, section.load_address, section.size);
        }
        self.registered_eh_frames = self.eh_frames.len();
        Ok(())
    }
}
