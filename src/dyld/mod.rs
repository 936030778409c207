//! The runtime dynamic linker.
//!
//! [`RuntimeDyld`] loads relocatable objects into memory handed out by a
//! [`MemoryManager`], resolves their relocations and exposes the addresses of
//! the symbols they define. Every section has two addresses: the *local*
//! address where the loader writes it, and the *target* address where the
//! code will run. They are equal until a section is remapped with
//! [`RuntimeDyld::map_section_address`].

mod coff;
mod elf;
mod linker;
mod macho;
mod section;

pub use section::{SectionId, SectionView};

use crate::{
    ObjectBuffer, ObjectImage, Result,
    error::relocate_error,
    image::ObjectFormat,
    memory::MemoryManager,
    os::host_symbol,
    relocation::SymbolLookup,
};
use core::ptr::NonNull;
use self::coff::CoffHandler;
use self::elf::ElfHandler;
use self::linker::{DyldCore, EhFrame};
use self::macho::MachOHandler;
use object::Architecture;
use self::section::SectionEntry;

/// The format-specific half of [`RuntimeDyld`], selected on the first load.
pub(crate) trait RuntimeDyldImpl {
    fn format(&self) -> ObjectFormat;

    fn arch(&self) -> Architecture;

    /// Loads `image` transactionally and hands it back on success.
    fn load_object(&mut self, image: ObjectImage, mm: &mut dyn MemoryManager)
    -> Result<ObjectImage>;

    fn resolve_relocations(&self, lookup: &dyn Fn(&str) -> Option<u64>) -> Result<()>;

    fn map_section_address(&mut self, local: *const u8, target: u64) -> Result<SectionId>;

    fn reassign_section_address(
        &mut self,
        id: SectionId,
        target: u64,
        lookup: &dyn Fn(&str) -> Option<u64>,
    ) -> Result<()>;

    fn symbol(&self, name: &str) -> Option<(SectionId, u64)>;

    fn sections(&self) -> &[SectionEntry];

    fn eh_frames(&self) -> &[EhFrame];

    fn register_eh_frames(&mut self, mm: &mut dyn MemoryManager) -> Result<()>;
}

fn select_impl(image: &ObjectImage) -> Result<Box<dyn RuntimeDyldImpl>> {
    let arch = image.architecture();
    Ok(match image.format() {
        ObjectFormat::Elf => Box::new(DyldCore::<ElfHandler>::new(arch)?),
        ObjectFormat::MachO => Box::new(DyldCore::<MachOHandler>::new(arch)?),
        ObjectFormat::Coff => Box::new(DyldCore::<CoffHandler>::new(arch)?),
    })
}

/// Looks a symbol up in the user resolver, then in the host process.
///
/// Names reach both without the format's global prefix.
fn lookup_external(
    resolver: &dyn SymbolLookup,
    process_symbols: bool,
    format: ObjectFormat,
    name: &str,
) -> Option<u64> {
    let name = name.strip_prefix(format.global_prefix()).unwrap_or(name);
    resolver
        .lookup(name)
        .or_else(|| {
            if process_symbols {
                host_symbol(name)
            } else {
                None
            }
        })
        .map(|addr| addr as u64)
}

/// Loads relocatable objects and links them in memory.
///
/// ```no_run
/// use rtdyld::{ObjectBuffer, RuntimeDyld, SectionMemoryManager};
///
/// let mut dyld = RuntimeDyld::new(SectionMemoryManager::new(), ());
/// let object = ObjectBuffer::from_path("add.o").unwrap();
/// dyld.load_object(object).unwrap();
/// dyld.resolve_relocations().unwrap();
/// dyld.finalize_memory().unwrap();
/// let add = dyld.get_symbol_address("add").unwrap();
/// let add: extern "C" fn(i32, i32) -> i32 = unsafe { core::mem::transmute(add) };
/// assert_eq!(add(3, 4), 7);
/// ```
pub struct RuntimeDyld {
    memory_manager: Box<dyn MemoryManager>,
    resolver: Box<dyn SymbolLookup>,
    dyld: Option<Box<dyn RuntimeDyldImpl>>,
    error: String,
    process_symbols: bool,
}

impl RuntimeDyld {
    /// Creates a linker that allocates through `memory_manager` and asks
    /// `resolver` for symbols no loaded object defines.
    pub fn new(
        memory_manager: impl MemoryManager + 'static,
        resolver: impl SymbolLookup + 'static,
    ) -> Self {
        Self::from_boxed(Box::new(memory_manager), Box::new(resolver))
    }

    pub(crate) fn from_boxed(
        memory_manager: Box<dyn MemoryManager>,
        resolver: Box<dyn SymbolLookup>,
    ) -> Self {
        Self {
            memory_manager,
            resolver,
            dyld: None,
            error: String::new(),
            process_symbols: true,
        }
    }

    /// Whether symbols missing from the resolver are looked up in the host
    /// process. Enabled by default.
    pub fn with_process_symbols(mut self, enabled: bool) -> Self {
        self.process_symbols = enabled;
        self
    }

    #[inline]
    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.error = err.to_string();
        }
        result
    }

    /// Parses and loads one relocatable object.
    ///
    /// The first object decides the format; later objects must share it.
    /// Nothing is kept when loading fails. Section contents and sizes are
    /// checked before any memory is requested; memory already handed out
    /// when a relocation turns out to be bad stays with the memory manager
    /// and is released when the manager is dropped.
    pub fn load_object(&mut self, buffer: ObjectBuffer) -> Result<ObjectImage> {
        let result = self.load_object_inner(buffer);
        self.record(result)
    }

    fn load_object_inner(&mut self, buffer: ObjectBuffer) -> Result<ObjectImage> {
        let image = ObjectImage::parse(buffer)?;
        if self.dyld.is_none() {
            #[cfg(feature = "log")]
            log::debug!(
                "selecting the {:?} loader for {:?}",
                image.format(),
                image.architecture()
            );
            self.dyld = Some(select_impl(&image)?);
        }
        let dyld = self.dyld.as_mut().ok_or_else(|| relocate_error("no loader"))?;
        dyld.load_object(image, self.memory_manager.as_mut())
    }

    /// Patches every relocation with the current address assignment.
    pub fn resolve_relocations(&mut self) -> Result<()> {
        let result = match &self.dyld {
            Some(dyld) => {
                let format = dyld.format();
                let resolver = self.resolver.as_ref();
                let process_symbols = self.process_symbols;
                dyld.resolve_relocations(&|name: &str| {
                    lookup_external(resolver, process_symbols, format, name)
                })
            }
            None => Ok(()),
        };
        self.record(result)
    }

    /// Records that the section loaded at `local` will execute at `target`.
    ///
    /// Nothing is patched until the next [`RuntimeDyld::resolve_relocations`].
    pub fn map_section_address(&mut self, local: *const u8, target: u64) -> Result<()> {
        let result = match self.dyld.as_mut() {
            Some(dyld) => dyld.map_section_address(local, target).map(|_| ()),
            None => Err(relocate_error(format!(
                "attempting to remap address {local:p} of unknown section"
            ))),
        };
        self.record(result)
    }

    /// Moves a section and re-resolves everything its address influences.
    pub(crate) fn reassign_section_address(&mut self, id: SectionId, target: u64) -> Result<()> {
        let result = match self.dyld.as_mut() {
            Some(dyld) => {
                let format = dyld.format();
                let resolver = self.resolver.as_ref();
                let process_symbols = self.process_symbols;
                dyld.reassign_section_address(id, target, &|name: &str| {
                    lookup_external(resolver, process_symbols, format, name)
                })
            }
            None => Err(relocate_error(format!("unknown section {id}"))),
        };
        self.record(result)
    }

    fn symbol_entry(&self, name: &str) -> Option<(&SectionEntry, u64)> {
        let dyld = self.dyld.as_ref()?;
        let (id, offset) = dyld.symbol(name)?;
        Some((&dyld.sections()[id.0], offset))
    }

    /// Host address of a loaded symbol, where its bytes can be read.
    pub fn get_symbol_address(&self, name: &str) -> Option<NonNull<u8>> {
        let (section, offset) = self.symbol_entry(name)?;
        // SAFETY: symbol offsets lie inside their section.
        Some(unsafe { section.local.add(offset as usize) })
    }

    /// Address a loaded symbol has where the code executes.
    pub fn get_symbol_load_address(&self, name: &str) -> Option<u64> {
        let (section, offset) = self.symbol_entry(name)?;
        Some(section.load_address.wrapping_add(offset))
    }

    /// Message of the last failed operation.
    pub fn error_string(&self) -> &str {
        &self.error
    }

    pub fn has_error(&self) -> bool {
        !self.error.is_empty()
    }

    /// Format of the loaded objects, once one has been loaded.
    pub fn format(&self) -> Option<ObjectFormat> {
        self.dyld.as_ref().map(|dyld| dyld.format())
    }

    /// Bytes of the first loaded EH frame section.
    ///
    /// Mach-O frames carry target addresses only after
    /// [`RuntimeDyld::register_eh_frames`].
    pub fn eh_frame_section(&self) -> Option<&[u8]> {
        let dyld = self.dyld.as_ref()?;
        let frame = dyld.eh_frames().first()?;
        let section = &dyld.sections()[frame.eh_frame.0];
        // SAFETY: the section memory lives as long as the memory manager.
        Some(unsafe { core::slice::from_raw_parts(section.local.as_ptr(), section.size) })
    }

    /// Hands every EH frame section not registered yet to the memory manager.
    pub fn register_eh_frames(&mut self) -> Result<()> {
        let result = match self.dyld.as_mut() {
            Some(dyld) => dyld.register_eh_frames(self.memory_manager.as_mut()),
            None => Ok(()),
        };
        self.record(result)
    }

    /// Every loaded section, in id order.
    pub fn sections(&self) -> impl Iterator<Item = SectionView<'_>> {
        self.dyld
            .iter()
            .flat_map(|dyld| dyld.sections().iter().enumerate())
            .map(|(id, section)| section.view(SectionId(id)))
    }

    pub fn memory_manager(&self) -> &dyn MemoryManager {
        self.memory_manager.as_ref()
    }

    pub fn memory_manager_mut(&mut self) -> &mut dyn MemoryManager {
        self.memory_manager.as_mut()
    }

    /// Applies the final page permissions. Sections must not be patched
    /// afterwards.
    pub fn finalize_memory(&mut self) -> Result<()> {
        let result = self.memory_manager.finalize_memory();
        self.record(result)
    }
}
