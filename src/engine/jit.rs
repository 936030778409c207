use super::{
    EngineKind, EngineOptions, ExecutionEngine, ObjectCache, OptLevel, marshal,
    remote::RemoteTarget,
};
use crate::{
    ObjectBuffer, ObjectImage, Result, RuntimeDyld, SectionMemoryManager,
    codegen::{CodeGenerator, host_code_generator},
    error::{Error, codegen_error, entry_point_error, fatal_error, relocate_error, unresolved_symbol},
    ir::Module,
    os::host_symbol,
    relocation::SymbolLookup,
    value::GenericValue,
};
use delegate::delegate;
use std::sync::Arc;

/// Observes objects as the JIT loads them.
pub trait JitEventListener {
    /// Called after `object` has been loaded and its relocations resolved.
    fn notify_object_emitted(&self, object: &ObjectImage, dyld: &RuntimeDyld);
}

impl<T: JitEventListener + ?Sized> JitEventListener for Arc<T> {
    fn notify_object_emitted(&self, object: &ObjectImage, dyld: &RuntimeDyld) {
        (**self).notify_object_emitted(object, dyld)
    }
}

/// Where the JIT is with its module.
#[derive(Clone, Debug)]
pub enum ModuleState {
    Uncompiled,
    Generating,
    /// Loaded and relocated, memory still writable.
    Loaded,
    Finalized,
    /// Compilation or loading failed; the error is returned again on every
    /// later request.
    Failed(Error),
}

/// Compiles a module to native code and runs it in this process.
pub struct Jit {
    module: Module,
    generator: Box<dyn CodeGenerator>,
    dyld: RuntimeDyld,
    cache: Option<Arc<dyn ObjectCache>>,
    listeners: Vec<Box<dyn JitEventListener>>,
    lookup: Arc<dyn SymbolLookup>,
    objects: Vec<ObjectImage>,
    remote: Option<RemoteTarget>,
    opt_level: OptLevel,
    state: ModuleState,
}

impl Jit {
    pub fn new(module: Module, options: EngineOptions) -> Result<Self> {
        let generator = options
            .code_generator
            .or_else(host_code_generator)
            .ok_or_else(|| codegen_error("no code generator is available for this host"))?;
        let lookup: Arc<dyn SymbolLookup> = options.symbol_lookup.unwrap_or_else(|| Arc::new(()));
        let memory_manager = options
            .memory_manager
            .unwrap_or_else(|| Box::new(SectionMemoryManager::new()));
        let dyld = RuntimeDyld::from_boxed(memory_manager, Box::new(lookup.clone()));
        #[cfg(feature = "log")]
        log::debug!(
            "[{}] JIT targeting {} at {:?}",
            module.identifier,
            generator.target_triple(),
            options.opt_level
        );
        Ok(Self {
            module,
            generator,
            dyld,
            cache: options.object_cache,
            listeners: options.listeners,
            lookup,
            objects: Vec::new(),
            remote: options.remote_mapping.then(RemoteTarget::new),
            opt_level: options.opt_level,
            state: ModuleState::Uncompiled,
        })
    }

    pub fn state(&self) -> &ModuleState {
        &self.state
    }

    /// The linker holding the loaded objects.
    pub fn dyld(&self) -> &RuntimeDyld {
        &self.dyld
    }

    /// Objects loaded so far, in load order.
    pub fn objects(&self) -> &[ObjectImage] {
        &self.objects
    }

    pub fn remote(&self) -> Option<&RemoteTarget> {
        self.remote.as_ref()
    }

    delegate! {
        to self.dyld {
            /// Message of the last failed linker operation.
            pub fn error_string(&self) -> &str;
            /// Bytes of the first loaded EH frame section.
            pub fn eh_frame_section(&self) -> Option<&[u8]>;
        }
    }

    fn transition(&mut self, state: ModuleState) {
        #[cfg(feature = "log")]
        log::debug!(
            "[{}] {:?} -> {:?}",
            self.module.identifier,
            self.state,
            state
        );
        self.state = state;
    }

    /// Compiles and loads the module unless that already happened.
    fn ensure_loaded(&mut self) -> Result<()> {
        match &self.state {
            ModuleState::Failed(err) => return Err(err.clone()),
            ModuleState::Loaded | ModuleState::Finalized => return Ok(()),
            ModuleState::Generating => {
                return Err(fatal_error(format!(
                    "[{}] is already being compiled",
                    self.module.identifier
                )));
            }
            ModuleState::Uncompiled => {}
        }
        self.transition(ModuleState::Generating);
        match self.compile_and_load() {
            Ok(()) => {
                self.transition(ModuleState::Loaded);
                Ok(())
            }
            Err(err) => {
                self.transition(ModuleState::Failed(err.clone()));
                Err(err)
            }
        }
    }

    fn cached_object(&self, id: &str) -> Option<Vec<u8>> {
        let cache = self.cache.as_ref()?;
        match cache.get_object(id) {
            Ok(hit) => hit,
            Err(_err) => {
                #[cfg(feature = "log")]
                log::warn!("[{id}] object cache lookup failed, recompiling: {_err}");
                None
            }
        }
    }

    fn compile_and_load(&mut self) -> Result<()> {
        let id = self.module.identifier.clone();
        let bytes = match self.cached_object(&id) {
            Some(bytes) => {
                #[cfg(feature = "log")]
                log::debug!("[{id}] object cache hit, {} bytes", bytes.len());
                bytes
            }
            None => {
                #[cfg(feature = "log")]
                log::debug!("[{id}] object cache miss, generating code");
                let bytes = self.generator.emit_object(&self.module, self.opt_level)?;
                if let Some(cache) = &self.cache
                    && let Err(_err) = cache.notify_object_compiled(&id, &bytes)
                {
                    #[cfg(feature = "log")]
                    log::warn!("[{id}] could not store the compiled object: {_err}");
                }
                bytes
            }
        };
        self.load(ObjectBuffer::new(format!("{id}.o"), bytes))?;
        self.dyld.resolve_relocations()?;
        Ok(())
    }

    fn load(&mut self, buffer: ObjectBuffer) -> Result<()> {
        let image = self.dyld.load_object(buffer)?;
        if let Some(remote) = self.remote.as_mut() {
            remote.map_sections(&mut self.dyld)?;
        }
        for listener in &self.listeners {
            listener.notify_object_emitted(&image, &self.dyld);
        }
        self.objects.push(image);
        Ok(())
    }

    /// Records that the section loaded at `local` will run at `target`.
    ///
    /// Once the module is loaded its relocations have been resolved, so
    /// everything the move affects is patched right away.
    pub fn map_section_address(&mut self, local: *const u8, target: u64) -> Result<()> {
        match self.state {
            ModuleState::Finalized => Err(relocate_error(
                "sections cannot be remapped after finalization",
            )),
            ModuleState::Loaded => {
                let id = self
                    .dyld
                    .sections()
                    .find(|s| core::ptr::eq(s.local.as_ptr(), local))
                    .map(|s| s.id)
                    .ok_or_else(|| {
                        relocate_error(format!(
                            "attempting to remap address {local:p} of unknown section"
                        ))
                    })?;
                self.dyld.reassign_section_address(id, target)
            }
            _ => self.dyld.map_section_address(local, target),
        }
    }

    fn mangle(&self, name: &str) -> String {
        let prefix = self.dyld.format().map_or("", |f| f.global_prefix());
        format!("{prefix}{name}")
    }

    /// Address of any function: loaded code first, then the symbol lookup,
    /// then the host process.
    pub fn get_pointer_to_named_function(&mut self, name: &str) -> Result<u64> {
        self.ensure_loaded()?;
        if let Some(addr) = self.dyld.get_symbol_load_address(&self.mangle(name)) {
            return Ok(addr);
        }
        self.lookup
            .lookup(name)
            .or_else(|| host_symbol(name))
            .map(|addr| addr as u64)
            .ok_or_else(|| unresolved_symbol(name))
    }
}

impl ExecutionEngine for Jit {
    fn kind(&self) -> EngineKind {
        EngineKind::Jit
    }

    fn module(&self) -> &Module {
        &self.module
    }

    fn run_function(&mut self, name: &str, args: &[GenericValue]) -> Result<GenericValue> {
        let sig = self
            .module
            .function(name)
            .map(|f| f.sig.clone())
            .ok_or_else(|| entry_point_error(format!("function [{name}] not found")))?;
        marshal::check_args(name, &sig, args)?;
        self.finalize_object()?;
        let addr = self.get_pointer_to_function(name)?;
        #[cfg(feature = "log")]
        log::trace!("calling [{name}] at {addr:#x}");
        // SAFETY: the address belongs to finalized code generated for `sig`.
        unsafe { marshal::call_native(addr, &sig, args) }
    }

    fn get_pointer_to_function(&mut self, name: &str) -> Result<u64> {
        self.ensure_loaded()?;
        self.dyld
            .get_symbol_load_address(&self.mangle(name))
            .ok_or_else(|| entry_point_error(format!("function [{name}] not found")))
    }

    fn get_global_value_address(&mut self, name: &str) -> Result<u64> {
        self.ensure_loaded()?;
        self.dyld
            .get_symbol_load_address(&self.mangle(name))
            .ok_or_else(|| unresolved_symbol(name))
    }

    /// Loads a precompiled object next to the module. Its symbols satisfy
    /// the module's external references.
    fn add_object_file(&mut self, buffer: ObjectBuffer) -> Result<()> {
        if matches!(self.state, ModuleState::Finalized) {
            return Err(relocate_error(format!(
                "cannot add [{}] after finalization",
                buffer.name()
            )));
        }
        self.load(buffer)
    }

    fn finalize_object(&mut self) -> Result<()> {
        self.ensure_loaded()?;
        if matches!(self.state, ModuleState::Finalized) {
            return Ok(());
        }
        self.dyld.resolve_relocations()?;
        self.dyld.register_eh_frames()?;
        self.dyld.finalize_memory()?;
        if let Some(remote) = self.remote.as_mut() {
            remote.commit(&self.dyld)?;
        }
        self.transition(ModuleState::Finalized);
        Ok(())
    }
}
