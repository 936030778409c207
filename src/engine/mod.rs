//! Execution engines.
//!
//! An engine owns one IR [`Module`] and runs its functions, either by
//! compiling it to native code ([`Jit`]) or by walking the IR
//! ([`Interpreter`](crate::interpreter::Interpreter)). Engines are created
//! through an [`EngineRegistry`], usually via an [`EngineBuilder`].

mod cache;
mod jit;
pub(crate) mod marshal;
pub mod remote;

pub use crate::codegen::OptLevel;
pub use cache::{FileObjectCache, MemoryObjectCache, ObjectCache};
pub use jit::{Jit, JitEventListener, ModuleState};

use crate::{
    ObjectBuffer, Result,
    codegen::{CodeGenerator, host_code_generator},
    error::{entry_point_error, fatal_error},
    interpreter::Interpreter,
    ir::{Module, Type},
    memory::MemoryManager,
    relocation::SymbolLookup,
    value::{GenericValue, IntValue},
};
use hashbrown::HashMap;
use std::{ffi::CString, sync::Arc};

/// The two implementations of [`ExecutionEngine`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EngineKind {
    Interpreter,
    Jit,
}

/// Runs the functions of one module.
pub trait ExecutionEngine {
    fn kind(&self) -> EngineKind;

    fn module(&self) -> &Module;

    /// Calls `name` with `args` and returns its result.
    ///
    /// The arguments must match the function's parameter types; `void`
    /// functions return [`GenericValue::default`].
    fn run_function(&mut self, name: &str, args: &[GenericValue]) -> Result<GenericValue>;

    /// Address of a function in executable memory, compiling on demand.
    fn get_pointer_to_function(&mut self, name: &str) -> Result<u64>;

    /// Address of a global variable.
    fn get_global_value_address(&mut self, name: &str) -> Result<u64>;

    /// Makes compiled code executable. Engines without native code do
    /// nothing.
    fn finalize_object(&mut self) -> Result<()>;

    /// Loads a precompiled object whose symbols the module may use.
    fn add_object_file(&mut self, buffer: ObjectBuffer) -> Result<()>;

    /// Runs `name` like a C `main`, passing as many of `argc`, `argv` and
    /// `envp` as it declares.
    fn run_function_as_main(&mut self, name: &str, argv: &[&str], envp: &[&str]) -> Result<i32> {
        let function = self
            .module()
            .function(name)
            .ok_or_else(|| entry_point_error(format!("function [{name}] not found")))?;
        let params = function.sig.params.clone();
        if params.len() > 3 {
            return Err(entry_point_error(format!(
                "[{name}] takes {} parameters, at most 3 are supported for main",
                params.len()
            )));
        }
        let argv_c = to_cstrings(argv)?;
        let envp_c = to_cstrings(envp)?;
        let argv_ptrs = null_terminated(&argv_c);
        let envp_ptrs = null_terminated(&envp_c);

        let mut args = Vec::with_capacity(params.len());
        for (i, ty) in params.iter().enumerate() {
            let arg = match (i, ty) {
                (0, Type::Int(bits)) => GenericValue::Int(IntValue::from_u64(*bits, argv.len() as u64)),
                (1, Type::Ptr) => GenericValue::Pointer(argv_ptrs.as_ptr() as usize),
                (2, Type::Ptr) => GenericValue::Pointer(envp_ptrs.as_ptr() as usize),
                (_, ty) => {
                    return Err(entry_point_error(format!(
                        "[{name}]: parameter {i} of type {ty} does not fit main"
                    )));
                }
            };
            args.push(arg);
        }
        let ret = self.run_function(name, &args)?;
        Ok(ret.as_i64().unwrap_or(0) as i32)
    }
}

fn to_cstrings(strings: &[&str]) -> Result<Vec<CString>> {
    strings
        .iter()
        .map(|s| {
            CString::new(*s)
                .map_err(|_| entry_point_error(format!("argument {s:?} contains a NUL byte")))
        })
        .collect()
}

fn null_terminated(strings: &[CString]) -> Vec<*const core::ffi::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(core::iter::once(core::ptr::null()))
        .collect()
}

/// Collaborators and settings handed to an engine factory.
#[derive(Default)]
pub struct EngineOptions {
    pub opt_level: OptLevel,
    pub object_cache: Option<Arc<dyn ObjectCache>>,
    pub memory_manager: Option<Box<dyn MemoryManager>>,
    pub symbol_lookup: Option<Arc<dyn SymbolLookup>>,
    pub code_generator: Option<Box<dyn CodeGenerator>>,
    pub listeners: Vec<Box<dyn JitEventListener>>,
    /// Run JIT code from a second copy of every section.
    pub remote_mapping: bool,
}

pub type EngineFactory = fn(Module, EngineOptions) -> Result<Box<dyn ExecutionEngine>>;

/// Maps engine kinds to the functions that create them.
#[derive(Default)]
pub struct EngineRegistry {
    factories: HashMap<EngineKind, EngineFactory>,
}

fn create_interpreter(module: Module, options: EngineOptions) -> Result<Box<dyn ExecutionEngine>> {
    Ok(Box::new(Interpreter::new(module, options)?))
}

fn create_jit(module: Module, options: EngineOptions) -> Result<Box<dyn ExecutionEngine>> {
    Ok(Box::new(Jit::new(module, options)?))
}

impl EngineRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the interpreter and the JIT.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(EngineKind::Interpreter, create_interpreter);
        registry.register(EngineKind::Jit, create_jit);
        registry
    }

    /// Registers `factory` for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: EngineKind, factory: EngineFactory) {
        self.factories.insert(kind, factory);
    }

    pub fn is_registered(&self, kind: EngineKind) -> bool {
        self.factories.contains_key(&kind)
    }

    pub fn create(
        &self,
        kind: EngineKind,
        module: Module,
        options: EngineOptions,
    ) -> Result<Box<dyn ExecutionEngine>> {
        let factory = self
            .factories
            .get(&kind)
            .ok_or_else(|| fatal_error(format!("no engine of kind {kind:?} is registered")))?;
        #[cfg(feature = "log")]
        log::debug!("creating {:?} engine for [{}]", kind, module.identifier);
        factory(module, options)
    }
}

/// Collects engine options and creates the engine.
///
/// ```no_run
/// use rtdyld::engine::{EngineBuilder, EngineKind, EngineRegistry};
/// use rtdyld::ir::parse_module;
///
/// let module = parse_module("define i32 @answer() {\n  ret i32 42\n}\n", "answer").unwrap();
/// let mut engine = EngineBuilder::new(module)
///     .with_kind(EngineKind::Interpreter)
///     .build(&EngineRegistry::with_defaults())
///     .unwrap();
/// let ret = engine.run_function("answer", &[]).unwrap();
/// assert_eq!(ret.as_i64(), Some(42));
/// ```
pub struct EngineBuilder {
    module: Module,
    kind: Option<EngineKind>,
    options: EngineOptions,
}

impl EngineBuilder {
    pub fn new(module: Module) -> Self {
        Self {
            module,
            kind: None,
            options: EngineOptions::default(),
        }
    }

    /// Picks the engine kind. Without it the JIT is used when a code
    /// generator is available, the interpreter otherwise.
    pub fn with_kind(mut self, kind: EngineKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_opt_level(mut self, opt_level: OptLevel) -> Self {
        self.options.opt_level = opt_level;
        self
    }

    pub fn with_object_cache(mut self, cache: Arc<dyn ObjectCache>) -> Self {
        self.options.object_cache = Some(cache);
        self
    }

    pub fn with_memory_manager(mut self, memory_manager: impl MemoryManager + 'static) -> Self {
        self.options.memory_manager = Some(Box::new(memory_manager));
        self
    }

    pub fn with_symbol_lookup(mut self, lookup: impl SymbolLookup + 'static) -> Self {
        self.options.symbol_lookup = Some(Arc::new(lookup));
        self
    }

    pub fn with_code_generator(mut self, generator: impl CodeGenerator + 'static) -> Self {
        self.options.code_generator = Some(Box::new(generator));
        self
    }

    pub fn with_listener(mut self, listener: impl JitEventListener + 'static) -> Self {
        self.options.listeners.push(Box::new(listener));
        self
    }

    pub fn with_remote_mapping(mut self, enabled: bool) -> Self {
        self.options.remote_mapping = enabled;
        self
    }

    pub fn build(self, registry: &EngineRegistry) -> Result<Box<dyn ExecutionEngine>> {
        let kind = self.kind.unwrap_or_else(|| {
            if self.options.code_generator.is_some() || host_code_generator().is_some() {
                EngineKind::Jit
            } else {
                EngineKind::Interpreter
            }
        });
        registry.create(kind, self.module, self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_kind_is_fatal() {
        let registry = EngineRegistry::new();
        let err = EngineBuilder::new(Module::new("empty"))
            .with_kind(EngineKind::Jit)
            .build(&registry)
            .err()
            .unwrap();
        assert!(err.is_fatal());
    }

    #[test]
    fn defaults_register_both_kinds() {
        let registry = EngineRegistry::with_defaults();
        assert!(registry.is_registered(EngineKind::Interpreter));
        assert!(registry.is_registered(EngineKind::Jit));
    }
}
