//! Lowering IR modules to relocatable objects.

mod x86_64;

pub use x86_64::X86_64CodeGen;

use crate::{Result, ir::Module};

/// How hard the code generator should try.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OptLevel {
    None,
    Less,
    #[default]
    Default,
    Aggressive,
}

impl OptLevel {
    /// Maps `-O0` to `-O3`.
    pub fn from_level(level: u8) -> Option<Self> {
        Some(match level {
            0 => OptLevel::None,
            1 => OptLevel::Less,
            2 => OptLevel::Default,
            3 => OptLevel::Aggressive,
            _ => return None,
        })
    }
}

/// Produces a relocatable object from a module.
///
/// The JIT calls this at most once per module; the bytes it returns are
/// what gets cached and loaded.
pub trait CodeGenerator {
    /// The triple of the objects this generator writes.
    fn target_triple(&self) -> &str;

    fn emit_object(&self, module: &Module, opt_level: OptLevel) -> Result<Vec<u8>>;
}

impl<T: CodeGenerator + ?Sized> CodeGenerator for Box<T> {
    fn target_triple(&self) -> &str {
        (**self).target_triple()
    }

    fn emit_object(&self, module: &Module, opt_level: OptLevel) -> Result<Vec<u8>> {
        (**self).emit_object(module, opt_level)
    }
}

/// The code generator for the host, when one exists.
pub fn host_code_generator() -> Option<Box<dyn CodeGenerator>> {
    if cfg!(target_arch = "x86_64") {
        Some(Box::new(X86_64CodeGen::new()))
    } else {
        None
    }
}
