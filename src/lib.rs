//! # rtdyld
//! A runtime dynamic linker and execution engine for relocatable objects.
//! ## Usage
//! [`RuntimeDyld`] loads ELF, Mach-O and COFF relocatable objects into memory
//! obtained from a [`MemoryManager`], resolves their relocations and hands
//! out the addresses of the symbols they define. On top of it, the
//! [`engine`] module runs IR [`ir::Module`]s either through the [`engine::Jit`]
//! (code generation, object caching, linking) or through the
//! [`interpreter::Interpreter`].
//! ## Example
//! ```no_run
//! use rtdyld::engine::{EngineBuilder, EngineRegistry};
//! use rtdyld::{GenericValue, ir::parse_module};
//!
//! let module = parse_module(
//!     "define i32 @add2(i32 %a, i32 %b) {\n  %s = add i32 %a, %b\n  ret i32 %s\n}\n",
//!     "add2",
//! )
//! .unwrap();
//! let mut engine = EngineBuilder::new(module)
//!     .build(&EngineRegistry::with_defaults())
//!     .unwrap();
//! let sum = engine
//!     .run_function("add2", &[GenericValue::from(3), GenericValue::from(4)])
//!     .unwrap();
//! assert_eq!(sum.as_i64(), Some(7));
//! ```

pub(crate) mod arch;
mod buffer;
pub mod codegen;
pub mod dyld;
mod error;
pub mod engine;
pub mod image;
pub mod interpreter;
pub mod ir;
mod memory;
pub mod os;
pub mod relocation;
pub mod value;

pub use buffer::ObjectBuffer;
pub use dyld::{RuntimeDyld, SectionId, SectionView};
pub use engine::{EngineBuilder, EngineKind, EngineRegistry, ExecutionEngine};
pub use error::{Error, custom_error, report_fatal_error};
pub use image::{ObjectFormat, ObjectImage};
pub use memory::{MemoryManager, SectionMemoryManager};
pub use relocation::{HostProcess, SymbolLookup};
pub use value::{GenericValue, IntValue};

/// A type alias for `Result`s returned by `rtdyld` functions.
pub type Result<T> = core::result::Result<T, Error>;
