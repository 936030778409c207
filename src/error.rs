use std::borrow::Cow;
use std::fmt::Display;

/// Error types used throughout the `rtdyld` library.
///
/// Every operation that touches an object file, the memory manager, the
/// object cache or an entry point reports failure through this type. The
/// [`Error::Fatal`] variant is reserved for conditions that indicate a
/// misconfigured build or target rather than bad input data.
#[derive(Clone, Debug)]
pub enum Error {
    /// An error occurred while reading or writing files.
    Io {
        /// A descriptive message about the I/O error.
        msg: Cow<'static, str>,
    },

    /// The memory manager could not map, protect or unmap memory.
    Mmap {
        /// A descriptive message about the memory mapping error.
        msg: Cow<'static, str>,
    },

    /// The object buffer is malformed, of an unsupported format, or of a
    /// format incompatible with objects already loaded.
    ParseObject {
        /// A descriptive message about the parsing error.
        msg: Cow<'static, str>,
    },

    /// The textual IR could not be parsed.
    ParseIr {
        /// 1-based line of the offending token.
        line: usize,
        /// A descriptive message about the parsing error.
        msg: Cow<'static, str>,
    },

    /// A relocation could not be applied, usually because the computed
    /// value does not fit in the relocated field.
    Relocation {
        /// A descriptive message about the relocation error.
        msg: Cow<'static, str>,
    },

    /// A relocation references a symbol that no loaded object, user
    /// resolver, or the host process defines.
    UnresolvedSymbol {
        /// The name of the missing symbol.
        name: String,
    },

    /// The code generator failed to produce an object for a module.
    Codegen {
        /// A descriptive message about the code generation error.
        msg: Cow<'static, str>,
    },

    /// The object cache failed to read or store an object. The engine
    /// treats this as a cache miss.
    Cache {
        /// A descriptive message about the cache error.
        msg: Cow<'static, str>,
    },

    /// The entry point is missing, or the supplied arguments do not match
    /// its signature.
    EntryPoint {
        /// A descriptive message about the contract violation.
        msg: Cow<'static, str>,
    },

    /// An unrecoverable condition: an unimplemented relocation kind, an
    /// instruction without semantics, an unregistered engine kind.
    Fatal {
        /// A descriptive message about the fatal condition.
        msg: Cow<'static, str>,
    },

    /// An error occurred in a user-defined callback or collaborator.
    Custom {
        /// A descriptive message about the custom error.
        msg: Cow<'static, str>,
    },
}

impl Error {
    /// Returns `true` if this error must not be recovered from.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal { .. })
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io { msg } => write!(f, "I/O error: {msg}"),
            Error::Mmap { msg } => write!(f, "Memory mapping error: {msg}"),
            Error::ParseObject { msg } => write!(f, "Object parsing error: {msg}"),
            Error::ParseIr { line, msg } => write!(f, "IR parsing error at line {line}: {msg}"),
            Error::Relocation { msg } => write!(f, "Relocation error: {msg}"),
            Error::UnresolvedSymbol { name } => write!(
                f,
                "Program used external symbol '{name}' which could not be resolved"
            ),
            Error::Codegen { msg } => write!(f, "Code generation error: {msg}"),
            Error::Cache { msg } => write!(f, "Object cache error: {msg}"),
            Error::EntryPoint { msg } => write!(f, "Entry point error: {msg}"),
            Error::Fatal { msg } => write!(f, "Fatal error: {msg}"),
            Error::Custom { msg } => write!(f, "Custom error: {msg}"),
        }
    }
}

impl core::error::Error for Error {}

impl From<std::io::Error> for Error {
    #[cold]
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            msg: err.to_string().into(),
        }
    }
}

#[cold]
#[inline(never)]
pub(crate) fn io_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Io { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn mmap_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Mmap { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn parse_object_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::ParseObject { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn parse_ir_error(line: usize, msg: impl Into<Cow<'static, str>>) -> Error {
    Error::ParseIr {
        line,
        msg: msg.into(),
    }
}

/// Creates a relocation error with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn relocate_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Relocation { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn unresolved_symbol(name: &str) -> Error {
    Error::UnresolvedSymbol {
        name: name.to_owned(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn codegen_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Codegen { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn cache_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Cache { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn entry_point_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::EntryPoint { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn fatal_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Fatal { msg: msg.into() }
}

/// Creates a custom error with the specified message.
///
/// Intended for user collaborators (memory managers, caches, code
/// generators) that need to report their own failures.
#[cold]
#[inline(never)]
pub fn custom_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Custom { msg: msg.into() }
}

/// Writes the diagnostic for an unrecoverable error and aborts the process.
///
/// Library code never calls this; it returns [`Error::Fatal`] instead and
/// leaves the decision to the host application.
#[cold]
pub fn report_fatal_error(err: &Error) -> ! {
    #[cfg(feature = "log")]
    log::error!("{err}");
    eprintln!("rtdyld: {err}");
    std::process::abort()
}
