use crate::{Result, error::io_error};
use std::{fmt::Debug, path::Path};

/// The raw bytes of one relocatable object, together with a name used in
/// diagnostics.
///
/// Ownership follows the bytes: the caller owns the buffer until it is
/// passed to [`RuntimeDyld::load_object`](crate::RuntimeDyld::load_object),
/// which either returns an [`ObjectImage`](crate::ObjectImage) holding it or
/// drops it before reporting the error.
pub struct ObjectBuffer {
    name: String,
    bytes: Vec<u8>,
}

impl ObjectBuffer {
    /// Wraps bytes already in memory.
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }

    /// Reads an object file from disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|err| io_error(format!("cannot read [{}]: {err}", path.display())))?;
        Ok(Self::new(path.display().to_string(), bytes))
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Gives the bytes back, consuming the buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl Debug for ObjectBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBuffer")
            .field("name", &self.name)
            .field("len", &self.bytes.len())
            .finish()
    }
}
