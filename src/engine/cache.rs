use crate::{Result, error::cache_error};
use hashbrown::HashMap;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

/// Stores compiled objects keyed by module identifier.
///
/// The JIT asks the cache before invoking the code generator, and hands it
/// every object it had to generate. Errors from either call are treated as
/// a miss.
pub trait ObjectCache: Send + Sync {
    /// Returns the object previously compiled for `module_id`, if any.
    fn get_object(&self, module_id: &str) -> Result<Option<Vec<u8>>>;

    /// Called once with each freshly generated object.
    fn notify_object_compiled(&self, module_id: &str, object: &[u8]) -> Result<()>;
}

/// An in-memory cache that counts how it is used.
#[derive(Default)]
pub struct MemoryObjectCache {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    lookups: AtomicUsize,
    inserts: AtomicUsize,
}

impl MemoryObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get_object` calls so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }

    /// Number of objects stored so far.
    pub fn inserts(&self) -> usize {
        self.inserts.load(Ordering::Relaxed)
    }

    pub fn contains(&self, module_id: &str) -> bool {
        self.objects
            .lock()
            .is_ok_and(|objects| objects.contains_key(module_id))
    }

    /// Seeds the cache without counting an insert.
    pub fn preload(&self, module_id: &str, object: Vec<u8>) -> Result<()> {
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| cache_error("object cache lock is poisoned"))?;
        objects.insert(module_id.to_owned(), object);
        Ok(())
    }
}

impl ObjectCache for MemoryObjectCache {
    fn get_object(&self, module_id: &str) -> Result<Option<Vec<u8>>> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let objects = self
            .objects
            .lock()
            .map_err(|_| cache_error("object cache lock is poisoned"))?;
        Ok(objects.get(module_id).cloned())
    }

    fn notify_object_compiled(&self, module_id: &str, object: &[u8]) -> Result<()> {
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| cache_error("object cache lock is poisoned"))?;
        if objects.contains_key(module_id) {
            return Err(cache_error(format!(
                "an object for [{module_id}] is already cached"
            )));
        }
        objects.insert(module_id.to_owned(), object.to_vec());
        self.inserts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// A cache keeping one `<module id>.o` file per module in a directory.
pub struct FileObjectCache {
    dir: PathBuf,
}

impl FileObjectCache {
    /// Uses `dir` as the cache directory, creating it if needed.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|err| {
            cache_error(format!("cannot create cache directory {}: {err}", dir.display()))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The file an object for `module_id` is stored in.
    pub fn path_for(&self, module_id: &str) -> PathBuf {
        let name: String = module_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.o"))
    }
}

impl ObjectCache for FileObjectCache {
    fn get_object(&self, module_id: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(module_id);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(cache_error(format!("cannot read {}: {err}", path.display()))),
        }
    }

    fn notify_object_compiled(&self, module_id: &str, object: &[u8]) -> Result<()> {
        let path = self.path_for(module_id);
        std::fs::write(&path, object)
            .map_err(|err| cache_error(format!("cannot write {}: {err}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_cache_rejects_duplicates() {
        let cache = MemoryObjectCache::new();
        assert_eq!(cache.get_object("m").unwrap(), None);
        cache.notify_object_compiled("m", b"obj").unwrap();
        assert!(cache.notify_object_compiled("m", b"obj").is_err());
        assert_eq!(cache.get_object("m").unwrap().as_deref(), Some(&b"obj"[..]));
        assert_eq!(cache.lookups(), 2);
        assert_eq!(cache.inserts(), 1);
    }

    #[test]
    fn file_cache_sanitizes_ids() {
        let dir = std::env::temp_dir().join(format!("rtdyld-cache-{}", std::process::id()));
        let cache = FileObjectCache::new(&dir).unwrap();
        let path = cache.path_for("dir/mod ule");
        assert_eq!(path.file_name().unwrap(), "dir_mod_ule.o");
        cache.notify_object_compiled("dir/mod ule", b"\x7fELF").unwrap();
        assert_eq!(
            cache.get_object("dir/mod ule").unwrap().as_deref(),
            Some(&b"\x7fELF"[..])
        );
        assert_eq!(cache.get_object("missing").unwrap(), None);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
