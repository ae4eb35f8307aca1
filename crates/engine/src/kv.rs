//! Durable key-value storage backing the backup tier.
//!
//! Any store offering the four calls of [`KvStore`] can hold backups.

use std::{
    collections::BTreeMap,
    fs,
    io::{ErrorKind, Write},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{EngineError, ResultEngine};

pub trait KvStore: Send {
    fn put(&mut self, key: &str, value: &str) -> ResultEngine<()>;
    fn get(&self, key: &str) -> ResultEngine<Option<String>>;
    fn remove(&mut self, key: &str) -> ResultEngine<()>;
    /// Keys starting with `prefix`, in no particular order.
    fn list_keys(&self, prefix: &str) -> ResultEngine<Vec<String>>;
}

/// Process-local KV store. Contents are lost on exit.
///
/// Clones share the same entries, so a caller can keep a handle to inspect
/// what the engine wrote.
#[derive(Debug, Default, Clone)]
pub struct MemoryKv {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl KvStore for MemoryKv {
    fn put(&mut self, key: &str, value: &str) -> ResultEngine<()> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> ResultEngine<Option<String>> {
        Ok(self.entries().get(key).cloned())
    }

    fn remove(&mut self, key: &str) -> ResultEngine<()> {
        self.entries().remove(key);
        Ok(())
    }

    fn list_keys(&self, prefix: &str) -> ResultEngine<Vec<String>> {
        Ok(self
            .entries()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// KV store keeping one file per key inside a directory.
///
/// Keys are restricted to ASCII alphanumerics, `_` and `-` so they map to file
/// names verbatim.
#[derive(Debug, Clone)]
pub struct DirKv {
    root: PathBuf,
}

impl DirKv {
    pub fn open(root: impl Into<PathBuf>) -> ResultEngine<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|err| {
            EngineError::Storage(format!("cannot create {}: {err}", root.display()))
        })?;
        Ok(Self { root })
    }

    fn path(&self, key: &str) -> ResultEngine<PathBuf> {
        if !is_file_safe(key) {
            return Err(EngineError::Storage(format!("invalid key \"{key}\"")));
        }
        Ok(self.root.join(format!("{key}.json")))
    }
}

/// Names that map to a file name verbatim: ASCII alphanumerics, `_` and `-`.
pub(crate) fn is_file_safe(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn storage_err(err: std::io::Error) -> EngineError {
    EngineError::Storage(err.to_string())
}

impl KvStore for DirKv {
    fn put(&mut self, key: &str, value: &str) -> ResultEngine<()> {
        let path = self.path(key)?;
        let tmp = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).map_err(storage_err)?;
        file.write_all(value.as_bytes()).map_err(storage_err)?;
        file.sync_all().map_err(storage_err)?;
        fs::rename(&tmp, &path).map_err(storage_err)
    }

    fn get(&self, key: &str) -> ResultEngine<Option<String>> {
        match fs::read_to_string(self.path(key)?) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(storage_err(err)),
        }
    }

    fn remove(&mut self, key: &str) -> ResultEngine<()> {
        match fs::remove_file(self.path(key)?) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(storage_err(err)),
        }
    }

    fn list_keys(&self, prefix: &str) -> ResultEngine<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(storage_err)? {
            let entry = entry.map_err(storage_err)?;
            let name = entry.file_name();
            let Some(key) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if key.starts_with(prefix) {
                keys.push(key.to_string());
            }
        }
        Ok(keys)
    }
}
