//! Long-term storage of committed tables.
//!
//! The engine hands the tables touched by a guarded operation to a
//! [`PersistenceSink`] once the operation has committed, in a single
//! [`save_all`](PersistenceSink::save_all) call. Sinks never see uncommitted
//! state.

use std::{
    collections::BTreeMap,
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use crate::{EngineError, Record, ResultEngine, TableStore, kv::is_file_safe};

pub trait PersistenceSink: Send {
    fn save(&mut self, table: &str, blob: &str) -> ResultEngine<()>;

    fn save_all(&mut self, blobs: &BTreeMap<String, String>) -> ResultEngine<()> {
        for (table, blob) in blobs {
            self.save(table, blob)?;
        }
        Ok(())
    }
}

/// Sink that drops everything. Used when the caller persists on its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPersistence;

impl PersistenceSink for NoopPersistence {
    fn save(&mut self, _table: &str, _blob: &str) -> ResultEngine<()> {
        Ok(())
    }
}

/// Sink keeping the last saved blob per table, plus the number of
/// [`save_all`](PersistenceSink::save_all) batches received. Clones share state.
#[derive(Debug, Default, Clone)]
pub struct MemoryPersistence {
    inner: Arc<Mutex<MemoryPersistenceState>>,
}

#[derive(Debug, Default)]
struct MemoryPersistenceState {
    saved: BTreeMap<String, String>,
    batches: usize,
    fail_next: Option<String>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryPersistenceState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn saved(&self, table: &str) -> Option<String> {
        self.state().saved.get(table).cloned()
    }

    pub fn batches(&self) -> usize {
        self.state().batches
    }

    /// Makes the next batch fail with `reason`.
    pub fn fail_next(&self, reason: &str) {
        self.state().fail_next = Some(reason.to_string());
    }
}

impl PersistenceSink for MemoryPersistence {
    fn save(&mut self, table: &str, blob: &str) -> ResultEngine<()> {
        self.state()
            .saved
            .insert(table.to_string(), blob.to_string());
        Ok(())
    }

    fn save_all(&mut self, blobs: &BTreeMap<String, String>) -> ResultEngine<()> {
        let mut state = self.state();
        if let Some(reason) = state.fail_next.take() {
            return Err(EngineError::Persistence(reason));
        }
        state.batches += 1;
        for (table, blob) in blobs {
            state.saved.insert(table.clone(), blob.clone());
        }
        Ok(())
    }
}

/// Sink writing each table to `<dir>/<table>.json`.
///
/// Files are written to a temporary name and renamed, so a crash mid-write
/// leaves the previous version intact. Table names follow the same rules as
/// [`DirKv`](crate::DirKv) keys.
#[derive(Debug, Clone)]
pub struct JsonDirPersistence {
    dir: PathBuf,
}

impl JsonDirPersistence {
    pub fn open(dir: impl Into<PathBuf>) -> ResultEngine<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| {
            EngineError::Persistence(format!("cannot create {}: {err}", dir.display()))
        })?;
        Ok(Self { dir })
    }

    /// Loads every `<table>.json` in the directory into a fresh store.
    pub fn load(&self) -> ResultEngine<TableStore> {
        let mut store = TableStore::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(store),
            Err(err) => return Err(EngineError::Persistence(err.to_string())),
        };
        for entry in entries {
            let path = entry
                .map_err(|err| EngineError::Persistence(err.to_string()))?
                .path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let Some(table) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if !is_file_safe(table) {
                tracing::warn!("skipping {}: not a table file", path.display());
                continue;
            }
            let raw = fs::read_to_string(&path)
                .map_err(|err| EngineError::Persistence(err.to_string()))?;
            let records: Vec<Record> = serde_json::from_str(&raw)?;
            store.replace_table(table, records)?;
        }
        store.clear_dirty();
        Ok(store)
    }

    /// Final and temporary paths of `table`.
    fn paths(&self, table: &str) -> ResultEngine<(PathBuf, PathBuf)> {
        if !is_file_safe(table) {
            return Err(EngineError::Persistence(format!(
                "invalid table name \"{table}\""
            )));
        }
        Ok((
            self.dir.join(format!("{table}.json")),
            self.dir.join(format!(".{table}.json.tmp")),
        ))
    }

    /// Writes `blob` to the temporary file of `table`.
    fn stage(&self, table: &str, blob: &str) -> ResultEngine<(PathBuf, PathBuf)> {
        let (path, tmp) = self.paths(table)?;
        if let Err(err) = write_synced(&tmp, blob) {
            let _ = fs::remove_file(&tmp);
            return Err(EngineError::Persistence(format!("{table}: {err}")));
        }
        Ok((path, tmp))
    }
}

fn write_synced(path: &Path, blob: &str) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(blob.as_bytes())?;
    file.sync_all()
}

impl PersistenceSink for JsonDirPersistence {
    fn save(&mut self, table: &str, blob: &str) -> ResultEngine<()> {
        let (path, tmp) = self.paths(table)?;
        write_synced(&tmp, blob)
            .and_then(|()| fs::rename(&tmp, &path))
            .map_err(|err| EngineError::Persistence(format!("{table}: {err}")))
    }

    /// Writes every table to its temporary file first and renames them only
    /// once all writes succeeded, so a failed batch leaves every data file
    /// untouched.
    fn save_all(&mut self, blobs: &BTreeMap<String, String>) -> ResultEngine<()> {
        let mut staged = Vec::with_capacity(blobs.len());
        for (table, blob) in blobs {
            match self.stage(table, blob) {
                Ok(paths) => staged.push(paths),
                Err(err) => {
                    for (_, tmp) in &staged {
                        let _ = fs::remove_file(tmp);
                    }
                    return Err(err);
                }
            }
        }

        for (path, tmp) in &staged {
            fs::rename(tmp, path).map_err(|err| {
                EngineError::Persistence(format!("{}: {err}", path.display()))
            })?;
        }
        tracing::debug!("saved {} tables to {}", staged.len(), self.dir.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../../target/test_kv")
            .join(uuid::Uuid::new_v4().to_string())
    }

    #[test]
    fn failed_batch_leaves_data_files_untouched() {
        let dir = scratch_dir();
        let mut sink = JsonDirPersistence::open(&dir).unwrap();
        sink.save("accounts", "[]").unwrap();
        // A directory where the staging file of the second table should go.
        fs::create_dir_all(dir.join(".transactions.json.tmp")).unwrap();

        let blobs = BTreeMap::from([
            ("accounts".to_string(), "[{\"id\":\"a\",\"fields\":{}}]".to_string()),
            ("transactions".to_string(), "[]".to_string()),
        ]);
        let err = sink.save_all(&blobs).unwrap_err();

        assert!(matches!(err, EngineError::Persistence(_)));
        assert_eq!(fs::read_to_string(dir.join("accounts.json")).unwrap(), "[]");
        assert!(!dir.join("transactions.json").exists());
        assert!(!dir.join(".accounts.json.tmp").exists());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn table_names_cannot_leave_the_directory() {
        let dir = scratch_dir();
        let mut sink = JsonDirPersistence::open(dir.join("data")).unwrap();

        let err = sink.save("../escaped", "[]").unwrap_err();

        assert!(matches!(err, EngineError::Persistence(_)));
        assert!(!dir.join("escaped.json").exists());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn load_reads_back_saved_tables() {
        let dir = scratch_dir();
        let mut sink = JsonDirPersistence::open(&dir).unwrap();
        let mut store = TableStore::new();
        store.upsert("accounts", Record::new("a").with("balance", 5_i64));
        let blobs = BTreeMap::from([(
            "accounts".to_string(),
            store.export_table("accounts").unwrap(),
        )]);
        sink.save_all(&blobs).unwrap();

        let loaded = sink.load().unwrap();

        assert_eq!(loaded.tables(), store.tables());
        assert_eq!(loaded.dirty_tables().count(), 0);
        fs::remove_dir_all(&dir).unwrap();
    }
}
