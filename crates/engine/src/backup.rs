//! Durable backups of the whole store.
//!
//! Every backup is the [`TableStore::export_all`] blob wrapped with its
//! metadata and written to a [`KvStore`] under `<namespace><backup id>`. An
//! in-memory index mirrors the metadata so listing never touches the sink.
//! Pruning is driven by the sink, not the index: entries written by an earlier
//! process are pruned too.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{EngineError, KvStore, ResultEngine, TableStore};

pub const DEFAULT_BACKUP_CAPACITY: usize = 5;
pub const DEFAULT_BACKUP_NAMESPACE: &str = "finance_backup_";

#[derive(Debug, Serialize, Deserialize)]
struct Backup {
    id: Uuid,
    operation_name: String,
    description: String,
    timestamp: DateTime<Utc>,
    data: String,
}

/// Only the part of a stored backup pruning needs.
#[derive(Deserialize)]
struct BackupHeader {
    timestamp: DateTime<Utc>,
}

/// Backup metadata, without the payload.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BackupInfo {
    pub id: Uuid,
    pub operation_name: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub size_bytes: usize,
}

impl From<&Backup> for BackupInfo {
    fn from(backup: &Backup) -> Self {
        Self {
            id: backup.id,
            operation_name: backup.operation_name.clone(),
            description: backup.description.clone(),
            timestamp: backup.timestamp,
            size_bytes: backup.data.len(),
        }
    }
}

pub struct BackupManager {
    kv: Box<dyn KvStore>,
    namespace: String,
    capacity: usize,
    /// Most recent first.
    index: Vec<BackupInfo>,
}

impl std::fmt::Debug for BackupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupManager")
            .field("namespace", &self.namespace)
            .field("capacity", &self.capacity)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl BackupManager {
    /// Opens the manager over `kv`, rebuilding the index from the backups
    /// already stored under `namespace`.
    ///
    /// Entries that cannot be parsed are left in place (pruning will get rid
    /// of them first) and skipped from the index.
    pub fn open(kv: Box<dyn KvStore>, namespace: &str, capacity: usize) -> ResultEngine<Self> {
        let mut index = Vec::new();
        for key in kv.list_keys(namespace)? {
            let Some(raw) = kv.get(&key)? else {
                continue;
            };
            match serde_json::from_str::<Backup>(&raw) {
                Ok(backup) => index.push(BackupInfo::from(&backup)),
                Err(err) => tracing::warn!("skipping unreadable backup {key}: {err}"),
            }
        }
        index.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        Ok(Self {
            kv,
            namespace: namespace.to_string(),
            capacity,
            index,
        })
    }

    fn key(&self, id: Uuid) -> String {
        format!("{}{id}", self.namespace)
    }

    /// Writes a backup of `store` and prunes the oldest ones.
    pub fn create_backup(
        &mut self,
        store: &TableStore,
        operation_name: &str,
        description: &str,
    ) -> ResultEngine<Uuid> {
        let backup = Backup {
            id: Uuid::new_v4(),
            operation_name: operation_name.to_string(),
            description: description.to_string(),
            timestamp: Utc::now(),
            data: store.export_all()?,
        };
        let raw =
            serde_json::to_string(&backup).map_err(|err| EngineError::Storage(err.to_string()))?;
        self.kv.put(&self.key(backup.id), &raw)?;
        self.index.insert(0, BackupInfo::from(&backup));
        tracing::debug!(
            "backup {} for \"{operation_name}\" ({} bytes)",
            backup.id,
            raw.len()
        );

        self.prune_old_backups()?;
        Ok(backup.id)
    }

    pub fn restore_from_backup(&self, id: Uuid, store: &mut TableStore) -> ResultEngine<()> {
        let raw = self
            .kv
            .get(&self.key(id))?
            .ok_or_else(|| EngineError::NotFound(format!("backup {id}")))?;
        let backup: Backup = serde_json::from_str(&raw)?;
        store.import_all(&backup.data)?;
        tracing::info!(
            "restored backup {id} (\"{}\" at {})",
            backup.operation_name,
            backup.timestamp
        );
        Ok(())
    }

    /// Removes the oldest backups until at most `capacity` remain.
    ///
    /// Entries whose timestamp cannot be read count as the oldest. Returns the
    /// number of removed backups.
    pub fn prune_old_backups(&mut self) -> ResultEngine<usize> {
        let keys = self.kv.list_keys(&self.namespace)?;
        if keys.len() <= self.capacity {
            return Ok(0);
        }

        let mut aged: Vec<(Option<DateTime<Utc>>, usize, String)> = keys
            .into_iter()
            .map(|key| {
                let timestamp = self
                    .kv
                    .get(&key)
                    .ok()
                    .flatten()
                    .and_then(|raw| serde_json::from_str::<BackupHeader>(&raw).ok())
                    .map(|header| header.timestamp);
                (timestamp, self.recency_rank(&key), key)
            })
            .collect();
        aged.sort();

        let excess = aged.len() - self.capacity;
        for (_, _, key) in aged.into_iter().take(excess) {
            self.kv.remove(&key)?;
            let namespace = self.namespace.as_str();
            self.index
                .retain(|info| format!("{namespace}{}", info.id) != key);
            tracing::debug!("pruned backup {key}");
        }
        Ok(excess)
    }

    /// Tie-breaker for equal timestamps: older index entries rank lower,
    /// entries unknown to the index rank lowest.
    fn recency_rank(&self, key: &str) -> usize {
        self.index
            .iter()
            .position(|info| self.key(info.id) == key)
            .map_or(0, |pos| self.index.len() - pos)
    }

    pub fn list_backups(&self) -> Vec<BackupInfo> {
        self.index.clone()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryKv, Record};

    fn manager(capacity: usize) -> BackupManager {
        BackupManager::open(Box::new(MemoryKv::new()), DEFAULT_BACKUP_NAMESPACE, capacity)
            .unwrap()
    }

    #[test]
    fn restore_brings_back_exported_state() {
        let mut store = TableStore::new();
        store.upsert("accounts", Record::new("a").with("balance", 10_i64));
        let mut backups = manager(DEFAULT_BACKUP_CAPACITY);
        let id = backups.create_backup(&store, "edit", "").unwrap();
        let before = store.tables().clone();

        store.upsert("accounts", Record::new("b"));
        backups.restore_from_backup(id, &mut store).unwrap();

        assert_eq!(store.tables(), &before);
    }

    #[test]
    fn pruning_bounds_sink_and_index() {
        let store = TableStore::new();
        let mut backups = manager(2);
        let ids: Vec<Uuid> = (0..5)
            .map(|i| backups.create_backup(&store, &format!("op{i}"), "").unwrap())
            .collect();

        let listed: Vec<Uuid> = backups.list_backups().iter().map(|b| b.id).collect();
        assert_eq!(listed, vec![ids[4], ids[3]]);
        assert_eq!(backups.kv.list_keys(DEFAULT_BACKUP_NAMESPACE).unwrap().len(), 2);
    }

    #[test]
    fn corrupt_entries_are_pruned_first() {
        let mut kv = MemoryKv::new();
        kv.put("finance_backup_broken", "{").unwrap();
        let mut backups = BackupManager::open(Box::new(kv), DEFAULT_BACKUP_NAMESPACE, 1).unwrap();
        assert!(backups.is_empty());

        let id = backups.create_backup(&TableStore::new(), "op", "").unwrap();

        let keys = backups.kv.list_keys(DEFAULT_BACKUP_NAMESPACE).unwrap();
        assert_eq!(keys, vec![format!("finance_backup_{id}")]);
    }

    #[test]
    fn restore_errors_are_typed() {
        let mut kv = MemoryKv::new();
        let broken = Uuid::new_v4();
        kv.put(&format!("finance_backup_{broken}"), "garbage").unwrap();
        let backups = BackupManager::open(Box::new(kv), DEFAULT_BACKUP_NAMESPACE, 5).unwrap();
        let mut store = TableStore::new();

        assert!(matches!(
            backups.restore_from_backup(Uuid::new_v4(), &mut store),
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            backups.restore_from_backup(broken, &mut store),
            Err(EngineError::Deserialization(_))
        ));
    }

    #[test]
    fn open_rebuilds_index_from_sink() {
        let kv = MemoryKv::new();
        let id = BackupManager::open(Box::new(kv.clone()), "ns_", 5)
            .unwrap()
            .create_backup(&TableStore::new(), "op", "desc")
            .unwrap();

        let reopened = BackupManager::open(Box::new(kv), "ns_", 5).unwrap();
        let listed = reopened.list_backups();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert_eq!(listed[0].description, "desc");
    }
}
