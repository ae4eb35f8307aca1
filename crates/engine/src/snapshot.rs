//! In-memory snapshots of the whole store.
//!
//! A snapshot is a full structural copy of every table and of the version map,
//! not a diff: its cost grows linearly with the number of records in the store.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    EngineError, Record, ResultEngine, TableStore, Value,
    store::{TableVersions, Tables},
};

pub const DEFAULT_SNAPSHOT_CAPACITY: usize = 10;

#[derive(Debug)]
struct Snapshot {
    info: SnapshotInfo,
    tables: Tables,
    table_versions: TableVersions,
}

/// Snapshot metadata, without the table payload.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SnapshotInfo {
    pub id: Uuid,
    pub operation_name: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub record_count: usize,
    pub approx_bytes: usize,
}

/// Bounded list of snapshots, most recent first.
#[derive(Debug)]
pub struct SnapshotManager {
    snapshots: VecDeque<Snapshot>,
    capacity: usize,
}

impl SnapshotManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            snapshots: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Captures the current state of `store` and returns the snapshot id.
    ///
    /// The oldest snapshots are evicted once the capacity is exceeded.
    pub fn create_snapshot(
        &mut self,
        store: &TableStore,
        operation_name: &str,
        description: &str,
    ) -> ResultEngine<Uuid> {
        let mut tables = Tables::new();
        let mut approx_bytes = 0;
        for (name, records) in store.tables() {
            let copied = records
                .iter()
                .map(Record::deep_copy)
                .collect::<ResultEngine<Vec<_>>>()?;
            approx_bytes += name.len() + copied.iter().map(record_size).sum::<usize>();
            tables.insert(name.clone(), copied);
        }

        let info = SnapshotInfo {
            id: Uuid::new_v4(),
            operation_name: operation_name.to_string(),
            description: description.to_string(),
            timestamp: Utc::now(),
            record_count: store.record_count(),
            approx_bytes,
        };
        let id = info.id;
        tracing::debug!(
            "snapshot {id} for \"{operation_name}\" ({} records)",
            info.record_count
        );

        self.snapshots.push_front(Snapshot {
            info,
            tables,
            table_versions: store.versions().clone(),
        });
        while self.snapshots.len() > self.capacity {
            if let Some(evicted) = self.snapshots.pop_back() {
                tracing::debug!("evicted snapshot {}", evicted.info.id);
            }
        }

        Ok(id)
    }

    /// Restores `store` to the state saved in snapshot `id`.
    ///
    /// The archived copy is never handed out, so rolling back to the same
    /// snapshot several times always yields the same state. Newer snapshots
    /// stay valid.
    pub fn rollback(&self, id: Uuid, store: &mut TableStore) -> ResultEngine<()> {
        let snapshot = self
            .snapshots
            .iter()
            .find(|snapshot| snapshot.info.id == id)
            .ok_or_else(|| EngineError::NotFound(format!("snapshot {id}")))?;

        store.restore(snapshot.tables.clone(), snapshot.table_versions.clone());
        tracing::info!(
            "rolled back to snapshot {id} (\"{}\")",
            snapshot.info.operation_name
        );
        Ok(())
    }

    pub fn list_snapshots(&self) -> Vec<SnapshotInfo> {
        self.snapshots.iter().map(|s| s.info.clone()).collect()
    }

    pub fn clear_snapshots(&mut self) {
        self.snapshots.clear();
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Rough number of bytes held by all snapshots.
    pub fn memory_estimate(&self) -> usize {
        self.snapshots.iter().map(|s| s.info.approx_bytes).sum()
    }
}

impl Default for SnapshotManager {
    fn default() -> Self {
        Self::new(DEFAULT_SNAPSHOT_CAPACITY)
    }
}

fn record_size(record: &Record) -> usize {
    record.id.len()
        + record
            .fields
            .iter()
            .map(|(name, value)| name.len() + value_size(value))
            .sum::<usize>()
}

fn value_size(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) => 1,
        Value::Int(_) | Value::Float(_) => 8,
        Value::Date(_) => 12,
        Value::Text(s) => s.len(),
        Value::List(items) => items.iter().map(value_size).sum(),
        Value::Record(fields) => fields.iter().map(|(k, v)| k.len() + value_size(v)).sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(balance: i64) -> TableStore {
        let mut store = TableStore::new();
        store.upsert("accounts", Record::new("a").with("balance", balance));
        store
    }

    #[test]
    fn rollback_ignores_later_mutations() {
        let mut store = store_with(100);
        let mut manager = SnapshotManager::default();
        let id = manager.create_snapshot(&store, "edit", "").unwrap();
        let before = store.tables().clone();

        store.upsert("accounts", Record::new("a").with("balance", 1_i64));
        store.upsert("transactions", Record::new("t1"));
        manager.rollback(id, &mut store).unwrap();

        assert_eq!(store.tables(), &before);
    }

    #[test]
    fn rollback_is_idempotent() {
        let mut store = store_with(100);
        let mut manager = SnapshotManager::default();
        let id = manager.create_snapshot(&store, "edit", "").unwrap();

        store.upsert("accounts", Record::new("b"));
        manager.rollback(id, &mut store).unwrap();
        let once = store.tables().clone();
        store.upsert("accounts", Record::new("c"));
        manager.rollback(id, &mut store).unwrap();

        assert_eq!(store.tables(), &once);
    }

    #[test]
    fn older_snapshot_rollback_keeps_newer_ones() {
        let mut store = store_with(1);
        let mut manager = SnapshotManager::default();
        let old = manager.create_snapshot(&store, "first", "").unwrap();
        store.upsert("accounts", Record::new("a").with("balance", 2_i64));
        let new = manager.create_snapshot(&store, "second", "").unwrap();

        manager.rollback(old, &mut store).unwrap();
        manager.rollback(new, &mut store).unwrap();

        assert_eq!(
            store.find("accounts", "a").and_then(|r| r.get("balance")),
            Some(&Value::Int(2))
        );
    }

    #[test]
    fn capacity_keeps_most_recent() {
        let store = store_with(1);
        let mut manager = SnapshotManager::new(3);
        let ids: Vec<Uuid> = (0..8)
            .map(|i| manager.create_snapshot(&store, &format!("op{i}"), "").unwrap())
            .collect();

        let listed: Vec<Uuid> = manager.list_snapshots().iter().map(|s| s.id).collect();
        assert_eq!(listed, vec![ids[7], ids[6], ids[5]]);
    }

    #[test]
    fn unknown_snapshot_is_not_found() {
        let mut store = TableStore::new();
        let manager = SnapshotManager::default();
        let err = manager.rollback(Uuid::new_v4(), &mut store).unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
