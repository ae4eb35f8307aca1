//! The in-memory table store.
//!
//! [`TableStore`] is the single mutable source of truth: every other component
//! borrows it for the duration of a call and never keeps a second live handle
//! to its tables.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EngineError, Record, ResultEngine};

/// Current layout of the blob produced by [`TableStore::export_all`].
pub const EXPORT_FORMAT_VERSION: u32 = 1;

pub type Tables = BTreeMap<String, Vec<Record>>;
pub type TableVersions = BTreeMap<String, u64>;

#[derive(Debug, Default)]
pub struct TableStore {
    tables: Tables,
    versions: TableVersions,
    dirty: BTreeSet<String>,
}

/// Serialized form of the whole store.
#[derive(Debug, Serialize, Deserialize)]
struct StoreExport {
    format_version: u32,
    exported_at: DateTime<Utc>,
    tables: Tables,
    table_versions: TableVersions,
}

impl TableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records of `name` in insertion order; empty for unknown tables.
    pub fn get_table(&self, name: &str) -> &[Record] {
        self.tables.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    /// Replaces the content of a table, rejecting duplicate ids.
    pub fn replace_table(&mut self, name: &str, records: Vec<Record>) -> ResultEngine<()> {
        let mut seen = HashSet::with_capacity(records.len());
        for record in &records {
            if !seen.insert(record.id.as_str()) {
                return Err(EngineError::InvalidRecord(format!(
                    "duplicate id \"{}\" in table \"{name}\"",
                    record.id
                )));
            }
        }
        self.tables.insert(name.to_string(), records);
        self.dirty.insert(name.to_string());
        Ok(())
    }

    pub fn find(&self, table: &str, id: &str) -> Option<&Record> {
        self.get_table(table).iter().find(|record| record.id == id)
    }

    /// Inserts `record`, or replaces the record with the same id in place.
    pub fn upsert(&mut self, table: &str, record: Record) {
        let records = self.tables.entry(table.to_string()).or_default();
        match records.iter_mut().find(|existing| existing.id == record.id) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        self.dirty.insert(table.to_string());
    }

    pub fn remove(&mut self, table: &str, id: &str) -> Option<Record> {
        let records = self.tables.get_mut(table)?;
        let index = records.iter().position(|record| record.id == id)?;
        let removed = records.remove(index);
        self.dirty.insert(table.to_string());
        Some(removed)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn record_count(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    pub fn get_version(&self, name: &str) -> u64 {
        self.versions.get(name).copied().unwrap_or(0)
    }

    pub fn bump_version(&mut self, name: &str) {
        *self.versions.entry(name.to_string()).or_insert(0) += 1;
    }

    /// Flags a table for the next commit without changing it.
    pub fn mark_dirty(&mut self, name: &str) {
        self.dirty.insert(name.to_string());
    }

    /// Tables mutated since the last commit or restore.
    pub fn dirty_tables(&self) -> impl Iterator<Item = &str> {
        self.dirty.iter().map(String::as_str)
    }

    /// Bumps the version of every dirty table once and clears the marks.
    ///
    /// Returns the names of the committed tables.
    pub(crate) fn commit_versions(&mut self) -> Vec<String> {
        let committed: Vec<String> = std::mem::take(&mut self.dirty).into_iter().collect();
        for name in &committed {
            self.bump_version(name);
        }
        committed
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty.clear();
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    pub fn versions(&self) -> &TableVersions {
        &self.versions
    }

    /// Replaces the whole state. Used by rollback and restore only.
    pub(crate) fn restore(&mut self, tables: Tables, versions: TableVersions) {
        self.tables = tables;
        self.versions = versions;
        self.dirty.clear();
    }

    /// Serialized copy of one table, as handed to a persistence sink.
    ///
    /// Fails with [`EngineError::UnsupportedValue`] instead of writing a value
    /// JSON cannot hold.
    pub fn export_table(&self, name: &str) -> ResultEngine<String> {
        let records = self.get_table(name);
        records.iter().try_for_each(Record::check_supported)?;
        serde_json::to_string(records)
            .map_err(|err| EngineError::Persistence(err.to_string()))
    }

    pub fn export_all(&self) -> ResultEngine<String> {
        self.tables
            .values()
            .flatten()
            .try_for_each(Record::check_supported)?;
        let export = StoreExport {
            format_version: EXPORT_FORMAT_VERSION,
            exported_at: Utc::now(),
            tables: self.tables.clone(),
            table_versions: self.versions.clone(),
        };
        serde_json::to_string(&export).map_err(|err| EngineError::Storage(err.to_string()))
    }

    pub fn import_all(&mut self, blob: &str) -> ResultEngine<()> {
        let export: StoreExport = serde_json::from_str(blob)?;
        if export.format_version != EXPORT_FORMAT_VERSION {
            return Err(EngineError::Deserialization(format!(
                "unsupported export format {}",
                export.format_version
            )));
        }
        self.restore(export.tables, export.table_versions);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;

    fn account(id: &str, balance: i64) -> Record {
        Record::new(id).with("balance", balance)
    }

    #[test]
    fn replace_table_rejects_duplicate_ids() {
        let mut store = TableStore::new();
        let err = store
            .replace_table("accounts", vec![account("a", 1), account("a", 2)])
            .unwrap_err();

        assert!(matches!(err, EngineError::InvalidRecord(_)));
        assert!(store.get_table("accounts").is_empty());
    }

    #[test]
    fn commit_bumps_each_dirty_table_once() {
        let mut store = TableStore::new();
        store.upsert("accounts", account("a", 1));
        store.upsert("accounts", account("b", 2));
        store.remove("accounts", "a");

        assert_eq!(store.commit_versions(), vec!["accounts".to_string()]);
        assert_eq!(store.get_version("accounts"), 1);
        assert_eq!(store.dirty_tables().count(), 0);
    }

    #[test]
    fn upsert_replaces_in_place() {
        let mut store = TableStore::new();
        store.upsert("accounts", account("a", 1));
        store.upsert("accounts", account("b", 2));
        store.upsert("accounts", account("a", 5));

        let ids: Vec<&str> = store
            .get_table("accounts")
            .iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(
            store.find("accounts", "a").and_then(|r| r.get("balance")),
            Some(&Value::Int(5))
        );
    }

    #[test]
    fn export_then_import_restores_tables_and_versions() {
        let mut store = TableStore::new();
        store.upsert("accounts", account("a", 1));
        store.commit_versions();
        let blob = store.export_all().unwrap();

        let mut other = TableStore::new();
        other.upsert("transactions", Record::new("t"));
        other.import_all(&blob).unwrap();

        assert_eq!(other.tables(), store.tables());
        assert_eq!(other.get_version("accounts"), 1);
        assert_eq!(other.dirty_tables().count(), 0);
    }

    #[test]
    fn export_rejects_non_finite_floats() {
        let mut store = TableStore::new();
        store.upsert("rates", Record::new("x").with("rate", Value::Float(f64::INFINITY)));

        assert!(matches!(
            store.export_table("rates"),
            Err(EngineError::UnsupportedValue(_))
        ));
        assert!(matches!(
            store.export_all(),
            Err(EngineError::UnsupportedValue(_))
        ));
    }

    #[test]
    fn import_rejects_garbage() {
        let mut store = TableStore::new();
        assert!(matches!(
            store.import_all("not json"),
            Err(EngineError::Deserialization(_))
        ));
    }
}
