//! Guarded operations.
//!
//! Every guarded operation follows the same life cycle:
//!
//! ```text
//! Idle -> Running -> Committed | RolledBack | FailedRecovery
//! ```
//!
//! The store lock is held from the protective snapshot to the end of the
//! recovery, so other readers see either the state before the operation or
//! the committed state after it. Committed tables are persisted once, after
//! the last step.
//!
//! A guarded future dropped before it commits (e.g. by `tokio::time::timeout`)
//! rolls the store back while it still holds the lock.

use std::collections::BTreeMap;

use tokio::sync::MutexGuard;
use uuid::Uuid;

use crate::{BackupInfo, EngineError, ResultEngine, SnapshotInfo, TableStore};

use super::{Engine, OperationOutcome, Step, StepFuture};

/// Owns the store lock of a running guarded operation.
///
/// Until [`commit`](Self::commit) or [`recover`](Self::recover) is called,
/// dropping it restores the protective snapshot (or backup).
struct PendingRollback<'e> {
    engine: &'e Engine,
    store: MutexGuard<'e, TableStore>,
    name: String,
    snapshot_id: Uuid,
    backup_id: Option<Uuid>,
    armed: bool,
}

impl PendingRollback<'_> {
    fn store(&mut self) -> &mut TableStore {
        &mut self.store
    }

    fn commit(&mut self) -> ResultEngine<()> {
        self.engine.commit(&mut self.store)
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    fn recover(mut self, original: EngineError) -> EngineError {
        self.armed = false;
        self.engine.recover(
            &mut self.store,
            &self.name,
            original,
            self.snapshot_id,
            self.backup_id,
        )
    }
}

impl Drop for PendingRollback<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::warn!("\"{}\" was dropped before committing", self.name);
        let cancelled = EngineError::Cancelled(self.name.clone());
        self.engine.recover(
            &mut self.store,
            &self.name,
            cancelled,
            self.snapshot_id,
            self.backup_id,
        );
    }
}

impl Engine {
    /// Runs `operation` against the store, rolling back to a fresh snapshot if
    /// it fails.
    ///
    /// Errors:
    /// - [`EngineError::ConcurrentOperation`] if another operation is running;
    /// - [`EngineError::Operation`] when the operation (or the persistence of
    ///   its result) failed and the store was rolled back;
    /// - [`EngineError::Unrecoverable`] when the rollback failed as well.
    pub async fn execute_with_snapshot<T, F>(
        &self,
        name: &str,
        operation: F,
        description: &str,
    ) -> ResultEngine<T>
    where
        F: for<'s> FnOnce(&'s mut TableStore) -> StepFuture<'s, T>,
    {
        let _flight = self.begin_flight(name, 1)?;
        let store = self.store.lock().await;
        self.run_protected(store, name, description, None, operation)
            .await
    }

    /// Like [`execute_with_snapshot`](Self::execute_with_snapshot), with a
    /// durable backup taken first and restored if the snapshot rollback fails.
    pub async fn execute_with_full_protection<T, F>(
        &self,
        name: &str,
        operation: F,
        description: &str,
    ) -> ResultEngine<T>
    where
        F: for<'s> FnOnce(&'s mut TableStore) -> StepFuture<'s, T>,
    {
        let _flight = self.begin_flight(name, 1)?;
        let store = self.store.lock().await;
        let backup_id = match self.backups().create_backup(&store, name, description) {
            Ok(id) => id,
            Err(err) => return Err(self.aborted(name, err)),
        };
        self.run_protected(store, name, description, Some(backup_id), operation)
            .await
    }

    /// Runs `steps` in order as one atomic operation and returns their results.
    ///
    /// Both a snapshot and a backup are taken before the first step. The first
    /// failing step aborts the remaining ones; the store is then recovered from
    /// the snapshot, or from the backup if the snapshot cannot be used.
    pub async fn perform_atomic_operation<T>(
        &self,
        name: &str,
        steps: Vec<Step<T>>,
        description: &str,
    ) -> ResultEngine<Vec<T>> {
        let _flight = self.begin_flight(name, steps.len())?;
        let store = self.store.lock().await;

        let snapshot_id = match self.snapshots().create_snapshot(&store, name, description) {
            Ok(id) => id,
            Err(err) => return Err(self.aborted(name, err)),
        };
        let backup_id = match self.backups().create_backup(&store, name, description) {
            Ok(id) => id,
            Err(err) => return Err(self.aborted(name, err)),
        };
        let mut pending = PendingRollback {
            engine: self,
            store,
            name: name.to_string(),
            snapshot_id,
            backup_id: Some(backup_id),
            armed: true,
        };

        let total = steps.len();
        let mut results = Vec::with_capacity(total);
        let mut failure = None;
        for (index, step) in steps.into_iter().enumerate() {
            match step(pending.store()).await {
                Ok(value) => {
                    results.push(value);
                    self.step_completed();
                }
                Err(err) => {
                    tracing::warn!("step {}/{total} of \"{name}\" failed: {err}", index + 1);
                    failure = Some(err);
                    break;
                }
            }
        }

        let outcome = match failure {
            None => pending.commit().map(|()| results),
            Some(err) => Err(err),
        };
        match outcome {
            Ok(results) => {
                pending.disarm();
                self.set_outcome(OperationOutcome::Committed);
                tracing::info!("committed \"{name}\" ({total} steps)");
                Ok(results)
            }
            Err(err) => Err(pending.recover(err)),
        }
    }

    async fn run_protected<T, F>(
        &self,
        store: MutexGuard<'_, TableStore>,
        name: &str,
        description: &str,
        backup_id: Option<Uuid>,
        operation: F,
    ) -> ResultEngine<T>
    where
        F: for<'s> FnOnce(&'s mut TableStore) -> StepFuture<'s, T>,
    {
        let snapshot_id = match self.snapshots().create_snapshot(&store, name, description) {
            Ok(id) => id,
            Err(err) => return Err(self.aborted(name, err)),
        };
        let mut pending = PendingRollback {
            engine: self,
            store,
            name: name.to_string(),
            snapshot_id,
            backup_id,
            armed: true,
        };

        let outcome = match operation(pending.store()).await {
            Ok(value) => pending.commit().map(|()| value),
            Err(err) => Err(err),
        };
        match outcome {
            Ok(value) => {
                pending.disarm();
                self.set_outcome(OperationOutcome::Committed);
                tracing::info!("committed \"{name}\"");
                Ok(value)
            }
            Err(err) => Err(pending.recover(err)),
        }
    }

    /// Persists the tables touched by the operation and bumps their versions.
    fn commit(&self, store: &mut TableStore) -> ResultEngine<()> {
        let dirty: Vec<String> = store.dirty_tables().map(ToString::to_string).collect();
        if dirty.is_empty() {
            return Ok(());
        }
        let blobs = dirty
            .into_iter()
            .map(|table| {
                let blob = store.export_table(&table)?;
                Ok((table, blob))
            })
            .collect::<ResultEngine<BTreeMap<String, String>>>()?;
        self.persistence().save_all(&blobs)?;
        store.commit_versions();
        Ok(())
    }

    /// The protection could not be set up; nothing was changed.
    fn aborted(&self, name: &str, err: EngineError) -> EngineError {
        tracing::warn!("\"{name}\" aborted before running: {err}");
        self.set_outcome(OperationOutcome::RolledBack);
        EngineError::Operation {
            operation: name.to_string(),
            source: Box::new(err),
        }
    }

    /// Snapshot rollback first, backup restore second.
    fn recover(
        &self,
        store: &mut TableStore,
        name: &str,
        original: EngineError,
        snapshot_id: Uuid,
        backup_id: Option<Uuid>,
    ) -> EngineError {
        let rollback = match self.snapshots().rollback(snapshot_id, store) {
            Ok(()) => return self.rolled_back(name, original),
            Err(err) => err,
        };
        tracing::warn!("snapshot rollback of \"{name}\" failed: {rollback}");

        let restore = match backup_id {
            Some(backup_id) => match self.backups().restore_from_backup(backup_id, store) {
                Ok(()) => return self.rolled_back(name, original),
                Err(err) => Some(Box::new(err)),
            },
            None => None,
        };

        self.set_outcome(OperationOutcome::FailedRecovery);
        tracing::error!(
            "\"{name}\" left the store in an unknown state, reload from the last saved file"
        );
        EngineError::Unrecoverable {
            operation: name.to_string(),
            original: Box::new(original),
            rollback: Box::new(rollback),
            restore,
        }
    }

    fn rolled_back(&self, name: &str, original: EngineError) -> EngineError {
        self.set_outcome(OperationOutcome::RolledBack);
        tracing::info!("rolled back \"{name}\": {original}");
        EngineError::Operation {
            operation: name.to_string(),
            source: Box::new(original),
        }
    }

    pub async fn create_snapshot(&self, name: &str, description: &str) -> ResultEngine<Uuid> {
        let _flight = self.begin_flight(name, 0)?;
        let store = self.store.lock().await;
        self.snapshots().create_snapshot(&store, name, description)
    }

    /// Restores the store to snapshot `id`. Older snapshots can be restored
    /// even after newer ones were taken; the newer ones stay available.
    pub async fn rollback(&self, id: Uuid) -> ResultEngine<()> {
        let _flight = self.begin_flight("rollback", 0)?;
        let mut store = self.store.lock().await;
        self.snapshots().rollback(id, &mut store)
    }

    pub async fn create_backup(&self, name: &str, description: &str) -> ResultEngine<Uuid> {
        let _flight = self.begin_flight(name, 0)?;
        let store = self.store.lock().await;
        self.backups().create_backup(&store, name, description)
    }

    pub async fn restore_from_backup(&self, id: Uuid) -> ResultEngine<()> {
        let _flight = self.begin_flight("restore_from_backup", 0)?;
        let mut store = self.store.lock().await;
        self.backups().restore_from_backup(id, &mut store)
    }

    pub fn prune_old_backups(&self) -> ResultEngine<usize> {
        self.backups().prune_old_backups()
    }

    pub fn list_snapshots(&self) -> Vec<SnapshotInfo> {
        self.snapshots().list_snapshots()
    }

    pub fn clear_snapshots(&self) {
        self.snapshots().clear_snapshots();
    }

    pub fn list_backups(&self) -> Vec<BackupInfo> {
        self.backups().list_backups()
    }
}
