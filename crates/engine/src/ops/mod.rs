use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    BackupManager, DEFAULT_BACKUP_CAPACITY, DEFAULT_BACKUP_NAMESPACE, DEFAULT_SNAPSHOT_CAPACITY,
    EngineError, KvStore, MemoryKv, NoopPersistence, PersistenceSink, Record, ResultEngine,
    SnapshotManager, TableStore,
};

mod guarded;
mod linked;

pub use linked::{LinkIssue, LinkedPairDraft, reverse_balance};

/// Future returned by a guarded step; borrows the store for its whole run.
pub type StepFuture<'s, T> = Pin<Box<dyn Future<Output = ResultEngine<T>> + Send + 's>>;

/// One step of an atomic operation.
pub type Step<T> = Box<dyn for<'s> FnOnce(&'s mut TableStore) -> StepFuture<'s, T> + Send>;

/// Boxes a closure as a [`Step`].
///
/// Going through this function lets the compiler infer the higher-ranked
/// signature of the closure.
pub fn step<T, F>(f: F) -> Step<T>
where
    F: for<'s> FnOnce(&'s mut TableStore) -> StepFuture<'s, T> + Send + 'static,
{
    Box::new(f)
}

/// Tunables of the protection layer.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Snapshots kept in memory; the oldest are evicted first.
    pub snapshot_capacity: usize,
    /// Backups kept in the KV sink; the oldest are pruned first.
    pub backup_capacity: usize,
    /// Key prefix of backup entries in the KV sink.
    pub backup_namespace: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snapshot_capacity: DEFAULT_SNAPSHOT_CAPACITY,
            backup_capacity: DEFAULT_BACKUP_CAPACITY,
            backup_namespace: DEFAULT_BACKUP_NAMESPACE.to_string(),
        }
    }
}

/// The operation currently holding the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AtomicOperationContext {
    pub operation_name: String,
    pub started_at: DateTime<Utc>,
    pub step_count: usize,
    pub completed_steps: usize,
}

/// How the last guarded operation ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationOutcome {
    Committed,
    RolledBack,
    /// Neither the snapshot nor the backup could be restored.
    FailedRecovery,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EngineStatus {
    pub is_in_transaction: bool,
    pub current_operation: Option<AtomicOperationContext>,
    pub snapshot_count: usize,
    pub backup_count: usize,
    /// Approximate bytes held by in-memory snapshots.
    pub memory_estimate: usize,
    pub last_outcome: Option<OperationOutcome>,
}

#[derive(Debug, Default)]
struct FlightState {
    current: Option<AtomicOperationContext>,
    last_outcome: Option<OperationOutcome>,
}

/// Releases the in-flight slot when dropped, whatever way the operation ends.
struct FlightGuard<'e> {
    engine: &'e Engine,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.engine.flight().current = None;
    }
}

pub struct Engine {
    store: tokio::sync::Mutex<TableStore>,
    snapshots: Mutex<SnapshotManager>,
    backups: Mutex<BackupManager>,
    persistence: Mutex<Box<dyn PersistenceSink>>,
    flight: Mutex<FlightState>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("status", &self.get_status())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Return a builder for `Engine`. Help to build the struct.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    fn snapshots(&self) -> MutexGuard<'_, SnapshotManager> {
        self.snapshots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn backups(&self) -> MutexGuard<'_, BackupManager> {
        self.backups.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persistence(&self) -> MutexGuard<'_, Box<dyn PersistenceSink>> {
        self.persistence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn flight(&self) -> MutexGuard<'_, FlightState> {
        self.flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims the in-flight slot or fails fast if another operation holds it.
    fn begin_flight(&self, operation_name: &str, step_count: usize) -> ResultEngine<FlightGuard<'_>> {
        let mut flight = self.flight();
        if let Some(current) = &flight.current {
            tracing::warn!(
                "rejected \"{operation_name}\": \"{}\" is running",
                current.operation_name
            );
            return Err(EngineError::ConcurrentOperation(
                current.operation_name.clone(),
            ));
        }
        flight.current = Some(AtomicOperationContext {
            operation_name: operation_name.to_string(),
            started_at: Utc::now(),
            step_count,
            completed_steps: 0,
        });
        Ok(FlightGuard { engine: self })
    }

    fn step_completed(&self) {
        if let Some(current) = self.flight().current.as_mut() {
            current.completed_steps += 1;
        }
    }

    fn set_outcome(&self, outcome: OperationOutcome) {
        self.flight().last_outcome = Some(outcome);
    }

    pub fn get_status(&self) -> EngineStatus {
        let (current_operation, last_outcome) = {
            let flight = self.flight();
            (flight.current.clone(), flight.last_outcome)
        };
        let (snapshot_count, memory_estimate) = {
            let snapshots = self.snapshots();
            (snapshots.len(), snapshots.memory_estimate())
        };
        EngineStatus {
            is_in_transaction: current_operation.is_some(),
            current_operation,
            snapshot_count,
            backup_count: self.backups().len(),
            memory_estimate,
            last_outcome,
        }
    }

    /// Copy of a table's records.
    ///
    /// Waits for a running guarded operation to finish, so partial state is
    /// never observed. Must not be called from inside a step.
    pub async fn table(&self, name: &str) -> Vec<Record> {
        self.store.lock().await.get_table(name).to_vec()
    }

    pub async fn version(&self, name: &str) -> u64 {
        self.store.lock().await.get_version(name)
    }

    /// Runs a read-only closure against the store.
    pub async fn read<R>(&self, f: impl FnOnce(&TableStore) -> R) -> R {
        let store = self.store.lock().await;
        f(&store)
    }
}

/// The builder for `Engine`
#[derive(Default)]
pub struct EngineBuilder {
    store: Option<TableStore>,
    kv: Option<Box<dyn KvStore>>,
    persistence: Option<Box<dyn PersistenceSink>>,
    config: EngineConfig,
}

impl EngineBuilder {
    /// Start from an already loaded store instead of an empty one.
    pub fn store(mut self, store: TableStore) -> EngineBuilder {
        self.store = Some(store);
        self
    }

    /// Durable sink for backups. Defaults to a process-local [`MemoryKv`].
    pub fn kv_store(mut self, kv: impl KvStore + 'static) -> EngineBuilder {
        self.kv = Some(Box::new(kv));
        self
    }

    /// Sink for committed tables. Defaults to [`NoopPersistence`].
    pub fn persistence(mut self, sink: impl PersistenceSink + 'static) -> EngineBuilder {
        self.persistence = Some(Box::new(sink));
        self
    }

    pub fn config(mut self, config: EngineConfig) -> EngineBuilder {
        self.config = config;
        self
    }

    /// Construct `Engine`
    pub fn build(self) -> ResultEngine<Engine> {
        let EngineConfig {
            snapshot_capacity,
            backup_capacity,
            backup_namespace,
        } = self.config;
        if snapshot_capacity == 0 || backup_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "snapshot and backup capacities must be > 0".to_string(),
            ));
        }
        if backup_namespace.is_empty() {
            return Err(EngineError::InvalidConfig(
                "backup namespace must not be empty".to_string(),
            ));
        }

        let kv = self.kv.unwrap_or_else(|| Box::new(MemoryKv::new()));
        let backups = BackupManager::open(kv, &backup_namespace, backup_capacity)?;
        let store = self.store.unwrap_or_default();
        tracing::info!(
            "engine ready: {} records, {} backups on record",
            store.record_count(),
            backups.len()
        );

        Ok(Engine {
            store: tokio::sync::Mutex::new(store),
            snapshots: Mutex::new(SnapshotManager::new(snapshot_capacity)),
            backups: Mutex::new(backups),
            persistence: Mutex::new(
                self.persistence
                    .unwrap_or_else(|| Box::new(NoopPersistence)),
            ),
            flight: Mutex::new(FlightState::default()),
        })
    }
}
