//! Transactional protection layer for the in-memory ledger store.
//!
//! All application data lives in a [`TableStore`]. Mutations go through the
//! [`Engine`], which guards them with:
//!
//! - in-memory snapshots ([`SnapshotManager`]) for cheap rollback;
//! - durable backups ([`BackupManager`]) in a [`KvStore`], used when a
//!   snapshot rollback is not possible;
//! - single-flight execution: at most one guarded operation runs at a time,
//!   and a second attempt fails with [`EngineError::ConcurrentOperation`]
//!   instead of queueing.
//!
//! Committed tables are handed to a [`PersistenceSink`]. Paired ledger
//! records (transfers, investment trades) are created and deleted as a unit
//! by the linked-record operations on [`Engine`].
//!
//! ```rust
//! use engine::{Engine, Record, TableStore, step};
//!
//! # async fn demo() -> Result<(), engine::EngineError> {
//! let engine = Engine::builder().build()?;
//! engine
//!     .perform_atomic_operation(
//!         "seed",
//!         vec![step(|store: &mut TableStore| {
//!             Box::pin(async move {
//!                 store.upsert("accounts", Record::new("a").with("balance", 100_i64));
//!                 Ok(())
//!             })
//!         })],
//!         "seed one account",
//!     )
//!     .await?;
//! assert_eq!(engine.table("accounts").await.len(), 1);
//! # Ok(())
//! # }
//! ```

pub use backup::{BackupInfo, BackupManager, DEFAULT_BACKUP_CAPACITY, DEFAULT_BACKUP_NAMESPACE};
pub use error::EngineError;
pub use kv::{DirKv, KvStore, MemoryKv};
pub use ledger::{
    ACCOUNTS_TABLE, Account, LedgerTransaction, TRANSACTIONS_TABLE, TransactionKind,
};
pub use ops::{
    AtomicOperationContext, Engine, EngineBuilder, EngineConfig, EngineStatus, LinkIssue,
    LinkedPairDraft, OperationOutcome, Step, StepFuture, reverse_balance, step,
};
pub use persistence::{JsonDirPersistence, MemoryPersistence, NoopPersistence, PersistenceSink};
pub use snapshot::{DEFAULT_SNAPSHOT_CAPACITY, SnapshotInfo, SnapshotManager};
pub use store::{TableStore, TableVersions, Tables};
pub use value::{Record, Value};

mod backup;
mod error;
mod kv;
mod ledger;
mod ops;
mod persistence;
mod snapshot;
mod store;
mod value;

type ResultEngine<T> = Result<T, EngineError>;
