//! The module contains the errors the engine can throw.
//!
//! Failures fall in two groups:
//!
//! - plain failures ([`NotFound`], [`Deserialization`], [`InvalidRecord`], ...)
//!   raised by a single component;
//! - guarded-operation failures: [`Operation`] wraps whatever went wrong inside
//!   a guarded operation once the store has been rolled back, while
//!   [`Unrecoverable`] means every recovery tier failed and the in-memory state
//!   can no longer be trusted.
//!
//!  [`NotFound`]: EngineError::NotFound
//!  [`Deserialization`]: EngineError::Deserialization
//!  [`InvalidRecord`]: EngineError::InvalidRecord
//!  [`Operation`]: EngineError::Operation
//!  [`Unrecoverable`]: EngineError::Unrecoverable
use thiserror::Error;

/// Engine custom errors.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("\"{0}\" not found!")]
    NotFound(String),
    #[error("Deserialization failed: {0}")]
    Deserialization(String),
    #[error("Operation \"{0}\" is already running")]
    ConcurrentOperation(String),
    #[error("Operation \"{0}\" was cancelled before committing")]
    Cancelled(String),
    #[error("Operation \"{operation}\" failed: {source}")]
    Operation {
        operation: String,
        #[source]
        source: Box<EngineError>,
    },
    #[error(
        "Operation \"{operation}\" left the store in an unknown state: {original}; \
         rollback failed: {rollback}; restore failed: {}",
        .restore.as_deref().map_or_else(|| "not attempted".to_string(), ToString::to_string)
    )]
    Unrecoverable {
        operation: String,
        original: Box<EngineError>,
        rollback: Box<EngineError>,
        restore: Option<Box<EngineError>>,
    },
    #[error("Invalid record: {0}")]
    InvalidRecord(String),
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Account \"{0}\" is still referenced by transactions")]
    AccountInUse(String),
    #[error("Unsupported value: {0}")]
    UnsupportedValue(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl EngineError {
    /// Returns the innermost cause, unwrapping [`EngineError::Operation`] layers.
    pub fn root_cause(&self) -> &EngineError {
        match self {
            Self::Operation { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// `true` when in-memory state must be reloaded from durable files.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Unrecoverable { .. })
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Deserialization(err.to_string())
    }
}

impl PartialEq for EngineError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::NotFound(a), Self::NotFound(b)) => a == b,
            (Self::Deserialization(a), Self::Deserialization(b)) => a == b,
            (Self::ConcurrentOperation(a), Self::ConcurrentOperation(b)) => a == b,
            (Self::Cancelled(a), Self::Cancelled(b)) => a == b,
            (
                Self::Operation {
                    operation: a,
                    source: sa,
                },
                Self::Operation {
                    operation: b,
                    source: sb,
                },
            ) => a == b && sa == sb,
            (
                Self::Unrecoverable {
                    operation: a,
                    original: oa,
                    rollback: ra,
                    restore: sa,
                },
                Self::Unrecoverable {
                    operation: b,
                    original: ob,
                    rollback: rb,
                    restore: sb,
                },
            ) => a == b && oa == ob && ra == rb && sa == sb,
            (Self::InvalidRecord(a), Self::InvalidRecord(b)) => a == b,
            (Self::InvalidAmount(a), Self::InvalidAmount(b)) => a == b,
            (Self::InvalidConfig(a), Self::InvalidConfig(b)) => a == b,
            (Self::AccountInUse(a), Self::AccountInUse(b)) => a == b,
            (Self::UnsupportedValue(a), Self::UnsupportedValue(b)) => a == b,
            (Self::Storage(a), Self::Storage(b)) => a == b,
            (Self::Persistence(a), Self::Persistence(b)) => a == b,
            _ => false,
        }
    }
}
