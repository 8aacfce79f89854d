//! Error types for rdbx operations

use crate::coerce::Coercion;
use std::time::Duration;
use thiserror::Error;

/// Why a single raw value could not become the requested field type.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValueError {
    #[error("expected {expected}, found {found}")]
    Mismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("NULL is not assignable to {expected}")]
    UnexpectedNull { expected: &'static str },

    #[error("malformed {expected} literal {literal:?}: {reason}")]
    Malformed {
        expected: &'static str,
        literal: String,
        reason: String,
    },

    #[error("{reason}")]
    Domain { reason: String },
}

/// Row mapping (input) errors. Always local, never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MapError {
    #[error("Invalid destination {destination}: {reason}")]
    InvalidDestination {
        destination: &'static str,
        reason: String,
    },

    #[error("No result column matches a tag of {destination}; result columns: {columns:?}")]
    UnmappedColumns {
        destination: &'static str,
        columns: Vec<String>,
    },

    #[error("Column {column} ({coercion:?} coercion): {source}")]
    Coercion {
        column: String,
        coercion: Coercion,
        #[source]
        source: ValueError,
    },
}

/// Relational executor errors. Propagated verbatim, never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Connection failed: {reason}")]
    Connection { reason: String },

    #[error("Begin failed: {reason}")]
    BeginFailed { reason: String },

    #[error("Query failed: {reason}")]
    QueryFailed { reason: String },

    #[error("Exec failed: {reason}")]
    ExecFailed { reason: String },

    #[error("Commit failed: {reason}")]
    CommitFailed { reason: String },

    #[error("Rollback failed: {reason}")]
    RollbackFailed { reason: String },

    #[error("Transaction {transaction_id} is already closed")]
    TransactionClosed { transaction_id: String },

    #[error("Cursor failed: {reason}")]
    CursorFailed { reason: String },
}

/// Cache service errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache read failed for {key}: {reason}")]
    ReadFailed { key: String, reason: String },

    #[error("Cache write failed for {key}: {reason}")]
    WriteFailed { key: String, reason: String },

    #[error("Row encoding failed: {reason}")]
    EncodeFailed { reason: String },

    #[error("Malformed row blob: {reason}")]
    MalformedBlob { reason: String },

    #[error("Cache backend lock poisoned")]
    LockPoisoned,
}

/// Distributed lock errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("Lock acquisition failed for {key}: {reason}")]
    AcquisitionFailed { key: String, reason: String },

    #[error("Lock {key} is not held by anyone")]
    NotHeld { key: String },

    #[error("Lock release abandoned for {key} after {attempts} attempts: {last_error}")]
    ReleaseAbandoned {
        key: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Lock service failure on {key}: {reason}")]
    Service { key: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Telemetry setup failed: {reason}")]
    Telemetry { reason: String },
}

/// Master error type for all rdbx errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RdbxError {
    #[error("Mapping error: {0}")]
    Map(#[from] MapError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("{operation} cancelled after {timeout:?}")]
    Cancelled {
        operation: &'static str,
        timeout: Duration,
    },
}

impl RdbxError {
    /// Whether the error came from a deadline rather than the collaborator.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RdbxError::Cancelled { .. })
    }
}

/// Result type alias for rdbx operations.
pub type RdbxResult<T> = Result<T, RdbxError>;

// =============================================================================
// TESTS
// =============================================================================
