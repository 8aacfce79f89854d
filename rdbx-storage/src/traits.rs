//! Collaborator traits.
//!
//! The relational store and the key/value service are opaque to this
//! workspace. Everything the query path and the coordinators need from them
//! is expressed here; concrete backends live in `rdbx-pg` and
//! [`MemoryStore`](crate::MemoryStore).

use async_trait::async_trait;
use rdbx_core::{RdbxResult, Value};
use std::time::Duration;

// ============================================================================
// RELATIONAL EXECUTOR
// ============================================================================

/// A forward-only cursor over an executed query.
#[async_trait]
pub trait RowCursor: Send {
    /// Result column names, in select order.
    fn columns(&self) -> &[String];

    /// Fetch the next row, `None` once the result set is exhausted.
    async fn next_row(&mut self) -> RdbxResult<Option<Vec<Value>>>;

    /// Release the cursor. Calling it twice is harmless.
    async fn close(&mut self) -> RdbxResult<()>;
}

/// An open SQL transaction.
///
/// `commit` and `rollback` consume the transaction, so a finished
/// transaction cannot be used again.
#[async_trait]
pub trait SqlTransaction: Send {
    async fn exec(&mut self, sql: &str, params: &[Value]) -> RdbxResult<u64>;

    async fn query(&mut self, sql: &str, params: &[Value]) -> RdbxResult<Box<dyn RowCursor>>;

    async fn commit(self: Box<Self>) -> RdbxResult<()>;

    async fn rollback(self: Box<Self>) -> RdbxResult<()>;
}

/// A relational store that can run statements and open transactions.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn begin(&self) -> RdbxResult<Box<dyn SqlTransaction>>;

    /// Run a statement, returning the number of affected rows.
    async fn exec(&self, sql: &str, params: &[Value]) -> RdbxResult<u64>;

    async fn query(&self, sql: &str, params: &[Value]) -> RdbxResult<Box<dyn RowCursor>>;

    /// Shut the executor down. Later calls fail with a connection error.
    async fn close(&self) -> RdbxResult<()>;
}

// ============================================================================
// KEY/VALUE SERVICE
// ============================================================================

/// Byte-oriented cache service.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Read a scalar entry. Missing and expired keys are `None`.
    async fn get(&self, key: &str) -> RdbxResult<Option<Vec<u8>>>;

    /// Store a scalar entry, replacing any previous value and its TTL.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> RdbxResult<()>;

    /// Push `value` onto the head of the list at `key`, returning the new
    /// list length.
    async fn append(&self, key: &str, value: &[u8]) -> RdbxResult<u64>;

    /// Every element of the list at `key`, head first.
    async fn get_list(&self, key: &str) -> RdbxResult<Vec<Vec<u8>>>;
}

/// Mutex primitive of the key/value service.
///
/// A lock is a key holding an owner token. Acquisition is an atomic
/// set-if-absent, release an atomic compare-and-delete.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Single attempt to store `token` under `key` if the key is free.
    async fn try_lock(&self, key: &str, token: &str, lease: Duration) -> RdbxResult<bool>;

    /// Delete `key` only if it still holds `token`. `Ok(false)` means the
    /// key holds some other value or is gone.
    async fn unlock(&self, key: &str, token: &str) -> RdbxResult<bool>;

    async fn get(&self, key: &str) -> RdbxResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> RdbxResult<()>;

    /// Delete `key`, returning how many keys were removed.
    async fn delete(&self, key: &str) -> RdbxResult<u64>;
}
