//! RDBX Test Utilities
//!
//! Shared test infrastructure for the RDBX workspace:
//! - Recording and scripted doubles for the executor, cache and lock service
//! - Proptest generators for driver values and result sets
//! - Fixtures for common scenarios
//! - Assertions for RDBX error variants

pub use rdbx_core::{
    CacheError, LockError, LockOptions, RdbxConfig, RdbxError, RdbxResult, RetryConfig,
    StorageError, Value,
};
pub use rdbx_storage::{
    CacheStore, LockService, MemoryStore, RowCursor, SqlExecutor, SqlTransaction, VecCursor,
};

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// RECORDING EXECUTOR
// ============================================================================

/// A canned result set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    pub fn new(columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        }
    }

    fn cursor(&self) -> VecCursor {
        VecCursor::new(self.columns.clone(), self.rows.clone())
    }
}

/// Call counts observed by a [`RecordingExecutor`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorCalls {
    pub begins: u32,
    pub commits: u32,
    pub rollbacks: u32,
    pub execs: u32,
    pub queries: u32,
}

#[derive(Default)]
struct Failures {
    begin: Option<RdbxError>,
    commit: Option<RdbxError>,
    rollback: Option<RdbxError>,
    query: Option<RdbxError>,
    exec: Option<RdbxError>,
    stall_queries: bool,
}

#[derive(Default)]
struct ExecutorShared {
    calls: Mutex<ExecutorCalls>,
    statements: Mutex<Vec<String>>,
    results: Mutex<HashMap<String, ResultSet>>,
    default_result: Mutex<ResultSet>,
    failures: Mutex<Failures>,
}

impl ExecutorShared {
    fn record(&self, sql: &str) {
        guard(&self.statements).push(sql.to_string());
    }

    async fn query(&self, sql: &str) -> RdbxResult<Box<dyn RowCursor>> {
        guard(&self.calls).queries += 1;
        self.record(sql);

        let (failure, stall) = {
            let failures = guard(&self.failures);
            (failures.query.clone(), failures.stall_queries)
        };
        if stall {
            return std::future::pending().await;
        }
        if let Some(e) = failure {
            return Err(e);
        }

        let canned = guard(&self.results).get(sql).cloned();
        let result = canned.unwrap_or_else(|| guard(&self.default_result).clone());
        Ok(Box::new(result.cursor()))
    }

    fn exec(&self, sql: &str) -> RdbxResult<u64> {
        guard(&self.calls).execs += 1;
        self.record(sql);
        match guard(&self.failures).exec.clone() {
            Some(e) => Err(e),
            None => Ok(1),
        }
    }
}

/// [`SqlExecutor`] double that records every statement and counts
/// transaction lifecycle calls.
#[derive(Clone, Default)]
pub struct RecordingExecutor {
    shared: Arc<ExecutorShared>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `sql` with a canned result set.
    pub fn with_result(self, sql: &str, result: ResultSet) -> Self {
        guard(&self.shared.results).insert(sql.to_string(), result);
        self
    }

    /// Answer every query without a canned result with `result`.
    pub fn with_default_result(self, result: ResultSet) -> Self {
        *guard(&self.shared.default_result) = result;
        self
    }

    pub fn fail_begin(self, error: RdbxError) -> Self {
        guard(&self.shared.failures).begin = Some(error);
        self
    }

    pub fn fail_commit(self, error: RdbxError) -> Self {
        guard(&self.shared.failures).commit = Some(error);
        self
    }

    pub fn fail_rollback(self, error: RdbxError) -> Self {
        guard(&self.shared.failures).rollback = Some(error);
        self
    }

    pub fn fail_queries(self, error: RdbxError) -> Self {
        guard(&self.shared.failures).query = Some(error);
        self
    }

    pub fn fail_execs(self, error: RdbxError) -> Self {
        guard(&self.shared.failures).exec = Some(error);
        self
    }

    /// Make every query hang until dropped.
    pub fn stall_queries(self) -> Self {
        guard(&self.shared.failures).stall_queries = true;
        self
    }

    pub fn calls(&self) -> ExecutorCalls {
        *guard(&self.shared.calls)
    }

    /// SQL of every `exec` and `query`, pool and transaction alike.
    pub fn statements(&self) -> Vec<String> {
        guard(&self.shared.statements).clone()
    }
}

#[async_trait]
impl SqlExecutor for RecordingExecutor {
    async fn begin(&self) -> RdbxResult<Box<dyn SqlTransaction>> {
        guard(&self.shared.calls).begins += 1;
        if let Some(e) = guard(&self.shared.failures).begin.clone() {
            return Err(e);
        }
        Ok(Box::new(RecordingTx {
            shared: self.shared.clone(),
        }))
    }

    async fn exec(&self, sql: &str, _params: &[Value]) -> RdbxResult<u64> {
        self.shared.exec(sql)
    }

    async fn query(&self, sql: &str, _params: &[Value]) -> RdbxResult<Box<dyn RowCursor>> {
        self.shared.query(sql).await
    }

    async fn close(&self) -> RdbxResult<()> {
        Ok(())
    }
}

struct RecordingTx {
    shared: Arc<ExecutorShared>,
}

#[async_trait]
impl SqlTransaction for RecordingTx {
    async fn exec(&mut self, sql: &str, _params: &[Value]) -> RdbxResult<u64> {
        self.shared.exec(sql)
    }

    async fn query(&mut self, sql: &str, _params: &[Value]) -> RdbxResult<Box<dyn RowCursor>> {
        self.shared.query(sql).await
    }

    async fn commit(self: Box<Self>) -> RdbxResult<()> {
        guard(&self.shared.calls).commits += 1;
        match guard(&self.shared.failures).commit.clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn rollback(self: Box<Self>) -> RdbxResult<()> {
        guard(&self.shared.calls).rollbacks += 1;
        match guard(&self.shared.failures).rollback.clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// ============================================================================
// RECORDING CACHE
// ============================================================================

/// One recorded `set` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheWrite {
    pub key: String,
    pub value: Vec<u8>,
    pub ttl: Duration,
}

/// [`CacheStore`] double over a [`MemoryStore`] that records reads and
/// writes and can be told to fail.
#[derive(Default)]
pub struct RecordingCache {
    store: MemoryStore,
    reads: Mutex<Vec<String>>,
    writes: Mutex<Vec<CacheWrite>>,
    fail_get: Mutex<Option<RdbxError>>,
    fail_set: Mutex<Option<RdbxError>>,
}

impl RecordingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_reads(self, error: RdbxError) -> Self {
        *guard(&self.fail_get) = Some(error);
        self
    }

    pub fn fail_writes(self, error: RdbxError) -> Self {
        *guard(&self.fail_set) = Some(error);
        self
    }

    pub fn reads(&self) -> Vec<String> {
        guard(&self.reads).clone()
    }

    pub fn writes(&self) -> Vec<CacheWrite> {
        guard(&self.writes).clone()
    }

    /// Keys of every `set`, in call order.
    pub fn written_keys(&self) -> Vec<String> {
        self.writes().into_iter().map(|w| w.key).collect()
    }
}

#[async_trait]
impl CacheStore for RecordingCache {
    async fn get(&self, key: &str) -> RdbxResult<Option<Vec<u8>>> {
        guard(&self.reads).push(key.to_string());
        if let Some(e) = guard(&self.fail_get).clone() {
            return Err(e);
        }
        CacheStore::get(&self.store, key).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> RdbxResult<()> {
        guard(&self.writes).push(CacheWrite {
            key: key.to_string(),
            value: value.to_vec(),
            ttl,
        });
        if let Some(e) = guard(&self.fail_set).clone() {
            return Err(e);
        }
        CacheStore::set(&self.store, key, value, ttl).await
    }

    async fn append(&self, key: &str, value: &[u8]) -> RdbxResult<u64> {
        self.store.append(key, value).await
    }

    async fn get_list(&self, key: &str) -> RdbxResult<Vec<Vec<u8>>> {
        self.store.get_list(key).await
    }
}

// ============================================================================
// SCRIPTED LOCK SERVICE
// ============================================================================

/// Scripted outcome for the next `unlock` call.
#[derive(Debug, Clone, PartialEq)]
pub enum UnlockStep {
    /// Report that the token is not the current holder.
    Reject,
    /// Fail with the given error.
    Fail(RdbxError),
    /// Hang until dropped.
    Stall,
}

/// Call counts observed by a [`ScriptedLockService`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockCalls {
    pub try_locks: u32,
    pub unlocks: u32,
    pub gets: u32,
    pub sets: Vec<String>,
    pub deletes: Vec<String>,
}

/// [`LockService`] double over a [`MemoryStore`].
///
/// Unlock outcomes can be scripted one call at a time; once the script runs
/// out, calls reach the real store.
#[derive(Default)]
pub struct ScriptedLockService {
    store: MemoryStore,
    script: Mutex<VecDeque<UnlockStep>>,
    reject_all: Mutex<bool>,
    fail_try_lock: Mutex<Option<RdbxError>>,
    calls: Mutex<LockCalls>,
}

impl ScriptedLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for the next `unlock` calls.
    pub fn script_unlocks(self, steps: impl IntoIterator<Item = UnlockStep>) -> Self {
        guard(&self.script).extend(steps);
        self
    }

    /// Reject every `unlock` call.
    pub fn reject_all_unlocks(self) -> Self {
        *guard(&self.reject_all) = true;
        self
    }

    pub fn fail_try_lock(self, error: RdbxError) -> Self {
        *guard(&self.fail_try_lock) = Some(error);
        self
    }

    /// Take `key` on behalf of another process.
    pub async fn hold_elsewhere(&self, key: &str, lease: Duration) -> RdbxResult<bool> {
        self.store.try_lock(key, "held-elsewhere", lease).await
    }

    pub fn calls(&self) -> LockCalls {
        guard(&self.calls).clone()
    }

    pub fn deletes_of(&self, key: &str) -> usize {
        guard(&self.calls).deletes.iter().filter(|k| *k == key).count()
    }

    /// Direct access to the backing store.
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }
}

#[async_trait]
impl LockService for ScriptedLockService {
    async fn try_lock(&self, key: &str, token: &str, lease: Duration) -> RdbxResult<bool> {
        guard(&self.calls).try_locks += 1;
        if let Some(e) = guard(&self.fail_try_lock).clone() {
            return Err(e);
        }
        self.store.try_lock(key, token, lease).await
    }

    async fn unlock(&self, key: &str, token: &str) -> RdbxResult<bool> {
        guard(&self.calls).unlocks += 1;
        let step = if *guard(&self.reject_all) {
            Some(UnlockStep::Reject)
        } else {
            guard(&self.script).pop_front()
        };

        match step {
            Some(UnlockStep::Reject) => Ok(false),
            Some(UnlockStep::Fail(e)) => Err(e),
            Some(UnlockStep::Stall) => std::future::pending().await,
            None => self.store.unlock(key, token).await,
        }
    }

    async fn get(&self, key: &str) -> RdbxResult<Option<String>> {
        guard(&self.calls).gets += 1;
        LockService::get(&self.store, key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> RdbxResult<()> {
        guard(&self.calls).sets.push(key.to_string());
        LockService::set(&self.store, key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> RdbxResult<u64> {
        guard(&self.calls).deletes.push(key.to_string());
        self.store.delete(key).await
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for driver values and result sets.

    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use proptest::prelude::*;
    use uuid::Uuid;

    pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
        any::<[u8; 16]>().prop_map(Uuid::from_bytes)
    }

    /// Timestamps between 2020 and 2030, whole seconds.
    pub fn arb_timestamp() -> impl Strategy<Value = DateTime<Utc>> {
        (1577836800i64..1893456000i64).prop_map(|secs| {
            Utc.timestamp_opt(secs, 0)
                .single()
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        })
    }

    /// Any non-null driver value.
    pub fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            (-1.0e9f64..1.0e9f64).prop_map(Value::Float),
            ".{0,24}".prop_map(Value::Text),
            prop::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
            arb_uuid().prop_map(Value::Uuid),
            arb_timestamp().prop_map(Value::Timestamp),
        ]
    }

    /// Driver value, NULL included.
    pub fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![1 => Just(Value::Null), 6 => arb_scalar()]
    }

    /// SQL identifier suitable for a column or table name.
    pub fn arb_identifier() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_]{0,15}"
    }

    /// A result set with `width` columns and up to `max_rows` rows.
    pub fn arb_result_set(width: usize, max_rows: usize) -> impl Strategy<Value = ResultSet> {
        let columns = prop::collection::hash_set(arb_identifier(), width);
        let rows = prop::collection::vec(prop::collection::vec(arb_value(), width), 0..=max_rows);
        (columns, rows).prop_map(|(columns, rows)| ResultSet {
            columns: columns.into_iter().collect(),
            rows,
        })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Ready-made configurations and result sets.

    use super::*;

    /// Retry policy fast enough for tests.
    pub fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            backoff_multiplier: 2.0,
        }
    }

    /// Default configuration with a fast unlock retry and no deadline.
    pub fn test_config() -> RdbxConfig {
        RdbxConfig::default()
            .with_unlock_retry(fast_retry(5))
            .with_call_timeout(None)
    }

    /// `(id, name)` rows `(1, "a")` and `(2, "b")`.
    pub fn two_rows() -> ResultSet {
        ResultSet::new(
            &["id", "name"],
            vec![
                vec![Value::Int(1), Value::Text("a".into())],
                vec![Value::Int(2), Value::Text("b".into())],
            ],
        )
    }

    pub fn storage_failure(reason: &str) -> RdbxError {
        StorageError::QueryFailed {
            reason: reason.to_string(),
        }
        .into()
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for RDBX error variants.

    use super::*;

    #[track_caller]
    pub fn assert_acquisition_failed<T: std::fmt::Debug>(result: &Result<T, RdbxError>) {
        match result {
            Err(RdbxError::Lock(LockError::AcquisitionFailed { .. })) => {}
            other => panic!("Expected AcquisitionFailed, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_release_abandoned<T: std::fmt::Debug>(
        result: &Result<T, RdbxError>,
        expected_attempts: u32,
    ) {
        match result {
            Err(RdbxError::Lock(LockError::ReleaseAbandoned { attempts, .. })) => {
                assert_eq!(*attempts, expected_attempts, "Wrong attempt count");
            }
            other => panic!("Expected ReleaseAbandoned, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_cancelled<T: std::fmt::Debug>(result: &Result<T, RdbxError>, operation: &str) {
        match result {
            Err(RdbxError::Cancelled { operation: op, .. }) => {
                assert_eq!(*op, operation, "Wrong cancelled operation");
            }
            other => panic!("Expected Cancelled, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_storage_error<T: std::fmt::Debug>(result: &Result<T, RdbxError>) {
        match result {
            Err(RdbxError::Storage(_)) => {}
            other => panic!("Expected Storage error, got: {:?}", other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_executor_counts_transaction_calls() {
        let executor = RecordingExecutor::new();
        let tx = executor.begin().await.unwrap();
        tx.rollback().await.unwrap();

        let calls = executor.calls();
        assert_eq!(calls.begins, 1);
        assert_eq!(calls.rollbacks, 1);
        assert_eq!(calls.commits, 0);
    }

    #[tokio::test]
    async fn test_executor_canned_results() {
        let executor = RecordingExecutor::new().with_result("SELECT id, name FROM t", fixtures::two_rows());
        let mut cursor = executor.query("SELECT id, name FROM t", &[]).await.unwrap();
        assert_eq!(cursor.columns(), &["id".to_string(), "name".to_string()]);
        assert!(cursor.next_row().await.unwrap().is_some());

        let mut empty = executor.query("SELECT 1", &[]).await.unwrap();
        assert_eq!(empty.next_row().await.unwrap(), None);
        assert_eq!(executor.statements().len(), 2);
    }

    #[tokio::test]
    async fn test_scripted_unlock_then_real_store() {
        let locks = ScriptedLockService::new().script_unlocks([UnlockStep::Reject]);
        assert!(locks.try_lock("k", "t", Duration::from_secs(5)).await.unwrap());
        assert!(!locks.unlock("k", "t").await.unwrap());
        assert!(locks.unlock("k", "t").await.unwrap());
        assert_eq!(locks.calls().unlocks, 2);
    }

    #[tokio::test]
    async fn test_recording_cache_failures() {
        let cache = RecordingCache::new().fail_writes(fixtures::storage_failure("down"));
        assert!(cache.set("k", b"v", Duration::from_secs(1)).await.is_err());
        assert_eq!(cache.written_keys(), vec!["k".to_string()]);
        assert_eq!(CacheStore::get(&cache, "k").await.unwrap(), None);
    }

    proptest! {
        #[test]
        fn prop_result_sets_are_rectangular(set in generators::arb_result_set(3, 5)) {
            prop_assert_eq!(set.columns.len(), 3);
            prop_assert!(set.rows.iter().all(|row| row.len() == 3));
        }
    }
}
