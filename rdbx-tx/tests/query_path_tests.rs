//! Cache-coordinated query path, on the pool and inside a coordinated
//! transaction.

use proptest::prelude::*;
use rdbx_core::{decode_blob, impl_record, CacheError, Fingerprint, MapError, RdbxError};
use rdbx_storage::Dbx;
use rdbx_test_utils::{
    assertions, fixtures, generators, RecordingCache, RecordingExecutor, ResultSet,
    ScriptedLockService, Value,
};
use rdbx_tx::Transactioner;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default, Clone, PartialEq)]
struct Model {
    id: i64,
    name: String,
}

impl_record!(Model { id => "id", name => "name" });

const EXPANDED: &str = "SELECT id, name FROM model";

fn setup(executor: RecordingExecutor, cache: RecordingCache) -> (Dbx, Arc<RecordingCache>) {
    let cache = Arc::new(cache);
    let dbx = Dbx::new(Arc::new(executor), cache.clone(), fixtures::test_config());
    (dbx, cache)
}

#[tokio::test]
async fn test_select_star_maps_rows_and_writes_one_blob() {
    let executor = RecordingExecutor::new().with_result(EXPANDED, fixtures::two_rows());
    let (dbx, cache) = setup(executor.clone(), RecordingCache::new());

    let mut models: Vec<Model> = Vec::new();
    dbx.queryx("SELECT * FROM model", &mut models, &[]).await.unwrap();

    assert_eq!(
        models,
        vec![
            Model { id: 1, name: "a".into() },
            Model { id: 2, name: "b".into() },
        ]
    );
    assert_eq!(executor.statements(), vec![EXPANDED.to_string()]);

    let writes = cache.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].key, Fingerprint::of(EXPANDED).to_string());
    assert_eq!(writes[0].ttl, Duration::from_secs(1800));
    assert_eq!(
        decode_blob(&writes[0].value).unwrap(),
        vec![vec!["1".to_string(), "a".to_string()], vec!["2".to_string(), "b".to_string()]]
    );
}

#[tokio::test]
async fn test_rerun_replaces_blob_without_appending() {
    let executor = RecordingExecutor::new().with_result(EXPANDED, fixtures::two_rows());
    let (dbx, cache) = setup(executor, RecordingCache::new());

    for _ in 0..2 {
        let mut models: Vec<Model> = Vec::new();
        dbx.queryx(EXPANDED, &mut models, &[]).await.unwrap();
    }

    let rows = dbx.query(EXPANDED, &[]).await.unwrap();
    assert_eq!(rows.previous_blob(), Some(&b"1,a;2,b;"[..]));
    rows.abandon().await;

    assert_eq!(cache.writes().len(), 2);
    assert_eq!(cache.reads().len(), 3);
    let stats = dbx.stats();
    assert_eq!((stats.misses, stats.hits, stats.writes), (1, 2, 2));
}

#[tokio::test]
async fn test_cache_read_failure_is_not_fatal() {
    let executor = RecordingExecutor::new().with_result(EXPANDED, fixtures::two_rows());
    let cache = RecordingCache::new().fail_reads(
        CacheError::ReadFailed {
            key: "any".to_string(),
            reason: "timeout".to_string(),
        }
        .into(),
    );
    let (dbx, cache) = setup(executor, cache);

    let mut models: Vec<Model> = Vec::new();
    dbx.queryx(EXPANDED, &mut models, &[]).await.unwrap();

    assert_eq!(models.len(), 2);
    assert_eq!(cache.writes().len(), 1);
    assert_eq!(dbx.stats().read_errors, 1);
}

#[tokio::test]
async fn test_cache_write_failure_surfaces_after_mapping() {
    let write_failure: RdbxError = CacheError::WriteFailed {
        key: "any".to_string(),
        reason: "read only replica".to_string(),
    }
    .into();
    let executor = RecordingExecutor::new().with_result(EXPANDED, fixtures::two_rows());
    let (dbx, _cache) = setup(executor, RecordingCache::new().fail_writes(write_failure.clone()));

    let mut models: Vec<Model> = Vec::new();
    let result = dbx.queryx(EXPANDED, &mut models, &[]).await;

    assert_eq!(result, Err(write_failure));
    assert_eq!(models.len(), 2);
    assert_eq!(dbx.stats().write_errors, 1);
}

#[tokio::test]
async fn test_coercion_failure_aborts_without_caching() {
    let bad = ResultSet::new(&["id", "name"], vec![vec![Value::Text("x1".into()), Value::Null]]);
    let executor = RecordingExecutor::new().with_result(EXPANDED, bad);
    let (dbx, cache) = setup(executor, RecordingCache::new());

    let mut models: Vec<Model> = Vec::new();
    let result = dbx.queryx(EXPANDED, &mut models, &[]).await;

    assert!(matches!(result, Err(RdbxError::Map(MapError::Coercion { .. }))));
    assert!(cache.writes().is_empty());
}

#[tokio::test]
async fn test_unrelated_result_columns_are_unmapped() {
    let other = ResultSet::new(&["total"], vec![vec![Value::Int(9)]]);
    let executor = RecordingExecutor::new().with_result("SELECT total FROM model", other);
    let (dbx, cache) = setup(executor, RecordingCache::new());

    let mut models: Vec<Model> = Vec::new();
    let result = dbx.queryx("SELECT total FROM model", &mut models, &[]).await;

    assert!(matches!(result, Err(RdbxError::Map(MapError::UnmappedColumns { .. }))));
    assert!(cache.writes().is_empty());
}

#[tokio::test]
async fn test_queryx_inside_locked_transaction() {
    let executor = RecordingExecutor::new().with_result(EXPANDED, fixtures::two_rows());
    let (dbx, cache) = setup(executor.clone(), RecordingCache::new());
    let transactioner = Transactioner::new(
        Arc::new(executor.clone()),
        Arc::new(ScriptedLockService::new()),
        fixtures::test_config(),
    );

    let models = transactioner
        .enable_tx()
        .with_lock("model:refresh", rdbx_core::LockOptions::new().with_auto_release(true))
        .exec(|handle, _lock| {
            let dbx = dbx.clone();
            async move {
                let mut models: Vec<Model> = Vec::new();
                dbx.with_tx(&handle).queryx("SELECT * FROM model", &mut models, &[]).await?;
                Ok::<_, RdbxError>(models)
            }
        })
        .await
        .unwrap();

    assert_eq!(models.len(), 2);
    assert_eq!(executor.calls().commits, 1);
    assert_eq!(cache.written_keys(), vec![Fingerprint::of(EXPANDED).to_string()]);
}

#[tokio::test]
async fn test_query_failure_inside_transaction_rolls_back_without_caching() {
    let executor =
        RecordingExecutor::new().fail_queries(fixtures::storage_failure("relation does not exist"));
    let (dbx, cache) = setup(executor.clone(), RecordingCache::new());
    let transactioner = Transactioner::new(
        Arc::new(executor.clone()),
        Arc::new(ScriptedLockService::new()),
        fixtures::test_config(),
    );

    let result = transactioner
        .enable_tx()
        .exec(|handle| {
            let dbx = dbx.clone();
            async move {
                let mut models: Vec<Model> = Vec::new();
                dbx.with_tx(&handle).queryx("SELECT * FROM model", &mut models, &[]).await?;
                Ok::<_, RdbxError>(models)
            }
        })
        .await;

    assertions::assert_storage_error(&result);
    let calls = executor.calls();
    assert_eq!((calls.begins, calls.commits, calls.rollbacks), (1, 0, 1));
    assert!(cache.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stalled_query_is_cancelled() {
    let executor = RecordingExecutor::new().stall_queries();
    let cache = Arc::new(RecordingCache::new());
    let config = fixtures::test_config().with_call_timeout(Some(Duration::from_secs(2)));
    let dbx = Dbx::new(Arc::new(executor), cache.clone(), config);

    let mut models: Vec<Model> = Vec::new();
    let result = dbx.queryx(EXPANDED, &mut models, &[]).await;

    assertions::assert_cancelled(&result, "query");
    assert!(cache.writes().is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_cached_blob_holds_the_fetched_rows(result in generators::arb_result_set(3, 6)) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let executor = RecordingExecutor::new().with_default_result(result.clone());
        let (dbx, cache) = setup(executor, RecordingCache::new());

        let fetched = runtime
            .block_on(async {
                let mut rows = dbx.query("SELECT a, b, c FROM t", &[]).await?;
                let mut fetched = Vec::new();
                while let Some(row) = rows.next().await? {
                    fetched.push(row);
                }
                rows.close().await?;
                Ok::<_, RdbxError>(fetched)
            })
            .unwrap();
        prop_assert_eq!(&fetched, &result.rows);

        let writes = cache.writes();
        prop_assert_eq!(writes.len(), 1);
        let expected: Vec<Vec<String>> = result
            .rows
            .iter()
            .map(|row| row.iter().map(|v| v.to_string()).collect())
            .collect();
        prop_assert_eq!(decode_blob(&writes[0].value).unwrap(), expected);
    }
}
