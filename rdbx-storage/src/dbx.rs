//! Query surface: row mapping over cache-coordinated cursors.

use crate::cursor::CachedRows;
use crate::deadline::with_deadline;
use crate::handle::TransactionHandle;
use crate::stats::{CacheCounters, QueryCacheStats};
use crate::traits::{CacheStore, RowCursor, SqlExecutor};
use rdbx_core::{expand_wildcard, Destination, Fingerprint, RdbxConfig, RdbxResult, Value};
use std::sync::Arc;

/// Where a statement runs.
#[derive(Clone, Copy)]
enum Target<'a> {
    Pool,
    Tx(&'a TransactionHandle),
}

/// Data-access entry point.
///
/// Holds the relational executor and the cache service side by side.
/// Statements run on the pool unless routed through a transaction with
/// [`with_tx`](Self::with_tx).
#[derive(Clone)]
pub struct Dbx {
    executor: Arc<dyn SqlExecutor>,
    cache: Arc<dyn CacheStore>,
    config: RdbxConfig,
    counters: Arc<CacheCounters>,
}

impl Dbx {
    pub fn new(executor: Arc<dyn SqlExecutor>, cache: Arc<dyn CacheStore>, config: RdbxConfig) -> Self {
        Self {
            executor,
            cache,
            config,
            counters: Arc::new(CacheCounters::new()),
        }
    }

    pub fn executor(&self) -> &Arc<dyn SqlExecutor> {
        &self.executor
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    pub fn config(&self) -> &RdbxConfig {
        &self.config
    }

    pub fn stats(&self) -> QueryCacheStats {
        self.counters.snapshot()
    }

    /// Route statements through an open transaction.
    pub fn with_tx<'a>(&'a self, handle: &'a TransactionHandle) -> TxDbx<'a> {
        TxDbx { dbx: self, handle }
    }

    /// Run `sql` and map every row onto `dest`.
    ///
    /// A standalone `*` selector is replaced by the destination's tagged
    /// columns before the query runs; the cache fingerprint is taken from
    /// the expanded text.
    pub async fn queryx<D>(&self, sql: &str, dest: &mut D, params: &[Value]) -> RdbxResult<()>
    where
        D: Destination + Send,
    {
        self.run_queryx(Target::Pool, sql, dest, params).await
    }

    /// Run `sql` and hand back the cache-coordinated cursor.
    pub async fn query(&self, sql: &str, params: &[Value]) -> RdbxResult<CachedRows> {
        self.run_query(Target::Pool, sql, params).await
    }

    /// Fetch at most one row. Bypasses the cache.
    pub async fn query_row(&self, sql: &str, params: &[Value]) -> RdbxResult<Option<Vec<Value>>> {
        self.run_query_row(Target::Pool, sql, params).await
    }

    pub async fn exec(&self, sql: &str, params: &[Value]) -> RdbxResult<u64> {
        self.run_exec(Target::Pool, sql, params).await
    }

    /// Shut the executor down.
    pub async fn close(&self) -> RdbxResult<()> {
        with_deadline("close", self.config.call_timeout, self.executor.close()).await
    }

    // ------------------------------------------------------------------------
    // Shared paths
    // ------------------------------------------------------------------------

    async fn run_queryx<D>(
        &self,
        target: Target<'_>,
        sql: &str,
        dest: &mut D,
        params: &[Value],
    ) -> RdbxResult<()>
    where
        D: Destination + Send,
    {
        D::validate()?;
        let expanded = expand_wildcard(sql, D::columns());
        let mut rows = self.run_query(target, &expanded, params).await?;

        match map_rows(&mut rows, dest).await {
            Ok(()) => rows.close().await,
            Err(e) => {
                rows.abandon().await;
                Err(e)
            }
        }
    }

    async fn run_query(&self, target: Target<'_>, sql: &str, params: &[Value]) -> RdbxResult<CachedRows> {
        let fingerprint = Fingerprint::of(sql);
        let previous = self.read_previous(&fingerprint).await;
        let cursor = self.open_cursor(target, sql, params).await?;

        Ok(CachedRows::new(
            cursor,
            fingerprint,
            self.cache.clone(),
            self.counters.clone(),
            previous,
            self.config.cache_ttl,
            self.config.call_timeout,
        ))
    }

    async fn run_query_row(
        &self,
        target: Target<'_>,
        sql: &str,
        params: &[Value],
    ) -> RdbxResult<Option<Vec<Value>>> {
        let timeout = self.config.call_timeout;
        let mut cursor = self.open_cursor(target, sql, params).await?;
        let row = with_deadline("cursor fetch", timeout, cursor.next_row()).await;
        let closed = with_deadline("cursor close", timeout, cursor.close()).await;
        let row = row?;
        closed?;
        Ok(row)
    }

    async fn run_exec(&self, target: Target<'_>, sql: &str, params: &[Value]) -> RdbxResult<u64> {
        match target {
            Target::Pool => {
                with_deadline("exec", self.config.call_timeout, self.executor.exec(sql, params)).await
            }
            Target::Tx(handle) => handle.exec(sql, params).await,
        }
    }

    async fn open_cursor(
        &self,
        target: Target<'_>,
        sql: &str,
        params: &[Value],
    ) -> RdbxResult<Box<dyn RowCursor>> {
        match target {
            Target::Pool => {
                with_deadline("query", self.config.call_timeout, self.executor.query(sql, params)).await
            }
            Target::Tx(handle) => handle.query(sql, params).await,
        }
    }

    /// Read the blob left by a previous run. Failures never fail the query.
    async fn read_previous(&self, fingerprint: &Fingerprint) -> Option<Vec<u8>> {
        let read = with_deadline(
            "cache get",
            self.config.call_timeout,
            self.cache.get(fingerprint.as_str()),
        )
        .await;

        match read {
            Ok(Some(blob)) => {
                CacheCounters::incr(&self.counters.hits);
                tracing::debug!(fingerprint = %fingerprint, bytes = blob.len(), "Cache hit");
                Some(blob)
            }
            Ok(None) => {
                CacheCounters::incr(&self.counters.misses);
                tracing::debug!(fingerprint = %fingerprint, "Cache miss");
                None
            }
            Err(e) => {
                CacheCounters::incr(&self.counters.read_errors);
                tracing::warn!(error = %e, fingerprint = %fingerprint, "Cache read failed");
                None
            }
        }
    }
}

async fn map_rows<D: Destination + Send>(rows: &mut CachedRows, dest: &mut D) -> RdbxResult<()> {
    D::check_columns(rows.columns())?;
    let columns = rows.columns().to_vec();
    while let Some(row) = rows.next().await? {
        dest.map_row(&columns, row)?;
    }
    Ok(())
}

/// [`Dbx`] operations routed through one transaction.
#[derive(Clone, Copy)]
pub struct TxDbx<'a> {
    dbx: &'a Dbx,
    handle: &'a TransactionHandle,
}

impl<'a> TxDbx<'a> {
    pub fn handle(&self) -> &'a TransactionHandle {
        self.handle
    }

    pub async fn queryx<D>(&self, sql: &str, dest: &mut D, params: &[Value]) -> RdbxResult<()>
    where
        D: Destination + Send,
    {
        self.dbx
            .run_queryx(Target::Tx(self.handle), sql, dest, params)
            .await
    }

    pub async fn query(&self, sql: &str, params: &[Value]) -> RdbxResult<CachedRows> {
        self.dbx.run_query(Target::Tx(self.handle), sql, params).await
    }

    pub async fn query_row(&self, sql: &str, params: &[Value]) -> RdbxResult<Option<Vec<Value>>> {
        self.dbx
            .run_query_row(Target::Tx(self.handle), sql, params)
            .await
    }

    pub async fn exec(&self, sql: &str, params: &[Value]) -> RdbxResult<u64> {
        self.dbx.run_exec(Target::Tx(self.handle), sql, params).await
    }
}
