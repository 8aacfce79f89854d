//! [`SqlExecutor`] over a deadpool-postgres pool.
//!
//! Pool-level calls borrow a connection per statement. A transaction pins one
//! pooled connection from `BEGIN` until `COMMIT`/`ROLLBACK`. Result sets are
//! read in full and served through a [`VecCursor`].

use crate::convert::{
    as_params, begin_failed, bind, commit_failed, db_error, exec_failed, pool_error, query_failed,
    rollback_failed, row_values,
};
use crate::db::DbConfig;
use async_trait::async_trait;
use deadpool_postgres::{Object, Pool};
use rdbx_core::{RdbxResult, StorageError, Value};
use rdbx_storage::{RowCursor, SqlExecutor, SqlTransaction, VecCursor};
use tokio_postgres::Client;

/// PostgreSQL-backed executor.
#[derive(Clone)]
pub struct PgExecutor {
    pool: Pool,
}

impl PgExecutor {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Create an executor with a fresh pool built from `config`.
    pub fn from_config(config: &DbConfig) -> RdbxResult<Self> {
        Ok(Self::new(config.create_pool()?))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Get the current pool size for observability.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    async fn get_conn(&self) -> RdbxResult<Object> {
        self.pool.get().await.map_err(pool_error)
    }
}

#[async_trait]
impl SqlExecutor for PgExecutor {
    async fn begin(&self) -> RdbxResult<Box<dyn SqlTransaction>> {
        let conn = self.get_conn().await?;
        conn.batch_execute("BEGIN")
            .await
            .map_err(|e| db_error(e, begin_failed))?;
        tracing::debug!("Transaction started");
        Ok(Box::new(PgTransaction { conn: Some(conn) }))
    }

    async fn exec(&self, sql: &str, params: &[Value]) -> RdbxResult<u64> {
        let conn = self.get_conn().await?;
        execute(&conn, sql, params).await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> RdbxResult<Box<dyn RowCursor>> {
        let conn = self.get_conn().await?;
        query_cursor(&conn, sql, params).await
    }

    async fn close(&self) -> RdbxResult<()> {
        self.pool.close();
        tracing::info!("Connection pool closed");
        Ok(())
    }
}

// ============================================================================
// TRANSACTION
// ============================================================================

/// A transaction pinned to one pooled connection.
///
/// `conn` is `None` once the transaction has finished.
struct PgTransaction {
    conn: Option<Object>,
}

impl PgTransaction {
    fn conn(&self) -> RdbxResult<&Object> {
        self.conn.as_ref().ok_or_else(|| {
            StorageError::TransactionClosed {
                transaction_id: "pg".to_string(),
            }
            .into()
        })
    }

    async fn finish(&mut self, statement: &str, variant: fn(String) -> StorageError) -> RdbxResult<()> {
        let conn = self.conn.take().ok_or_else(|| StorageError::TransactionClosed {
            transaction_id: "pg".to_string(),
        })?;
        conn.batch_execute(statement)
            .await
            .map_err(|e| db_error(e, variant))
    }
}

#[async_trait]
impl SqlTransaction for PgTransaction {
    async fn exec(&mut self, sql: &str, params: &[Value]) -> RdbxResult<u64> {
        execute(self.conn()?, sql, params).await
    }

    async fn query(&mut self, sql: &str, params: &[Value]) -> RdbxResult<Box<dyn RowCursor>> {
        query_cursor(self.conn()?, sql, params).await
    }

    async fn commit(self: Box<Self>) -> RdbxResult<()> {
        let mut tx = self;
        tx.finish("COMMIT", commit_failed).await
    }

    async fn rollback(self: Box<Self>) -> RdbxResult<()> {
        let mut tx = self;
        tx.finish("ROLLBACK", rollback_failed).await
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        // An unfinished transaction must not go back to the pool.
        if let Some(conn) = self.conn.take() {
            tracing::warn!("Transaction dropped while open, discarding its connection");
            drop(Object::take(conn));
        }
    }
}

// ============================================================================
// STATEMENTS
// ============================================================================

async fn execute(client: &Client, sql: &str, params: &[Value]) -> RdbxResult<u64> {
    let args = bind(params);
    client
        .execute(sql, &as_params(&args))
        .await
        .map_err(|e| db_error(e, exec_failed))
}

async fn query_cursor(
    client: &Client,
    sql: &str,
    params: &[Value],
) -> RdbxResult<Box<dyn RowCursor>> {
    let statement = client
        .prepare(sql)
        .await
        .map_err(|e| db_error(e, query_failed))?;
    let columns = statement
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    let args = bind(params);
    let rows = client
        .query(&statement, &as_params(&args))
        .await
        .map_err(|e| db_error(e, query_failed))?;
    let rows = rows.iter().map(row_values).collect::<RdbxResult<Vec<_>>>()?;

    Ok(Box::new(VecCursor::new(columns, rows)))
}
