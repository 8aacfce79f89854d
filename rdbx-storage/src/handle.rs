//! Explicit transaction handle.

use crate::deadline::with_deadline;
use crate::traits::{RowCursor, SqlTransaction};
use rdbx_core::{RdbxError, RdbxResult, StorageError, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Shared handle on one open SQL transaction.
///
/// Clones refer to the same transaction. The handle is what an action
/// receives from a coordinator and what nested coordinators join. Once
/// committed or rolled back, every clone fails with
/// [`StorageError::TransactionClosed`].
#[derive(Clone)]
pub struct TransactionHandle {
    id: Uuid,
    timeout: Option<Duration>,
    inner: Arc<Mutex<Option<Box<dyn SqlTransaction>>>>,
}

impl TransactionHandle {
    pub fn new(tx: Box<dyn SqlTransaction>, timeout: Option<Duration>) -> Self {
        Self {
            id: Uuid::now_v7(),
            timeout,
            inner: Arc::new(Mutex::new(Some(tx))),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether the transaction is still open.
    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    /// Whether both handles refer to the same transaction.
    pub fn same_transaction(&self, other: &TransactionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub async fn exec(&self, sql: &str, params: &[Value]) -> RdbxResult<u64> {
        let mut guard = self.inner.lock().await;
        let tx = guard.as_mut().ok_or_else(|| self.closed())?;
        with_deadline("transaction exec", self.timeout, tx.exec(sql, params)).await
    }

    pub async fn query(&self, sql: &str, params: &[Value]) -> RdbxResult<Box<dyn RowCursor>> {
        let mut guard = self.inner.lock().await;
        let tx = guard.as_mut().ok_or_else(|| self.closed())?;
        with_deadline("transaction query", self.timeout, tx.query(sql, params)).await
    }

    /// Commit the transaction. Normally driven by the owning coordinator.
    pub async fn commit(&self) -> RdbxResult<()> {
        let tx = self.take().await?;
        with_deadline("commit", self.timeout, tx.commit()).await
    }

    /// Roll the transaction back. Normally driven by the owning coordinator.
    pub async fn rollback(&self) -> RdbxResult<()> {
        let tx = self.take().await?;
        with_deadline("rollback", self.timeout, tx.rollback()).await
    }

    async fn take(&self) -> RdbxResult<Box<dyn SqlTransaction>> {
        self.inner.lock().await.take().ok_or_else(|| self.closed())
    }

    fn closed(&self) -> RdbxError {
        StorageError::TransactionClosed {
            transaction_id: self.id.to_string(),
        }
        .into()
    }
}

impl fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::VecCursor;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Calls {
        execs: AtomicU32,
        commits: AtomicU32,
        rollbacks: AtomicU32,
    }

    struct MockTx(Arc<Calls>);

    #[async_trait]
    impl SqlTransaction for MockTx {
        async fn exec(&mut self, _sql: &str, _params: &[Value]) -> RdbxResult<u64> {
            self.0.execs.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        }

        async fn query(&mut self, _sql: &str, _params: &[Value]) -> RdbxResult<Box<dyn RowCursor>> {
            Ok(Box::new(VecCursor::empty()))
        }

        async fn commit(self: Box<Self>) -> RdbxResult<()> {
            self.0.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> RdbxResult<()> {
            self.0.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_clones_share_the_transaction() {
        let calls = Arc::new(Calls::default());
        let handle = TransactionHandle::new(Box::new(MockTx(calls.clone())), None);
        let joined = handle.clone();

        assert!(handle.same_transaction(&joined));
        joined.exec("UPDATE t SET x = 1", &[]).await.unwrap();
        handle.commit().await.unwrap();

        assert_eq!(calls.execs.load(Ordering::SeqCst), 1);
        assert_eq!(calls.commits.load(Ordering::SeqCst), 1);
        assert!(!joined.is_open().await);
    }

    #[tokio::test]
    async fn test_use_after_commit_is_rejected() {
        let calls = Arc::new(Calls::default());
        let handle = TransactionHandle::new(Box::new(MockTx(calls.clone())), None);
        handle.commit().await.unwrap();

        let err = handle.rollback().await.unwrap_err();
        assert!(matches!(
            err,
            RdbxError::Storage(StorageError::TransactionClosed { .. })
        ));
        assert!(handle.exec("SELECT 1", &[]).await.is_err());
        assert_eq!(calls.rollbacks.load(Ordering::SeqCst), 0);
    }
}
