//! Row cursors: an in-memory cursor and the cache-coordinated wrapper.

use crate::deadline::with_deadline;
use crate::stats::CacheCounters;
use crate::traits::{CacheStore, RowCursor};
use async_trait::async_trait;
use rdbx_core::{encode_row, Fingerprint, RdbxResult, StorageError, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// VEC CURSOR
// ============================================================================

/// Cursor over rows that are already materialised.
#[derive(Debug, Clone, Default)]
pub struct VecCursor {
    columns: Vec<String>,
    rows: VecDeque<Vec<Value>>,
    closed: bool,
}

impl VecCursor {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns,
            rows: rows.into(),
            closed: false,
        }
    }

    /// A cursor with no columns and no rows.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Rows not fetched yet.
    pub fn remaining(&self) -> usize {
        self.rows.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[async_trait]
impl RowCursor for VecCursor {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn next_row(&mut self) -> RdbxResult<Option<Vec<Value>>> {
        if self.closed {
            return Err(StorageError::CursorFailed {
                reason: "cursor is closed".to_string(),
            }
            .into());
        }
        Ok(self.rows.pop_front())
    }

    async fn close(&mut self) -> RdbxResult<()> {
        self.closed = true;
        self.rows.clear();
        Ok(())
    }
}

// ============================================================================
// CACHED ROWS
// ============================================================================

/// A live cursor that serializes every fetched row into a write buffer and
/// persists the buffer under the query fingerprint when closed.
///
/// The buffer always starts empty. Whatever the cache held for the same
/// fingerprint before the query ran is kept aside in
/// [`previous_blob`](Self::previous_blob) and never merged into the new
/// blob, so a close replaces the entry.
pub struct CachedRows {
    inner: Box<dyn RowCursor>,
    fingerprint: Fingerprint,
    cache: Arc<dyn CacheStore>,
    counters: Arc<CacheCounters>,
    ttl: Duration,
    timeout: Option<Duration>,
    buffer: Vec<u8>,
    previous: Option<Vec<u8>>,
    drained: bool,
}

impl CachedRows {
    pub fn new(
        inner: Box<dyn RowCursor>,
        fingerprint: Fingerprint,
        cache: Arc<dyn CacheStore>,
        counters: Arc<CacheCounters>,
        previous: Option<Vec<u8>>,
        ttl: Duration,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner,
            fingerprint,
            cache,
            counters,
            ttl,
            timeout,
            buffer: Vec::new(),
            previous,
            drained: false,
        }
    }

    pub fn columns(&self) -> &[String] {
        self.inner.columns()
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Blob the cache held for this fingerprint when the query started.
    pub fn previous_blob(&self) -> Option<&[u8]> {
        self.previous.as_deref()
    }

    /// Bytes serialized so far.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Whether the native cursor reported the end of the result set.
    pub fn is_drained(&self) -> bool {
        self.drained
    }

    /// Fetch the next row and append its encoding to the buffer.
    ///
    /// A native fetch failure aborts before anything is serialized. A row
    /// that cannot be encoded is reported as an error and not returned.
    pub async fn next(&mut self) -> RdbxResult<Option<Vec<Value>>> {
        let fetched = with_deadline("cursor fetch", self.timeout, self.inner.next_row()).await?;
        match fetched {
            Some(row) => {
                encode_row(&mut self.buffer, self.inner.columns().len(), &row)?;
                Ok(Some(row))
            }
            None => {
                self.drained = true;
                Ok(None)
            }
        }
    }

    /// Persist the buffer with the configured TTL, then release the native
    /// cursor.
    ///
    /// A cursor that was not read to the end writes nothing. When the cache
    /// write fails the native cursor is still released and the write error
    /// is returned.
    pub async fn close(mut self) -> RdbxResult<()> {
        let written = if self.drained {
            self.write_blob().await
        } else {
            CacheCounters::incr(&self.counters.skipped_writes);
            tracing::debug!(
                fingerprint = %self.fingerprint,
                "Cursor closed before exhaustion, skipping cache write"
            );
            Ok(())
        };

        let released = with_deadline("cursor close", self.timeout, self.inner.close()).await;

        match (written, released) {
            (Err(write_err), Err(close_err)) => {
                tracing::warn!(
                    error = %close_err,
                    fingerprint = %self.fingerprint,
                    "Cursor close failed after cache write failure"
                );
                Err(write_err)
            }
            (Err(write_err), Ok(())) => Err(write_err),
            (Ok(()), released) => released,
        }
    }

    /// Release the native cursor without writing anything to the cache.
    pub async fn abandon(mut self) {
        if let Err(e) = with_deadline("cursor close", self.timeout, self.inner.close()).await {
            tracing::warn!(
                error = %e,
                fingerprint = %self.fingerprint,
                "Failed to close abandoned cursor"
            );
        }
    }

    async fn write_blob(&self) -> RdbxResult<()> {
        let key = self.fingerprint.as_str();
        match with_deadline(
            "cache set",
            self.timeout,
            self.cache.set(key, &self.buffer, self.ttl),
        )
        .await
        {
            Ok(()) => {
                CacheCounters::incr(&self.counters.writes);
                tracing::debug!(
                    fingerprint = %self.fingerprint,
                    bytes = self.buffer.len(),
                    "Cached result blob"
                );
                Ok(())
            }
            Err(e) => {
                CacheCounters::incr(&self.counters.write_errors);
                tracing::error!(error = %e, fingerprint = %self.fingerprint, "Cache write failed");
                Err(e)
            }
        }
    }
}
