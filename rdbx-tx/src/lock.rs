//! Distributed lock extension for the transaction coordinator.

use crate::coordinator::EnabledTx;
use futures_util::FutureExt;
use rdbx_core::{
    value_key, LockDescriptor, LockError, LockOptions, LockStatus, RdbxError, RdbxResult,
    RetryConfig,
};
use rdbx_storage::{with_deadline, LockService, TransactionHandle};
use std::fmt;
use std::future::Future;
use std::panic::{resume_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

fn new_token() -> String {
    Uuid::now_v7().to_string()
}

// ============================================================================
// LOCKED TX
// ============================================================================

/// A coordinator guarded by a named distributed lock.
pub struct LockedTx {
    tx: EnabledTx,
    key: String,
    options: LockOptions,
}

impl LockedTx {
    pub(crate) fn new(tx: EnabledTx, key: String, options: LockOptions) -> Self {
        Self { tx, key, options }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// The wrapped coordinator.
    pub fn tx(&self) -> &EnabledTx {
        &self.tx
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.options.lease = lease;
        self
    }

    /// Acquire the lock, then run `action` through the coordinator.
    ///
    /// Acquisition is a single attempt. When the lock is held elsewhere the
    /// call fails with [`LockError::AcquisitionFailed`] before any
    /// transaction is opened. After the action the lock is released when
    /// auto-release is on or the action failed or panicked; release
    /// failures are logged only.
    pub async fn exec<F, Fut, T, E>(&mut self, action: F) -> Result<T, E>
    where
        F: FnOnce(TransactionHandle, LockHandle) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<RdbxError> + fmt::Display,
    {
        let lock = LockHandle::acquire(
            self.tx.locks().clone(),
            &self.key,
            self.options.clone(),
            self.tx.config().unlock_retry.clone(),
            self.tx.config().call_timeout,
        )
        .await
        .map_err(E::from)?;

        let for_action = lock.clone();
        let outcome = AssertUnwindSafe(self.tx.exec(move |handle| action(handle, for_action)))
            .catch_unwind()
            .await;

        let succeeded = matches!(outcome, Ok(Ok(_)));
        if (self.options.auto_release || !succeeded) && lock.is_held().await {
            if let Err(e) = lock.unlock().await {
                tracing::warn!(error = %e, key = %self.key, "Failed to release lock");
            }
        }

        match outcome {
            Ok(result) => result,
            Err(panic) => resume_unwind(panic),
        }
    }
}

impl fmt::Debug for LockedTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedTx")
            .field("key", &self.key)
            .field("options", &self.options)
            .field("tx", &self.tx)
            .finish()
    }
}

// ============================================================================
// LOCK HANDLE
// ============================================================================

struct LockState {
    /// Value we expect the lock key to hold when releasing.
    token: String,
    descriptor: LockDescriptor,
}

struct LockInner {
    key: String,
    options: LockOptions,
    locks: Arc<dyn LockService>,
    retry: RetryConfig,
    timeout: Option<Duration>,
    state: Mutex<LockState>,
}

/// Handle on an acquired distributed lock, passed to locked actions.
#[derive(Clone)]
pub struct LockHandle {
    inner: Arc<LockInner>,
}

impl LockHandle {
    /// Single attempt to take `key`, recording the idempotency value when
    /// one is configured.
    pub async fn acquire(
        locks: Arc<dyn LockService>,
        key: &str,
        options: LockOptions,
        retry: RetryConfig,
        timeout: Option<Duration>,
    ) -> RdbxResult<LockHandle> {
        let token = new_token();
        try_acquire(locks.as_ref(), key, &token, options.lease, timeout).await?;

        let handle = LockHandle {
            inner: Arc::new(LockInner {
                key: key.to_string(),
                state: Mutex::new(LockState {
                    token,
                    descriptor: LockDescriptor::acquired(key, &options),
                }),
                options,
                locks,
                retry,
                timeout,
            }),
        };

        if let Err(e) = handle.store_value().await {
            tracing::error!(error = %e, key, "Failed to store lock value, releasing lock");
            if let Err(release) = handle.unlock().await {
                tracing::warn!(error = %release, key, "Failed to release lock");
            }
            return Err(e);
        }

        Ok(handle)
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Snapshot of the lock descriptor, including the last error seen.
    pub async fn descriptor(&self) -> LockDescriptor {
        self.inner.state.lock().await.descriptor.clone()
    }

    pub async fn is_held(&self) -> bool {
        self.inner.state.lock().await.descriptor.status == LockStatus::Held
    }

    /// Read the idempotency value stored under `<key>.value`.
    ///
    /// Works whether or not this handle still holds the lock.
    pub async fn get_value(&self) -> RdbxResult<Option<String>> {
        let key = value_key(&self.inner.key);
        with_deadline("lock value get", self.inner.timeout, self.inner.locks.get(&key)).await
    }

    /// Take the lock again with a fresh token. Single attempt.
    pub async fn lock(&self) -> RdbxResult<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        let token = new_token();

        if let Err(e) = try_acquire(
            inner.locks.as_ref(),
            &inner.key,
            &token,
            inner.options.lease,
            inner.timeout,
        )
        .await
        {
            state.descriptor.last_error = Some(e.to_string());
            return Err(e);
        }

        state.token = token;
        let last_error = state.descriptor.last_error.take();
        state.descriptor = LockDescriptor::acquired(inner.key.as_str(), &inner.options);
        state.descriptor.last_error = last_error;
        drop(state);

        self.store_value().await
    }

    /// Release the lock.
    ///
    /// When the service rejects the release because the key holds another
    /// token, the current token is read back, adopted and the release is
    /// retried. Service failures are retried as well. Attempts are bounded
    /// by the retry policy with exponential backoff in between; running
    /// out yields [`LockError::ReleaseAbandoned`]. Deadline expiry is not
    /// retried. On success the `<key>.value` key is deleted.
    pub async fn unlock(&self) -> RdbxResult<bool> {
        let inner = &self.inner;
        let key = inner.key.as_str();
        let max_attempts = inner.retry.max_attempts.max(1);
        let mut state = inner.state.lock().await;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let released =
                with_deadline("unlock", inner.timeout, inner.locks.unlock(key, &state.token)).await;

            match released {
                Ok(true) => {
                    state.descriptor.status = LockStatus::Released;
                    drop(state);
                    tracing::debug!(key, attempt, "Lock released");
                    self.clear_value().await;
                    return Ok(true);
                }
                Ok(false) => {
                    let current =
                        with_deadline("lock get", inner.timeout, inner.locks.get(key)).await;
                    match current {
                        Ok(Some(holder)) => {
                            tracing::debug!(key, attempt, "Lock holds another token, adopting it");
                            state.token = holder;
                            last_error = "lock is held under another token".to_string();
                        }
                        Ok(None) => {
                            let err: RdbxError = LockError::NotHeld {
                                key: key.to_string(),
                            }
                            .into();
                            state.descriptor.status = LockStatus::Released;
                            state.descriptor.last_error = Some(err.to_string());
                            return Err(err);
                        }
                        Err(e) if e.is_cancelled() => {
                            state.descriptor.last_error = Some(e.to_string());
                            return Err(e);
                        }
                        Err(e) => last_error = e.to_string(),
                    }
                }
                Err(e) if e.is_cancelled() => {
                    state.descriptor.last_error = Some(e.to_string());
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(error = %e, key, attempt, "Unlock attempt failed");
                    last_error = e.to_string();
                }
            }

            state.descriptor.last_error = Some(last_error.clone());
            if attempt < max_attempts {
                tokio::time::sleep(inner.retry.backoff_for(attempt)).await;
            }
        }

        state.descriptor.status = LockStatus::Abandoned;
        tracing::error!(key, attempts = max_attempts, last_error = %last_error, "Gave up releasing lock");
        Err(LockError::ReleaseAbandoned {
            key: key.to_string(),
            attempts: max_attempts,
            last_error,
        }
        .into())
    }

    async fn store_value(&self) -> RdbxResult<()> {
        let inner = &self.inner;
        let Some(value) = inner.options.value.as_deref() else {
            return Ok(());
        };
        let key = value_key(&inner.key);
        with_deadline(
            "lock value set",
            inner.timeout,
            inner.locks.set(&key, value, inner.options.lease),
        )
        .await
    }

    async fn clear_value(&self) {
        let inner = &self.inner;
        let key = value_key(&inner.key);
        if let Err(e) = with_deadline("lock value delete", inner.timeout, inner.locks.delete(&key)).await {
            tracing::warn!(error = %e, key = %key, "Failed to delete lock value");
            inner.state.lock().await.descriptor.last_error = Some(e.to_string());
        }
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.inner.key)
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

async fn try_acquire(
    locks: &dyn LockService,
    key: &str,
    token: &str,
    lease: Duration,
    timeout: Option<Duration>,
) -> RdbxResult<()> {
    match with_deadline("lock", timeout, locks.try_lock(key, token, lease)).await {
        Ok(true) => {
            tracing::debug!(key, lease_ms = lease.as_millis() as u64, "Lock acquired");
            Ok(())
        }
        Ok(false) => Err(LockError::AcquisitionFailed {
            key: key.to_string(),
            reason: "lock is held elsewhere".to_string(),
        }
        .into()),
        Err(e) if e.is_cancelled() => Err(e),
        Err(e) => Err(LockError::AcquisitionFailed {
            key: key.to_string(),
            reason: e.to_string(),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdbx_storage::MemoryStore;

    fn retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    async fn acquire(store: &Arc<MemoryStore>, options: LockOptions) -> RdbxResult<LockHandle> {
        LockHandle::acquire(store.clone(), "jobs:7", options, retry(), None).await
    }

    #[tokio::test]
    async fn test_acquire_stores_value_under_value_key() {
        let store = Arc::new(MemoryStore::new());
        let lock = acquire(&store, LockOptions::new().with_value("req-1")).await.unwrap();

        assert_eq!(lock.get_value().await.unwrap().as_deref(), Some("req-1"));
        assert!(lock.is_held().await);
        assert_eq!(lock.descriptor().await.value.as_deref(), Some("req-1"));
    }

    #[tokio::test]
    async fn test_second_acquire_fails() {
        let store = Arc::new(MemoryStore::new());
        let _held = acquire(&store, LockOptions::new()).await.unwrap();

        let err = acquire(&store, LockOptions::new()).await.unwrap_err();
        assert!(matches!(err, RdbxError::Lock(LockError::AcquisitionFailed { .. })));
    }

    #[tokio::test]
    async fn test_unlock_releases_and_clears_value() {
        let store = Arc::new(MemoryStore::new());
        let lock = acquire(&store, LockOptions::new().with_value("v")).await.unwrap();

        assert_eq!(lock.unlock().await, Ok(true));
        assert_eq!(lock.get_value().await.unwrap(), None);
        assert_eq!(lock.descriptor().await.status, LockStatus::Released);
        assert!(acquire(&store, LockOptions::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_unlock_adopts_current_token() {
        let store = Arc::new(MemoryStore::new());
        let lock = acquire(&store, LockOptions::new()).await.unwrap();
        LockService::set(store.as_ref(), "jobs:7", "someone-else", Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(lock.unlock().await, Ok(true));
        assert_eq!(LockService::get(store.as_ref(), "jobs:7").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unlock_of_missing_key_is_not_held() {
        let store = Arc::new(MemoryStore::new());
        let lock = acquire(&store, LockOptions::new()).await.unwrap();
        store.delete("jobs:7").await.unwrap();

        let err = lock.unlock().await.unwrap_err();
        assert_eq!(
            err,
            RdbxError::Lock(LockError::NotHeld {
                key: "jobs:7".to_string()
            })
        );
        assert!(lock.descriptor().await.last_error.is_some());
    }

    #[tokio::test]
    async fn test_lock_reacquires_after_unlock() {
        let store = Arc::new(MemoryStore::new());
        let lock = acquire(&store, LockOptions::new().with_value("v")).await.unwrap();
        lock.unlock().await.unwrap();

        lock.lock().await.unwrap();
        assert!(lock.is_held().await);
        assert_eq!(lock.get_value().await.unwrap().as_deref(), Some("v"));
        assert!(lock.lock().await.is_err());
    }
}
