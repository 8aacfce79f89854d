//! Transaction coordinator.
//!
//! # State Transition Diagram
//!
//! ```text
//!          begin ok            action Ok + commit ok
//! Idle ──────────────→ Began ─────────────────────────→ Committed
//!   │                    │
//!   │ begin failed       │ action Err / panic + rollback ok
//!   ↓                    └──────────────────────────────→ RolledBack
//! Failed ←── commit or rollback failed
//! ```
//!
//! A coordinator built with [`Transactioner::join`] starts in `Joined`, runs
//! actions on the borrowed handle and never finishes the transaction.

use crate::lock::LockedTx;
use futures_util::FutureExt;
use rdbx_core::{LockOptions, RdbxConfig, RdbxError, RdbxResult, StorageError};
use rdbx_storage::{with_deadline, LockService, SqlExecutor, TransactionHandle};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{resume_unwind, AssertUnwindSafe};
use std::sync::Arc;
use uuid::Uuid;

// ============================================================================
// TRANSACTIONER
// ============================================================================

/// Factory for transaction coordinators.
#[derive(Clone)]
pub struct Transactioner {
    executor: Arc<dyn SqlExecutor>,
    locks: Arc<dyn LockService>,
    config: RdbxConfig,
}

impl Transactioner {
    pub fn new(executor: Arc<dyn SqlExecutor>, locks: Arc<dyn LockService>, config: RdbxConfig) -> Self {
        Self {
            executor,
            locks,
            config,
        }
    }

    pub fn config(&self) -> &RdbxConfig {
        &self.config
    }

    /// A coordinator owning a new transaction. Nothing is opened until the
    /// first [`EnabledTx::begin`] or [`EnabledTx::exec`].
    pub fn enable_tx(&self) -> EnabledTx {
        EnabledTx {
            executor: self.executor.clone(),
            locks: self.locks.clone(),
            config: self.config.clone(),
            state: TxState::Idle,
        }
    }

    /// A coordinator that reuses an already open transaction.
    pub fn join(&self, handle: &TransactionHandle) -> EnabledTx {
        EnabledTx {
            executor: self.executor.clone(),
            locks: self.locks.clone(),
            config: self.config.clone(),
            state: TxState::Joined(handle.clone()),
        }
    }
}

// ============================================================================
// STATE
// ============================================================================

/// Observable lifecycle phase of an [`EnabledTx`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxPhase {
    Idle,
    Began,
    Joined,
    Committed,
    RolledBack,
    Failed,
}

impl fmt::Display for TxPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxPhase::Idle => "idle",
            TxPhase::Began => "began",
            TxPhase::Joined => "joined",
            TxPhase::Committed => "committed",
            TxPhase::RolledBack => "rolled_back",
            TxPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

enum TxState {
    Idle,
    Began(TransactionHandle),
    Joined(TransactionHandle),
    Committed(Uuid),
    RolledBack(Uuid),
    Failed(RdbxError),
}

// ============================================================================
// ENABLED TX
// ============================================================================

/// Runs caller actions inside one SQL transaction.
///
/// Not meant for concurrent use; `exec` takes `&mut self`.
pub struct EnabledTx {
    executor: Arc<dyn SqlExecutor>,
    locks: Arc<dyn LockService>,
    config: RdbxConfig,
    state: TxState,
}

impl EnabledTx {
    pub fn phase(&self) -> TxPhase {
        match self.state {
            TxState::Idle => TxPhase::Idle,
            TxState::Began(_) => TxPhase::Began,
            TxState::Joined(_) => TxPhase::Joined,
            TxState::Committed(_) => TxPhase::Committed,
            TxState::RolledBack(_) => TxPhase::RolledBack,
            TxState::Failed(_) => TxPhase::Failed,
        }
    }

    /// The open transaction, if any.
    pub fn handle(&self) -> Option<&TransactionHandle> {
        match &self.state {
            TxState::Began(handle) | TxState::Joined(handle) => Some(handle),
            _ => None,
        }
    }

    /// The error that put the coordinator into `Failed`.
    pub fn error(&self) -> Option<&RdbxError> {
        match &self.state {
            TxState::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub(crate) fn locks(&self) -> &Arc<dyn LockService> {
        &self.locks
    }

    pub(crate) fn config(&self) -> &RdbxConfig {
        &self.config
    }

    /// Guard this coordinator with a distributed lock on `key`.
    pub fn with_lock(self, key: impl Into<String>, options: LockOptions) -> LockedTx {
        LockedTx::new(self, key.into(), options)
    }

    /// Open the transaction if it is not open yet and return its handle.
    ///
    /// A failed open is sticky: every later call returns the same error.
    pub async fn begin(&mut self) -> RdbxResult<TransactionHandle> {
        match &self.state {
            TxState::Began(handle) | TxState::Joined(handle) => return Ok(handle.clone()),
            TxState::Failed(e) => return Err(e.clone()),
            TxState::Committed(id) | TxState::RolledBack(id) => {
                return Err(StorageError::TransactionClosed {
                    transaction_id: id.to_string(),
                }
                .into())
            }
            TxState::Idle => {}
        }

        let timeout = self.config.call_timeout;
        match with_deadline("begin", timeout, self.executor.begin()).await {
            Ok(tx) => {
                let handle = TransactionHandle::new(tx, timeout);
                tracing::debug!(transaction_id = %handle.id(), "Transaction began");
                self.state = TxState::Began(handle.clone());
                Ok(handle)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to begin transaction");
                self.state = TxState::Failed(e.clone());
                Err(e)
            }
        }
    }

    /// Run `action` inside the transaction and finish it.
    ///
    /// - `Ok`: commit; a commit failure becomes the returned error.
    /// - `Err`: roll back and return the action's error. A failed rollback
    ///   is logged and does not replace it.
    /// - panic: roll back and resume the panic. If that rollback fails too,
    ///   panic with both causes.
    ///
    /// A joined coordinator only runs the action; the owner finishes the
    /// transaction.
    pub async fn exec<F, Fut, T, E>(&mut self, action: F) -> Result<T, E>
    where
        F: FnOnce(TransactionHandle) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<RdbxError> + fmt::Display,
    {
        let handle = self.begin().await.map_err(E::from)?;
        if let TxState::Joined(_) = self.state {
            return action(handle).await;
        }

        let id = handle.id();
        let running = handle.clone();
        let outcome = AssertUnwindSafe(async move { action(running).await })
            .catch_unwind()
            .await;

        match outcome {
            Err(panic) => match handle.rollback().await {
                Ok(()) => {
                    tracing::warn!(transaction_id = %id, "Rolled back transaction after panic");
                    self.state = TxState::RolledBack(id);
                    resume_unwind(panic)
                }
                Err(e) => {
                    self.state = TxState::Failed(e.clone());
                    panic!(
                        "transaction {id} rollback failed after panic: {e}; panic: {}",
                        panic_message(panic.as_ref())
                    )
                }
            },
            Ok(Err(err)) => {
                match handle.rollback().await {
                    Ok(()) => {
                        tracing::debug!(transaction_id = %id, error = %err, "Rolled back transaction");
                        self.state = TxState::RolledBack(id);
                    }
                    Err(e) => {
                        tracing::error!(
                            transaction_id = %id,
                            error = %e,
                            action_error = %err,
                            "Rollback failed"
                        );
                        self.state = TxState::Failed(e);
                    }
                }
                Err(err)
            }
            Ok(Ok(value)) => match handle.commit().await {
                Ok(()) => {
                    tracing::debug!(transaction_id = %id, "Committed transaction");
                    self.state = TxState::Committed(id);
                    Ok(value)
                }
                Err(e) => {
                    tracing::error!(transaction_id = %id, error = %e, "Commit failed");
                    self.state = TxState::Failed(e.clone());
                    Err(E::from(e))
                }
            },
        }
    }
}

impl fmt::Debug for EnabledTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnabledTx")
            .field("phase", &self.phase())
            .field("handle", &self.handle())
            .finish_non_exhaustive()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
