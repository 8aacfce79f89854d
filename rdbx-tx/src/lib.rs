//! RDBX Tx - Transaction Coordination and Distributed Locks
//!
//! [`Transactioner`] hands out [`EnabledTx`] coordinators that run a caller
//! action inside one SQL transaction and commit or roll back on its outcome,
//! panics included. [`EnabledTx::with_lock`] wraps a coordinator in a named
//! distributed lock from the key/value service.
//!
//! # Example
//!
//! ```ignore
//! let transactioner = Transactioner::new(executor, locks, RdbxConfig::default());
//! let mut tx = transactioner
//!     .enable_tx()
//!     .with_lock("orders:42", LockOptions::new().with_auto_release(true));
//!
//! tx.exec(|handle, _lock| async move {
//!     dbx.with_tx(&handle).exec("UPDATE orders SET paid = true WHERE id = 42", &[]).await
//! })
//! .await?;
//! ```

pub mod coordinator;
pub mod lock;

pub use coordinator::{EnabledTx, Transactioner, TxPhase};
pub use lock::{LockHandle, LockedTx};
