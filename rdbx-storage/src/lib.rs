//! RDBX Storage - Collaborator Traits and Query Path
//!
//! Defines the relational executor and key/value service abstractions, the
//! cache-coordinated row cursor, and the [`Dbx`] query surface. The Postgres
//! executor lives in `rdbx-pg`.

pub mod cursor;
pub mod dbx;
pub mod deadline;
pub mod handle;
pub mod memory;
pub mod stats;
pub mod traits;

pub use cursor::{CachedRows, VecCursor};
pub use dbx::{Dbx, TxDbx};
pub use deadline::with_deadline;
pub use handle::TransactionHandle;
pub use memory::MemoryStore;
pub use stats::{CacheCounters, QueryCacheStats};
pub use traits::{CacheStore, LockService, RowCursor, SqlExecutor, SqlTransaction};
