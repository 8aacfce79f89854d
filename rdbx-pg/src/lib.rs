//! RDBX PostgreSQL backend
//!
//! A [`PgExecutor`] implementing [`rdbx_storage::SqlExecutor`] over a
//! deadpool-postgres pool, the [`DbConfig`] that builds the pool from the
//! environment, and tracing setup for binaries that embed RDBX.
//!
//! ```ignore
//! let executor = PgExecutor::from_config(&DbConfig::from_env())?;
//! let dbx = Dbx::new(Arc::new(executor), Arc::new(MemoryStore::new()), RdbxConfig::from_env());
//! ```

pub mod convert;
pub mod db;
pub mod executor;
pub mod telemetry;

pub use convert::{row_values, PgArg};
pub use db::DbConfig;
pub use executor::PgExecutor;
pub use telemetry::{init_tracing, TelemetryConfig};
