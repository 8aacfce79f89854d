//! RDBX Core - Values, Mapping, and Shared Types
//!
//! Pure data-access building blocks with no I/O: the driver value model,
//! record mapping, query fingerprints, the cached row codec, lock
//! descriptors, configuration, and the error hierarchy. All other crates
//! depend on this.

pub mod codec;
pub mod coerce;
pub mod config;
pub mod error;
pub mod lock;
pub mod query;
pub mod record;
pub mod value;

pub use codec::{decode_blob, encode_row, FIELD_SEPARATOR, ROW_SEPARATOR};
pub use coerce::{coerce, Assign, Coercion, FromValue};
pub use config::{RdbxConfig, RetryConfig, DEFAULT_CACHE_TTL, DEFAULT_LOCK_LEASE};
pub use error::{
    CacheError, ConfigError, LockError, MapError, RdbxError, RdbxResult, StorageError, ValueError,
};
pub use lock::{value_key, LockDescriptor, LockOptions, LockStatus};
pub use query::{expand_wildcard, Fingerprint};
pub use record::{map_record, Destination, Record};
pub use value::Value;

pub use rust_decimal::Decimal;
