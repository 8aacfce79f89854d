//! Conversions between [`Value`] and PostgreSQL wire types, plus error
//! mapping for driver and pool failures.

use bytes::BytesMut;
use chrono::{DateTime, NaiveDateTime, Utc};
use deadpool_postgres::{CreatePoolError, PoolError};
use rdbx_core::{ConfigError, Decimal, RdbxError, RdbxResult, StorageError, Value};
use std::error::Error;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, ToSql, Type};
use tokio_postgres::Row;
use uuid::Uuid;

// ============================================================================
// PARAMETERS
// ============================================================================

/// A [`Value`] bound as a statement parameter.
///
/// Integers and floats are narrowed to the parameter's declared width. Text
/// bound to a `json`/`jsonb` parameter is parsed first, and numbers or text
/// bound to a `numeric` parameter go through [`Decimal`].
#[derive(Debug)]
pub struct PgArg<'a>(pub &'a Value);

impl ToSql for PgArg<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self.0 {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => b.to_sql_checked(ty, out),
            Value::Int(i) => {
                if *ty == Type::INT2 {
                    i16::try_from(*i)?.to_sql_checked(ty, out)
                } else if *ty == Type::INT4 {
                    i32::try_from(*i)?.to_sql_checked(ty, out)
                } else if *ty == Type::NUMERIC {
                    Decimal::from(*i).to_sql_checked(ty, out)
                } else {
                    i.to_sql_checked(ty, out)
                }
            }
            Value::Float(x) => {
                if *ty == Type::FLOAT4 {
                    (*x as f32).to_sql_checked(ty, out)
                } else if *ty == Type::NUMERIC {
                    Decimal::try_from(*x)?.to_sql_checked(ty, out)
                } else {
                    x.to_sql_checked(ty, out)
                }
            }
            Value::Text(s) => {
                if *ty == Type::JSON || *ty == Type::JSONB {
                    serde_json::from_str::<serde_json::Value>(s)?.to_sql_checked(ty, out)
                } else if *ty == Type::NUMERIC {
                    s.trim().parse::<Decimal>()?.to_sql_checked(ty, out)
                } else {
                    s.to_sql_checked(ty, out)
                }
            }
            Value::Bytes(b) => b.as_slice().to_sql_checked(ty, out),
            Value::Uuid(u) => u.to_sql_checked(ty, out),
            Value::Timestamp(t) => {
                if *ty == Type::TIMESTAMP {
                    t.naive_utc().to_sql_checked(ty, out)
                } else {
                    t.to_sql_checked(ty, out)
                }
            }
        }
    }

    // Each variant checks the parameter type when it delegates.
    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Wrap every parameter for binding.
pub fn bind(params: &[Value]) -> Vec<PgArg<'_>> {
    params.iter().map(PgArg).collect()
}

/// Borrow wrapped parameters the way `tokio_postgres` takes them.
pub fn as_params<'a>(args: &'a [PgArg<'a>]) -> Vec<&'a (dyn ToSql + Sync)> {
    args.iter().map(|a| a as &(dyn ToSql + Sync)).collect()
}

// ============================================================================
// ROWS
// ============================================================================

/// Convert every column of `row` into a [`Value`].
pub fn row_values(row: &Row) -> RdbxResult<Vec<Value>> {
    (0..row.len()).map(|idx| column_value(row, idx)).collect()
}

fn column_value(row: &Row, idx: usize) -> RdbxResult<Value> {
    let ty = row.columns()[idx].type_();

    let value = if *ty == Type::BOOL {
        take::<bool>(row, idx)?.map(Value::Bool)
    } else if *ty == Type::INT2 {
        take::<i16>(row, idx)?.map(|v| Value::Int(v.into()))
    } else if *ty == Type::INT4 {
        take::<i32>(row, idx)?.map(|v| Value::Int(v.into()))
    } else if *ty == Type::INT8 {
        take::<i64>(row, idx)?.map(Value::Int)
    } else if *ty == Type::OID {
        take::<u32>(row, idx)?.map(|v| Value::Int(v.into()))
    } else if *ty == Type::FLOAT4 {
        take::<f32>(row, idx)?.map(|v| Value::Float(v.into()))
    } else if *ty == Type::FLOAT8 {
        take::<f64>(row, idx)?.map(Value::Float)
    } else if *ty == Type::NUMERIC {
        take::<Decimal>(row, idx)?.map(|v| Value::Text(v.to_string()))
    } else if *ty == Type::TEXT || *ty == Type::VARCHAR || *ty == Type::BPCHAR || *ty == Type::NAME {
        take::<String>(row, idx)?.map(Value::Text)
    } else if *ty == Type::BYTEA {
        take::<Vec<u8>>(row, idx)?.map(Value::Bytes)
    } else if *ty == Type::UUID {
        take::<Uuid>(row, idx)?.map(Value::Uuid)
    } else if *ty == Type::TIMESTAMPTZ {
        take::<DateTime<Utc>>(row, idx)?.map(Value::Timestamp)
    } else if *ty == Type::TIMESTAMP {
        take::<NaiveDateTime>(row, idx)?.map(|v| Value::Timestamp(v.and_utc()))
    } else if *ty == Type::JSON || *ty == Type::JSONB {
        take::<serde_json::Value>(row, idx)?.map(|v| Value::Text(v.to_string()))
    } else {
        return Err(StorageError::CursorFailed {
            reason: format!(
                "column {} has unsupported type {}",
                row.columns()[idx].name(),
                ty
            ),
        }
        .into());
    };

    Ok(value.unwrap_or(Value::Null))
}

fn take<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> RdbxResult<Option<T>> {
    row.try_get::<_, Option<T>>(idx).map_err(|e| {
        StorageError::CursorFailed {
            reason: format!("column {}: {}", row.columns()[idx].name(), e),
        }
        .into()
    })
}

// ============================================================================
// ERRORS
// ============================================================================

/// Map a driver error onto the storage variant chosen by `variant`.
pub(crate) fn db_error(err: tokio_postgres::Error, variant: fn(String) -> StorageError) -> RdbxError {
    tracing::debug!(error = ?err, "Database error");
    let reason = match err.as_db_error() {
        Some(db) => format!("{} ({})", db.message(), db.code().code()),
        None => err.to_string(),
    };
    variant(reason).into()
}

pub(crate) fn pool_error(err: PoolError) -> RdbxError {
    tracing::error!(error = ?err, "Connection pool error");
    let reason = match err {
        PoolError::Timeout(_) => "connection pool exhausted".to_string(),
        PoolError::Closed => "connection pool is closed".to_string(),
        other => format!("failed to acquire connection: {}", other),
    };
    StorageError::Connection { reason }.into()
}

pub(crate) fn pool_setup_error(err: CreatePoolError) -> RdbxError {
    ConfigError::InvalidValue {
        field: "db".to_string(),
        value: "pool".to_string(),
        reason: err.to_string(),
    }
    .into()
}

pub(crate) fn query_failed(reason: String) -> StorageError {
    StorageError::QueryFailed { reason }
}

pub(crate) fn exec_failed(reason: String) -> StorageError {
    StorageError::ExecFailed { reason }
}

pub(crate) fn begin_failed(reason: String) -> StorageError {
    StorageError::BeginFailed { reason }
}

pub(crate) fn commit_failed(reason: String) -> StorageError {
    StorageError::CommitFailed { reason }
}

pub(crate) fn rollback_failed(reason: String) -> StorageError {
    StorageError::RollbackFailed { reason }
}
