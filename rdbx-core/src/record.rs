//! Record mapping: column-tagged fields populated from result rows.

use crate::error::MapError;
use crate::value::Value;

/// A struct whose fields are tagged with column names.
///
/// Implemented through [`impl_record!`](crate::impl_record); the tag list is
/// given in field-declaration order and drives wildcard expansion.
pub trait Record: Default {
    /// Type name used in errors.
    const NAME: &'static str;
    /// Tagged columns, in field-declaration order.
    const COLUMNS: &'static [&'static str];

    /// Assign `value` to the field tagged `column`.
    ///
    /// Returns `Ok(false)` when no field carries that tag.
    fn assign_column(&mut self, column: &str, value: Value) -> Result<bool, MapError>;
}

/// Something a query result can be mapped into: a single record or a `Vec`
/// of records.
pub trait Destination {
    /// Tagged columns the destination can receive.
    fn columns() -> &'static [&'static str];

    /// Type name used in errors.
    fn name() -> &'static str;

    /// Map one result row onto the destination.
    fn map_row(&mut self, columns: &[String], row: Vec<Value>) -> Result<(), MapError>;

    /// Reject destinations that cannot receive anything. Runs before any I/O.
    fn validate() -> Result<(), MapError> {
        if Self::columns().is_empty() {
            return Err(MapError::InvalidDestination {
                destination: Self::name(),
                reason: "no column-tagged fields".to_string(),
            });
        }
        Ok(())
    }

    /// Reject a result set that shares no column with the destination tags.
    fn check_columns(columns: &[String]) -> Result<(), MapError> {
        let tags = Self::columns();
        if columns.iter().any(|c| tags.contains(&c.as_str())) {
            Ok(())
        } else {
            Err(MapError::UnmappedColumns {
                destination: Self::name(),
                columns: columns.to_vec(),
            })
        }
    }
}

/// Map one row onto a record. Columns without a matching tag are skipped.
pub fn map_record<R: Record>(
    record: &mut R,
    columns: &[String],
    row: Vec<Value>,
) -> Result<(), MapError> {
    for (column, value) in columns.iter().zip(row) {
        record.assign_column(column, value)?;
    }
    Ok(())
}

impl<R: Record> Destination for Vec<R> {
    fn columns() -> &'static [&'static str] {
        R::COLUMNS
    }

    fn name() -> &'static str {
        R::NAME
    }

    fn map_row(&mut self, columns: &[String], row: Vec<Value>) -> Result<(), MapError> {
        let mut element = R::default();
        map_record(&mut element, columns, row)?;
        self.push(element);
        Ok(())
    }
}

/// Implement [`Record`] and [`Destination`] for a struct.
///
/// Fields are listed as `field => "column"` in declaration order. Fields that
/// are not listed are never touched by the mapper.
///
/// # Example
/// ```ignore
/// #[derive(Debug, Default)]
/// struct User {
///     id: i64,
///     name: String,
/// }
///
/// impl_record!(User { id => "id", name => "name" });
/// ```
#[macro_export]
macro_rules! impl_record {
    ($type:ty { $($field:ident => $column:literal),* $(,)? }) => {
        impl $crate::Record for $type {
            const NAME: &'static str = stringify!($type);
            const COLUMNS: &'static [&'static str] = &[$($column),*];

            fn assign_column(
                &mut self,
                column: &str,
                value: $crate::Value,
            ) -> Result<bool, $crate::MapError> {
                match column {
                    $($column => {
                        self.$field = $crate::coerce(column, value)?;
                        Ok(true)
                    })*
                    _ => {
                        drop(value);
                        Ok(false)
                    }
                }
            }
        }

        impl $crate::Destination for $type {
            fn columns() -> &'static [&'static str] {
                <$type as $crate::Record>::COLUMNS
            }

            fn name() -> &'static str {
                <$type as $crate::Record>::NAME
            }

            fn map_row(
                &mut self,
                columns: &[String],
                row: Vec<$crate::Value>,
            ) -> Result<(), $crate::MapError> {
                $crate::record::map_record(self, columns, row)
            }
        }
    };
}
