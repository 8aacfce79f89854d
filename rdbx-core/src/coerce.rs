//! Field coercion from driver values.
//!
//! Every mappable field type carries one of four [`Coercion`] tags, checked in
//! this priority order when a type is declared:
//!
//! 1. [`Coercion::Domain`]: the type implements [`Assign`] and is bridged with
//!    [`impl_assign!`](crate::impl_assign). This is the extension point for
//!    domain types.
//! 2. [`Coercion::Nullable`]: `Option<T>`; NULL becomes `None`.
//! 3. [`Coercion::Rich`]: well-known richer scalars (`Uuid`, `Decimal`,
//!    `DateTime<Utc>`), parsed from their text form when the driver hands over
//!    text.
//! 4. [`Coercion::Raw`]: plain scalars, with byte results normalised to text.

use crate::error::{MapError, ValueError};
use crate::value::Value;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The coercion path a field type goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Coercion {
    /// Delegated to the type's own [`Assign`] implementation
    Domain,
    /// Optional wrapper around another coercible type
    Nullable,
    /// UUIDs, decimals and timestamps
    Rich,
    /// Integers, floats, booleans, text and bytes
    Raw,
}

/// A field type that can be populated from a driver [`Value`].
pub trait FromValue: Sized {
    /// Which coercion path this type uses.
    const COERCION: Coercion;
    /// Human-readable type name for error messages.
    const EXPECTED: &'static str;

    fn from_value(value: Value) -> Result<Self, ValueError>;
}

/// Domain-level value coercion.
///
/// Implement this for your own types and register them with
/// [`impl_assign!`](crate::impl_assign) to make them usable as record fields.
pub trait Assign: Sized {
    fn assign(raw: Value) -> Result<Self, ValueError>;
}

/// Bridge an [`Assign`] implementation into [`FromValue`].
///
/// # Example
/// ```ignore
/// struct Cents(i64);
/// impl Assign for Cents { /* ... */ }
/// impl_assign!(Cents);
/// ```
#[macro_export]
macro_rules! impl_assign {
    ($type:ty) => {
        impl $crate::FromValue for $type {
            const COERCION: $crate::Coercion = $crate::Coercion::Domain;
            const EXPECTED: &'static str = stringify!($type);

            fn from_value(value: $crate::Value) -> Result<Self, $crate::ValueError> {
                <$type as $crate::Assign>::assign(value)
            }
        }
    };
}

/// Coerce the value of `column` into `T`, attributing failures to the column.
pub fn coerce<T: FromValue>(column: &str, value: Value) -> Result<T, MapError> {
    T::from_value(value).map_err(|source| MapError::Coercion {
        column: column.to_string(),
        coercion: T::COERCION,
        source,
    })
}

fn mismatch(expected: &'static str, value: &Value) -> ValueError {
    if value.is_null() {
        ValueError::UnexpectedNull { expected }
    } else {
        ValueError::Mismatch {
            expected,
            found: value.kind(),
        }
    }
}

fn bytes_to_text(expected: &'static str, bytes: Vec<u8>) -> Result<String, ValueError> {
    String::from_utf8(bytes).map_err(|e| ValueError::Malformed {
        expected,
        literal: hex::encode(e.as_bytes()),
        reason: "bytes are not valid UTF-8".to_string(),
    })
}

fn parse_text<T>(expected: &'static str, text: &str) -> Result<T, ValueError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    text.trim().parse::<T>().map_err(|e| ValueError::Malformed {
        expected,
        literal: text.to_string(),
        reason: e.to_string(),
    })
}

// ============================================================================
// NULLABLE
// ============================================================================

impl<T: FromValue> FromValue for Option<T> {
    const COERCION: Coercion = Coercion::Nullable;
    const EXPECTED: &'static str = T::EXPECTED;

    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

// ============================================================================
// RICH SCALARS
// ============================================================================

impl FromValue for Uuid {
    const COERCION: Coercion = Coercion::Rich;
    const EXPECTED: &'static str = "uuid";

    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Uuid(u) => Ok(u),
            Value::Text(s) => parse_text(Self::EXPECTED, &s),
            Value::Bytes(b) if b.len() == 16 => {
                Uuid::from_slice(&b).map_err(|e| ValueError::Malformed {
                    expected: Self::EXPECTED,
                    literal: hex::encode(&b),
                    reason: e.to_string(),
                })
            }
            Value::Bytes(b) => parse_text(Self::EXPECTED, &bytes_to_text(Self::EXPECTED, b)?),
            other => Err(mismatch(Self::EXPECTED, &other)),
        }
    }
}

impl FromValue for Decimal {
    const COERCION: Coercion = Coercion::Rich;
    const EXPECTED: &'static str = "decimal";

    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Int(i) => Ok(Decimal::from(i)),
            Value::Float(f) => Decimal::try_from(f).map_err(|e| ValueError::Malformed {
                expected: Self::EXPECTED,
                literal: f.to_string(),
                reason: e.to_string(),
            }),
            Value::Text(s) => parse_text(Self::EXPECTED, &s),
            Value::Bytes(b) => parse_text(Self::EXPECTED, &bytes_to_text(Self::EXPECTED, b)?),
            other => Err(mismatch(Self::EXPECTED, &other)),
        }
    }
}

impl FromValue for DateTime<Utc> {
    const COERCION: Coercion = Coercion::Rich;
    const EXPECTED: &'static str = "timestamp";

    fn from_value(value: Value) -> Result<Self, ValueError> {
        let text = match value {
            Value::Timestamp(t) => return Ok(t),
            Value::Text(s) => s,
            Value::Bytes(b) => bytes_to_text(Self::EXPECTED, b)?,
            other => return Err(mismatch(Self::EXPECTED, &other)),
        };
        DateTime::parse_from_rfc3339(text.trim())
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| ValueError::Malformed {
                expected: Self::EXPECTED,
                literal: text.clone(),
                reason: e.to_string(),
            })
    }
}

// ============================================================================
// RAW SCALARS
// ============================================================================

impl FromValue for i64 {
    const COERCION: Coercion = Coercion::Raw;
    const EXPECTED: &'static str = "i64";

    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Int(i) => Ok(i),
            // i64::MAX as f64 rounds up to 2^63, which is out of range.
            Value::Float(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
                Ok(f as i64)
            }
            Value::Text(s) => parse_text(Self::EXPECTED, &s),
            Value::Bytes(b) => parse_text(Self::EXPECTED, &bytes_to_text(Self::EXPECTED, b)?),
            other => Err(mismatch(Self::EXPECTED, &other)),
        }
    }
}

macro_rules! impl_narrow_int {
    ($type:ty, $name:literal) => {
        impl FromValue for $type {
            const COERCION: Coercion = Coercion::Raw;
            const EXPECTED: &'static str = $name;

            fn from_value(value: Value) -> Result<Self, ValueError> {
                let wide = i64::from_value(value).map_err(|e| match e {
                    ValueError::Mismatch { found, .. } => ValueError::Mismatch {
                        expected: $name,
                        found,
                    },
                    ValueError::UnexpectedNull { .. } => ValueError::UnexpectedNull { expected: $name },
                    other => other,
                })?;
                <$type>::try_from(wide).map_err(|e| ValueError::Malformed {
                    expected: $name,
                    literal: wide.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    };
}

impl_narrow_int!(i32, "i32");
impl_narrow_int!(i16, "i16");

impl FromValue for f64 {
    const COERCION: Coercion = Coercion::Raw;
    const EXPECTED: &'static str = "f64";

    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Float(f) => Ok(f),
            Value::Int(i) => Ok(i as f64),
            Value::Text(s) => parse_text(Self::EXPECTED, &s),
            Value::Bytes(b) => parse_text(Self::EXPECTED, &bytes_to_text(Self::EXPECTED, b)?),
            other => Err(mismatch(Self::EXPECTED, &other)),
        }
    }
}

impl FromValue for f32 {
    const COERCION: Coercion = Coercion::Raw;
    const EXPECTED: &'static str = "f32";

    fn from_value(value: Value) -> Result<Self, ValueError> {
        f64::from_value(value).map(|f| f as f32)
    }
}

impl FromValue for bool {
    const COERCION: Coercion = Coercion::Raw;
    const EXPECTED: &'static str = "bool";

    fn from_value(value: Value) -> Result<Self, ValueError> {
        let text = match value {
            Value::Bool(b) => return Ok(b),
            Value::Int(0) => return Ok(false),
            Value::Int(1) => return Ok(true),
            Value::Text(s) => s,
            Value::Bytes(b) => bytes_to_text(Self::EXPECTED, b)?,
            other => return Err(mismatch(Self::EXPECTED, &other)),
        };
        match text.trim().to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(ValueError::Malformed {
                expected: Self::EXPECTED,
                literal: text.clone(),
                reason: "not a boolean literal".to_string(),
            }),
        }
    }
}

impl FromValue for String {
    const COERCION: Coercion = Coercion::Raw;
    const EXPECTED: &'static str = "text";

    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Text(s) => Ok(s),
            Value::Bytes(b) => bytes_to_text(Self::EXPECTED, b),
            Value::Null => Err(ValueError::UnexpectedNull {
                expected: Self::EXPECTED,
            }),
            other => Ok(other.to_string()),
        }
    }
}

impl FromValue for Vec<u8> {
    const COERCION: Coercion = Coercion::Raw;
    const EXPECTED: &'static str = "bytes";

    fn from_value(value: Value) -> Result<Self, ValueError> {
        match value {
            Value::Bytes(b) => Ok(b),
            Value::Text(s) => Ok(s.into_bytes()),
            other => Err(mismatch(Self::EXPECTED, &other)),
        }
    }
}

impl FromValue for Value {
    const COERCION: Coercion = Coercion::Raw;
    const EXPECTED: &'static str = "value";

    fn from_value(value: Value) -> Result<Self, ValueError> {
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Cents(i64);

    impl Assign for Cents {
        fn assign(raw: Value) -> Result<Self, ValueError> {
            let text = String::from_value(raw)?;
            let (units, cents) = text.split_once('.').ok_or_else(|| ValueError::Domain {
                reason: format!("{text} has no decimal point"),
            })?;
            let units: i64 = units.parse().map_err(|_| ValueError::Domain {
                reason: format!("bad units in {text}"),
            })?;
            let cents: i64 = cents.parse().map_err(|_| ValueError::Domain {
                reason: format!("bad cents in {text}"),
            })?;
            Ok(Cents(units * 100 + cents))
        }
    }

    crate::impl_assign!(Cents);

    #[test]
    fn test_domain_coercion_uses_assign() {
        let cents: Cents = coerce("price", Value::Text("12.34".into())).unwrap();
        assert_eq!(cents, Cents(1234));
        assert_eq!(<Cents as FromValue>::COERCION, Coercion::Domain);

        let err = coerce::<Cents>("price", Value::Text("12".into())).unwrap_err();
        assert!(matches!(
            err,
            MapError::Coercion {
                coercion: Coercion::Domain,
                ..
            }
        ));
    }

    #[test]
    fn test_nullable_round_trip() {
        let none: Option<i64> = coerce("n", Value::Null).unwrap();
        assert_eq!(none, None);
        let some: Option<String> = coerce("s", Value::Text("x".into())).unwrap();
        assert_eq!(some.as_deref(), Some("x"));
        assert_eq!(<Option<i64> as FromValue>::COERCION, Coercion::Nullable);
    }

    #[test]
    fn test_null_into_non_nullable_fails() {
        let err = coerce::<i64>("id", Value::Null).unwrap_err();
        assert_eq!(
            err,
            MapError::Coercion {
                column: "id".to_string(),
                coercion: Coercion::Raw,
                source: ValueError::UnexpectedNull { expected: "i64" },
            }
        );
    }

    #[test]
    fn test_uuid_from_text_and_bytes() {
        let id = Uuid::now_v7();
        let from_text: Uuid = coerce("id", Value::Text(id.to_string())).unwrap();
        assert_eq!(from_text, id);
        let from_bytes: Uuid = coerce("id", Value::Bytes(id.as_bytes().to_vec())).unwrap();
        assert_eq!(from_bytes, id);
    }

    #[test]
    fn test_malformed_uuid_fails_loudly() {
        let err = coerce::<Uuid>("id", Value::Text("not-a-uuid".into())).unwrap_err();
        match err {
            MapError::Coercion {
                coercion, source, ..
            } => {
                assert_eq!(coercion, Coercion::Rich);
                assert!(matches!(source, ValueError::Malformed { expected: "uuid", .. }));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_decimal_round_trips_literal() {
        let price: Decimal = coerce("price", Value::Text("12.3400".into())).unwrap();
        assert_eq!(price.to_string(), "12.3400");
        assert_eq!(<Decimal as FromValue>::COERCION, Coercion::Rich);

        let from_bytes: Decimal = coerce("price", Value::Bytes(b"-0.5".to_vec())).unwrap();
        assert_eq!(from_bytes, Decimal::new(-5, 1));

        let reread: Decimal = coerce("price", Value::Text(price.to_string())).unwrap();
        assert_eq!(reread, price);
    }

    #[test]
    fn test_decimal_from_numbers() {
        let whole: Decimal = coerce("n", Value::Int(42)).unwrap();
        assert_eq!(whole, Decimal::from(42));
        let half: Decimal = coerce("n", Value::Float(2.5)).unwrap();
        assert_eq!(half, Decimal::new(25, 1));
        let none: Option<Decimal> = coerce("n", Value::Null).unwrap();
        assert_eq!(none, None);
    }

    #[test]
    fn test_malformed_decimal_fails_loudly() {
        let err = coerce::<Decimal>("price", Value::Text("12.3.4".into())).unwrap_err();
        assert!(matches!(
            err,
            MapError::Coercion {
                coercion: Coercion::Rich,
                source: ValueError::Malformed { expected: "decimal", .. },
                ..
            }
        ));
        assert!(coerce::<Decimal>("price", Value::Float(f64::NAN)).is_err());
        assert!(coerce::<Decimal>("price", Value::Bool(true)).is_err());
    }

    #[test]
    fn test_timestamp_from_rfc3339() {
        let ts: DateTime<Utc> =
            coerce("at", Value::Text("2024-05-01T10:00:00Z".into())).unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn test_bytes_normalised_to_text() {
        let s: String = coerce("name", Value::Bytes(b"alice".to_vec())).unwrap();
        assert_eq!(s, "alice");
    }

    #[test]
    fn test_narrow_int_overflow() {
        let err = coerce::<i16>("small", Value::Int(70_000)).unwrap_err();
        assert!(matches!(
            err,
            MapError::Coercion {
                source: ValueError::Malformed { expected: "i16", .. },
                ..
            }
        ));
        let ok: i32 = coerce("n", Value::Text(" 42 ".into())).unwrap();
        assert_eq!(ok, 42);
    }

    #[test]
    fn test_float_beyond_i64_range_fails() {
        let err = coerce::<i64>("n", Value::Float(9_223_372_036_854_775_808.0)).unwrap_err();
        assert!(matches!(
            err,
            MapError::Coercion {
                source: ValueError::Mismatch { expected: "i64", found: "float" },
                ..
            }
        ));
        let min: i64 = coerce("n", Value::Float(i64::MIN as f64)).unwrap();
        assert_eq!(min, i64::MIN);
        let exact: i64 = coerce("n", Value::Float(4096.0)).unwrap();
        assert_eq!(exact, 4096);
    }

    #[test]
    fn test_bool_literals() {
        assert!(coerce::<bool>("b", Value::Text("t".into())).unwrap());
        assert!(!coerce::<bool>("b", Value::Int(0)).unwrap());
        assert!(coerce::<bool>("b", Value::Text("maybe".into())).is_err());
    }
}
