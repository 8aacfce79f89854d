//! Serialized row blob codec.
//!
//! A blob is the concatenation of row encodings in consumption order. A row
//! is its field texts joined by [`FIELD_SEPARATOR`] and terminated by
//! [`ROW_SEPARATOR`]. Separators and the escape byte inside a field are
//! prefixed with [`ESCAPE`].

use crate::error::CacheError;
use crate::value::Value;

pub const FIELD_SEPARATOR: u8 = b',';
pub const ROW_SEPARATOR: u8 = b';';
pub const ESCAPE: u8 = b'\\';

fn push_escaped(out: &mut Vec<u8>, field: &[u8]) {
    for &b in field {
        if b == FIELD_SEPARATOR || b == ROW_SEPARATOR || b == ESCAPE {
            out.push(ESCAPE);
        }
        out.push(b);
    }
}

/// Append the encoding of one row to `out`.
///
/// Fails without touching `out` when the row width differs from the
/// number of result columns.
pub fn encode_row(out: &mut Vec<u8>, column_count: usize, row: &[Value]) -> Result<(), CacheError> {
    if row.len() != column_count {
        return Err(CacheError::EncodeFailed {
            reason: format!(
                "row has {} values but the result set has {} columns",
                row.len(),
                column_count
            ),
        });
    }

    for (i, value) in row.iter().enumerate() {
        if i > 0 {
            out.push(FIELD_SEPARATOR);
        }
        push_escaped(out, value.to_string().as_bytes());
    }
    out.push(ROW_SEPARATOR);
    Ok(())
}

/// Split a blob back into rows of field texts.
pub fn decode_blob(blob: &[u8]) -> Result<Vec<Vec<String>>, CacheError> {
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut field: Vec<u8> = Vec::new();
    let mut escaped = false;

    let finish_field = |field: &mut Vec<u8>| -> Result<String, CacheError> {
        String::from_utf8(std::mem::take(field)).map_err(|e| CacheError::MalformedBlob {
            reason: e.to_string(),
        })
    };

    for &b in blob {
        if escaped {
            field.push(b);
            escaped = false;
            continue;
        }
        match b {
            ESCAPE => escaped = true,
            FIELD_SEPARATOR => row.push(finish_field(&mut field)?),
            ROW_SEPARATOR => {
                row.push(finish_field(&mut field)?);
                rows.push(std::mem::take(&mut row));
            }
            _ => field.push(b),
        }
    }

    if escaped || !field.is_empty() || !row.is_empty() {
        return Err(CacheError::MalformedBlob {
            reason: "blob does not end with a row separator".to_string(),
        });
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_rows_in_order() {
        let mut blob = Vec::new();
        encode_row(&mut blob, 2, &[Value::Int(1), Value::Text("a".into())]).unwrap();
        encode_row(&mut blob, 2, &[Value::Int(2), Value::Text("b".into())]).unwrap();
        assert_eq!(blob, b"1,a;2,b;");
    }

    #[test]
    fn test_width_mismatch_leaves_buffer_untouched() {
        let mut blob = b"1,a;".to_vec();
        let err = encode_row(&mut blob, 3, &[Value::Int(1)]).unwrap_err();
        assert!(matches!(err, CacheError::EncodeFailed { .. }));
        assert_eq!(blob, b"1,a;");
    }

    #[test]
    fn test_separators_are_escaped() {
        let mut blob = Vec::new();
        encode_row(&mut blob, 2, &[Value::Text("a,b;c\\".into()), Value::Null]).unwrap();
        assert_eq!(blob, b"a\\,b\\;c\\\\,;");
        let rows = decode_blob(&blob).unwrap();
        assert_eq!(rows, vec![vec!["a,b;c\\".to_string(), String::new()]]);
    }

    #[test]
    fn test_truncated_blob_is_malformed() {
        assert!(decode_blob(b"1,a;2,").is_err());
        assert_eq!(decode_blob(b"").unwrap(), Vec::<Vec<String>>::new());
    }

    proptest! {
        #[test]
        fn prop_text_fields_survive_the_blob(
            rows in prop::collection::vec(prop::collection::vec(".{0,12}", 3), 0..8)
        ) {
            let mut blob = Vec::new();
            for row in &rows {
                let values: Vec<Value> = row.iter().cloned().map(Value::Text).collect();
                encode_row(&mut blob, 3, &values).unwrap();
            }
            prop_assert_eq!(decode_blob(&blob).unwrap(), rows);
        }
    }
}
