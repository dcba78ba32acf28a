//! Cell values and text-format COPY encoding
//!
//! Row producers emit [`SqlValue`] cells; the writer streams them to the
//! server through `COPY ... FROM STDIN` in text format. Text format keeps
//! the encoder uniform across every column type the sink can create,
//! including `numeric`/`uint8` fields and `jsonb` payloads.

use bytes::BytesMut;
use chrono::{DateTime, Utc};

use crate::metric::FieldValue;

/// A single cell bound for the database.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    SmallInt(i16),
    Integer(i32),
    BigInt(i64),
    UBigInt(u64),
    Double(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl From<&FieldValue> for SqlValue {
    fn from(v: &FieldValue) -> Self {
        match v {
            FieldValue::Bool(v) => SqlValue::Bool(*v),
            FieldValue::I8(v) => SqlValue::SmallInt(i16::from(*v)),
            FieldValue::I16(v) => SqlValue::SmallInt(*v),
            FieldValue::I32(v) => SqlValue::Integer(*v),
            FieldValue::I64(v) => SqlValue::BigInt(*v),
            FieldValue::U8(v) => SqlValue::SmallInt(i16::from(*v)),
            FieldValue::U16(v) => SqlValue::Integer(i32::from(*v)),
            FieldValue::U32(v) => SqlValue::BigInt(i64::from(*v)),
            FieldValue::U64(v) => SqlValue::UBigInt(*v),
            FieldValue::F32(v) => SqlValue::Double(f64::from(*v)),
            FieldValue::F64(v) => SqlValue::Double(*v),
            FieldValue::Text(v) => SqlValue::Text(v.clone()),
        }
    }
}

/// Append one row to `buf` as a text-format COPY line: tab-separated cells
/// terminated by a newline.
pub fn encode_row(buf: &mut BytesMut, row: &[SqlValue]) {
    let mut line = String::with_capacity(row.len() * 8);
    for (i, cell) in row.iter().enumerate() {
        if i > 0 {
            line.push('\t');
        }
        encode_cell(&mut line, cell);
    }
    line.push('\n');
    buf.extend_from_slice(line.as_bytes());
}

fn encode_cell(out: &mut String, value: &SqlValue) {
    match value {
        SqlValue::Null => out.push_str("\\N"),
        SqlValue::Bool(true) => out.push('t'),
        SqlValue::Bool(false) => out.push('f'),
        SqlValue::SmallInt(v) => out.push_str(&v.to_string()),
        SqlValue::Integer(v) => out.push_str(&v.to_string()),
        SqlValue::BigInt(v) => out.push_str(&v.to_string()),
        SqlValue::UBigInt(v) => out.push_str(&v.to_string()),
        SqlValue::Double(v) => encode_double(out, *v),
        SqlValue::Text(v) => escape_text(out, v),
        SqlValue::Timestamp(v) => {
            out.push_str(&v.naive_utc().format("%Y-%m-%d %H:%M:%S%.6f").to_string());
        }
        SqlValue::Json(v) => {
            // Compact JSON contains no raw control characters, but string
            // values may hold backslashes that COPY would interpret.
            escape_text(out, &v.to_string());
        }
    }
}

fn encode_double(out: &mut String, v: f64) {
    if v.is_nan() {
        out.push_str("NaN");
    } else if v == f64::INFINITY {
        out.push_str("Infinity");
    } else if v == f64::NEG_INFINITY {
        out.push_str("-Infinity");
    } else {
        out.push_str(&v.to_string());
    }
}

/// Escape a string cell for text-format COPY. Backslash and the row/cell
/// delimiters must be escaped; all other bytes pass through verbatim.
fn escape_text(out: &mut String, s: &str) {
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(ch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn encode(row: &[SqlValue]) -> String {
        let mut buf = BytesMut::new();
        encode_row(&mut buf, row);
        String::from_utf8(buf.to_vec()).unwrap()
    }

    #[test]
    fn test_basic_row() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let row = vec![
            SqlValue::Timestamp(ts),
            SqlValue::Text("host1".into()),
            SqlValue::BigInt(-42),
        ];
        assert_eq!(encode(&row), "2024-05-01 12:30:00.000000\thost1\t-42\n");
    }

    #[test]
    fn test_null_and_bool_cells() {
        let row = vec![SqlValue::Null, SqlValue::Bool(true), SqlValue::Bool(false)];
        assert_eq!(encode(&row), "\\N\tt\tf\n");
    }

    #[test]
    fn test_unsigned_64_round_trips_as_decimal_text() {
        let row = vec![SqlValue::UBigInt(u64::MAX)];
        assert_eq!(encode(&row), format!("{}\n", u64::MAX));
    }

    #[test]
    fn test_text_escaping() {
        let row = vec![SqlValue::Text("a\\b\tc\nd\re".into())];
        assert_eq!(encode(&row), "a\\\\b\\tc\\nd\\re\n");
    }

    #[test]
    fn test_non_finite_doubles() {
        assert_eq!(encode(&[SqlValue::Double(f64::NAN)]), "NaN\n");
        assert_eq!(encode(&[SqlValue::Double(f64::INFINITY)]), "Infinity\n");
        assert_eq!(
            encode(&[SqlValue::Double(f64::NEG_INFINITY)]),
            "-Infinity\n"
        );
    }

    #[test]
    fn test_json_cell_is_escaped() {
        let row = vec![SqlValue::Json(serde_json::json!({"k": "a\\b"}))];
        assert_eq!(encode(&row), "{\"k\":\"a\\\\\\\\b\"}\n");
    }

    #[test]
    fn test_field_value_conversion() {
        assert_eq!(SqlValue::from(&FieldValue::U8(7)), SqlValue::SmallInt(7));
        assert_eq!(SqlValue::from(&FieldValue::U32(7)), SqlValue::BigInt(7));
        assert_eq!(SqlValue::from(&FieldValue::F32(0.5)), SqlValue::Double(0.5));
    }
}
