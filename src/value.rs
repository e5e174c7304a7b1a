//! Column values and the type registry.
//!
//! pgoutput sends every column in text format. Known types are decoded into
//! a tagged [`Value`] so filter and set expressions can compute with them;
//! anything else stays as its raw text. Statements send values back as text
//! parameters cast to the destination column type, so the text form a value
//! renders to must be accepted by PostgreSQL's input functions.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

/// Column values keyed by column name. Ordered, so generated SQL is stable.
pub type Row = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
}

/// Static type of a column, as declared to expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Bool,
    Int,
    Float,
    String,
    Bytes,
    Timestamp,
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Text form for a statement parameter; `None` binds SQL NULL.
    pub fn to_sql_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(if *b { "true" } else { "false" }.to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) if f.is_nan() => Some("NaN".into()),
            Value::Float(f) if f.is_infinite() => {
                Some(if *f > 0.0 { "Infinity" } else { "-Infinity" }.into())
            }
            Value::Float(f) => Some(f.to_string()),
            Value::String(s) => Some(s.clone()),
            Value::Bytes(b) => Some(encode_bytea(b)),
            Value::Timestamp(t) => Some(t.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_sql_text() {
            Some(s) => f.write_str(&s),
            None => f.write_str("null"),
        }
    }
}

// Built-in type oids (pg_type.dat)
pub const BOOL_OID: u32 = 16;
pub const BYTEA_OID: u32 = 17;
pub const INT8_OID: u32 = 20;
pub const INT2_OID: u32 = 21;
pub const INT4_OID: u32 = 23;
pub const TEXT_OID: u32 = 25;
pub const OID_OID: u32 = 26;
pub const FLOAT4_OID: u32 = 700;
pub const FLOAT8_OID: u32 = 701;
pub const VARCHAR_OID: u32 = 1043;
pub const BPCHAR_OID: u32 = 1042;
pub const TIMESTAMP_OID: u32 = 1114;
pub const TIMESTAMPTZ_OID: u32 = 1184;
pub const NUMERIC_OID: u32 = 1700;

/// Registry lookup by catalog type name (`pg_type.typname`).
pub fn type_for_name(name: &str) -> ValueType {
    match name {
        "bool" => ValueType::Bool,
        "int2" | "int4" | "int8" | "oid" => ValueType::Int,
        "float4" | "float8" => ValueType::Float,
        "bytea" => ValueType::Bytes,
        "timestamp" | "timestamptz" => ValueType::Timestamp,
        _ => ValueType::String,
    }
}

/// Decode a text-format column. Values that fail to parse as their declared
/// type are kept as raw text instead of being dropped.
pub fn decode_text(type_oid: u32, raw: &[u8]) -> Value {
    let text = String::from_utf8_lossy(raw);
    let parsed = match type_oid {
        BOOL_OID => match text.as_ref() {
            "t" | "true" => Some(Value::Bool(true)),
            "f" | "false" => Some(Value::Bool(false)),
            _ => None,
        },
        INT2_OID | INT4_OID | INT8_OID | OID_OID => text.parse().ok().map(Value::Int),
        FLOAT4_OID | FLOAT8_OID => text.parse().ok().map(Value::Float),
        BYTEA_OID => decode_bytea(&text).map(Value::Bytes),
        TIMESTAMPTZ_OID => parse_timestamptz(&text).map(Value::Timestamp),
        TIMESTAMP_OID => NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f")
            .ok()
            .map(|t| Value::Timestamp(t.and_utc())),
        _ => None,
    };
    parsed.unwrap_or_else(|| Value::String(text.into_owned()))
}

pub fn parse_timestamptz(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
        .or_else(|_| DateTime::parse_from_rfc3339(text))
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn decode_bytea(text: &str) -> Option<Vec<u8>> {
    let hex = text.strip_prefix("\\x")?;
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

fn encode_bytea(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn decodes_known_types() {
        assert_eq!(decode_text(INT4_OID, b"42"), Value::Int(42));
        assert_eq!(decode_text(BOOL_OID, b"t"), Value::Bool(true));
        assert_eq!(decode_text(FLOAT8_OID, b"1.5"), Value::Float(1.5));
        assert_eq!(decode_text(BYTEA_OID, b"\\x00ff"), Value::Bytes(vec![0, 255]));
        assert_eq!(
            decode_text(NUMERIC_OID, b"12345678901234567890.0001"),
            Value::String("12345678901234567890.0001".into())
        );
    }

    #[test]
    fn decodes_timestamps_with_offsets() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 2, 1, 4, 5).unwrap();
        assert_eq!(
            decode_text(TIMESTAMPTZ_OID, b"2024-01-02 03:04:05+02"),
            Value::Timestamp(expected)
        );
        assert_eq!(
            decode_text(TIMESTAMP_OID, b"2024-01-02 01:04:05"),
            Value::Timestamp(expected)
        );
    }

    #[test]
    fn unknown_or_unparsable_falls_back_to_text() {
        assert_eq!(decode_text(2950, b"a0ee-bc99"), Value::String("a0ee-bc99".into()));
        assert_eq!(decode_text(TIMESTAMPTZ_OID, b"infinity"), Value::String("infinity".into()));
        assert_eq!(decode_text(INT4_OID, b"x"), Value::String("x".into()));
    }

    #[test]
    fn renders_parameters_as_text() {
        assert_eq!(Value::Null.to_sql_text(), None);
        assert_eq!(Value::Bool(false).to_sql_text().as_deref(), Some("false"));
        assert_eq!(Value::Bytes(vec![1, 171]).to_sql_text().as_deref(), Some("\\x01ab"));
        assert_eq!(Value::Float(f64::NEG_INFINITY).to_sql_text().as_deref(), Some("-Infinity"));
        let t = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            Value::Timestamp(t).to_sql_text().as_deref(),
            Some("2024-01-02T03:04:05Z")
        );
    }
}
