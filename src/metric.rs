//! The metric batch data model
//!
//! A [`Metric`] is one measurement record: a timestamp, a set of string
//! tags identifying the series, and a set of typed field values. Records
//! within a batch need not share tag or field keysets; the sink derives
//! table shape from whatever arrives.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// A typed field value carried by a metric record.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Text(String),
}

impl FieldValue {
    /// JSON representation, used when fields are coalesced into a single
    /// `jsonb` column. Non-finite floats become `null`, as JSON has no
    /// spelling for them.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            FieldValue::Bool(v) => Value::Bool(*v),
            FieldValue::I8(v) => Value::from(*v),
            FieldValue::I16(v) => Value::from(*v),
            FieldValue::I32(v) => Value::from(*v),
            FieldValue::I64(v) => Value::from(*v),
            FieldValue::U8(v) => Value::from(*v),
            FieldValue::U16(v) => Value::from(*v),
            FieldValue::U32(v) => Value::from(*v),
            FieldValue::U64(v) => Value::from(*v),
            FieldValue::F32(v) => serde_json::Number::from_f64(f64::from(*v))
                .map(Value::Number)
                .unwrap_or(Value::Null),
            FieldValue::F64(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            FieldValue::Text(v) => Value::String(v.clone()),
        }
    }
}

macro_rules! impl_from_field_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for FieldValue {
            fn from(v: $ty) -> Self {
                FieldValue::$variant(v)
            }
        })*
    };
}

impl_from_field_value! {
    bool => Bool,
    i8 => I8, i16 => I16, i32 => I32, i64 => I64,
    u8 => U8, u16 => U16, u32 => U32, u64 => U64,
    f32 => F32, f64 => F64,
    String => Text,
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

/// One time-series measurement record.
///
/// Tags and fields are kept in sorted maps so that tagset canonicalization
/// and DDL rendering are deterministic regardless of insertion order.
#[derive(Debug, Clone)]
pub struct Metric {
    measurement: String,
    timestamp: DateTime<Utc>,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
}

impl Metric {
    /// Create a record with no tags or fields.
    pub fn new(measurement: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            timestamp,
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
        }
    }

    /// Attach a tag. Re-adding a tag name replaces its value.
    pub fn with_tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(name.into(), value.into());
        self
    }

    /// Attach a field. Re-adding a field name replaces its value.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// The measurement name; one measurement maps to one metric table.
    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    /// JSON object of all tags, for the single-`jsonb`-column layout.
    pub fn tags_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.tags
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect(),
        )
    }

    /// JSON object of all fields, for the single-`jsonb`-column layout.
    pub fn fields_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}
