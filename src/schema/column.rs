//! Column model and type inference
//!
//! Maps incoming metric value kinds to Postgres column types, canonicalizes
//! column roles, and defines the widening rules used when an incoming batch
//! is matched against an existing table.

use crate::metric::FieldValue;

use super::quote_ident;

/// Reserved name of the timestamp column on every metric table.
pub const TIME_COLUMN: &str = "time";
/// Reserved name of the tag-identity column in foreign-key mode.
pub const TAG_ID_COLUMN: &str = "tag_id";
/// Name of the coalesced tag column when `tags_as_jsonb` is set.
pub const TAGS_JSON_COLUMN: &str = "tags";
/// Name of the coalesced field column when `fields_as_jsonb` is set.
pub const FIELDS_JSON_COLUMN: &str = "fields";

/// What a column is for. Determines DDL ordering and how the writer treats
/// a column that turns out to be missing from the target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnRole {
    Time,
    TagId,
    Tag,
    Field,
}

impl ColumnRole {
    /// DDL position: time, tag_id, tags, fields.
    fn position(self) -> u8 {
        match self {
            ColumnRole::Time => 0,
            ColumnRole::TagId => 1,
            ColumnRole::Tag => 2,
            ColumnRole::Field => 3,
        }
    }
}

/// Semantic Postgres column type.
///
/// `Other` carries catalog types outside the model (arrays, user enums, …);
/// they are retained in cached descriptors but never produced by inference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PgDataType {
    Bool,
    SmallInt,
    Integer,
    BigInt,
    Numeric,
    /// Unsigned 64-bit type provided by the pguint extension.
    Uint8,
    Double,
    Text,
    Timestamp,
    Jsonb,
    Other(String),
}

impl PgDataType {
    /// SQL spelling used in rendered DDL.
    pub fn sql(&self) -> &str {
        match self {
            PgDataType::Bool => "boolean",
            PgDataType::SmallInt => "smallint",
            PgDataType::Integer => "integer",
            PgDataType::BigInt => "bigint",
            PgDataType::Numeric => "numeric",
            PgDataType::Uint8 => "uint8",
            PgDataType::Double => "double precision",
            PgDataType::Text => "text",
            PgDataType::Timestamp => "timestamp without time zone",
            PgDataType::Jsonb => "jsonb",
            PgDataType::Other(s) => s,
        }
    }

    /// Map a row of `information_schema.columns` back into the model.
    /// User-defined types (e.g. pguint's `uint8`) hide behind the
    /// `USER-DEFINED` marker and are resolved through `udt_name`.
    pub fn from_catalog(data_type: &str, udt_name: &str) -> Self {
        let name = if data_type.eq_ignore_ascii_case("USER-DEFINED") {
            udt_name
        } else {
            data_type
        };
        match name {
            "boolean" => PgDataType::Bool,
            "smallint" => PgDataType::SmallInt,
            "integer" => PgDataType::Integer,
            "bigint" => PgDataType::BigInt,
            "numeric" => PgDataType::Numeric,
            "uint8" => PgDataType::Uint8,
            "double precision" => PgDataType::Double,
            "text" => PgDataType::Text,
            "timestamp without time zone" => PgDataType::Timestamp,
            "jsonb" => PgDataType::Jsonb,
            other => PgDataType::Other(other.to_string()),
        }
    }

    /// Rank within the signed integer widening chain.
    fn int_rank(&self) -> Option<u8> {
        match self {
            PgDataType::SmallInt => Some(1),
            PgDataType::Integer => Some(2),
            PgDataType::BigInt => Some(3),
            PgDataType::Numeric => Some(4),
            _ => None,
        }
    }

    /// Whether a value of type `incoming` can be stored in an existing
    /// column of type `self` without loss.
    ///
    /// Equal types always satisfy. Within the integer family an existing
    /// wider column accepts a narrower incoming value. `uint8` is only
    /// satisfied by itself or `numeric`; a signed column never accepts it.
    pub fn satisfies(&self, incoming: &PgDataType) -> bool {
        if self == incoming {
            return true;
        }
        if *incoming == PgDataType::Uint8 {
            return *self == PgDataType::Numeric;
        }
        match (self.int_rank(), incoming.int_rank()) {
            (Some(existing), Some(incoming)) => existing >= incoming,
            _ => false,
        }
    }
}

/// A column: name, role, and semantic type. Equality is by all three.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub role: ColumnRole,
    pub data_type: PgDataType,
}

impl Column {
    /// The timestamp column present on every metric table.
    pub fn time() -> Self {
        Self {
            name: TIME_COLUMN.to_string(),
            role: ColumnRole::Time,
            data_type: PgDataType::Timestamp,
        }
    }

    /// The tag-identity column used in foreign-key mode.
    pub fn tag_id() -> Self {
        Self {
            name: TAG_ID_COLUMN.to_string(),
            role: ColumnRole::TagId,
            data_type: PgDataType::BigInt,
        }
    }

    /// A plain tag column. Tag values are always text.
    pub fn from_tag(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: ColumnRole::Tag,
            data_type: PgDataType::Text,
        }
    }

    /// The coalesced `tags` column for the single-jsonb-column layout.
    pub fn tags_json() -> Self {
        Self {
            name: TAGS_JSON_COLUMN.to_string(),
            role: ColumnRole::Tag,
            data_type: PgDataType::Jsonb,
        }
    }

    /// The coalesced `fields` column for the single-jsonb-column layout.
    pub fn fields_json() -> Self {
        Self {
            name: FIELDS_JSON_COLUMN.to_string(),
            role: ColumnRole::Field,
            data_type: PgDataType::Jsonb,
        }
    }

    /// Infer a field column from a value.
    ///
    /// `use_uint8` selects the pguint extension type for unsigned 64-bit
    /// values instead of `numeric`.
    pub fn from_field(name: impl Into<String>, value: &FieldValue, use_uint8: bool) -> Self {
        let data_type = match value {
            FieldValue::Bool(_) => PgDataType::Bool,
            FieldValue::I8(_) | FieldValue::I16(_) => PgDataType::SmallInt,
            FieldValue::I32(_) => PgDataType::Integer,
            FieldValue::I64(_) => PgDataType::BigInt,
            FieldValue::U8(_) => PgDataType::SmallInt,
            FieldValue::U16(_) => PgDataType::Integer,
            FieldValue::U32(_) => PgDataType::BigInt,
            FieldValue::U64(_) => {
                if use_uint8 {
                    PgDataType::Uint8
                } else {
                    PgDataType::Numeric
                }
            }
            FieldValue::F32(_) | FieldValue::F64(_) => PgDataType::Double,
            FieldValue::Text(_) => PgDataType::Text,
        };
        Self {
            name: name.into(),
            role: ColumnRole::Field,
            data_type,
        }
    }

    /// The `"name" type` fragment used in rendered DDL.
    pub fn definition(&self) -> String {
        format!("{} {}", quote_ident(&self.name), self.data_type.sql())
    }
}

/// Merge two types observed for the same column name within one batch.
/// Compatible integer-family types coalesce to the wider; `None` means the
/// types conflict and the caller picks a winner.
pub fn coalesce_types(a: &PgDataType, b: &PgDataType) -> Option<PgDataType> {
    if a == b {
        return Some(a.clone());
    }
    if a.satisfies(b) {
        return Some(a.clone());
    }
    if b.satisfies(a) {
        return Some(b.clone());
    }
    None
}

/// Sort columns into deterministic DDL order: time, tag_id, tags, fields,
/// alphabetical within each role.
pub fn sort_columns(columns: &mut [Column]) {
    columns.sort_by(|a, b| {
        a.role
            .position()
            .cmp(&b.role.position())
            .then_with(|| a.name.cmp(&b.name))
    });
}
