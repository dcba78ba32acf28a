//! Schema model for sink-managed tables
//!
//! Defines the semantic column model (roles, Postgres data types, inference
//! from incoming values) and quoted, schema-qualified table identifiers.

mod column;

pub use column::{
    coalesce_types, sort_columns, Column, ColumnRole, PgDataType, FIELDS_JSON_COLUMN,
    TAGS_JSON_COLUMN, TAG_ID_COLUMN, TIME_COLUMN,
};

use std::fmt;

/// A table identifier, optionally schema-qualified.
///
/// Rendering double-quotes each part and doubles embedded quotes, so
/// arbitrary measurement names are safe to splice into DDL and COPY
/// statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableIdent {
    schema: Option<String>,
    table: String,
}

impl TableIdent {
    /// A schema-qualified identifier.
    pub fn qualified(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            table: table.into(),
        }
    }

    /// An unqualified identifier, e.g. for temp tables which live in their
    /// own namespace.
    pub fn bare(table: impl Into<String>) -> Self {
        Self {
            schema: None,
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

impl fmt::Display for TableIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(schema) = &self.schema {
            write!(f, "{}.", quote_ident(schema))?;
        }
        write!(f, "{}", quote_ident(&self.table))
    }
}

/// Double-quote an SQL identifier, doubling any embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    let mut out = String::with_capacity(ident.len() + 2);
    out.push('"');
    for ch in ident.chars() {
        if ch == '"' {
            out.push('"');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualified_identifier_rendering() {
        let ident = TableIdent::qualified("public", "cpu");
        assert_eq!(ident.to_string(), "\"public\".\"cpu\"");
    }

    #[test]
    fn test_bare_identifier_rendering() {
        let ident = TableIdent::bare("cpu_tag_temp");
        assert_eq!(ident.to_string(), "\"cpu_tag_temp\"");
    }

    #[test]
    fn test_embedded_quotes_are_doubled() {
        let ident = TableIdent::qualified("public", "weird\"name");
        assert_eq!(ident.to_string(), "\"public\".\"weird\"\"name\"");
    }
}
