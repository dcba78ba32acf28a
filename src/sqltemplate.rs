//! DDL templates
//!
//! Table creation and alteration statements are user-supplied templates so
//! that deployments can route DDL through partitioning extensions, add
//! indexes, or disable alteration entirely. A template is opaque to the
//! rest of the crate: it is given a render context and returns SQL text.
//!
//! Placeholders:
//!
//! * `{{table}}`: the table being created or altered
//! * `{{columns}}`: the column list relevant to this statement (all desired
//!   columns for a create, only the missing ones for an alter)
//! * `{{allColumns}}`: the full desired column list
//! * `{{metricTable}}` / `{{tagTable}}`: the measurement table and its tag
//!   table, for templates that cross-reference them
//!
//! Column lists render as `"name" type` definitions joined with `", "` by
//! default; `{{columns|join ", ADD COLUMN IF NOT EXISTS "}}` overrides the
//! separator.

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::schema::{Column, TableIdent};

/// A parsed DDL template.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "String")]
pub struct Template {
    source: String,
    parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Literal(String),
    Placeholder { name: String, join: Option<String> },
}

/// Everything a template may reference. The same context shape is passed to
/// create and alter templates alike.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    /// The table this statement touches.
    pub table: &'a TableIdent,
    /// Columns relevant to this statement.
    pub columns: &'a [Column],
    /// The full desired column set.
    pub all_columns: &'a [Column],
    /// The metric table of the measurement being written.
    pub metric_table: &'a TableIdent,
    /// The tag table, when tags are normalized into one.
    pub tag_table: Option<&'a TableIdent>,
}

impl Template {
    /// Parse a template. Parsing is total: text that does not form a
    /// well-shaped `{{...}}` placeholder is kept as a literal, and errors
    /// (unknown placeholder names) surface at render time.
    pub fn parse(source: &str) -> Self {
        let mut parts = Vec::new();
        let mut rest = source;
        let mut literal = String::new();
        while let Some(start) = rest.find("{{") {
            let after = &rest[start + 2..];
            match after.find("}}") {
                Some(end) => {
                    literal.push_str(&rest[..start]);
                    match parse_placeholder(&after[..end]) {
                        Some(part) => {
                            if !literal.is_empty() {
                                parts.push(Part::Literal(std::mem::take(&mut literal)));
                            }
                            parts.push(part);
                        }
                        None => {
                            // Not a recognizable placeholder; keep verbatim.
                            literal.push_str(&rest[start..start + 2 + end + 2]);
                        }
                    }
                    rest = &after[end + 2..];
                }
                None => break,
            }
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }
        Self {
            source: source.to_string(),
            parts,
        }
    }

    /// The original template text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Render the template against `ctx`.
    pub fn render(&self, ctx: &TemplateContext<'_>) -> Result<String> {
        let mut out = String::with_capacity(self.source.len());
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Placeholder { name, join } => {
                    render_placeholder(&mut out, name, join.as_deref(), ctx)?
                }
            }
        }
        Ok(out)
    }
}

fn parse_placeholder(body: &str) -> Option<Part> {
    let body = body.trim();
    let (name, filter) = match body.split_once('|') {
        Some((name, filter)) => (name.trim(), Some(filter.trim())),
        None => (body, None),
    };
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    let join = match filter {
        None => None,
        Some(f) => Some(parse_join(f)?),
    };
    Some(Part::Placeholder {
        name: name.to_string(),
        join,
    })
}

fn parse_join(filter: &str) -> Option<String> {
    let rest = filter.strip_prefix("join")?.trim_start();
    let rest = rest.strip_prefix('"')?;
    let end = rest.rfind('"')?;
    Some(rest[..end].to_string())
}

fn render_placeholder(
    out: &mut String,
    name: &str,
    join: Option<&str>,
    ctx: &TemplateContext<'_>,
) -> Result<()> {
    match name {
        "table" => out.push_str(&ctx.table.to_string()),
        "metricTable" => out.push_str(&ctx.metric_table.to_string()),
        "tagTable" => match ctx.tag_table {
            Some(ident) => out.push_str(&ident.to_string()),
            None => {
                return Err(Error::Template(
                    "{{tagTable}} referenced but tags are not stored in a tag table".to_string(),
                ))
            }
        },
        "columns" => push_columns(out, ctx.columns, join),
        "allColumns" => push_columns(out, ctx.all_columns, join),
        other => {
            return Err(Error::Template(format!(
                "unknown placeholder {{{{{other}}}}}"
            )))
        }
    }
    Ok(())
}

fn push_columns(out: &mut String, columns: &[Column], join: Option<&str>) {
    let sep = join.unwrap_or(", ");
    for (i, col) in columns.iter().enumerate() {
        if i > 0 {
            out.push_str(sep);
        }
        out.push_str(&col.definition());
    }
}

impl From<String> for Template {
    fn from(source: String) -> Self {
        Template::parse(&source)
    }
}
