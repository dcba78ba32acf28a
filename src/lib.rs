//! # pgsink
//!
//! A schema-evolving PostgreSQL sink for time-series metrics.
//!
//! pgsink ingests batches of semi-structured metric records whose tag and
//! field sets are not known ahead of time, and lands them in one table per
//! measurement. Table shape follows the data: tables are created on first
//! write and widened with new columns as new tags and fields appear, using
//! operator-supplied DDL templates.
//!
//! ## Key features
//!
//! - **Dynamic schema**: create/alter statements are rendered from
//!   templates, so deployments can route DDL through partitioning
//!   extensions or forbid alteration outright
//! - **Tag normalization**: tags can be stored inline, as a single jsonb
//!   column, or factored into a side table keyed by a stable 64-bit tagset
//!   identity with an in-memory admission cache
//! - **Bulk ingest**: rows are streamed with the COPY protocol
//! - **Fault tolerance**: errors are classified as temporary or permanent;
//!   temporary ones retry with capped exponential backoff, permanent ones
//!   drop only the affected sub-batch
//!
//! ## Architecture
//!
//! - **Table manager**: caches table descriptors, reconciles them against
//!   the live catalog, and issues create/alter DDL
//! - **Sources**: restartable row producers that project metric batches
//!   onto the reconciled column set
//! - **Sink**: sequential (single connection, savepoint-isolated) and
//!   concurrent (worker pool) write strategies

pub mod config;
pub mod manager;
pub mod metric;
pub mod schema;
pub mod sink;
pub mod source;
pub mod sqltemplate;
pub mod tags;
pub mod value;

pub mod db;
mod error;

pub use config::SinkConfig;
pub use error::{is_temporary, Error, Result};
pub use metric::{FieldValue, Metric};
pub use sink::PgSink;

use schema::TableIdent;
use tags::TagCache;

/// Immutable configuration plus the process-wide handles shared by the
/// table manager, the row sources, and the write pipeline.
pub struct SinkContext {
    pub config: SinkConfig,
    /// Present only when tags are normalized into tag tables.
    pub tag_cache: Option<TagCache>,
}

impl SinkContext {
    /// Validate `config` and build the shared context.
    pub fn new(config: SinkConfig) -> Result<Self> {
        config.validate()?;
        let tag_cache = if config.tags_as_foreign_keys {
            Some(TagCache::new(config.tag_cache_size))
        } else {
            None
        };
        Ok(Self { config, tag_cache })
    }

    /// Schema-qualified identifier of a measurement's metric table.
    pub fn metric_ident(&self, measurement: &str) -> TableIdent {
        TableIdent::qualified(&self.config.schema, measurement)
    }

    /// Name of a measurement's tag table.
    pub fn tag_table_name(&self, measurement: &str) -> String {
        format!("{}{}", measurement, self.config.tag_table_suffix)
    }

    /// Schema-qualified identifier of a measurement's tag table.
    pub fn tag_ident(&self, measurement: &str) -> TableIdent {
        TableIdent::qualified(&self.config.schema, self.tag_table_name(measurement))
    }
}
