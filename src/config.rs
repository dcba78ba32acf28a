//! Sink configuration
//!
//! All options accepted by the sink, deserializable from TOML. Missing
//! options take the documented defaults; `validate` catches the
//! combinations that cannot work before any connection is attempted.
//! See `pgsink.sample.toml` at the repository root for a commented example.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};
use crate::sqltemplate::Template;

/// Default statement for creating a metric table.
pub const CREATE_TABLE_TEMPLATE: &str = "CREATE TABLE {{table}} ({{columns}})";
/// Default statement for adding columns to a metric or tag table.
pub const ADD_COLUMN_TEMPLATE: &str =
    "ALTER TABLE {{table}} ADD COLUMN IF NOT EXISTS {{columns|join \", ADD COLUMN IF NOT EXISTS \"}}";
/// Default statement for creating a tag table.
pub const TAG_TABLE_CREATE_TEMPLATE: &str =
    "CREATE TABLE {{table}} ({{columns}}, PRIMARY KEY (tag_id))";

/// Driver log verbosity requested by the operator. The crate emits through
/// `tracing`; the embedding application is expected to translate this into
/// its subscriber filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    None,
}

impl LogLevel {
    /// The corresponding `tracing` level, or `None` to silence.
    pub fn as_level(self) -> Option<tracing::Level> {
        match self {
            LogLevel::Trace => Some(tracing::Level::TRACE),
            LogLevel::Debug => Some(tracing::Level::DEBUG),
            LogLevel::Info => Some(tracing::Level::INFO),
            LogLevel::Warn => Some(tracing::Level::WARN),
            LogLevel::Error => Some(tracing::Level::ERROR),
            LogLevel::None => None,
        }
    }
}

/// Configuration for the PostgreSQL sink.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SinkConfig {
    /// libpq-style connection string or URL. All parameters are optional;
    /// libpq environment variables (PGHOST, PGUSER, ...) are honored by the
    /// driver.
    pub connection: String,
    /// Postgres schema all tables live in.
    pub schema: String,
    /// Normalize tags into a side table keyed by tag_id.
    pub tags_as_foreign_keys: bool,
    /// Suffix appended to the measurement name to form the tag table name.
    pub tag_table_suffix: String,
    /// Fail the sub-batch when tag rows cannot be inserted, instead of
    /// logging and carrying on.
    pub foreign_tag_constraint: bool,
    /// Store all tags in a single `tags` jsonb column.
    pub tags_as_jsonb: bool,
    /// Store all fields in a single `fields` jsonb column.
    pub fields_as_jsonb: bool,
    /// Statements executed when creating a metric table.
    pub create_templates: Vec<Template>,
    /// Statements executed when adding columns to a metric table. An empty
    /// list disables alteration: new tags skip the affected records, new
    /// fields are omitted.
    pub add_column_templates: Vec<Template>,
    /// Statements executed when creating a tag table.
    pub tag_table_create_templates: Vec<Template>,
    /// Statements executed when adding columns to a tag table. An empty
    /// list disables alteration.
    pub tag_table_add_column_templates: Vec<Template>,
    /// Use the `uint8` type from the pguint extension for unsigned 64-bit
    /// fields instead of `numeric`.
    pub use_uint8: bool,
    /// Cap on the exponential backoff between retries of temporary errors,
    /// in seconds.
    #[serde(deserialize_with = "de_duration_secs")]
    pub retry_max_backoff: Duration,
    /// Approximate entry count of the in-memory tag admission cache.
    pub tag_cache_size: u64,
    /// Driver log verbosity.
    pub log_level: LogLevel,
    /// Maximum size of the connection pool. Defaults to 1, which keeps all
    /// writes on a single connection and schema changes strictly serialized
    /// within this process; larger values enable the concurrent write path.
    pub pool_max_conns: Option<u32>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            connection: String::new(),
            schema: "public".to_string(),
            tags_as_foreign_keys: false,
            tag_table_suffix: "_tag".to_string(),
            foreign_tag_constraint: false,
            tags_as_jsonb: false,
            fields_as_jsonb: false,
            create_templates: vec![Template::parse(CREATE_TABLE_TEMPLATE)],
            add_column_templates: vec![Template::parse(ADD_COLUMN_TEMPLATE)],
            tag_table_create_templates: vec![Template::parse(TAG_TABLE_CREATE_TEMPLATE)],
            tag_table_add_column_templates: vec![Template::parse(ADD_COLUMN_TEMPLATE)],
            use_uint8: false,
            retry_max_backoff: Duration::from_secs(15),
            tag_cache_size: 100_000,
            log_level: LogLevel::Warn,
            pool_max_conns: None,
        }
    }
}

impl SinkConfig {
    /// Check option values and combinations. Called by the sink on connect;
    /// exposed so embedders can fail fast at load time.
    pub fn validate(&self) -> Result<()> {
        if let Err(e) = self.connection.parse::<tokio_postgres::Config>() {
            return Err(Error::Config(format!("connection: {e}")));
        }
        if self.schema.is_empty() {
            return Err(Error::Config("schema must not be empty".to_string()));
        }
        if self.tags_as_foreign_keys && self.tag_table_suffix.is_empty() {
            return Err(Error::Config(
                "tag_table_suffix must not be empty when tags_as_foreign_keys is set".to_string(),
            ));
        }
        if self.tag_cache_size == 0 {
            return Err(Error::Config(
                "tag_cache_size must be positive".to_string(),
            ));
        }
        if self.pool_max_conns == Some(0) {
            return Err(Error::Config(
                "pool_max_conns must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective pool size; the driver-typical default of 4 is deliberately
    /// not used, so an unconfigured sink writes sequentially.
    pub fn effective_pool_size(&self) -> u32 {
        self.pool_max_conns.unwrap_or(1)
    }
}

fn de_duration_secs<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Secs {
        Int(u64),
        Float(f64),
    }
    match Secs::deserialize(deserializer)? {
        Secs::Int(s) => Ok(Duration::from_secs(s)),
        Secs::Float(s) if s.is_finite() && s >= 0.0 => Ok(Duration::from_secs_f64(s)),
        Secs::Float(_) => Err(serde::de::Error::custom(
            "retry_max_backoff must be a non-negative number of seconds",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SinkConfig::default();
        assert_eq!(config.schema, "public");
        assert_eq!(config.tag_table_suffix, "_tag");
        assert_eq!(config.retry_max_backoff, Duration::from_secs(15));
        assert_eq!(config.tag_cache_size, 100_000);
        assert_eq!(config.log_level, LogLevel::Warn);
        assert_eq!(config.effective_pool_size(), 1);
        assert_eq!(config.create_templates.len(), 1);
        assert_eq!(config.add_column_templates.len(), 1);
        assert_eq!(config.tag_table_create_templates.len(), 1);
        assert_eq!(config.tag_table_add_column_templates.len(), 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_toml_round_trip() {
        let config: SinkConfig = toml::from_str(
            r#"
            connection = "host=localhost user=metrics dbname=telemetry"
            schema = "telemetry"
            tags_as_foreign_keys = true
            foreign_tag_constraint = true
            tag_table_suffix = "_tags"
            retry_max_backoff = 30
            tag_cache_size = 5000
            log_level = "debug"
            pool_max_conns = 4
            create_templates = [
                'CREATE TABLE {{table}} ({{columns}})',
                'CREATE INDEX ON {{table}} (time)',
            ]
            "#,
        )
        .unwrap();
        assert!(config.tags_as_foreign_keys);
        assert_eq!(config.schema, "telemetry");
        assert_eq!(config.tag_table_suffix, "_tags");
        assert_eq!(config.retry_max_backoff, Duration::from_secs(30));
        assert_eq!(config.tag_cache_size, 5000);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.effective_pool_size(), 4);
        assert_eq!(config.create_templates.len(), 2);
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_template_list_is_preserved() {
        // An explicitly empty list disables alteration; it must not be
        // replaced by the default.
        let config: SinkConfig = toml::from_str("add_column_templates = []").unwrap();
        assert!(config.add_column_templates.is_empty());
    }

    #[test]
    fn test_fractional_backoff() {
        let config: SinkConfig = toml::from_str("retry_max_backoff = 0.5").unwrap();
        assert_eq!(config.retry_max_backoff, Duration::from_millis(500));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(toml::from_str::<SinkConfig>("log_level = \"loud\"").is_err());
        assert!(toml::from_str::<SinkConfig>("no_such_option = 1").is_err());

        let config: SinkConfig = toml::from_str("tag_cache_size = 0").unwrap();
        assert!(config.validate().is_err());

        let config: SinkConfig = toml::from_str("pool_max_conns = 0").unwrap();
        assert!(config.validate().is_err());

        let config: SinkConfig = toml::from_str("connection = \"host localhost\"").unwrap();
        assert!(config.validate().is_err());

        let config: SinkConfig =
            toml::from_str("tags_as_foreign_keys = true\ntag_table_suffix = \"\"").unwrap();
        assert!(config.validate().is_err());
    }
}
