//! Row producers over metric batches
//!
//! A [`TableSource`] adapts one measurement's slice of a write batch into
//! the column-major row sequence the COPY protocol consumes. It is lazy and
//! restartable: the retry loop rewinds it with [`TableSource::reset`] after
//! a failed attempt. Construction scans the batch once to compute the union
//! of observed tag and field columns; the table manager later trims that
//! set down to what the target table can actually hold.

mod tag_table;

pub use tag_table::TagTableSource;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::debug;

use crate::metric::Metric;
use crate::schema::{coalesce_types, Column, ColumnRole, PgDataType};
use crate::tags;
use crate::value::SqlValue;
use crate::SinkContext;

/// Partition a batch by measurement into per-table row sources.
///
/// Records with an empty measurement name cannot be routed to a table and
/// are dropped with a log line.
pub fn partition(ctx: &Arc<SinkContext>, metrics: Vec<Metric>) -> BTreeMap<String, TableSource> {
    let mut sources: BTreeMap<String, TableSource> = BTreeMap::new();
    for metric in metrics {
        if metric.measurement().is_empty() {
            debug!("dropping metric with empty measurement name");
            continue;
        }
        sources
            .entry(metric.measurement().to_string())
            .or_insert_with(|| TableSource::new(ctx.clone(), metric.measurement()))
            .add_metric(metric);
    }
    sources
}

/// A restartable row producer over a single measurement's records.
pub struct TableSource {
    ctx: Arc<SinkContext>,
    name: String,
    metrics: Vec<Metric>,
    cursor: usize,
    /// Union of tag names observed in the batch.
    tag_columns: BTreeSet<String>,
    /// Union of field names observed, with the coalesced column type.
    field_columns: BTreeMap<String, PgDataType>,
    /// Tag columns the target table cannot hold; records carrying them are
    /// skipped entirely, since their series identity cannot be represented.
    dropped_tag_columns: BTreeSet<String>,
    /// The coalesced `tags`/`fields` jsonb columns, when those layouts are
    /// active and the column could not be created.
    tags_dropped: bool,
    fields_dropped: bool,
    /// Distinct tagsets seen in the batch, keyed by tag identity. Only
    /// populated when tags are normalized into a tag table.
    tag_sets: BTreeMap<i64, BTreeMap<String, String>>,
}

impl TableSource {
    fn new(ctx: Arc<SinkContext>, name: &str) -> Self {
        Self {
            ctx,
            name: name.to_string(),
            metrics: Vec::new(),
            cursor: 0,
            tag_columns: BTreeSet::new(),
            field_columns: BTreeMap::new(),
            dropped_tag_columns: BTreeSet::new(),
            tags_dropped: false,
            fields_dropped: false,
            tag_sets: BTreeMap::new(),
        }
    }

    fn add_metric(&mut self, metric: Metric) {
        let config = &self.ctx.config;
        if config.tags_as_foreign_keys {
            let id = tags::tag_id(metric.tags());
            self.tag_sets
                .entry(id)
                .or_insert_with(|| metric.tags().clone());
        }
        for name in metric.tags().keys() {
            self.tag_columns.insert(name.clone());
        }
        for (name, value) in metric.fields() {
            let incoming = Column::from_field(name.clone(), value, config.use_uint8).data_type;
            match self.field_columns.get(name) {
                None => {
                    self.field_columns.insert(name.clone(), incoming);
                }
                Some(existing) => match coalesce_types(existing, &incoming) {
                    Some(merged) => {
                        self.field_columns.insert(name.clone(), merged);
                    }
                    None => {
                        debug!(
                            measurement = %self.name,
                            field = %name,
                            "conflicting types within batch; keeping the later one"
                        );
                        self.field_columns.insert(name.clone(), incoming);
                    }
                },
            }
        }
        self.metrics.push(metric);
    }

    /// The measurement name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the tag table paired with this measurement.
    pub fn tag_table_name(&self) -> String {
        self.ctx.tag_table_name(&self.name)
    }

    /// Rewind to the first record, so a retry can re-drive the producer.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    fn emit_tags_json(&self) -> bool {
        !self.tag_columns.is_empty() && !self.tags_dropped
    }

    fn emit_fields_json(&self) -> bool {
        !self.field_columns.is_empty() && !self.fields_dropped
    }

    fn active_tag_columns(&self) -> impl Iterator<Item = &String> {
        self.tag_columns
            .iter()
            .filter(|name| !self.dropped_tag_columns.contains(*name))
    }

    /// The columns this source emits for the metric table, in DDL order:
    /// time, tag_id, tags, fields.
    pub fn metric_table_columns(&self) -> Vec<Column> {
        let config = &self.ctx.config;
        let mut columns = vec![Column::time()];
        if config.tags_as_foreign_keys {
            columns.push(Column::tag_id());
        } else if config.tags_as_jsonb {
            if self.emit_tags_json() {
                columns.push(Column::tags_json());
            }
        } else {
            for name in self.active_tag_columns() {
                columns.push(Column::from_tag(name.clone()));
            }
        }
        if config.fields_as_jsonb {
            if self.emit_fields_json() {
                columns.push(Column::fields_json());
            }
        } else {
            for (name, data_type) in &self.field_columns {
                columns.push(Column {
                    name: name.clone(),
                    role: ColumnRole::Field,
                    data_type: data_type.clone(),
                });
            }
        }
        columns
    }

    /// The columns this source implies for the tag table: tag_id plus the
    /// tag columns (or the coalesced `tags` jsonb column).
    pub fn tag_table_columns(&self) -> Vec<Column> {
        let mut columns = vec![Column::tag_id()];
        if self.ctx.config.tags_as_jsonb {
            if self.emit_tags_json() {
                columns.push(Column::tags_json());
            }
        } else {
            for name in self.active_tag_columns() {
                columns.push(Column::from_tag(name.clone()));
            }
        }
        columns
    }

    /// Names of the columns [`Iterator::next`] emits, in emission order.
    pub fn column_names(&self) -> Vec<String> {
        self.metric_table_columns()
            .into_iter()
            .map(|c| c.name)
            .collect()
    }

    /// Remove a column this batch wanted but the target table cannot hold.
    pub fn drop_column(&mut self, column: &Column) {
        match column.role {
            ColumnRole::Tag => {
                if self.ctx.config.tags_as_jsonb {
                    self.tags_dropped = true;
                } else {
                    self.dropped_tag_columns.insert(column.name.clone());
                }
            }
            ColumnRole::Field => {
                if self.ctx.config.fields_as_jsonb {
                    self.fields_dropped = true;
                } else {
                    self.field_columns.remove(&column.name);
                }
            }
            // The time and tag_id columns are part of every create template;
            // a table that lacks them failed creation outright.
            ColumnRole::Time | ColumnRole::TagId => {
                debug!(column = %column.name, "ignoring drop of a structural column");
            }
        }
    }

    /// Whether this record carries a tag the target table cannot hold.
    fn skip_record(&self, metric: &Metric) -> bool {
        if self.ctx.config.tags_as_jsonb {
            self.tags_dropped && !metric.tags().is_empty()
        } else {
            metric
                .tags()
                .keys()
                .any(|name| self.dropped_tag_columns.contains(name))
        }
    }

    fn project(&self, metric: &Metric) -> Vec<SqlValue> {
        let config = &self.ctx.config;
        let mut row = Vec::with_capacity(2 + self.tag_columns.len() + self.field_columns.len());
        row.push(SqlValue::Timestamp(metric.timestamp()));
        if config.tags_as_foreign_keys {
            row.push(SqlValue::BigInt(tags::tag_id(metric.tags())));
        } else if config.tags_as_jsonb {
            if self.emit_tags_json() {
                row.push(SqlValue::Json(metric.tags_json()));
            }
        } else {
            for name in self.active_tag_columns() {
                match metric.tags().get(name) {
                    Some(value) => row.push(SqlValue::Text(value.clone())),
                    None => row.push(SqlValue::Null),
                }
            }
        }
        if config.fields_as_jsonb {
            if self.emit_fields_json() {
                row.push(SqlValue::Json(metric.fields_json()));
            }
        } else {
            for name in self.field_columns.keys() {
                match metric.fields().get(name) {
                    Some(value) => row.push(SqlValue::from(value)),
                    None => row.push(SqlValue::Null),
                }
            }
        }
        row
    }

    pub(crate) fn context(&self) -> &Arc<SinkContext> {
        &self.ctx
    }

    pub(crate) fn tag_sets(&self) -> &BTreeMap<i64, BTreeMap<String, String>> {
        &self.tag_sets
    }

    pub(crate) fn tag_set_skipped(&self, tags: &BTreeMap<String, String>) -> bool {
        if self.ctx.config.tags_as_jsonb {
            self.tags_dropped && !tags.is_empty()
        } else {
            tags.keys()
                .any(|name| self.dropped_tag_columns.contains(name))
        }
    }
}

impl Iterator for TableSource {
    type Item = Vec<SqlValue>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.cursor < self.metrics.len() {
            let index = self.cursor;
            self.cursor += 1;
            if self.skip_record(&self.metrics[index]) {
                continue;
            }
            return Some(self.project(&self.metrics[index]));
        }
        None
    }
}
