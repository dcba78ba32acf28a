//! Tag-table rows derived from a table source
//!
//! When tags are normalized, each distinct tagset in a batch becomes one
//! candidate row `(tag_id, tag columns…)` for the measurement's tag table.
//! Tagsets the admission cache already knows are suppressed; the rest are
//! merged with `ON CONFLICT DO NOTHING`, and only after that transaction
//! commits are their identities published to the cache.

use crate::value::SqlValue;

use super::TableSource;

/// Deduplicated `(tag_id, tags…)` row producer for one batch.
pub struct TagTableSource<'a> {
    src: &'a TableSource,
    /// Candidate tag identities, ascending. Tagsets carrying a dropped tag
    /// column are excluded: their records are skipped by the parent source,
    /// so persisting their identity would record a series that never lands.
    ids: Vec<i64>,
    cursor: usize,
}

impl<'a> TagTableSource<'a> {
    pub fn new(src: &'a TableSource) -> Self {
        let ids = src
            .tag_sets()
            .iter()
            .filter(|(_, tags)| !src.tag_set_skipped(tags))
            .map(|(id, _)| *id)
            .collect();
        Self {
            src,
            ids,
            cursor: 0,
        }
    }

    /// Name of the tag table these rows target.
    pub fn name(&self) -> String {
        self.src.tag_table_name()
    }

    /// Names of the emitted columns, in emission order.
    pub fn column_names(&self) -> Vec<String> {
        self.src
            .tag_table_columns()
            .into_iter()
            .map(|c| c.name)
            .collect()
    }

    /// Whether any row would currently be emitted.
    pub fn has_rows(&self) -> bool {
        self.ids.iter().any(|id| !self.admitted(*id))
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Publish every candidate identity to the admission cache. Call only
    /// after the insert transaction has committed.
    pub fn update_cache(&self) {
        if let Some(cache) = &self.src.context().tag_cache {
            for id in &self.ids {
                cache.admit(*id);
            }
        }
    }

    fn admitted(&self, id: i64) -> bool {
        match &self.src.context().tag_cache {
            Some(cache) => cache.admitted(id),
            None => false,
        }
    }

    fn project(&self, id: i64) -> Option<Vec<SqlValue>> {
        let tags = self.src.tag_sets().get(&id)?;
        let mut row = Vec::with_capacity(1 + tags.len());
        row.push(SqlValue::BigInt(id));
        if self.src.context().config.tags_as_jsonb {
            row.push(SqlValue::Json(serde_json::Value::Object(
                tags.iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                    .collect(),
            )));
        } else {
            for name in self.src.active_tag_columns() {
                match tags.get(name) {
                    Some(value) => row.push(SqlValue::Text(value.clone())),
                    None => row.push(SqlValue::Null),
                }
            }
        }
        Some(row)
    }
}

impl Iterator for TagTableSource<'_> {
    type Item = Vec<SqlValue>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.cursor < self.ids.len() {
            let id = self.ids[self.cursor];
            self.cursor += 1;
            if self.admitted(id) {
                continue;
            }
            if let Some(row) = self.project(id) {
                return Some(row);
            }
        }
        None
    }
}
