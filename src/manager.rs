//! The table manager: schema reconciliation
//!
//! Matches an incoming batch's shape against cached and database-observed
//! table schemas, issues create/alter DDL through the configured templates,
//! and decides which columns must be dropped from a batch when alteration
//! is forbidden or fails.
//!
//! Descriptors are cached per table. The outer table→descriptor map is a
//! concurrent read-mostly map; each descriptor carries its own async lock
//! held for the duration of a reconciliation, so two workers writing the
//! same measurement cannot issue duplicate DDL while distinct tables
//! reconcile independently.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::db::DbHandle;
use crate::error::{is_temporary, Error, Result};
use crate::schema::{
    sort_columns, Column, ColumnRole, PgDataType, TableIdent, TAG_ID_COLUMN, TIME_COLUMN,
};
use crate::source::TableSource;
use crate::sqltemplate::{Template, TemplateContext};
use crate::SinkContext;

const COLUMNS_QUERY: &str = "SELECT column_name, data_type, udt_name \
     FROM information_schema.columns WHERE table_schema = $1 AND table_name = $2";

/// Cached descriptor of one database table.
#[derive(Debug, Default)]
struct TableState {
    /// Columns known to exist, by name. Superset of any one batch's needs:
    /// live-catalog columns outside the desired set are retained.
    columns: HashMap<String, Column>,
    /// Whether `columns` has been populated from the live catalog since
    /// process start or the last cache clear. Failed DDL resets this so a
    /// retried transaction re-reads the catalog and observes whatever a
    /// concurrent writer managed to create.
    fetched: bool,
    /// Bumped on every observed mutation.
    version: u64,
}

/// Schema cache and reconciliation engine.
pub struct TableManager {
    ctx: Arc<SinkContext>,
    tables: DashMap<String, Arc<Mutex<TableState>>>,
}

impl TableManager {
    pub fn new(ctx: Arc<SinkContext>) -> Self {
        Self {
            ctx,
            tables: DashMap::new(),
        }
    }

    /// Reconcile the table(s) required by `src` with the database.
    ///
    /// On return, either the database holds every column the source wants
    /// to emit, or the source's column set has been trimmed to the columns
    /// that actually exist. Fails only when a required table cannot be
    /// created or a temporary error asks the caller to retry.
    pub async fn match_source<D: DbHandle>(&self, db: &mut D, src: &mut TableSource) -> Result<()> {
        let config = &self.ctx.config;
        let metric_table = self.ctx.metric_ident(src.name());
        let tag_table = config
            .tags_as_foreign_keys
            .then(|| self.ctx.tag_ident(src.name()));

        if let Some(tag_ident) = &tag_table {
            let tag_table_name = src.tag_table_name();
            let desired = src.tag_table_columns();
            let missing = self
                .ensure_structure(
                    db,
                    &tag_table_name,
                    &desired,
                    &config.tag_table_create_templates,
                    &config.tag_table_add_column_templates,
                    &metric_table,
                    Some(tag_ident),
                )
                .await?;
            if !missing.is_empty() {
                let described = describe_columns(&missing);
                for col in &missing {
                    src.drop_column(col);
                }
                error!(
                    table = %tag_table_name,
                    columns = %described,
                    "table is missing tag columns; dropping affected metrics"
                );
            }
        }

        let desired = src.metric_table_columns();
        let missing = self
            .ensure_structure(
                db,
                src.name(),
                &desired,
                &config.create_templates,
                &config.add_column_templates,
                &metric_table,
                tag_table.as_ref(),
            )
            .await?;
        if !missing.is_empty() {
            let described = describe_columns(&missing);
            for col in &missing {
                src.drop_column(col);
            }
            error!(
                table = %src.name(),
                columns = %described,
                "table is missing columns; omitting fields"
            );
        }
        Ok(())
    }

    /// Bring `table_name` up to `desired` shape, or report what could not
    /// be done.
    ///
    /// Returns the columns that remain missing after reconciliation; the
    /// caller is expected to trim them from the batch. An empty add-column
    /// template list means alteration is forbidden, which is not an error.
    /// A table that does not exist and cannot be created is.
    #[allow(clippy::too_many_arguments)]
    pub async fn ensure_structure<D: DbHandle>(
        &self,
        db: &mut D,
        table_name: &str,
        desired: &[Column],
        create_templates: &[Template],
        add_column_templates: &[Template],
        metric_table: &TableIdent,
        tag_table: Option<&TableIdent>,
    ) -> Result<Vec<Column>> {
        let state = self.table_state(table_name);
        let mut tbl = state.lock().await;

        let mut missing = missing_columns(&tbl.columns, desired);
        if missing.is_empty() {
            return Ok(Vec::new());
        }

        // The cache may simply be cold; check the live catalog before
        // issuing DDL.
        if !tbl.fetched {
            tbl.columns = self.fetch_columns(db, table_name).await?;
            tbl.fetched = true;
            tbl.version += 1;
            missing = missing_columns(&tbl.columns, desired);
            if missing.is_empty() {
                return Ok(Vec::new());
            }
        }

        let creating = tbl.columns.is_empty();
        let templates = if creating {
            if create_templates.is_empty() {
                return Err(Error::Schema {
                    table: table_name.to_string(),
                    reason: "table does not exist and create templates are empty".to_string(),
                });
            }
            create_templates
        } else {
            if add_column_templates.is_empty() {
                return Ok(missing);
            }
            add_column_templates
        };

        let table = TableIdent::qualified(&self.ctx.config.schema, table_name);
        let statement_columns: &[Column] = if creating { desired } else { &missing };
        let result = self
            .execute_templates(
                db,
                &table,
                templates,
                statement_columns,
                desired,
                metric_table,
                tag_table,
            )
            .await;

        match result {
            Ok(()) => {
                if creating {
                    tbl.columns = desired
                        .iter()
                        .map(|c| (c.name.clone(), c.clone()))
                        .collect();
                } else {
                    // Merge only columns that were absent by name. A
                    // name-matched column with an incompatible type keeps
                    // the catalog's word and stays missing below, so the
                    // batch gets trimmed rather than the cache lied to.
                    for col in &missing {
                        if !tbl.columns.contains_key(&col.name) {
                            tbl.columns.insert(col.name.clone(), col.clone());
                        }
                    }
                }
                tbl.version += 1;
                debug!(
                    table = %table_name,
                    version = tbl.version,
                    "table descriptor updated"
                );
                Ok(missing_columns(&tbl.columns, desired))
            }
            Err(e) => {
                tbl.fetched = false;
                if is_temporary(&e) {
                    return Err(e);
                }
                if creating {
                    return Err(Error::Schema {
                        table: table_name.to_string(),
                        reason: e.to_string(),
                    });
                }
                warn!(
                    table = %table_name,
                    error = %e,
                    "adding columns failed permanently; omitting them from the batch"
                );
                Ok(missing)
            }
        }
    }

    /// Read live column metadata from the database catalog and map it into
    /// the semantic column model.
    pub async fn get_columns<D: DbHandle>(
        &self,
        db: &D,
        table_name: &str,
    ) -> Result<Vec<Column>> {
        let mut columns: Vec<Column> = self
            .fetch_columns(db, table_name)
            .await?
            .into_values()
            .collect();
        sort_columns(&mut columns);
        Ok(columns)
    }

    /// Snapshot of the cached descriptor for `table_name`, in DDL order.
    pub async fn cached_columns(&self, table_name: &str) -> Vec<Column> {
        let state = self.table_state(table_name);
        let tbl = state.lock().await;
        let mut columns: Vec<Column> = tbl.columns.values().cloned().collect();
        sort_columns(&mut columns);
        columns
    }

    /// Drop every cached descriptor. The next reconciliation of each table
    /// re-reads the live catalog.
    pub fn clear_table_cache(&self) {
        self.tables.clear();
    }

    fn table_state(&self, name: &str) -> Arc<Mutex<TableState>> {
        self.tables.entry(name.to_string()).or_default().clone()
    }

    async fn fetch_columns<D: DbHandle + ?Sized>(
        &self,
        db: &D,
        table_name: &str,
    ) -> Result<HashMap<String, Column>> {
        let rows = db
            .query(COLUMNS_QUERY, &[&self.ctx.config.schema, &table_name])
            .await?;
        let mut columns = HashMap::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get(0)?;
            let data_type: String = row.try_get(1)?;
            let udt_name: String = row.try_get(2)?;
            let role = match name.as_str() {
                TIME_COLUMN => ColumnRole::Time,
                TAG_ID_COLUMN => ColumnRole::TagId,
                // The catalog cannot distinguish tag from field columns;
                // reconciliation compares by name and type only.
                _ => ColumnRole::Field,
            };
            columns.insert(
                name.clone(),
                Column {
                    name,
                    role,
                    data_type: PgDataType::from_catalog(&data_type, &udt_name),
                },
            );
        }
        Ok(columns)
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_templates<D: DbHandle>(
        &self,
        db: &mut D,
        table: &TableIdent,
        templates: &[Template],
        columns: &[Column],
        all_columns: &[Column],
        metric_table: &TableIdent,
        tag_table: Option<&TableIdent>,
    ) -> Result<()> {
        let ctx = TemplateContext {
            table,
            columns,
            all_columns,
            metric_table,
            tag_table,
        };
        let statements: Vec<String> = templates
            .iter()
            .map(|tpl| tpl.render(&ctx))
            .collect::<Result<_>>()?;

        let tx = db.begin().await?;
        for sql in &statements {
            debug!(sql = %sql, "executing DDL");
            tx.exec(sql.as_str(), &[]).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

/// Columns in `desired` the table does not satisfy: absent by name, or
/// present with a type the existing column cannot store.
fn missing_columns(existing: &HashMap<String, Column>, desired: &[Column]) -> Vec<Column> {
    desired
        .iter()
        .filter(|col| match existing.get(&col.name) {
            None => true,
            Some(have) => !have.data_type.satisfies(&col.data_type),
        })
        .cloned()
        .collect()
}

fn describe_columns(columns: &[Column]) -> String {
    columns
        .iter()
        .map(Column::definition)
        .collect::<Vec<_>>()
        .join(", ")
}
