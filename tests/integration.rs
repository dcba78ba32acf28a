//! Integration tests against a live PostgreSQL server.
//!
//! These tests are skipped unless `TEST_PG_URL` points at a database the
//! test user may create tables in, e.g.:
//!
//! ```text
//! TEST_PG_URL='host=localhost user=postgres dbname=pgsink_test' cargo test
//! ```
//!
//! Every test uses its own `pgsink_it_*` tables and drops them up front, so
//! the suite can run repeatedly and in parallel against the same database.

use chrono::{TimeZone, Utc};
use tokio_postgres::NoTls;

use pgsink::metric::FieldValue;
use pgsink::schema::Column;
use pgsink::{Metric, PgSink, SinkConfig};

fn test_url() -> Option<String> {
    init_tracing();
    match std::env::var("TEST_PG_URL") {
        Ok(url) => Some(url),
        Err(_) => {
            eprintln!("skipping: set TEST_PG_URL to run integration tests");
            None
        }
    }
}

/// Install a `RUST_LOG`-filtered subscriber so sink log lines are visible
/// when debugging a failing run. Only the first call wins; the rest are
/// no-ops.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config(url: &str) -> SinkConfig {
    SinkConfig {
        connection: url.to_string(),
        ..SinkConfig::default()
    }
}

fn metric(measurement: &str) -> Metric {
    Metric::new(
        measurement,
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
    )
}

async fn raw_client(url: &str) -> tokio_postgres::Client {
    let (client, connection) = tokio_postgres::connect(url, NoTls)
        .await
        .expect("connecting to TEST_PG_URL");
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn reset_tables(client: &tokio_postgres::Client, tables: &[&str]) {
    for table in tables {
        let sql = format!("DROP TABLE IF EXISTS public.\"{table}\" CASCADE");
        client
            .execute(sql.as_str(), &[])
            .await
            .expect("dropping leftover table");
    }
}

/// `(column_name, data_type, udt_name)` rows for a table, ordered by name.
async fn table_columns(
    client: &tokio_postgres::Client,
    table: &str,
) -> Vec<(String, String, String)> {
    client
        .query(
            "SELECT column_name, data_type, udt_name FROM information_schema.columns \
             WHERE table_schema = 'public' AND table_name = $1 ORDER BY column_name",
            &[&table],
        )
        .await
        .expect("reading catalog")
        .into_iter()
        .map(|row| (row.get(0), row.get(1), row.get(2)))
        .collect()
}

fn column_names(columns: &[(String, String, String)]) -> Vec<&str> {
    columns.iter().map(|(name, _, _)| name.as_str()).collect()
}

async fn row_count(client: &tokio_postgres::Client, table: &str) -> i64 {
    let sql = format!("SELECT count(*) FROM public.\"{table}\"");
    let row = client
        .query_one(sql.as_str(), &[])
        .await
        .expect("counting rows");
    row.get(0)
}

#[tokio::test]
async fn create_on_first_write() {
    let Some(url) = test_url() else { return };
    let client = raw_client(&url).await;
    reset_tables(&client, &["pgsink_it_create"]).await;

    let mut sink = PgSink::connect(config(&url)).await.expect("connect");
    sink.write(vec![metric("pgsink_it_create")
        .with_tag("tag", "foo")
        .with_field("baz", 0i64)])
        .await
        .expect("write");

    let cols = table_columns(&client, "pgsink_it_create").await;
    assert_eq!(column_names(&cols), vec!["baz", "tag", "time"]);
    assert_eq!(cols[0].1, "bigint");
    assert_eq!(cols[1].1, "text");
    assert_eq!(cols[2].1, "timestamp without time zone");
    assert_eq!(row_count(&client, "pgsink_it_create").await, 1);

    // The cached descriptor matches what was created.
    let cached: Vec<String> = sink
        .table_manager()
        .cached_columns("pgsink_it_create")
        .await
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(cached, vec!["time", "tag", "baz"]);
    sink.close().await;
}

#[tokio::test]
async fn alter_on_new_field() {
    let Some(url) = test_url() else { return };
    let client = raw_client(&url).await;
    reset_tables(&client, &["pgsink_it_alter"]).await;

    let mut sink = PgSink::connect(config(&url)).await.expect("connect");
    sink.write(vec![metric("pgsink_it_alter")
        .with_tag("tag", "foo")
        .with_field("baz", 0i64)])
        .await
        .expect("first write");
    sink.write(vec![metric("pgsink_it_alter")
        .with_tag("tag", "foo")
        .with_field("baz", 0i64)
        .with_field("bar", 0i64)])
        .await
        .expect("second write");

    let cols = table_columns(&client, "pgsink_it_alter").await;
    assert_eq!(column_names(&cols), vec!["bar", "baz", "tag", "time"]);
    assert_eq!(row_count(&client, "pgsink_it_alter").await, 2);
    sink.close().await;
}

#[tokio::test]
async fn alter_disabled_drops_new_columns() {
    let Some(url) = test_url() else { return };
    let client = raw_client(&url).await;
    reset_tables(&client, &["pgsink_it_noalter"]).await;

    let mut cfg = config(&url);
    cfg.add_column_templates = Vec::new();
    let mut sink = PgSink::connect(cfg).await.expect("connect");

    sink.write(vec![metric("pgsink_it_noalter")
        .with_tag("tag", "foo")
        .with_field("a", 1i64)])
        .await
        .expect("first write");
    sink.write(vec![
        metric("pgsink_it_noalter")
            .with_tag("tag", "foo")
            .with_field("a", 2i64),
        metric("pgsink_it_noalter")
            .with_tag("tag", "foo")
            .with_tag("bar", "baz")
            .with_field("a", 3i64),
    ])
    .await
    .expect("second write");

    let cols = table_columns(&client, "pgsink_it_noalter").await;
    assert_eq!(
        column_names(&cols),
        vec!["a", "tag", "time"],
        "the new tag column must not be added"
    );
    // The record carrying the unrepresentable tag is skipped; the other
    // three land.
    assert_eq!(row_count(&client, "pgsink_it_noalter").await, 2);
    sink.close().await;
}

#[tokio::test]
async fn new_field_is_omitted_when_alter_fails_permanently() {
    let Some(url) = test_url() else { return };
    let client = raw_client(&url).await;
    reset_tables(&client, &["pgsink_it_badalter"]).await;

    let mut cfg = config(&url);
    cfg.add_column_templates = vec!["bad statement".to_string().into()];
    let mut sink = PgSink::connect(cfg).await.expect("connect");

    sink.write(vec![metric("pgsink_it_badalter")
        .with_tag("tag", "foo")
        .with_field("a", 2i64)])
        .await
        .expect("first write");
    sink.write(vec![metric("pgsink_it_badalter")
        .with_tag("tag", "foo")
        .with_field("a", 3i64)
        .with_field("b", 3i64)])
        .await
        .expect("second write succeeds with the field omitted");

    let cols = table_columns(&client, "pgsink_it_badalter").await;
    assert_eq!(column_names(&cols), vec!["a", "tag", "time"]);
    assert_eq!(row_count(&client, "pgsink_it_badalter").await, 2);
    sink.close().await;
}

#[tokio::test]
async fn missing_create_templates_is_an_error() {
    let Some(url) = test_url() else { return };
    let client = raw_client(&url).await;
    reset_tables(&client, &["pgsink_it_nocreate"]).await;

    let mut cfg = config(&url);
    cfg.create_templates = Vec::new();
    let sink = PgSink::connect(cfg).await.expect("connect");

    let mut sources = pgsink::source::partition(
        sink.context(),
        vec![metric("pgsink_it_nocreate")
            .with_tag("tag", "foo")
            .with_field("a", 1i64)],
    );
    let mut src = sources.remove("pgsink_it_nocreate").expect("source");
    let mut db = raw_client(&url).await;
    let err = sink
        .table_manager()
        .match_source(&mut db, &mut src)
        .await
        .expect_err("the table cannot be created");
    assert!(!pgsink::is_temporary(&err));
}

#[tokio::test]
async fn missing_tag_table_create_templates_is_an_error() {
    let Some(url) = test_url() else { return };
    let client = raw_client(&url).await;
    reset_tables(&client, &["pgsink_it_notagcreate", "pgsink_it_notagcreate_tag"]).await;

    let mut cfg = config(&url);
    cfg.tags_as_foreign_keys = true;
    cfg.tag_table_create_templates = Vec::new();
    let sink = PgSink::connect(cfg).await.expect("connect");

    let mut sources = pgsink::source::partition(
        sink.context(),
        vec![metric("pgsink_it_notagcreate")
            .with_tag("tag", "foo")
            .with_field("a", 1i64)],
    );
    let mut src = sources.remove("pgsink_it_notagcreate").expect("source");
    let mut db = raw_client(&url).await;
    sink.table_manager()
        .match_source(&mut db, &mut src)
        .await
        .expect_err("the tag table cannot be created");
}

#[tokio::test]
async fn new_tag_table_column_is_dropped_when_alter_disabled() {
    let Some(url) = test_url() else { return };
    let client = raw_client(&url).await;
    reset_tables(&client, &["pgsink_it_fknoalter", "pgsink_it_fknoalter_tag"]).await;

    let mut cfg = config(&url);
    cfg.tags_as_foreign_keys = true;
    cfg.tag_table_add_column_templates = Vec::new();
    let mut sink = PgSink::connect(cfg).await.expect("connect");

    sink.write(vec![metric("pgsink_it_fknoalter")
        .with_tag("tag", "foo")
        .with_field("a", 1i64)])
        .await
        .expect("first write");
    sink.write(vec![
        metric("pgsink_it_fknoalter")
            .with_tag("tag", "foo")
            .with_field("a", 2i64),
        metric("pgsink_it_fknoalter")
            .with_tag("tag", "foo")
            .with_tag("bar", "baz")
            .with_field("a", 3i64),
    ])
    .await
    .expect("second write");

    let tag_cols = table_columns(&client, "pgsink_it_fknoalter_tag").await;
    assert_eq!(column_names(&tag_cols), vec!["tag", "tag_id"]);
    // Only the representable records land.
    assert_eq!(row_count(&client, "pgsink_it_fknoalter").await, 2);
    assert_eq!(row_count(&client, "pgsink_it_fknoalter_tag").await, 1);
    sink.close().await;
}

#[tokio::test]
async fn tags_as_foreign_keys() {
    let Some(url) = test_url() else { return };
    let client = raw_client(&url).await;
    reset_tables(&client, &["pgsink_it_fk", "pgsink_it_fk_tag"]).await;

    let mut cfg = config(&url);
    cfg.tags_as_foreign_keys = true;
    let mut sink = PgSink::connect(cfg).await.expect("connect");

    sink.write(vec![metric("pgsink_it_fk")
        .with_tag("tag", "foo")
        .with_field("a", 1i64)])
        .await
        .expect("write");

    let metric_cols = table_columns(&client, "pgsink_it_fk").await;
    assert_eq!(column_names(&metric_cols), vec!["a", "tag_id", "time"]);
    let tag_cols = table_columns(&client, "pgsink_it_fk_tag").await;
    assert_eq!(column_names(&tag_cols), vec!["tag", "tag_id"]);

    // Same tagset again: the admission cache suppresses the tag row and the
    // merge is idempotent either way.
    sink.write(vec![metric("pgsink_it_fk")
        .with_tag("tag", "foo")
        .with_field("a", 2i64)])
        .await
        .expect("second write");
    assert_eq!(row_count(&client, "pgsink_it_fk").await, 2);
    assert_eq!(row_count(&client, "pgsink_it_fk_tag").await, 1);

    // The metric rows reference the tag row.
    let row = client
        .query_one(
            "SELECT count(*) FROM public.\"pgsink_it_fk\" m \
             JOIN public.\"pgsink_it_fk_tag\" t USING (tag_id)",
            &[],
        )
        .await
        .expect("join");
    assert_eq!(row.get::<_, i64>(0), 2);
    sink.close().await;
}

#[tokio::test]
async fn jsonb_layouts() {
    let Some(url) = test_url() else { return };
    let client = raw_client(&url).await;
    reset_tables(&client, &["pgsink_it_jsonb"]).await;

    let mut cfg = config(&url);
    cfg.tags_as_jsonb = true;
    cfg.fields_as_jsonb = true;
    let mut sink = PgSink::connect(cfg).await.expect("connect");

    sink.write(vec![metric("pgsink_it_jsonb")
        .with_tag("host", "h1")
        .with_field("a", 1i64)
        .with_field("b", 0.5f64)])
        .await
        .expect("write");

    let cols = table_columns(&client, "pgsink_it_jsonb").await;
    assert_eq!(column_names(&cols), vec!["fields", "tags", "time"]);
    let row = client
        .query_one(
            "SELECT tags->>'host', (fields->>'a')::bigint, (fields->>'b')::float8 \
             FROM public.\"pgsink_it_jsonb\"",
            &[],
        )
        .await
        .expect("read back");
    assert_eq!(row.get::<_, String>(0), "h1");
    assert_eq!(row.get::<_, i64>(1), 1);
    assert_eq!(row.get::<_, f64>(2), 0.5);
    sink.close().await;
}

#[tokio::test]
async fn uint8_uses_extension_type() {
    let Some(url) = test_url() else { return };
    let client = raw_client(&url).await;

    let row = client
        .query_one(
            "SELECT count(*) FROM pg_extension WHERE extname = 'uint'",
            &[],
        )
        .await
        .expect("checking for pguint");
    if row.get::<_, i64>(0) == 0 {
        eprintln!("skipping: pguint extension is not installed");
        return;
    }
    reset_tables(&client, &["pgsink_it_uint8"]).await;

    let mut cfg = config(&url);
    cfg.use_uint8 = true;
    let mut sink = PgSink::connect(cfg).await.expect("connect");
    sink.write(vec![metric("pgsink_it_uint8").with_field("a", u64::MAX)])
        .await
        .expect("write");

    let cols = table_columns(&client, "pgsink_it_uint8").await;
    let a = cols.iter().find(|(name, _, _)| name == "a").expect("column a");
    assert_eq!(a.2, "uint8");
    sink.close().await;
}

#[tokio::test]
async fn permanent_error_drops_only_its_sub_batch() {
    let Some(url) = test_url() else { return };
    let client = raw_client(&url).await;
    reset_tables(&client, &["pgsink_it_peer"]).await;
    client
        .execute("DROP VIEW IF EXISTS public.\"pgsink_it_view\"", &[])
        .await
        .expect("dropping leftover view");
    // A view reads like a table in the catalog, so reconciliation passes
    // and the COPY then fails permanently.
    client
        .execute(
            "CREATE VIEW public.\"pgsink_it_view\" AS \
             SELECT now()::timestamp AS time, 0::bigint AS a",
            &[],
        )
        .await
        .expect("creating view");

    let mut sink = PgSink::connect(config(&url)).await.expect("connect");
    sink.write(vec![
        metric("pgsink_it_peer").with_field("a", 1i64),
        metric("pgsink_it_view").with_field("a", 2i64),
    ])
    .await
    .expect("batch succeeds; the bad sub-batch is dropped");

    assert_eq!(
        row_count(&client, "pgsink_it_peer").await,
        1,
        "the healthy sub-batch must land"
    );
    sink.close().await;
}

#[tokio::test]
async fn concurrent_mode_writes_all_measurements() {
    let Some(url) = test_url() else { return };
    let client = raw_client(&url).await;
    reset_tables(&client, &["pgsink_it_wa", "pgsink_it_wb", "pgsink_it_wc"]).await;

    let mut cfg = config(&url);
    cfg.pool_max_conns = Some(3);
    let mut sink = PgSink::connect(cfg).await.expect("connect");
    sink.write(vec![
        metric("pgsink_it_wa").with_field("v", 1i64),
        metric("pgsink_it_wb").with_field("v", 2i64),
        metric("pgsink_it_wc").with_field("v", 3i64),
    ])
    .await
    .expect("dispatch");
    // close drains the worker pool before returning.
    sink.close().await;

    assert_eq!(row_count(&client, "pgsink_it_wa").await, 1);
    assert_eq!(row_count(&client, "pgsink_it_wb").await, 1);
    assert_eq!(row_count(&client, "pgsink_it_wc").await, 1);
}

#[tokio::test]
async fn ensure_structure_is_idempotent() {
    let Some(url) = test_url() else { return };
    let client = raw_client(&url).await;
    reset_tables(&client, &["pgsink_it_ensure"]).await;

    let sink = PgSink::connect(config(&url)).await.expect("connect");
    let manager = sink.table_manager();
    let defaults = SinkConfig::default();
    let table = sink.context().metric_ident("pgsink_it_ensure");
    let desired = vec![
        Column::time(),
        Column::from_tag("foo"),
        Column::from_field("baz", &FieldValue::I64(0), false),
    ];

    let mut db = raw_client(&url).await;
    let missing = manager
        .ensure_structure(
            &mut db,
            "pgsink_it_ensure",
            &desired,
            &defaults.create_templates,
            &defaults.add_column_templates,
            &table,
            None,
        )
        .await
        .expect("first ensure");
    assert!(missing.is_empty());
    let version_probe = table_columns(&client, "pgsink_it_ensure").await;

    let missing = manager
        .ensure_structure(
            &mut db,
            "pgsink_it_ensure",
            &desired,
            &defaults.create_templates,
            &defaults.add_column_templates,
            &table,
            None,
        )
        .await
        .expect("second ensure");
    assert!(missing.is_empty());
    assert_eq!(
        table_columns(&client, "pgsink_it_ensure").await,
        version_probe,
        "second call must not change the table"
    );
}

#[tokio::test]
async fn get_columns_round_trips() {
    let Some(url) = test_url() else { return };
    let client = raw_client(&url).await;
    reset_tables(&client, &["pgsink_it_round"]).await;

    let mut sink = PgSink::connect(config(&url)).await.expect("connect");
    sink.write(vec![metric("pgsink_it_round")
        .with_tag("foo", "bar")
        .with_field("baz", 0i64)])
        .await
        .expect("write");

    let installed = sink.table_manager().cached_columns("pgsink_it_round").await;

    sink.table_manager().clear_table_cache();
    assert!(
        sink.table_manager()
            .cached_columns("pgsink_it_round")
            .await
            .is_empty(),
        "cache clear must drop the descriptor"
    );

    let db = raw_client(&url).await;
    let live = sink
        .table_manager()
        .get_columns(&db, "pgsink_it_round")
        .await
        .expect("get_columns");

    // Compare as unordered sets of (name, type): the catalog cannot
    // recover column roles, so role-based ordering differs.
    let mut installed_types: Vec<(String, String)> = installed
        .iter()
        .map(|c| (c.name.clone(), c.data_type.sql().to_string()))
        .collect();
    let mut live_types: Vec<(String, String)> = live
        .iter()
        .map(|c| (c.name.clone(), c.data_type.sql().to_string()))
        .collect();
    installed_types.sort();
    live_types.sort();
    assert_eq!(installed_types, live_types);
    sink.close().await;
}
