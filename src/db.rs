//! Database access plumbing
//!
//! The write pipeline and the table manager run the same code whether they
//! are handed a pooled connection, a transaction, or a savepoint, so all
//! database access goes through the [`DbHandle`] abstraction. Bulk ingest
//! streams text-format COPY data through the driver's `CopyInSink`.

use async_trait::async_trait;
use bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use bytes::{Bytes, BytesMut};
use futures::{pin_mut, SinkExt};
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, CopyInSink, NoTls, Row, Transaction};

use crate::config::SinkConfig;
use crate::error::{Error, Result};
use crate::schema::{quote_ident, TableIdent};
use crate::value::{encode_row, SqlValue};

/// The connection pool shared by the sink and its workers.
pub type PgPool = Pool<PostgresConnectionManager<NoTls>>;

/// Flush threshold for buffered COPY data.
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Abstract handle over a connection, a transaction, or a savepoint.
///
/// `begin` opens a transaction on a connection and a savepoint on a
/// transaction, which is exactly the nesting the write pipeline needs.
#[async_trait]
pub trait DbHandle: Send + Sync {
    /// Open a subordinate transaction.
    async fn begin(&mut self) -> std::result::Result<Transaction<'_>, tokio_postgres::Error>;

    /// Execute a statement, returning the affected row count.
    async fn exec(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> std::result::Result<u64, tokio_postgres::Error>;

    /// Run a query and collect its rows.
    async fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> std::result::Result<Vec<Row>, tokio_postgres::Error>;

    /// Start a `COPY ... FROM STDIN` and return the sink to stream into.
    async fn copy_from(
        &self,
        sql: &str,
    ) -> std::result::Result<CopyInSink<Bytes>, tokio_postgres::Error>;
}

#[async_trait]
impl DbHandle for Client {
    async fn begin(&mut self) -> std::result::Result<Transaction<'_>, tokio_postgres::Error> {
        self.transaction().await
    }

    async fn exec(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> std::result::Result<u64, tokio_postgres::Error> {
        Client::execute(self, sql, params).await
    }

    async fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> std::result::Result<Vec<Row>, tokio_postgres::Error> {
        Client::query(self, sql, params).await
    }

    async fn copy_from(
        &self,
        sql: &str,
    ) -> std::result::Result<CopyInSink<Bytes>, tokio_postgres::Error> {
        Client::copy_in(self, sql).await
    }
}

#[async_trait]
impl DbHandle for Transaction<'_> {
    async fn begin(&mut self) -> std::result::Result<Transaction<'_>, tokio_postgres::Error> {
        self.transaction().await
    }

    async fn exec(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> std::result::Result<u64, tokio_postgres::Error> {
        Transaction::execute(self, sql, params).await
    }

    async fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> std::result::Result<Vec<Row>, tokio_postgres::Error> {
        Transaction::query(self, sql, params).await
    }

    async fn copy_from(
        &self,
        sql: &str,
    ) -> std::result::Result<CopyInSink<Bytes>, tokio_postgres::Error> {
        Transaction::copy_in(self, sql).await
    }
}

/// Build the connection pool from the sink configuration.
///
/// The pool is sized to `pool_max_conns` (default 1) and the connection's
/// `application_name` defaults to `pgsink` unless the connection string
/// sets one.
pub async fn connect_pool(config: &SinkConfig) -> Result<PgPool> {
    let mut pg_config: tokio_postgres::Config = config
        .connection
        .parse()
        .map_err(|e| Error::Config(format!("connection: {e}")))?;
    if pg_config.get_application_name().is_none() {
        pg_config.application_name("pgsink");
    }

    let manager = PostgresConnectionManager::new(pg_config, NoTls);
    let pool = Pool::builder()
        .max_size(config.effective_pool_size())
        .build(manager)
        .await
        .map_err(Error::Db)?;
    Ok(pool)
}

/// Stream every row from `rows` into `table` via text-format COPY.
/// Returns the number of rows the server reports as copied.
pub(crate) async fn copy_rows<D, R>(
    db: &D,
    table: &TableIdent,
    columns: &[String],
    rows: &mut R,
) -> Result<u64>
where
    D: DbHandle + ?Sized,
    R: Iterator<Item = Vec<SqlValue>> + Send,
{
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("COPY {table} ({column_list}) FROM STDIN");

    let sink = db.copy_from(&sql).await?;
    pin_mut!(sink);

    let mut buf = BytesMut::with_capacity(COPY_BUFFER_SIZE);
    for row in rows.by_ref() {
        encode_row(&mut buf, &row);
        if buf.len() >= COPY_BUFFER_SIZE {
            sink.send(buf.split().freeze()).await?;
        }
    }
    if !buf.is_empty() {
        sink.send(buf.split().freeze()).await?;
    }

    let copied = sink.finish().await?;
    Ok(copied)
}
