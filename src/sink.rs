//! The sink: write strategies, retry, and lifecycle
//!
//! [`PgSink`] is the entry point. A batch of metrics is partitioned into
//! per-measurement table sources and written with one of two strategies:
//!
//! - **Sequential** (pool size 1): one top-level transaction per batch,
//!   each sub-batch isolated in a savepoint so a permanent failure drops
//!   only that measurement's rows.
//! - **Concurrent** (pool size > 1): sub-batches are dispatched over a
//!   bounded channel to a fixed worker pool; each worker retries temporary
//!   errors in place with capped exponential backoff.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SinkConfig;
use crate::db::{self, DbHandle, PgPool};
use crate::error::{is_temporary, Error, Result};
use crate::manager::TableManager;
use crate::metric::Metric;
use crate::schema::TableIdent;
use crate::source::{self, TableSource, TagTableSource};
use crate::SinkContext;

/// First retry delay; doubles on each subsequent temporary failure.
const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
/// How long `close` waits for in-flight writes before giving up.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// State shared between the sink handle and its write workers.
struct SinkShared {
    ctx: Arc<SinkContext>,
    pool: PgPool,
    manager: TableManager,
    shutdown: CancellationToken,
}

/// A connected PostgreSQL metrics sink.
pub struct PgSink {
    shared: Arc<SinkShared>,
    write_tx: Option<mpsc::Sender<TableSource>>,
    workers: Vec<JoinHandle<()>>,
}

impl PgSink {
    /// Validate `config`, connect, and start the worker pool when the pool
    /// admits more than one connection.
    pub async fn connect(config: SinkConfig) -> Result<Self> {
        let ctx = Arc::new(SinkContext::new(config)?);
        let pool = db::connect_pool(&ctx.config).await?;

        {
            // Fail fast on unreachable servers and bad credentials instead
            // of surfacing them on the first write.
            let conn = pool.get().await?;
            if ctx.config.use_uint8 {
                let rows = conn
                    .query("SELECT oid FROM pg_type WHERE typname = $1", &[&"uint8"])
                    .await?;
                if rows.is_empty() {
                    return Err(Error::Config(
                        "use_uint8 is set but the uint8 type does not exist; \
                         install the pguint extension"
                            .to_string(),
                    ));
                }
            }
        }

        let manager = TableManager::new(ctx.clone());
        let shared = Arc::new(SinkShared {
            ctx,
            pool,
            manager,
            shutdown: CancellationToken::new(),
        });

        let max_conns = shared.ctx.config.effective_pool_size();
        let (write_tx, workers) = if max_conns > 1 {
            let (tx, rx) = mpsc::channel::<TableSource>(1);
            let rx = Arc::new(Mutex::new(rx));
            let workers = (0..max_conns)
                .map(|worker_id| {
                    let shared = shared.clone();
                    let rx = rx.clone();
                    tokio::spawn(async move { write_worker(worker_id, shared, rx).await })
                })
                .collect();
            (Some(tx), workers)
        } else {
            (None, Vec::new())
        };

        info!(pool_size = max_conns, "connected to PostgreSQL");
        Ok(Self {
            shared,
            write_tx,
            workers,
        })
    }

    /// Write a batch of metrics.
    ///
    /// Sequential mode returns the batch's fate directly: a temporary error
    /// means the whole batch should be retried by the caller. Concurrent
    /// mode returns once every sub-batch is dispatched; retries and drops
    /// happen on the workers.
    pub async fn write(&self, metrics: Vec<Metric>) -> Result<()> {
        if let Some(cache) = &self.shared.ctx.tag_cache {
            // Gather at the start of the write so fewer async writes are in
            // flight while reading the counters.
            let stats = cache.stats();
            debug!(
                entries = stats.entries,
                hits = stats.hits,
                misses = stats.misses,
                "tag cache statistics"
            );
            cache.reset_stats();
        }

        let sources = source::partition(&self.shared.ctx, metrics);
        if sources.is_empty() {
            return Ok(());
        }

        match &self.write_tx {
            Some(tx) => {
                for (_, src) in sources {
                    tokio::select! {
                        sent = tx.send(src) => {
                            if sent.is_err() {
                                return Err(Error::Cancelled);
                            }
                        }
                        _ = self.shared.shutdown.cancelled() => return Ok(()),
                    }
                }
                Ok(())
            }
            None => self.shared.write_sequential(sources).await,
        }
    }

    /// Stop accepting work, wait up to five seconds for in-flight writes,
    /// then cancel everything and release the pool.
    pub async fn close(&mut self) {
        if let Some(tx) = self.write_tx.take() {
            drop(tx);
            let drained = futures::future::join_all(self.workers.drain(..));
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, drained).await.is_err() {
                warn!(
                    "shutdown timeout expired while waiting for metrics to flush; \
                     some metrics may not be written to the database"
                );
            }
        }
        self.shared.shutdown.cancel();
    }

    /// The schema reconciliation engine.
    pub fn table_manager(&self) -> &TableManager {
        &self.shared.manager
    }

    /// The shared configuration and handles.
    pub fn context(&self) -> &Arc<SinkContext> {
        &self.shared.ctx
    }
}

async fn write_worker(
    worker_id: u32,
    shared: Arc<SinkShared>,
    rx: Arc<Mutex<mpsc::Receiver<TableSource>>>,
) {
    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                src = rx.recv() => src,
                _ = shared.shutdown.cancelled() => None,
            }
        };
        let Some(mut src) = next else { break };
        if let Err(e) = shared.write_retry(&mut src).await {
            error!(
                worker = worker_id,
                measurement = %src.name(),
                error = %e,
                "write error (permanent, dropping sub-batch)"
            );
        }
    }
    debug!(worker = worker_id, "write worker stopped");
}

impl SinkShared {
    /// Write every sub-batch inside one transaction, isolating each in a
    /// savepoint when the batch spans multiple measurements. Temporary
    /// errors abort the transaction and propagate so the caller retries the
    /// whole batch; permanent errors roll back only their savepoint.
    async fn write_sequential(&self, sources: BTreeMap<String, TableSource>) -> Result<()> {
        let multi = sources.len() > 1;
        let mut conn = self.pool.get().await?;
        let mut tx = conn.transaction().await?;

        for (_, mut src) in sources {
            if multi {
                let mut sp = tx.transaction().await?;
                match self.write_measurement(&mut sp, &mut src).await {
                    Ok(()) => {
                        // The driver rolls a dropped subtransaction back, so
                        // the savepoint must be released explicitly.
                        sp.commit().await?;
                    }
                    Err(e) if is_temporary(&e) => return Err(e),
                    Err(e) => {
                        error!(
                            measurement = %src.name(),
                            error = %e,
                            "write error (permanent, dropping sub-batch)"
                        );
                        sp.rollback().await?;
                    }
                }
            } else {
                match self.write_measurement(&mut tx, &mut src).await {
                    Ok(()) => {}
                    Err(e) if is_temporary(&e) => return Err(e),
                    Err(e) => {
                        error!(
                            measurement = %src.name(),
                            error = %e,
                            "write error (permanent, dropping sub-batch)"
                        );
                    }
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Retry loop for the concurrent path. Temporary errors back off
    /// exponentially up to the configured cap; permanent errors and
    /// shutdown propagate.
    async fn write_retry(&self, src: &mut TableSource) -> Result<()> {
        let mut backoff = Duration::ZERO;
        loop {
            let err = match self.write_once(src).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if !is_temporary(&err) {
                return Err(err);
            }
            error!(
                measurement = %src.name(),
                error = %err,
                "write error (retry in {:?})",
                backoff
            );
            src.reset();
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.shutdown.cancelled() => return Err(Error::Cancelled),
            }
            backoff = next_backoff(backoff, self.ctx.config.retry_max_backoff);
        }
    }

    async fn write_once(&self, src: &mut TableSource) -> Result<()> {
        let mut conn = self.pool.get().await?;
        self.write_measurement(&mut *conn, src).await
    }

    /// Write one measurement's rows: reconcile schema, merge tag rows when
    /// tags are normalized, then bulk-copy the metric rows.
    async fn write_measurement<D: DbHandle>(
        &self,
        db: &mut D,
        src: &mut TableSource,
    ) -> Result<()> {
        self.manager.match_source(db, src).await?;

        if self.ctx.config.tags_as_foreign_keys {
            if let Err(e) = self.write_tag_table(db, src).await {
                if self.ctx.config.foreign_tag_constraint {
                    return Err(Error::TagInsert {
                        table: src.tag_table_name(),
                        source: Box::new(e),
                    });
                }
                // Tags do not change over time and are carried by every
                // record, so once the operator corrects the issue they are
                // picked up from a later batch.
                error!(
                    table = %src.tag_table_name(),
                    error = %e,
                    "writing to tag table failed; tags will be retried with a later batch"
                );
            }
        }

        let ident = self.ctx.metric_ident(src.name());
        let columns = src.column_names();
        db::copy_rows(&*db, &ident, &columns, src).await?;
        Ok(())
    }

    /// Merge this batch's new tag rows into the tag table: bulk-copy them
    /// into a transaction-scoped temp table, then insert with
    /// `ON CONFLICT DO NOTHING` so concurrent inserters deduplicate.
    /// Admission-cache publication happens only after commit.
    async fn write_tag_table<D: DbHandle>(&self, db: &mut D, src: &TableSource) -> Result<()> {
        let mut ttsrc = TagTableSource::new(src);
        if !ttsrc.has_rows() {
            return Ok(());
        }

        let tag_ident = self.ctx.tag_ident(src.name());
        let temp_ident = TableIdent::bare(format!("{}_temp", src.tag_table_name()));
        let columns = ttsrc.column_names();

        let tx = db.begin().await?;

        let create_temp =
            format!("CREATE TEMP TABLE {temp_ident} (LIKE {tag_ident}) ON COMMIT DROP");
        tx.exec(create_temp.as_str(), &[]).await?;

        db::copy_rows(&tx, &temp_ident, &columns, &mut ttsrc).await?;

        // Ordering by tag_id keeps concurrent inserters locking rows in a
        // consistent order, which avoids deadlocking against each other.
        let merge = format!(
            "INSERT INTO {tag_ident} SELECT * FROM {temp_ident} \
             ORDER BY tag_id ON CONFLICT (tag_id) DO NOTHING"
        );
        tx.exec(merge.as_str(), &[]).await?;

        tx.commit().await?;
        ttsrc.update_cache();
        Ok(())
    }
}

/// Backoff schedule: 0, 250ms, then doubling, clamped at `max`.
fn next_backoff(current: Duration, max: Duration) -> Duration {
    if current.is_zero() {
        INITIAL_BACKOFF.min(max)
    } else {
        (current * 2).min(max)
    }
}

/// Convenience constructor mirroring `PgSink::connect`.
impl PgSink {
    /// Connect with a plain connection string and defaults for everything
    /// else.
    pub async fn connect_str(connection: &str) -> Result<Self> {
        let config = SinkConfig {
            connection: connection.to_string(),
            ..SinkConfig::default()
        };
        Self::connect(config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let max = Duration::from_secs(15);
        let mut backoff = Duration::ZERO;
        let mut schedule = Vec::new();
        for _ in 0..8 {
            backoff = next_backoff(backoff, max);
            schedule.push(backoff);
        }
        assert_eq!(schedule[0], Duration::from_millis(250));
        assert_eq!(schedule[1], Duration::from_millis(500));
        assert_eq!(schedule[2], Duration::from_secs(1));
        assert_eq!(schedule[6], Duration::from_secs(15), "clamped at the cap");
        assert_eq!(schedule[7], Duration::from_secs(15), "stays clamped");
    }

    #[test]
    fn test_backoff_reaches_cap_in_logarithmic_steps() {
        let max = Duration::from_secs(15);
        let mut backoff = Duration::ZERO;
        let mut steps = 0;
        while backoff < max {
            backoff = next_backoff(backoff, max);
            steps += 1;
            assert!(steps < 16, "backoff must converge");
        }
        assert_eq!(steps, 7);
    }

    #[test]
    fn test_backoff_respects_small_cap() {
        let max = Duration::from_millis(100);
        assert_eq!(next_backoff(Duration::ZERO, max), max);
        assert_eq!(next_backoff(max, max), max);
    }
}
