//! Full sync: bulk copy of a table's current contents.
//!
//! The source side runs `COPY (SELECT ...) TO STDOUT` and pulls rows one at a
//! time; a spawned writer task feeds them into `COPY ... FROM STDIN` on a
//! pooled destination connection. Rows cross a bounded channel, and every row
//! takes a token from the shared [`RateLimiter`] before it is forwarded.
//!
//! ```text
//!   source COPY ──rows──> limiter ──mpsc──> writer task ──> destination COPY
//!                    └──────── Finish / Abort (oneshot) ───────┘
//! ```

pub mod rate_limiter;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::SinkExt;
use pg_escape::{quote_identifier, quote_literal};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_postgres::CopyInSink;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::PgConnection;
use crate::error::{Result, StreamerError};
use crate::mapping::{MappingEntry, SID_COLUMN};
use crate::telemetry;
use crate::writer::statement::{is_managed, quote_table};

pub use rate_limiter::RateLimiter;

/// Rows between two flushes of the sync counters.
const METRICS_EVERY: u64 = 1000;

/// Pulls COPY rows from a source.
#[async_trait]
pub trait RowSource: Send {
    /// Start `sql` (a `COPY ... TO STDOUT`).
    async fn start_copy(&mut self, sql: &str) -> Result<()>;

    /// Next row in COPY text format, `None` at end of data.
    async fn next_row(&mut self) -> Result<Option<Bytes>>;
}

#[async_trait]
impl RowSource for PgConnection {
    async fn start_copy(&mut self, sql: &str) -> Result<()> {
        self.copy_out(sql).await
    }

    async fn next_row(&mut self) -> Result<Option<Bytes>> {
        self.copy_out_row().await
    }
}

/// The receiving end of one `COPY ... FROM STDIN`.
#[async_trait]
pub trait CopyTarget: Send {
    async fn write(&mut self, row: Bytes) -> Result<()>;

    /// Complete the copy; returns the number of rows the destination took.
    async fn finish(self: Box<Self>) -> Result<u64>;
}

/// Opens copy targets on the destination.
#[async_trait]
pub trait CopyDestination: Send + Sync {
    async fn copy_in(&self, sql: &str) -> Result<Box<dyn CopyTarget>>;
}

/// `COPY FROM STDIN` on a pooled connection. Dropping it unfinished
/// makes the server abort the copy.
pub struct PgCopyTarget {
    sink: Pin<Box<CopyInSink<Bytes>>>,
    _client: deadpool_postgres::Object,
}

#[async_trait]
impl CopyTarget for PgCopyTarget {
    async fn write(&mut self, row: Bytes) -> Result<()> {
        Ok(self.sink.send(row).await?)
    }

    async fn finish(mut self: Box<Self>) -> Result<u64> {
        Ok(self.sink.as_mut().finish().await?)
    }
}

#[async_trait]
impl CopyDestination for deadpool_postgres::Pool {
    async fn copy_in(&self, sql: &str) -> Result<Box<dyn CopyTarget>> {
        let client = self.get().await?;
        let sink = client.copy_in::<_, Bytes>(sql).await?;
        Ok(Box::new(PgCopyTarget {
            sink: Box::pin(sink),
            _client: client,
        }))
    }
}

/// Columns copied for `entry`: source columns that also exist in the
/// destination, in source order, without `sid` and the history columns.
pub fn copy_columns(entry: &MappingEntry) -> Vec<&str> {
    entry
        .source_columns
        .iter()
        .map(|c| c.name.as_str())
        .filter(|name| *name != SID_COLUMN && !is_managed(name))
        .filter(|name| entry.dest_column(name).is_some())
        .collect()
}

/// The source and destination COPY statements for one table.
pub fn copy_statements(entry: &MappingEntry, source_table: &str, sid: &str) -> Result<(String, String)> {
    let columns = copy_columns(entry);
    if columns.is_empty() {
        return Err(StreamerError::Write(format!(
            "{source_table} and {} have no columns in common",
            entry.target
        )));
    }
    let mut select: Vec<String> = Vec::with_capacity(columns.len() + 1);
    let mut insert: Vec<String> = Vec::with_capacity(columns.len() + 1);
    if entry.has_sid_column() {
        select.push(quote_literal(sid));
        insert.push(quote_identifier(SID_COLUMN).into_owned());
    }
    for c in columns {
        select.push(quote_identifier(c).into_owned());
        insert.push(quote_identifier(c).into_owned());
    }
    let out = format!(
        "COPY (SELECT {} FROM {}) TO STDOUT",
        select.join(", "),
        quote_table(source_table)
    );
    let into = format!("COPY {} ({}) FROM STDIN", quote_table(&entry.target), insert.join(", "));
    Ok((out, into))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub rows: u64,
    pub bytes: u64,
    pub elapsed: Duration,
}

impl SyncStats {
    /// MiB per second.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.bytes as f64 / secs / 1024.0 / 1024.0
    }
}

#[derive(Debug)]
enum Command {
    Finish,
    Abort,
}

fn aborted() -> StreamerError {
    StreamerError::Task("copy aborted by reader".into())
}

async fn write_rows(
    mut target: Box<dyn CopyTarget>,
    mut rows: mpsc::Receiver<Bytes>,
    mut command: oneshot::Receiver<Command>,
) -> Result<u64> {
    loop {
        tokio::select! {
            biased;

            row = rows.recv() => match row {
                Some(row) => target.write(row).await?,
                // the reader always decides before hanging up
                None => match (&mut command).await {
                    Ok(Command::Finish) => break,
                    _ => return Err(aborted()),
                },
            },
            cmd = &mut command => match cmd {
                Ok(Command::Finish) => {
                    while let Ok(row) = rows.try_recv() {
                        target.write(row).await?;
                    }
                    break;
                }
                Ok(Command::Abort) | Err(_) => return Err(aborted()),
            },
        }
    }
    target.finish().await
}

/// Copies whole tables from a source connection into the destination.
#[derive(Clone)]
pub struct FullSync {
    destination: Arc<dyn CopyDestination>,
    limiter: Arc<RateLimiter>,
    queue: usize,
}

impl FullSync {
    pub fn new(destination: Arc<dyn CopyDestination>, limiter: Arc<RateLimiter>, queue: usize) -> Self {
        Self {
            destination,
            limiter,
            queue: queue.max(1),
        }
    }

    /// Copy `source_table` (the entry's table or one of its partitions)
    /// into the entry's target. `source` must be idle; on error it is left
    /// mid-copy and should be discarded.
    pub async fn run_table<S: RowSource + ?Sized>(
        &self,
        source: &mut S,
        entry: &MappingEntry,
        source_table: &str,
        sid: &str,
        cancel: &CancellationToken,
    ) -> Result<SyncStats> {
        let (out_sql, in_sql) = copy_statements(entry, source_table, sid)?;
        debug!(table = %source_table, target = %entry.target, sql = %out_sql, "starting full sync");

        let target = self.destination.copy_in(&in_sql).await?;
        let (row_tx, row_rx) = mpsc::channel(self.queue);
        let (cmd_tx, cmd_rx) = oneshot::channel();
        let writer = tokio::spawn(write_rows(target, row_rx, cmd_rx));

        let start = Instant::now();
        let mut rows = 0u64;
        let mut bytes = 0u64;
        let mut pending = (0u64, 0u64);

        let read = async {
            source.start_copy(&out_sql).await?;
            loop {
                let row = tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(StreamerError::Task("full sync cancelled".into()));
                    }
                    row = source.next_row() => row?,
                };
                let Some(row) = row else {
                    break;
                };
                let len = row.len() as u64;
                let sent = tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(StreamerError::Task("full sync cancelled".into()));
                    }
                    sent = async {
                        self.limiter.acquire().await;
                        row_tx.send(row).await
                    } => sent,
                };
                if sent.is_err() {
                    // writer is gone; its result carries the cause
                    return Err(StreamerError::Task("copy writer stopped".into()));
                }
                rows += 1;
                bytes += len;
                pending.0 += 1;
                pending.1 += len;
                if pending.0 >= METRICS_EVERY {
                    telemetry::record_sync(&entry.db_name, sid, source_table, pending.0, pending.1);
                    pending = (0, 0);
                }
            }
            Ok::<(), StreamerError>(())
        };
        let read_result = read.await;
        telemetry::record_sync(&entry.db_name, sid, source_table, pending.0, pending.1);

        let command = if read_result.is_ok() { Command::Finish } else { Command::Abort };
        let _ = cmd_tx.send(command);
        drop(row_tx);
        let written = writer
            .await
            .map_err(|e| StreamerError::Task(format!("copy writer panicked: {e}")))?;

        match (read_result, written) {
            (Ok(()), Ok(copied)) => {
                if copied != rows {
                    warn!(table = %source_table, read = rows, copied, "row count mismatch after copy");
                }
                let stats = SyncStats {
                    rows,
                    bytes,
                    elapsed: start.elapsed(),
                };
                info!(
                    database = %entry.db_name,
                    sid,
                    table = %source_table,
                    target = %entry.target,
                    rows,
                    bytes,
                    duration = ?stats.elapsed,
                    throughput_mib_s = stats.throughput(),
                    "finished full sync"
                );
                Ok(stats)
            }
            (Ok(()), Err(e)) => Err(e),
            (Err(e), Err(w)) if matches!(e, StreamerError::Task(_)) && !cancel.is_cancelled() => {
                // the writer failed first
                Err(w)
            }
            (Err(e), _) => Err(e),
        }
    }
}
