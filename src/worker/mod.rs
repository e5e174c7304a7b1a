//! Fixed pool of destination writers.
//!
//! Operations are routed by their entry's `route_key`, so every change of one
//! source table goes through the same worker in arrival order. Each worker
//! batches what it receives into one destination transaction and commits on
//! a timer. A failing statement is rolled back to a per-operation savepoint
//! and dropped; the transaction carries on. Losing the destination
//! connection abandons the transaction and asks for a restart of all
//! sessions so the lost changes are streamed again.

mod tracker;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, StreamerError};
use crate::telemetry::{self, Outcome};
use crate::writer::{self, Executor, Operation};

#[cfg(test)]
pub use tracker::LaneStatus;
pub use tracker::{SourceKey, WatermarkTracker};

const SAVEPOINT: &str = "SAVEPOINT cdc_op";
const RELEASE: &str = "RELEASE SAVEPOINT cdc_op";
const ROLLBACK_TO: &str = "ROLLBACK TO SAVEPOINT cdc_op";

/// Hands out destination connections.
#[async_trait]
pub trait Destination: Send + Sync + 'static {
    type Conn: Executor + 'static;

    async fn acquire(&self) -> Result<Self::Conn>;
}

#[async_trait]
impl Destination for deadpool_postgres::Pool {
    type Conn = deadpool_postgres::Object;

    async fn acquire(&self) -> Result<Self::Conn> {
        Ok(self.get().await?)
    }
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub workers: usize,
    pub queue: usize,
    pub commit_delay: Duration,
}

pub struct WorkerPool {
    senders: Vec<mpsc::Sender<Operation>>,
    tracker: Arc<WatermarkTracker>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn the workers. `restart` is notified when a worker loses its
    /// destination connection.
    pub fn start<D: Destination>(
        destination: Arc<D>,
        opts: &PoolOptions,
        tracker: Arc<WatermarkTracker>,
        restart: Arc<Notify>,
        cancel: CancellationToken,
    ) -> Self {
        let n = opts.workers.max(1);
        let mut senders = Vec::with_capacity(n);
        let mut handles = Vec::with_capacity(n);
        for id in 0..n {
            let (tx, rx) = mpsc::channel(opts.queue.max(1));
            let worker = Worker {
                id,
                destination: Arc::clone(&destination),
                tracker: Arc::clone(&tracker),
                restart: Arc::clone(&restart),
                conn: None,
            };
            handles.push(tokio::spawn(worker.run(rx, opts.commit_delay, cancel.clone())));
            senders.push(tx);
        }
        info!(workers = n, commit_delay = ?opts.commit_delay, "worker pool started");
        Self {
            senders,
            tracker,
            handles: Mutex::new(handles),
        }
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    pub fn tracker(&self) -> &Arc<WatermarkTracker> {
        &self.tracker
    }

    pub fn worker_for(&self, route_key: u64) -> usize {
        (route_key % self.senders.len() as u64) as usize
    }

    /// Queue `op` on its worker; waits while that worker's queue is full.
    pub async fn dispatch(&self, op: Operation) -> Result<()> {
        let w = self.worker_for(op.entry.route_key);
        self.tracker
            .dispatch(w, &SourceKey::new(op.database(), op.sid.as_str()), op.lsn);
        self.senders[w]
            .send(op)
            .await
            .map_err(|_| StreamerError::Task(format!("worker {w} has stopped")))
    }

    /// Close the queues and wait for the workers to drain and commit.
    pub async fn join(mut self) {
        drop(std::mem::take(&mut self.senders));
        self.wait().await;
    }

    /// Wait for the workers to stop; they stop once cancelled.
    pub async fn wait(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        for h in handles {
            if let Err(e) = h.await {
                error!(error = %e, "worker task failed");
            }
        }
    }
}

struct Worker<D: Destination> {
    id: usize,
    destination: Arc<D>,
    tracker: Arc<WatermarkTracker>,
    restart: Arc<Notify>,
    /// Set while a transaction is open.
    conn: Option<D::Conn>,
}

impl<D: Destination> Worker<D> {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<Operation>,
        commit_delay: Duration,
        cancel: CancellationToken,
    ) {
        let mut tick = tokio::time::interval_at(Instant::now() + commit_delay, commit_delay);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(worker = self.id, "worker started");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,
                _ = tick.tick() => self.commit().await,
                op = rx.recv() => match op {
                    Some(op) => self.handle(op).await,
                    None => break,
                },
            }
        }
        self.commit().await;
        debug!(worker = self.id, "worker stopped");
    }

    async fn handle(&mut self, op: Operation) {
        telemetry::record_job(self.id);
        let key = SourceKey::new(op.database(), op.sid.as_str());

        if let Err(e) = self.begin().await {
            error!(worker = self.id, error = %e, "cannot open destination transaction");
            telemetry::record_operation(&op, Outcome::Error, Duration::ZERO);
            self.fail();
            return;
        }
        let Some(conn) = self.conn.as_ref() else {
            return;
        };

        let start = Instant::now();
        let result = apply_in_savepoint(conn, &op).await;
        let elapsed = start.elapsed();
        match result {
            Ok(rows) => {
                debug!(worker = self.id, table = %op.source_table, op = %op.kind, rows, lsn = %op.lsn, "applied");
                telemetry::record_operation(&op, Outcome::Ok, elapsed);
            }
            Err(e) if e.is_sync() => {
                warn!(
                    worker = self.id,
                    database = %op.database(),
                    sid = %op.sid,
                    table = %op.source_table,
                    lsn = %op.lsn,
                    error = %e,
                    "destination out of sync"
                );
                telemetry::record_operation(&op, Outcome::Sync, elapsed);
            }
            Err(e) => {
                error!(
                    worker = self.id,
                    database = %op.database(),
                    sid = %op.sid,
                    table = %op.source_table,
                    op = %op.kind,
                    lsn = %op.lsn,
                    error = %e,
                    "operation dropped"
                );
                telemetry::record_operation(&op, Outcome::Error, elapsed);
                if conn.is_closed() || matches!(e, StreamerError::Task(_)) {
                    self.fail();
                    return;
                }
            }
        }
        self.tracker.applied(self.id, &key, op.lsn);
    }

    async fn begin(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let conn = self.destination.acquire().await?;
        conn.batch_execute("BEGIN").await?;
        self.conn = Some(conn);
        Ok(())
    }

    async fn commit(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        match conn.batch_execute("COMMIT").await {
            Ok(()) => {
                self.tracker.commit(self.id);
                debug!(worker = self.id, "committed");
            }
            Err(e) => {
                error!(worker = self.id, error = %e, "commit failed");
                self.fail();
            }
        }
    }

    /// The transaction is lost.
    fn fail(&mut self) {
        self.conn = None;
        self.tracker.abandon(self.id);
        self.restart.notify_one();
    }
}

/// Run `op` under a savepoint. Only a failure of the savepoint handling
/// itself is reported as [`StreamerError::Task`].
async fn apply_in_savepoint<E: Executor + ?Sized>(conn: &E, op: &Operation) -> Result<u64> {
    let lost = |e: StreamerError| StreamerError::Task(format!("savepoint: {e}"));
    conn.batch_execute(SAVEPOINT).await.map_err(lost)?;
    match writer::apply(conn, op, Utc::now()).await {
        Ok(rows) => {
            conn.batch_execute(RELEASE).await.map_err(lost)?;
            Ok(rows)
        }
        Err(e) if e.is_sync() => {
            conn.batch_execute(RELEASE).await.map_err(lost)?;
            Err(e)
        }
        Err(e) => {
            conn.batch_execute(ROLLBACK_TO).await.map_err(lost)?;
            Err(e)
        }
    }
}
