//! Process-level runtime: one destination pool, one worker pool, and one
//! connector per configured source URL.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use pgwire_streamer::{CelEngine, FileMappingSource, Streamer, StreamerConfig};
//!
//! # async fn example() -> pgwire_streamer::Result<()> {
//! let config = StreamerConfig {
//!     destination_url: "postgres://cdc@warehouse/cdc".into(),
//!     ..StreamerConfig::default()
//! };
//! let streamer = Streamer::new(
//!     config,
//!     Arc::new(FileMappingSource::new("mapping.yaml")),
//!     Arc::new(CelEngine),
//! )?;
//! let handle = streamer.handle();
//! tokio::spawn(async move {
//!     tokio::signal::ctrl_c().await.ok();
//!     handle.shutdown();
//! });
//! streamer.run().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::StreamerConfig;
use crate::error::{Result, StreamerError};
use crate::expr::ExpressionEngine;
use crate::mapping::{BuildOptions, MappingSource, MappingTable, MappingView, TableMapper};
use crate::replication::{Connector, ConnectorContext, Router, SessionCommand, UrlError, UrlErrors};
use crate::sync::{FullSync, RateLimiter};
use crate::worker::{PoolOptions, WatermarkTracker, WorkerPool};
use crate::writer::statement;

/// Capacity of each connector's command channel.
const COMMAND_QUEUE: usize = 4;

struct Shared {
    destination: Pool,
    mapper: Arc<TableMapper>,
    pool: Arc<WorkerPool>,
    context: Arc<ConnectorContext>,
    errors: Arc<UrlErrors>,
    restart: Arc<Notify>,
    sessions: Mutex<HashMap<String, mpsc::Sender<SessionCommand>>>,
    cancel: CancellationToken,
}

pub struct Streamer {
    shared: Arc<Shared>,
}

impl Streamer {
    /// Build the runtime and start the workers. Must be called inside a
    /// Tokio runtime.
    pub fn new(
        config: StreamerConfig,
        source: Arc<dyn MappingSource>,
        engine: Arc<dyn ExpressionEngine>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let destination = destination_pool(&config)?;
        let cancel = CancellationToken::new();

        let mapper = Arc::new(TableMapper::new(
            source,
            engine,
            destination.clone(),
            BuildOptions {
                default_schema: config.default_schema.clone(),
                destination_schema: config.destination_schema.clone(),
            },
            config.application_name.clone(),
        ));

        let tracker = Arc::new(WatermarkTracker::new());
        let restart = Arc::new(Notify::new());
        let pool = Arc::new(WorkerPool::start(
            Arc::new(destination.clone()),
            &PoolOptions {
                workers: config.num_workers,
                queue: config.worker_queue,
                commit_delay: config.commit_delay,
            },
            Arc::clone(&tracker),
            Arc::clone(&restart),
            cancel.child_token(),
        ));

        let limiter = Arc::new(RateLimiter::new(config.sync_rate, config.sync_burst));
        let errors = Arc::new(UrlErrors::new());
        let context = Arc::new(ConnectorContext {
            config: Arc::clone(&config),
            mapping: Arc::clone(&mapper) as Arc<dyn MappingView>,
            dispatcher: Arc::new(Router::new(Arc::clone(&pool), destination.clone())),
            tracker,
            full_sync: FullSync::new(Arc::new(destination.clone()), limiter, config.worker_queue),
            errors: Arc::clone(&errors),
        });

        Ok(Self {
            shared: Arc::new(Shared {
                destination,
                mapper,
                pool,
                context,
                errors,
                restart,
                sessions: Mutex::new(HashMap::new()),
                cancel,
            }),
        })
    }

    pub fn handle(&self) -> StreamerHandle {
        StreamerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Replicate until shut down. Fails only if the first mapping refresh
    /// does.
    pub async fn run(&self) -> Result<()> {
        let s = &self.shared;
        s.mapper.refresh().await?;

        loop {
            let generation = s.cancel.child_token();
            let tasks = self.spawn_connectors(&generation);

            let restart = tokio::select! {
                _ = s.cancel.cancelled() => false,
                _ = s.restart.notified() => true,
            };
            generation.cancel();
            for task in tasks {
                if let Err(e) = task.await {
                    error!(error = %e, "connector task failed");
                }
            }
            if !restart || !restart_backoff(&s.cancel, &s.restart, s.context.config.retry_backoff).await {
                break;
            }

            info!("restarting all sessions");
            if let Err(e) = s.mapper.refresh().await {
                warn!(error = %e, "mapping refresh failed, keeping previous snapshot");
            }
        }

        s.pool.wait().await;
        info!("streamer stopped");
        Ok(())
    }

    fn spawn_connectors(&self, generation: &CancellationToken) -> Vec<JoinHandle<()>> {
        let s = &self.shared;
        let mapping = s.mapper.snapshot();
        let mut sessions = s.sessions.lock();
        sessions.clear();

        let mut tasks = Vec::new();
        for db in mapping.databases() {
            for url in &db.urls {
                let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
                sessions.insert(url.url.clone(), tx);
                let connector = Connector::new(Arc::clone(&s.context), &db.name, url.clone(), rx);
                tasks.push(tokio::spawn(connector.run(generation.child_token())));
            }
        }
        info!(connectors = tasks.len(), "connectors started");
        tasks
    }
}

/// Cloneable control surface for a running [`Streamer`].
#[derive(Clone)]
pub struct StreamerHandle {
    shared: Arc<Shared>,
}

impl StreamerHandle {
    pub fn mapping(&self) -> Arc<MappingTable> {
        self.shared.mapper.snapshot()
    }

    pub async fn refresh(&self) -> Result<Arc<MappingTable>> {
        self.shared.mapper.refresh().await
    }

    /// End every session and start over with a fresh mapping.
    pub fn restart_all(&self) {
        self.shared.restart.notify_one();
    }

    /// Restart the session of one source URL.
    pub async fn restart_source(&self, url: &str) -> Result<()> {
        let tx = self
            .shared
            .sessions
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| StreamerError::Config("no session for this url".into()))?;
        tx.send(SessionCommand::Restart)
            .await
            .map_err(|_| StreamerError::Task("session has stopped".into()))
    }

    pub fn url_errors(&self) -> HashMap<String, UrlError> {
        self.shared.errors.snapshot()
    }

    /// Create the destination table of mapping entry `id` if it is missing,
    /// then refresh the mapping. Returns whether a table was created.
    pub async fn ensure_destination_table(&self, id: usize) -> Result<bool> {
        let mapping = self.shared.mapper.snapshot();
        let entry = mapping
            .get(id)
            .ok_or_else(|| StreamerError::Mapping(format!("no mapping entry {id}")))?;
        if entry.present {
            return Ok(false);
        }
        let sql = statement::create_table(entry);
        info!(table = %entry.qualified(), target = %entry.target, "creating destination table");
        let conn = self.shared.destination.get().await?;
        conn.batch_execute(&sql).await?;
        drop(conn);
        self.shared.mapper.refresh().await?;
        Ok(true)
    }

    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
    }
}

/// Wait `backoff` before the next generation, merging restart requests
/// raised meanwhile. Returns `false` when cancelled.
async fn restart_backoff(cancel: &CancellationToken, restart: &Notify, backoff: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => return false,
        _ = tokio::time::sleep(backoff) => {}
    }
    let _ = restart.notified().now_or_never();
    true
}

fn destination_pool(config: &StreamerConfig) -> Result<Pool> {
    let pg: tokio_postgres::Config = config
        .destination_url
        .parse()
        .map_err(|e| StreamerError::Config(format!("destination url: {e}")))?;
    let manager = Manager::from_config(
        pg,
        tokio_postgres::NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    Pool::builder(manager)
        .max_size(config.destination_pool_size.max(1))
        .build()
        .map_err(|e| StreamerError::Config(format!("destination pool: {e}")))
}
