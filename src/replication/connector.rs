use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::processor::{Dispatcher, Processor};
use super::slot::{self, Setup};
use super::{
    MAX_TESTED_SERVER_VERSION, MIN_SERVER_VERSION, SessionCommand, SessionEnd, State, UrlErrors,
};
use crate::client::{ConnectionKind, PgConnection};
use crate::config::{SourceConfig, StreamerConfig};
use crate::error::{Result, StreamerError};
use crate::mapping::{MappingTable, MappingView, SourceUrl};
use crate::protocol::StreamMessage;
use crate::protocol::replication::lag;
use crate::sync::FullSync;
use crate::telemetry;
use crate::worker::{SourceKey, WatermarkTracker};

/// Everything connectors share.
pub struct ConnectorContext {
    pub config: Arc<StreamerConfig>,
    pub mapping: Arc<dyn MappingView>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub tracker: Arc<WatermarkTracker>,
    pub full_sync: FullSync,
    pub errors: Arc<UrlErrors>,
}

/// Replicates one source URL until cancelled.
pub struct Connector {
    ctx: Arc<ConnectorContext>,
    url: SourceUrl,
    key: SourceKey,
    slot: String,
    commands: mpsc::Receiver<SessionCommand>,
}

enum Event {
    Stop(SessionEnd),
    StatusDue,
    Message(Option<StreamMessage>),
}

/// Standby status cadence. An update is due every `interval`, or at once
/// when the server asks for a reply.
#[derive(Debug)]
struct StatusClock {
    interval: Duration,
    next: Instant,
}

impl StatusClock {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now() + interval,
        }
    }

    fn deadline(&self) -> Instant {
        self.next
    }

    fn is_due(&self) -> bool {
        Instant::now() >= self.next
    }

    fn sent(&mut self) {
        self.next = Instant::now() + self.interval;
    }

    fn request_reply(&mut self) {
        self.next = Instant::now();
    }
}

impl Connector {
    pub fn new(
        ctx: Arc<ConnectorContext>,
        database: &str,
        url: SourceUrl,
        commands: mpsc::Receiver<SessionCommand>,
    ) -> Self {
        let slot = slot::slot_name(&ctx.config.slot_prefix, database, &url.sid);
        let key = SourceKey::new(database, url.sid.as_str());
        Self {
            ctx,
            url,
            key,
            slot,
            commands,
        }
    }

    pub fn key(&self) -> &SourceKey {
        &self.key
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    fn enter(&self, state: State) {
        info!(database = %self.key.database, sid = %self.key.sid, %state, "connector state");
    }

    /// Run sessions until `cancel` fires. Failures are recorded and retried
    /// after the configured backoff.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            match self.session(&cancel).await {
                Ok(SessionEnd::Cancelled) => break,
                Ok(SessionEnd::Restart) => {
                    info!(database = %self.key.database, sid = %self.key.sid, "session restart requested");
                }
                Err(e) => {
                    error!(
                        database = %self.key.database,
                        sid = %self.key.sid,
                        slot = %self.slot,
                        error = %e,
                        transient = e.is_transient(),
                        "replication session failed"
                    );
                    self.ctx.errors.record(&self.url.url, &e);
                    self.enter(State::Reconnecting);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.ctx.config.retry_backoff) => {}
                        Some(SessionCommand::Restart) = self.commands.recv() => {}
                    }
                }
            }
        }
        self.enter(State::Terminated);
    }

    async fn session(&mut self, cancel: &CancellationToken) -> Result<SessionEnd> {
        self.enter(State::Connecting);
        let mut cfg = SourceConfig::from_url(&self.url.url)?;
        cfg.application_name = self.ctx.config.application_name.clone();

        let mut conn = tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            conn = PgConnection::connect(&cfg, ConnectionKind::Replication) => conn?,
        };
        debug!(
            host = %cfg.host,
            server_version = conn.server_param("server_version").unwrap_or("unknown"),
            "connected"
        );

        self.enter(State::VersionCheck);
        let major = check_server(&mut conn).await?;

        self.enter(State::SlotSetup);
        let mapping = self.ctx.mapping.snapshot();
        let tables = mapping.base_tables(&self.key.database);
        if tables.is_empty() {
            warn!(database = %self.key.database, "no replicated tables; publication will be empty");
        }
        let setup = slot::prepare(&mut conn, &self.slot, &tables).await?;

        if !setup.new_tables.is_empty() {
            self.enter(State::FullSync);
            if let Some(end) = self.initial_sync(&mut conn, &cfg, &mapping, &setup, cancel).await? {
                conn.close().await;
                return Ok(end);
            }
        } else if setup.created {
            conn.execute("COMMIT").await?;
        }

        self.stream(conn, major, setup, cancel).await
    }

    /// Copy the tables a session has to sync before streaming. Returns a
    /// session end if cancelled part way.
    async fn initial_sync(
        &self,
        conn: &mut PgConnection,
        cfg: &SourceConfig,
        mapping: &MappingTable,
        setup: &Setup,
        cancel: &CancellationToken,
    ) -> Result<Option<SessionEnd>> {
        let mut done = Vec::new();
        let result = self
            .sync_tables(conn, mapping, &setup.new_tables, &mut done, cancel)
            .await;
        let result = match result {
            Ok(()) if setup.created => conn.execute("COMMIT").await,
            other => other,
        };

        if let Err(e) = result {
            let pending: Vec<String> = setup
                .new_tables
                .iter()
                .filter(|t| !done.contains(t))
                .cloned()
                .collect();
            if let Err(undo) = self.undo_setup(cfg, setup.created, &pending).await {
                error!(slot = %self.slot, error = %undo, "cannot undo publication changes after failed sync");
            }
            if cancel.is_cancelled() {
                return Ok(Some(SessionEnd::Cancelled));
            }
            return Err(e);
        }

        if setup.created && !self.ctx.config.start_delay.is_zero() {
            debug!(delay = ?self.ctx.config.start_delay, "waiting before streaming");
            tokio::select! {
                _ = cancel.cancelled() => return Ok(Some(SessionEnd::Cancelled)),
                _ = tokio::time::sleep(self.ctx.config.start_delay) => {}
            }
        }
        Ok(None)
    }

    async fn sync_tables(
        &self,
        conn: &mut PgConnection,
        mapping: &MappingTable,
        tables: &[String],
        done: &mut Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for table in tables {
            let Some(entry) = mapping.find(&self.key.database, table) else {
                warn!(database = %self.key.database, %table, "published table has no mapping, not synced");
                done.push(table.clone());
                continue;
            };
            if !entry.present {
                warn!(%table, target = %entry.target, "destination table missing, not synced");
                done.push(table.clone());
                continue;
            }
            self.ctx
                .full_sync
                .run_table(conn, entry, table, &self.key.sid, cancel)
                .await?;
            done.push(table.clone());
        }
        Ok(())
    }

    /// Make the next session retry the sync: a fresh slot drops its
    /// publication so the pair is recreated; tables added to an existing
    /// publication are removed again.
    async fn undo_setup(&self, cfg: &SourceConfig, created: bool, pending: &[String]) -> Result<()> {
        let mut conn = PgConnection::connect(cfg, ConnectionKind::Regular).await?;
        let result = if created {
            slot::drop_publication(&mut conn, &self.slot).await
        } else {
            slot::alter_publication(&mut conn, &self.slot, &[], pending).await
        };
        conn.close().await;
        result
    }

    async fn stream(
        &mut self,
        mut conn: PgConnection,
        major: u32,
        setup: Setup,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd> {
        let tracker = Arc::clone(&self.ctx.tracker);
        tracker.reset_source(&self.key);

        let options = slot::plugin_options(major, &self.slot);
        conn.start_replication(&self.slot, setup.start, &options).await?;
        self.ctx.errors.clear(&self.url.url);
        self.enter(State::Streaming);
        info!(slot = %self.slot, start = %setup.start, "streaming started");

        let mut processor = Processor::new(
            self.key.clone(),
            Arc::clone(&self.ctx.mapping),
            Arc::clone(&self.ctx.dispatcher),
        );
        let mut status = StatusClock::new(self.ctx.config.status_interval);

        let end = loop {
            // a busy stream never lets the receive time out
            let event = if status.is_due() {
                Event::StatusDue
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => Event::Stop(SessionEnd::Cancelled),
                    Some(SessionCommand::Restart) = self.commands.recv() => Event::Stop(SessionEnd::Restart),
                    msg = tokio::time::timeout_at(status.deadline(), conn.recv_replication()) => match msg {
                        Err(_) => Event::StatusDue,
                        Ok(msg) => Event::Message(msg?),
                    },
                }
            };

            match event {
                Event::Stop(end) => break end,
                Event::StatusDue => {
                    let safe = tracker.safe_lsn(&self.key);
                    if !safe.is_zero() {
                        conn.send_standby_status(safe, false).await?;
                        trace!(slot = %self.slot, lsn = %safe, "standby status sent");
                    }
                    status.sent();
                }
                Event::Message(None) => {
                    return Err(StreamerError::Protocol("server ended the replication stream".into()));
                }
                Event::Message(Some(StreamMessage::Keepalive { end, reply, .. })) => {
                    telemetry::record_heartbeat(&self.key.database, &self.key.sid);
                    trace!(wal_end = %end, reply, "keepalive");
                    if reply {
                        status.request_reply();
                    }
                }
                Event::Message(Some(StreamMessage::Wal { sent_at, data, .. })) => {
                    telemetry::record_heartbeat(&self.key.database, &self.key.sid);
                    if let Some(sent_at) = sent_at {
                        telemetry::record_lag(&self.key.database, &self.key.sid, lag(sent_at));
                    }
                    processor.process(data).await?;
                }
            }
        };

        let safe = tracker.safe_lsn(&self.key);
        if !safe.is_zero() {
            let _ = conn.send_standby_status(safe, false).await;
        }
        if let Err(e) = conn.finish_replication().await {
            debug!(error = %e, "finishing replication");
        }
        conn.close().await;
        info!(slot = %self.slot, ?end, open_streams = processor.open_streams(), "streaming stopped");
        Ok(end)
    }
}

/// Server major version, after checking it and `wal_level`.
async fn check_server(conn: &mut PgConnection) -> Result<u32> {
    let num: u32 = show(conn, "server_version_num")
        .await?
        .parse()
        .map_err(|e| StreamerError::Protocol(format!("bad server_version_num: {e}")))?;
    let major = num / 10_000;
    check_version(major)?;

    let wal_level = show(conn, "wal_level").await?;
    if wal_level != "logical" {
        return Err(StreamerError::Config(format!(
            "wal_level is {wal_level}, logical replication needs wal_level = logical"
        )));
    }
    Ok(major)
}

fn check_version(major: u32) -> Result<()> {
    if major < MIN_SERVER_VERSION {
        return Err(StreamerError::Config(format!(
            "server version {major} is not supported, need {MIN_SERVER_VERSION} or later"
        )));
    }
    if major > MAX_TESTED_SERVER_VERSION {
        warn!(version = major, "server version is newer than any tested");
    }
    Ok(())
}

async fn show(conn: &mut PgConnection, setting: &str) -> Result<String> {
    let rows = conn.simple_query(&format!("SHOW {setting}")).await?;
    rows.first()
        .and_then(|r| r.get_idx(0))
        .map(str::to_string)
        .ok_or_else(|| StreamerError::Protocol(format!("SHOW {setting} returned nothing")))
}
