//! Metric names and recording helpers.
//!
//! Recorded through the `metrics` facade; without an installed recorder
//! these are no-ops.

use std::time::Duration;

use metrics::{counter, gauge, histogram};

use crate::writer::Operation;

pub const OPERATIONS_TOTAL: &str = "streamer_operations_total";
pub const OPERATION_SECONDS: &str = "streamer_operation_seconds";
pub const SYNC_ROWS_TOTAL: &str = "streamer_sync_rows_total";
pub const SYNC_BYTES_TOTAL: &str = "streamer_sync_bytes_total";
pub const JOBS_TOTAL: &str = "streamer_jobs_total";
pub const URL_HEARTBEAT: &str = "streamer_url_heartbeat";
pub const URL_LAG_SECONDS: &str = "streamer_url_lag_seconds";

/// Outcome label of an applied operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    /// Zero rows affected where one was expected.
    Sync,
    Error,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::Sync => "sync",
            Outcome::Error => "error",
        }
    }
}

pub fn record_operation(op: &Operation, outcome: Outcome, elapsed: Duration) {
    counter!(
        OPERATIONS_TOTAL,
        "database" => op.database().to_string(),
        "sid" => op.sid.clone(),
        "table" => op.source_table.clone(),
        "operation" => op.kind.as_str(),
        "result" => outcome.as_str(),
    )
    .increment(1);
    histogram!(OPERATION_SECONDS, "operation" => op.kind.as_str()).record(elapsed.as_secs_f64());
}

pub fn record_sync(database: &str, sid: &str, table: &str, rows: u64, bytes: u64) {
    counter!(
        SYNC_ROWS_TOTAL,
        "database" => database.to_string(),
        "sid" => sid.to_string(),
        "table" => table.to_string(),
    )
    .increment(rows);
    counter!(
        SYNC_BYTES_TOTAL,
        "database" => database.to_string(),
        "sid" => sid.to_string(),
        "table" => table.to_string(),
    )
    .increment(bytes);
}

pub fn record_job(worker: usize) {
    counter!(JOBS_TOTAL, "worker" => worker.to_string()).increment(1);
}

/// Unix seconds of the last message seen on a source URL.
pub fn record_heartbeat(database: &str, sid: &str) {
    gauge!(
        URL_HEARTBEAT,
        "database" => database.to_string(),
        "sid" => sid.to_string(),
    )
    .set(chrono::Utc::now().timestamp() as f64);
}

/// Server clock minus the send time of the last WAL message.
pub fn record_lag(database: &str, sid: &str, lag: chrono::TimeDelta) {
    gauge!(
        URL_LAG_SECONDS,
        "database" => database.to_string(),
        "sid" => sid.to_string(),
    )
    .set(lag.num_milliseconds() as f64 / 1000.0);
}
