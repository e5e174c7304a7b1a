//! Per-URL logical replication sessions.
//!
//! A [`Connector`] owns one source URL for the life of the process. Each
//! session walks the same path:
//!
//! ```text
//! Connecting ─► VersionCheck ─► SlotSetup ─► FullSync ─► Streaming
//!      ▲                                                    │
//!      └──────────────── Reconnecting ◄──── error ──────────┘
//! ```
//!
//! Cancellation ends the connector (`Terminated`); a restart command ends
//! the current session cleanly and starts a new one without backoff.

mod connector;
mod processor;
pub mod slot;

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::StreamerError;

pub use connector::{Connector, ConnectorContext};
pub use processor::{Dispatcher, PgRelation, Processor, Router};
pub use slot::{plugin_options, slot_name};

/// Oldest server major version with the features sessions rely on.
pub const MIN_SERVER_VERSION: u32 = 12;
/// Newest server major version known to work.
pub const MAX_TESTED_SERVER_VERSION: u32 = 17;

/// Sent to a running connector over its command channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// Close the session and open a new one, without backoff.
    Restart,
}

/// How a session ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Cancelled,
    Restart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    VersionCheck,
    SlotSetup,
    FullSync,
    Streaming,
    Reconnecting,
    Terminated,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Connecting => "connecting",
            State::VersionCheck => "version_check",
            State::SlotSetup => "slot_setup",
            State::FullSync => "full_sync",
            State::Streaming => "streaming",
            State::Reconnecting => "reconnecting",
            State::Terminated => "terminated",
        })
    }
}

/// Last failure seen on a source URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlError {
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Failures keyed by source URL, for operators to inspect.
#[derive(Debug, Default)]
pub struct UrlErrors {
    inner: Mutex<HashMap<String, UrlError>>,
}

impl UrlErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, url: &str, err: &StreamerError) {
        self.inner.lock().insert(
            url.to_string(),
            UrlError {
                message: err.to_string(),
                at: Utc::now(),
            },
        );
    }

    pub fn clear(&self, url: &str) {
        self.inner.lock().remove(url);
    }

    pub fn get(&self, url: &str) -> Option<UrlError> {
        self.inner.lock().get(url).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, UrlError> {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_errors_keep_the_latest_failure() {
        let errors = UrlErrors::new();
        let url = "postgres://repl@db1/shop";
        errors.record(url, &StreamerError::Io("connection refused".into()));
        errors.record(url, &StreamerError::Server("slot is active".into()));

        let err = errors.get(url).unwrap();
        assert!(err.message.contains("slot is active"));
        assert_eq!(errors.snapshot().len(), 1);

        errors.clear(url);
        assert!(errors.get(url).is_none());
    }

    #[test]
    fn states_display_as_snake_case() {
        assert_eq!(State::SlotSetup.to_string(), "slot_setup");
        assert_eq!(State::Terminated.to_string(), "terminated");
    }
}
