//! Error types for pgwire-streamer.
//!
//! All errors in this crate are represented by [`StreamerError`]. The source
//! side (wire protocol, authentication, TLS) and the destination side
//! (statements, pool, copy) share one enum so connectors and workers can log
//! and classify failures uniformly.

use thiserror::Error;

/// Error type for all pgwire-streamer operations.
#[derive(Debug, Error, Clone)]
pub enum StreamerError {
    /// I/O error (network, file system).
    ///
    /// Note: `std::io::Error` is not `Clone`, so we store the message.
    #[error("io error: {0}")]
    Io(String),

    /// Protocol error - malformed message or unexpected response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server error - the source returned an error response.
    ///
    /// The message typically includes SQLSTATE code.
    #[error("server error: {0}")]
    Server(String),

    /// Authentication error - wrong credentials or unsupported method.
    #[error("authentication error: {0}")]
    Auth(String),

    /// TLS error - handshake failure, certificate validation, etc.
    #[error("tls error: {0}")]
    Tls(String),

    /// Task error - a spawned task panicked or a channel closed.
    #[error("task error: {0}")]
    Task(String),

    /// Invalid configuration (bad URL, unsupported server, bad mapping file).
    #[error("config error: {0}")]
    Config(String),

    /// Destination database error (statement, pool, copy).
    #[error("destination error: {0}")]
    Destination(String),

    /// Mapping error - table not mapped or destination table missing.
    #[error("mapping error: {0}")]
    Mapping(String),

    /// Expression compile or evaluation error.
    #[error("expression error: {0}")]
    Expression(String),

    /// The destination does not hold the row a change refers to.
    #[error("sync error: {0}")]
    Sync(String),

    /// A change could not be turned into a statement.
    #[error("write error: {0}")]
    Write(String),

    /// Internal error - bug in the library.
    #[error("internal error: {0}")]
    Internal(String),
}

impl StreamerError {
    /// Returns `true` if this is an I/O error.
    #[inline]
    pub fn is_io(&self) -> bool {
        matches!(self, StreamerError::Io(_))
    }

    /// Returns `true` if this is a server error.
    #[inline]
    pub fn is_server(&self) -> bool {
        matches!(self, StreamerError::Server(_))
    }

    /// Returns `true` if the destination drifted from the source.
    #[inline]
    pub fn is_sync(&self) -> bool {
        matches!(self, StreamerError::Sync(_))
    }

    /// Returns `true` if this error is likely transient and retryable.
    ///
    /// Transient errors include I/O, task and destination errors. Non-transient
    /// errors (auth, config, protocol) typically require operator action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StreamerError::Io(_) | StreamerError::Task(_) | StreamerError::Destination(_)
        )
    }
}

// Manual From impls since the wrapped errors aren't Clone
impl From<std::io::Error> for StreamerError {
    fn from(err: std::io::Error) -> Self {
        StreamerError::Io(err.to_string())
    }
}

impl From<tokio_postgres::Error> for StreamerError {
    fn from(err: tokio_postgres::Error) -> Self {
        match err.as_db_error() {
            Some(db) => StreamerError::Destination(format!(
                "{} (SQLSTATE {})",
                db.message(),
                db.code().code()
            )),
            None => StreamerError::Destination(err.to_string()),
        }
    }
}

impl From<deadpool_postgres::PoolError> for StreamerError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        StreamerError::Destination(format!("pool: {err}"))
    }
}

impl From<serde_yaml::Error> for StreamerError {
    fn from(err: serde_yaml::Error) -> Self {
        StreamerError::Config(err.to_string())
    }
}

impl From<crate::lsn::ParseLsnError> for StreamerError {
    fn from(err: crate::lsn::ParseLsnError) -> Self {
        StreamerError::Protocol(err.to_string())
    }
}

/// Result type alias for pgwire-streamer operations.
pub type Result<T> = std::result::Result<T, StreamerError>;
