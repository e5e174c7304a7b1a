#![warn(
    clippy::all,
    clippy::cargo,
    clippy::perf,
    clippy::style,
    clippy::correctness,
    clippy::suspicious
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::multiple_crate_versions
)]

//! Multi-source PostgreSQL logical replication into one destination
//! database.
//!
//! Each configured source URL gets a replication session that decodes
//! pgoutput, resolves every change against the table mapping and hands it
//! to a fixed pool of destination writers. Tables are written in one of
//! three modes: a mirror (`clone`), a versioned log (`history`) or an
//! insert-only log (`append`). New slots and newly published tables are
//! bootstrapped with a throttled `COPY`. The slot is only acknowledged up to
//! the position whose changes are committed in the destination.

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod expr;
pub mod lsn;
pub mod mapping;
pub mod protocol;
pub mod replication;
pub mod streamer;
pub mod sync;
pub mod telemetry;
pub mod tls;
pub mod value;
pub mod worker;
pub mod writer;

pub use config::{SourceConfig, SslMode, StreamerConfig, TlsConfig};
pub use error::{Result, StreamerError};
pub use expr::{CelEngine, ExpressionEngine};
pub use lsn::Lsn;
pub use mapping::{
    FileMappingSource, MappingEntry, MappingSource, MappingTable, SourceDatabase, SourceUrl,
    StaticMappingSource, TableConfig, WriteMode,
};
pub use replication::{UrlError, UrlErrors};
pub use streamer::{Streamer, StreamerHandle};
pub use value::Value;
pub use worker::{SourceKey, WatermarkTracker};
