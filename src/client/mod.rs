//! Source-side PostgreSQL sessions.
//!
//! [`PgConnection`] speaks the frontend/backend protocol directly, which is
//! what logical replication needs: `replication=database` startup, the
//! replication command set and COPY-both streaming. The same type serves
//! catalog reads (simple query) and full-sync exports (`COPY ... TO STDOUT`).
//!
//! ```text
//! ┌──────────────┐  START_REPLICATION   ┌─────────────────┐
//! │  Connector   │─────────────────────►│   PostgreSQL    │
//! │              │◄─────────────────────│   (pgoutput)    │
//! │              │  XLogData/KeepAlive  │                 │
//! │              │─────────────────────►│                 │
//! └──────────────┘  StandbyStatusUpdate └─────────────────┘
//! ```

mod connection;

pub use connection::{ConnectionKind, PgConnection, SimpleRow, SnapshotAction, SystemIdentity};
