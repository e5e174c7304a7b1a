//! Frontend/backend protocol pieces used by source sessions.
//!
//! [`framing`] cuts the byte stream into tagged messages (one tag byte, a
//! length that counts itself, the payload; startup and SSLRequest carry no
//! tag). [`messages`] reads the authentication, error and result bodies a
//! session cares about. [`pgoutput`] decodes what the output plugin puts in
//! each WAL message.
//!
//! While a slot streams, every CopyData frame is either a WAL message or a
//! keepalive ([`replication`]). The session answers with status updates
//! carrying the position committed at the destination.

pub mod framing;
pub mod messages;
pub mod pgoutput;
pub mod replication;

pub use framing::{BackendMessage, MessageReader};
pub use messages::{ErrorFields, parse_auth_request, parse_error_response};
pub use pgoutput::{
    ColumnData, LogicalMessage, OldTuple, PgOutputDecoder, RelationBody, RelationColumn, TupleData,
};
pub use replication::{StatusUpdate, StreamMessage};
