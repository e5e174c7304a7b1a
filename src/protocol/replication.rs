//! CopyBoth payloads exchanged while a slot is streaming.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeDelta, Utc};

use crate::error::{Result, StreamerError};
use crate::lsn::Lsn;

/// Microseconds between the Unix epoch and 2000-01-01, the server's epoch.
const SERVER_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

/// What the walsender can put inside a CopyData frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMessage {
    /// `w`: one pgoutput message.
    Wal {
        start: Lsn,
        end: Lsn,
        sent_at: Option<DateTime<Utc>>,
        data: Bytes,
    },
    /// `k`: primary keepalive.
    Keepalive {
        end: Lsn,
        sent_at: Option<DateTime<Utc>>,
        reply: bool,
    },
}

impl StreamMessage {
    /// Decode a CopyData body.
    pub fn decode(mut body: Bytes) -> Result<Self> {
        if !body.has_remaining() {
            return Err(StreamerError::Protocol("empty CopyData in replication stream".into()));
        }
        let kind = body.get_u8();
        match kind {
            b'w' => {
                need(&body, 24, "wal message")?;
                let start = Lsn(body.get_u64());
                let end = Lsn(body.get_u64());
                let sent_at = from_server_time(body.get_i64());
                Ok(Self::Wal { start, end, sent_at, data: body })
            }
            b'k' => {
                need(&body, 17, "keepalive")?;
                Ok(Self::Keepalive {
                    end: Lsn(body.get_u64()),
                    sent_at: from_server_time(body.get_i64()),
                    reply: body.get_u8() != 0,
                })
            }
            other => Err(StreamerError::Protocol(format!(
                "unexpected replication message kind 0x{other:02x}"
            ))),
        }
    }

    /// Server end of WAL as of this message.
    pub fn wal_end(&self) -> Lsn {
        match self {
            Self::Wal { end, .. } | Self::Keepalive { end, .. } => *end,
        }
    }
}

fn need(body: &Bytes, len: usize, what: &str) -> Result<()> {
    if body.remaining() < len {
        return Err(StreamerError::Protocol(format!(
            "truncated {what}: {} of {len} bytes",
            body.remaining()
        )));
    }
    Ok(())
}

/// Standby status update (`r`).
///
/// Written, flushed and applied positions are all `acked`: a position is
/// only reported once the destination committed everything before it.
#[derive(Debug, Clone, Copy)]
pub struct StatusUpdate {
    pub acked: Lsn,
    pub at: DateTime<Utc>,
    pub reply: bool,
}

impl StatusUpdate {
    pub fn now(acked: Lsn) -> Self {
        Self { acked, at: Utc::now(), reply: false }
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(34);
        out.put_u8(b'r');
        for _ in 0..3 {
            out.put_u64(self.acked.0);
        }
        out.put_i64(to_server_time(self.at));
        out.put_u8(u8::from(self.reply));
        out.freeze()
    }
}

/// Server timestamp to UTC. `None` when out of chrono's range.
pub fn from_server_time(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros.checked_add(SERVER_EPOCH_OFFSET_MICROS)?)
}

pub fn to_server_time(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros() - SERVER_EPOCH_OFFSET_MICROS
}

/// How far behind the server clock a message is, zero if the clocks disagree.
pub fn lag(sent_at: DateTime<Utc>) -> TimeDelta {
    (Utc::now() - sent_at).max(TimeDelta::zero())
}
