//! pgoutput logical decoding messages.
//!
//! Covers protocol versions 1 and 2. Version 2 adds streamed transactions:
//! between `StreamStart` and `StreamStop` every data-carrying message is
//! prefixed with the xid of the (sub)transaction that produced it. The
//! decoder tracks that framing itself, so callers see one message shape
//! regardless of version.

use bytes::{Buf, Bytes};

use crate::error::{Result, StreamerError};
use crate::lsn::Lsn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationColumn {
    /// Bit 0 set when the column is part of the replica identity key.
    pub flags: u8,
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
}

impl RelationColumn {
    #[inline]
    pub fn is_key(&self) -> bool {
        self.flags & 1 == 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationBody {
    pub id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: u8,
    pub columns: Vec<RelationColumn>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnData {
    Null,
    /// Unchanged TOAST value; the destination keeps what it has.
    Unchanged,
    Text(Bytes),
    Binary(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TupleData(pub Vec<ColumnData>);

/// Old row image attached to an update or delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OldTuple {
    /// 'K': replica identity key columns only.
    Key(TupleData),
    /// 'O': the complete prior row (REPLICA IDENTITY FULL).
    Full(TupleData),
}

impl OldTuple {
    pub fn tuple(&self) -> &TupleData {
        match self {
            OldTuple::Key(t) | OldTuple::Full(t) => t,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogicalMessage {
    Begin {
        final_lsn: Lsn,
        commit_time: i64,
        xid: u32,
    },
    Commit {
        flags: u8,
        commit_lsn: Lsn,
        end_lsn: Lsn,
        commit_time: i64,
    },
    Origin {
        commit_lsn: Lsn,
        name: String,
    },
    Relation {
        xid: Option<u32>,
        body: RelationBody,
    },
    Type {
        xid: Option<u32>,
        id: u32,
        namespace: String,
        name: String,
    },
    Insert {
        xid: Option<u32>,
        relation_id: u32,
        new: TupleData,
    },
    Update {
        xid: Option<u32>,
        relation_id: u32,
        old: Option<OldTuple>,
        new: TupleData,
    },
    Delete {
        xid: Option<u32>,
        relation_id: u32,
        old: OldTuple,
    },
    Truncate {
        xid: Option<u32>,
        options: u8,
        relation_ids: Vec<u32>,
    },
    Message {
        xid: Option<u32>,
        transactional: bool,
        lsn: Lsn,
        prefix: String,
        content: Bytes,
    },
    StreamStart {
        xid: u32,
        first_segment: bool,
    },
    StreamStop,
    StreamCommit {
        xid: u32,
        flags: u8,
        commit_lsn: Lsn,
        end_lsn: Lsn,
        commit_time: i64,
    },
    StreamAbort {
        xid: u32,
        sub_xid: u32,
    },
}

/// Stateful decoder; remembers whether a streamed chunk is open.
#[derive(Debug, Default)]
pub struct PgOutputDecoder {
    in_stream: bool,
}

impl PgOutputDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_stream(&self) -> bool {
        self.in_stream
    }

    pub fn decode(&mut self, data: Bytes) -> Result<LogicalMessage> {
        let mut buf = Reader::new(data);
        let tag = buf.u8()?;
        let msg = match tag {
            b'B' => LogicalMessage::Begin {
                final_lsn: buf.lsn()?,
                commit_time: buf.i64()?,
                xid: buf.u32()?,
            },
            b'C' => LogicalMessage::Commit {
                flags: buf.u8()?,
                commit_lsn: buf.lsn()?,
                end_lsn: buf.lsn()?,
                commit_time: buf.i64()?,
            },
            b'O' => LogicalMessage::Origin {
                commit_lsn: buf.lsn()?,
                name: buf.cstr()?,
            },
            b'R' => {
                let xid = self.stream_xid(&mut buf)?;
                LogicalMessage::Relation {
                    xid,
                    body: decode_relation(&mut buf)?,
                }
            }
            b'Y' => LogicalMessage::Type {
                xid: self.stream_xid(&mut buf)?,
                id: buf.u32()?,
                namespace: buf.cstr()?,
                name: buf.cstr()?,
            },
            b'I' => {
                let xid = self.stream_xid(&mut buf)?;
                let relation_id = buf.u32()?;
                buf.expect(b'N', "insert")?;
                LogicalMessage::Insert {
                    xid,
                    relation_id,
                    new: decode_tuple(&mut buf)?,
                }
            }
            b'U' => {
                let xid = self.stream_xid(&mut buf)?;
                let relation_id = buf.u32()?;
                let old = match buf.u8()? {
                    b'K' => Some(OldTuple::Key(decode_tuple(&mut buf)?)),
                    b'O' => Some(OldTuple::Full(decode_tuple(&mut buf)?)),
                    b'N' => None,
                    other => return Err(unexpected("update", other)),
                };
                if old.is_some() {
                    buf.expect(b'N', "update")?;
                }
                LogicalMessage::Update {
                    xid,
                    relation_id,
                    old,
                    new: decode_tuple(&mut buf)?,
                }
            }
            b'D' => {
                let xid = self.stream_xid(&mut buf)?;
                let relation_id = buf.u32()?;
                let old = match buf.u8()? {
                    b'K' => OldTuple::Key(decode_tuple(&mut buf)?),
                    b'O' => OldTuple::Full(decode_tuple(&mut buf)?),
                    other => return Err(unexpected("delete", other)),
                };
                LogicalMessage::Delete {
                    xid,
                    relation_id,
                    old,
                }
            }
            b'T' => {
                let xid = self.stream_xid(&mut buf)?;
                let count = buf.u32()?;
                let options = buf.u8()?;
                let mut relation_ids = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    relation_ids.push(buf.u32()?);
                }
                LogicalMessage::Truncate {
                    xid,
                    options,
                    relation_ids,
                }
            }
            b'M' => {
                let xid = self.stream_xid(&mut buf)?;
                let transactional = buf.u8()? & 1 == 1;
                let lsn = buf.lsn()?;
                let prefix = buf.cstr()?;
                let len = buf.u32()? as usize;
                LogicalMessage::Message {
                    xid,
                    transactional,
                    lsn,
                    prefix,
                    content: buf.bytes(len)?,
                }
            }
            b'S' => {
                let msg = LogicalMessage::StreamStart {
                    xid: buf.u32()?,
                    first_segment: buf.u8()? == 1,
                };
                self.in_stream = true;
                msg
            }
            b'E' => {
                self.in_stream = false;
                LogicalMessage::StreamStop
            }
            b'c' => LogicalMessage::StreamCommit {
                xid: buf.u32()?,
                flags: buf.u8()?,
                commit_lsn: buf.lsn()?,
                end_lsn: buf.lsn()?,
                commit_time: buf.i64()?,
            },
            b'A' => LogicalMessage::StreamAbort {
                xid: buf.u32()?,
                sub_xid: buf.u32()?,
            },
            other => {
                return Err(StreamerError::Protocol(format!(
                    "unknown pgoutput message: 0x{other:02x} ('{}')",
                    other as char
                )));
            }
        };
        Ok(msg)
    }

    fn stream_xid(&self, buf: &mut Reader) -> Result<Option<u32>> {
        if self.in_stream {
            Ok(Some(buf.u32()?))
        } else {
            Ok(None)
        }
    }
}

fn decode_relation(buf: &mut Reader) -> Result<RelationBody> {
    let id = buf.u32()?;
    let namespace = buf.cstr()?;
    let name = buf.cstr()?;
    let replica_identity = buf.u8()?;
    let count = buf.u16()?;
    let mut columns = Vec::with_capacity(count as usize);
    for _ in 0..count {
        columns.push(RelationColumn {
            flags: buf.u8()?,
            name: buf.cstr()?,
            type_oid: buf.u32()?,
            type_modifier: buf.i32()?,
        });
    }
    Ok(RelationBody {
        id,
        namespace,
        name,
        replica_identity,
        columns,
    })
}

fn decode_tuple(buf: &mut Reader) -> Result<TupleData> {
    let count = buf.u16()?;
    let mut columns = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let col = match buf.u8()? {
            b'n' => ColumnData::Null,
            b'u' => ColumnData::Unchanged,
            b't' => {
                let len = buf.u32()? as usize;
                ColumnData::Text(buf.bytes(len)?)
            }
            b'b' => {
                let len = buf.u32()? as usize;
                ColumnData::Binary(buf.bytes(len)?)
            }
            other => return Err(unexpected("tuple column", other)),
        };
        columns.push(col);
    }
    Ok(TupleData(columns))
}

fn unexpected(what: &str, tag: u8) -> StreamerError {
    StreamerError::Protocol(format!(
        "unexpected {what} marker: 0x{tag:02x} ('{}')",
        tag as char
    ))
}

/// Bounds-checked big-endian reader over one message.
struct Reader {
    buf: Bytes,
}

impl Reader {
    fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(StreamerError::Protocol(format!(
                "pgoutput message too short: need {n} more bytes, have {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    fn i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    fn lsn(&mut self) -> Result<Lsn> {
        self.need(8)?;
        Ok(Lsn(self.buf.get_u64()))
    }

    fn bytes(&mut self, n: usize) -> Result<Bytes> {
        self.need(n)?;
        Ok(self.buf.split_to(n))
    }

    fn cstr(&mut self) -> Result<String> {
        let pos = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| StreamerError::Protocol("unterminated string".into()))?;
        let s = self.buf.split_to(pos);
        self.buf.advance(1);
        String::from_utf8(s.to_vec())
            .map_err(|e| StreamerError::Protocol(format!("invalid utf-8 in string: {e}")))
    }

    fn expect(&mut self, want: u8, what: &str) -> Result<()> {
        let got = self.u8()?;
        if got != want {
            return Err(unexpected(what, got));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Builders for pgoutput messages used across the crate's tests.
    use bytes::{BufMut, Bytes, BytesMut};

    pub fn begin(final_lsn: u64, xid: u32) -> Bytes {
        let mut b = BytesMut::new();
        b.put_u8(b'B');
        b.put_u64(final_lsn);
        b.put_i64(0);
        b.put_u32(xid);
        b.freeze()
    }

    pub fn commit(commit_lsn: u64) -> Bytes {
        let mut b = BytesMut::new();
        b.put_u8(b'C');
        b.put_u8(0);
        b.put_u64(commit_lsn);
        b.put_u64(commit_lsn + 8);
        b.put_i64(0);
        b.freeze()
    }

    /// Relation with `(name, type oid, key)` columns.
    pub fn relation(xid: Option<u32>, id: u32, ns: &str, name: &str, cols: &[(&str, u32, bool)]) -> Bytes {
        let mut b = BytesMut::new();
        b.put_u8(b'R');
        if let Some(x) = xid {
            b.put_u32(x);
        }
        b.put_u32(id);
        put_cstr(&mut b, ns);
        put_cstr(&mut b, name);
        b.put_u8(b'd');
        b.put_u16(cols.len() as u16);
        for (n, oid, key) in cols {
            b.put_u8(u8::from(*key));
            put_cstr(&mut b, n);
            b.put_u32(*oid);
            b.put_i32(-1);
        }
        b.freeze()
    }

    /// Tuple body; `None` is null, `Some("\u{0}")` is unchanged TOAST.
    pub fn tuple(b: &mut BytesMut, values: &[Option<&str>]) {
        b.put_u16(values.len() as u16);
        for v in values {
            match v {
                None => b.put_u8(b'n'),
                Some("\u{0}") => b.put_u8(b'u'),
                Some(s) => {
                    b.put_u8(b't');
                    b.put_u32(s.len() as u32);
                    b.extend_from_slice(s.as_bytes());
                }
            }
        }
    }

    pub fn insert(xid: Option<u32>, rel: u32, values: &[Option<&str>]) -> Bytes {
        let mut b = BytesMut::new();
        b.put_u8(b'I');
        if let Some(x) = xid {
            b.put_u32(x);
        }
        b.put_u32(rel);
        b.put_u8(b'N');
        tuple(&mut b, values);
        b.freeze()
    }

    pub fn update(rel: u32, old: Option<(u8, &[Option<&str>])>, new: &[Option<&str>]) -> Bytes {
        let mut b = BytesMut::new();
        b.put_u8(b'U');
        b.put_u32(rel);
        if let Some((kind, values)) = old {
            b.put_u8(kind);
            tuple(&mut b, values);
        }
        b.put_u8(b'N');
        tuple(&mut b, new);
        b.freeze()
    }

    pub fn delete(rel: u32, kind: u8, old: &[Option<&str>]) -> Bytes {
        let mut b = BytesMut::new();
        b.put_u8(b'D');
        b.put_u32(rel);
        b.put_u8(kind);
        tuple(&mut b, old);
        b.freeze()
    }

    pub fn stream_start(xid: u32) -> Bytes {
        let mut b = BytesMut::new();
        b.put_u8(b'S');
        b.put_u32(xid);
        b.put_u8(1);
        b.freeze()
    }

    pub fn stream_stop() -> Bytes {
        Bytes::from_static(b"E")
    }

    pub fn stream_commit(xid: u32, commit_lsn: u64) -> Bytes {
        let mut b = BytesMut::new();
        b.put_u8(b'c');
        b.put_u32(xid);
        b.put_u8(0);
        b.put_u64(commit_lsn);
        b.put_u64(commit_lsn + 8);
        b.put_i64(0);
        b.freeze()
    }

    pub fn stream_abort(xid: u32, sub_xid: u32) -> Bytes {
        let mut b = BytesMut::new();
        b.put_u8(b'A');
        b.put_u32(xid);
        b.put_u32(sub_xid);
        b.freeze()
    }

    fn put_cstr(b: &mut BytesMut, s: &str) {
        b.extend_from_slice(s.as_bytes());
        b.put_u8(0);
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use bytes::{BufMut, BytesMut};

    // ==================== Transaction framing tests ====================

    #[test]
    fn decode_begin_and_commit() {
        let mut d = PgOutputDecoder::new();
        assert_eq!(
            d.decode(begin(0x1_0000_0010, 7)).unwrap(),
            LogicalMessage::Begin {
                final_lsn: Lsn(0x1_0000_0010),
                commit_time: 0,
                xid: 7
            }
        );
        match d.decode(commit(0x20)).unwrap() {
            LogicalMessage::Commit {
                commit_lsn, end_lsn, ..
            } => {
                assert_eq!(commit_lsn, Lsn(0x20));
                assert_eq!(end_lsn, Lsn(0x28));
            }
            other => panic!("expected Commit, got {other:?}"),
        }
    }

    // ==================== Row message tests ====================

    #[test]
    fn decode_relation_marks_key_columns() {
        let mut d = PgOutputDecoder::new();
        let msg = d
            .decode(relation(None, 16384, "public", "users", &[("id", 23, true), ("name", 25, false)]))
            .unwrap();
        let LogicalMessage::Relation { xid, body } = msg else {
            panic!("expected Relation");
        };
        assert_eq!(xid, None);
        assert_eq!(body.id, 16384);
        assert_eq!(body.name, "users");
        assert!(body.columns[0].is_key());
        assert!(!body.columns[1].is_key());
        assert_eq!(body.columns[1].type_oid, 25);
    }

    #[test]
    fn decode_insert_with_null_and_toast() {
        let mut d = PgOutputDecoder::new();
        let msg = d.decode(insert(None, 1, &[Some("42"), None, Some("\u{0}")])).unwrap();
        assert_eq!(
            msg,
            LogicalMessage::Insert {
                xid: None,
                relation_id: 1,
                new: TupleData(vec![
                    ColumnData::Text(Bytes::from_static(b"42")),
                    ColumnData::Null,
                    ColumnData::Unchanged,
                ]),
            }
        );
    }

    #[test]
    fn decode_update_variants() {
        let mut d = PgOutputDecoder::new();
        let plain = d.decode(update(1, None, &[Some("1"), Some("b")])).unwrap();
        assert!(matches!(plain, LogicalMessage::Update { old: None, .. }));

        let keyed = d
            .decode(update(1, Some((b'K', &[Some("1"), None])), &[Some("2"), Some("b")]))
            .unwrap();
        assert!(matches!(keyed, LogicalMessage::Update { old: Some(OldTuple::Key(_)), .. }));

        let full = d
            .decode(update(1, Some((b'O', &[Some("1"), Some("a")])), &[Some("1"), Some("b")]))
            .unwrap();
        let LogicalMessage::Update { old: Some(OldTuple::Full(t)), .. } = full else {
            panic!("expected full old row");
        };
        assert_eq!(t.0.len(), 2);
    }

    #[test]
    fn decode_delete_requires_old_row() {
        let mut d = PgOutputDecoder::new();
        assert!(matches!(
            d.decode(delete(3, b'K', &[Some("9")])).unwrap(),
            LogicalMessage::Delete { relation_id: 3, old: OldTuple::Key(_), .. }
        ));
        assert!(d.decode(delete(3, b'N', &[Some("9")])).is_err());
    }

    #[test]
    fn decode_logical_message() {
        let mut b = BytesMut::new();
        b.put_u8(b'M');
        b.put_u8(1);
        b.put_u64(0x99);
        b.extend_from_slice(b"audit\0");
        b.put_u32(5);
        b.extend_from_slice(b"hello");
        let mut d = PgOutputDecoder::new();
        let LogicalMessage::Message { transactional, prefix, content, .. } = d.decode(b.freeze()).unwrap() else {
            panic!("expected Message");
        };
        assert!(transactional);
        assert_eq!(prefix, "audit");
        assert_eq!(&content[..], b"hello");
    }

    // ==================== Streaming tests ====================

    #[test]
    fn stream_framing_adds_xid_prefix() {
        let mut d = PgOutputDecoder::new();
        d.decode(stream_start(700)).unwrap();
        assert!(d.in_stream());
        let msg = d.decode(insert(Some(701), 5, &[Some("x")])).unwrap();
        assert!(matches!(msg, LogicalMessage::Insert { xid: Some(701), relation_id: 5, .. }));
        d.decode(stream_stop()).unwrap();
        assert!(!d.in_stream());
        assert!(matches!(
            d.decode(stream_commit(700, 0x500)).unwrap(),
            LogicalMessage::StreamCommit { xid: 700, commit_lsn: Lsn(0x500), .. }
        ));
        assert_eq!(
            d.decode(stream_abort(700, 702)).unwrap(),
            LogicalMessage::StreamAbort { xid: 700, sub_xid: 702 }
        );
    }

    // ==================== Malformed input tests ====================

    #[test]
    fn truncated_messages_are_errors_not_panics() {
        let full = insert(None, 1, &[Some("hello")]);
        let mut d = PgOutputDecoder::new();
        for cut in 0..full.len() {
            assert!(d.decode(full.slice(..cut)).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn unknown_tag_is_protocol_error() {
        let mut d = PgOutputDecoder::new();
        let err = d.decode(Bytes::from_static(b"Z")).unwrap_err();
        assert!(err.to_string().contains("unknown pgoutput message"));
    }
}
