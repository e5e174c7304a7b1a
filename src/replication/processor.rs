//! Turns pgoutput messages into [`Operation`]s.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Result, StreamerError};
use crate::expr::Bindings;
use crate::lsn::Lsn;
use crate::mapping::{MappingEntry, MappingTable, MappingView, WriteMode};
use crate::protocol::{ColumnData, LogicalMessage, OldTuple, PgOutputDecoder, RelationColumn, TupleData};
use crate::telemetry::{self, Outcome};
use crate::value::{Row, Value, decode_text};
use crate::worker::{SourceKey, WorkerPool};
use crate::writer::{self, Executor, Identity, OpKind, Operation};

/// A source relation as last described by a Relation message.
#[derive(Debug, Clone)]
pub struct PgRelation {
    pub id: u32,
    pub namespace: String,
    pub name: String,
    pub columns: Vec<RelationColumn>,
}

impl PgRelation {
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

/// Where finished operations go.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, op: Operation) -> Result<()>;

    /// The source committed a transaction ending at `lsn`.
    fn source_committed(&self, key: &SourceKey, lsn: Lsn);
}

/// Sends history changes straight to the destination and everything else
/// to the worker pool.
pub struct Router {
    pool: Arc<WorkerPool>,
    destination: deadpool_postgres::Pool,
}

impl Router {
    pub fn new(pool: Arc<WorkerPool>, destination: deadpool_postgres::Pool) -> Self {
        Self { pool, destination }
    }

    async fn apply_inline(&self, op: Operation) -> Result<()> {
        let conn = self.destination.get().await?;
        let start = Instant::now();
        let result = writer::apply(&conn, &op, Utc::now()).await;
        let outcome = match &result {
            Ok(_) => Outcome::Ok,
            Err(e) if e.is_sync() => Outcome::Sync,
            Err(_) => Outcome::Error,
        };
        telemetry::record_operation(&op, outcome, start.elapsed());
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_sync() => {
                warn!(table = %op.source_table, sid = %op.sid, lsn = %op.lsn, error = %e, "destination out of sync");
                Ok(())
            }
            Err(e) if conn.is_closed() => Err(e),
            Err(e) => {
                error!(table = %op.source_table, sid = %op.sid, op = %op.kind, lsn = %op.lsn, error = %e, "operation dropped");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Dispatcher for Router {
    async fn dispatch(&self, op: Operation) -> Result<()> {
        if op.entry.mode == WriteMode::History {
            self.apply_inline(op).await
        } else {
            self.pool.dispatch(op).await
        }
    }

    fn source_committed(&self, key: &SourceKey, lsn: Lsn) {
        self.pool.tracker().source_committed(key, lsn);
    }
}

/// Per-session decoding state: relation cache, transaction position and
/// streamed-transaction buffers.
pub struct Processor {
    key: SourceKey,
    view: Arc<dyn MappingView>,
    mapping: Arc<MappingTable>,
    dispatcher: Arc<dyn Dispatcher>,
    decoder: PgOutputDecoder,
    relations: HashMap<u32, PgRelation>,
    txn_lsn: Lsn,
    stream_xid: Option<u32>,
    /// Top-level xid -> (producing xid, operation).
    streams: HashMap<u32, Vec<(u32, Operation)>>,
}

impl Processor {
    pub fn new(key: SourceKey, view: Arc<dyn MappingView>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        let mapping = view.snapshot();
        Self {
            key,
            view,
            mapping,
            dispatcher,
            decoder: PgOutputDecoder::new(),
            relations: HashMap::new(),
            txn_lsn: Lsn::ZERO,
            stream_xid: None,
            streams: HashMap::new(),
        }
    }

    /// Streamed transactions still waiting for commit or abort.
    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }

    /// Handle the pgoutput bytes of one WAL message.
    pub async fn process(&mut self, data: Bytes) -> Result<()> {
        let msg = self.decoder.decode(data)?;
        trace!(message = ?msg, "pgoutput");
        match msg {
            LogicalMessage::Begin { final_lsn, xid, .. } => {
                self.txn_lsn = final_lsn;
                self.mapping = self.view.snapshot();
                trace!(xid, lsn = %final_lsn, "begin");
            }
            LogicalMessage::Commit { end_lsn, .. } => {
                self.dispatcher.source_committed(&self.key, end_lsn);
            }
            LogicalMessage::Origin { name, .. } => debug!(origin = %name, "origin"),
            LogicalMessage::Relation { body, .. } => {
                debug!(id = body.id, namespace = %body.namespace, name = %body.name, "relation");
                self.relations.insert(
                    body.id,
                    PgRelation {
                        id: body.id,
                        namespace: body.namespace,
                        name: body.name,
                        columns: body.columns,
                    },
                );
            }
            LogicalMessage::Type { namespace, name, .. } => debug!(%namespace, %name, "type"),
            LogicalMessage::Insert { xid, relation_id, new } => {
                let op = self.build(OpKind::Insert, relation_id, Some(&new), None)?;
                self.emit(xid, op).await?;
            }
            LogicalMessage::Update { xid, relation_id, old, new } => {
                let op = self.build(OpKind::Update, relation_id, Some(&new), old.as_ref())?;
                self.emit(xid, op).await?;
            }
            LogicalMessage::Delete { xid, relation_id, old } => {
                let op = self.build(OpKind::Delete, relation_id, None, Some(&old))?;
                self.emit(xid, op).await?;
            }
            LogicalMessage::Truncate { relation_ids, .. } => {
                let names: Vec<String> = relation_ids
                    .iter()
                    .filter_map(|id| self.relations.get(id).map(PgRelation::qualified))
                    .collect();
                info!(tables = ?names, "truncate is not replicated");
            }
            LogicalMessage::Message { prefix, content, .. } => {
                debug!(%prefix, len = content.len(), "logical decoding message");
            }
            LogicalMessage::StreamStart { xid, .. } => {
                self.stream_xid = Some(xid);
                self.mapping = self.view.snapshot();
            }
            LogicalMessage::StreamStop => self.stream_xid = None,
            LogicalMessage::StreamCommit {
                xid,
                commit_lsn,
                end_lsn,
                ..
            } => {
                let ops = self.streams.remove(&xid).unwrap_or_default();
                debug!(xid, ops = ops.len(), lsn = %commit_lsn, "streamed transaction committed");
                for (_, mut op) in ops {
                    op.lsn = commit_lsn;
                    self.dispatcher.dispatch(op).await?;
                }
                self.dispatcher.source_committed(&self.key, end_lsn);
            }
            LogicalMessage::StreamAbort { xid, sub_xid } => {
                if xid == sub_xid {
                    let dropped = self.streams.remove(&xid).map_or(0, |ops| ops.len());
                    debug!(xid, dropped, "streamed transaction aborted");
                } else if let Some(ops) = self.streams.get_mut(&xid) {
                    ops.retain(|(x, _)| *x != sub_xid);
                    debug!(xid, sub_xid, "streamed subtransaction aborted");
                }
            }
        }
        Ok(())
    }

    async fn emit(&mut self, xid: Option<u32>, op: Option<Operation>) -> Result<()> {
        let Some(op) = op else {
            return Ok(());
        };
        match (self.stream_xid, xid) {
            (Some(top), Some(x)) => {
                self.streams.entry(top).or_default().push((x, op));
                Ok(())
            }
            _ => self.dispatcher.dispatch(op).await,
        }
    }

    fn build(
        &self,
        kind: OpKind,
        relation_id: u32,
        new: Option<&TupleData>,
        old: Option<&OldTuple>,
    ) -> Result<Option<Operation>> {
        let rel = self
            .relations
            .get(&relation_id)
            .ok_or_else(|| StreamerError::Protocol(format!("unknown relation id {relation_id}")))?;
        let qualified = rel.qualified();
        let Some(entry) = self.mapping.find(&self.key.database, &qualified) else {
            warn!(database = %self.key.database, table = %qualified, "no mapping for table, change dropped");
            return Ok(None);
        };
        if !entry.present {
            warn!(table = %qualified, target = %entry.target, "destination table missing, change dropped");
            return Ok(None);
        }
        if kind == OpKind::Delete && entry.mode == WriteMode::Append {
            trace!(table = %qualified, "delete ignored for append table");
            return Ok(None);
        }

        let new_row = new.map(|t| decode_tuple(rel, t, false)).transpose()?;
        let (key, identity) = match old {
            Some(OldTuple::Key(t)) => (decode_tuple(rel, t, true)?, Identity::Key),
            Some(OldTuple::Full(t)) => (decode_tuple(rel, t, false)?, Identity::Full),
            None => {
                let values = new_row.as_ref().cloned().unwrap_or_default();
                let key = entry
                    .primary_key()
                    .into_iter()
                    .filter_map(|c| values.get(c).map(|v| (c.to_string(), v.clone())))
                    .collect();
                (key, Identity::None)
            }
        };

        let now = Utc::now();
        let subject = new_row.as_ref().unwrap_or(&key);
        if !passes_filter(entry, subject, now, &qualified) {
            trace!(table = %qualified, "filtered out");
            return Ok(None);
        }

        let values = match new_row {
            Some(row) if !entry.set.is_empty() => apply_set(entry, &row, now, &qualified),
            Some(row) => row,
            None => key.clone(),
        };

        Ok(Some(Operation {
            kind,
            entry: Arc::clone(entry),
            sid: self.key.sid.clone(),
            source_table: qualified,
            values,
            key,
            identity,
            lsn: self.txn_lsn,
        }))
    }
}

/// Decode a tuple against its relation. Unchanged TOAST columns are left
/// out; `keys_only` keeps replica identity columns only.
fn decode_tuple(rel: &PgRelation, tuple: &TupleData, keys_only: bool) -> Result<Row> {
    if tuple.0.len() != rel.columns.len() {
        return Err(StreamerError::Protocol(format!(
            "tuple for {} has {} columns, relation has {}",
            rel.qualified(),
            tuple.0.len(),
            rel.columns.len()
        )));
    }
    let mut row = Row::new();
    for (col, data) in rel.columns.iter().zip(&tuple.0) {
        if keys_only && !col.is_key() {
            continue;
        }
        let value = match data {
            ColumnData::Null => Value::Null,
            ColumnData::Unchanged => continue,
            ColumnData::Text(raw) => decode_text(col.type_oid, raw),
            ColumnData::Binary(raw) => Value::Bytes(raw.to_vec()),
        };
        row.insert(col.name.clone(), value);
    }
    Ok(row)
}

/// Evaluate the entry's filter. Anything but a clean `false` lets the
/// change through.
fn passes_filter(entry: &MappingEntry, row: &Row, now: DateTime<Utc>, table: &str) -> bool {
    let Some(filter) = entry.filter.as_ref() else {
        return true;
    };
    match filter.eval(&Bindings::new(row, now)) {
        Ok(Value::Bool(keep)) => keep,
        Ok(other) => {
            error!(%table, result = %other, "filter did not return a bool, change kept");
            true
        }
        Err(e) => {
            error!(%table, error = %e, "filter failed, change kept");
            true
        }
    }
}

/// Replace the row with the entry's set columns.
fn apply_set(entry: &MappingEntry, row: &Row, now: DateTime<Utc>, table: &str) -> Row {
    let bindings = Bindings::new(row, now);
    entry
        .set
        .iter()
        .map(|(column, program)| {
            let value = program.eval(&bindings).unwrap_or_else(|e| {
                warn!(%table, %column, error = %e, "set expression failed, passing value through");
                row.get(column).cloned().unwrap_or(Value::Null)
            });
            (column.clone(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::expr::{CelEngine, Environment, ExpressionEngine};
    use crate::mapping::testing::{entry, mapping};
    use crate::protocol::pgoutput::testing as pg;
    use crate::value::{INT8_OID, TEXT_OID, ValueType};

    const REL: u32 = 16384;

    #[derive(Default)]
    struct Collect {
        ops: Mutex<Vec<Operation>>,
        committed: Mutex<Vec<Lsn>>,
    }

    #[async_trait]
    impl Dispatcher for Collect {
        async fn dispatch(&self, op: Operation) -> Result<()> {
            self.ops.lock().push(op);
            Ok(())
        }

        fn source_committed(&self, _key: &SourceKey, lsn: Lsn) {
            self.committed.lock().push(lsn);
        }
    }

    fn compile(src: &str) -> Arc<dyn crate::expr::Program> {
        let env = Environment::new()
            .with("id", ValueType::Int)
            .with("email", ValueType::String);
        CelEngine.compile(src, &env).unwrap()
    }

    async fn processor(e: MappingEntry) -> (Processor, Arc<Collect>) {
        let sink = Arc::new(Collect::default());
        let view: Arc<dyn MappingView> = Arc::new(Arc::new(mapping(vec![e])));
        let mut p = Processor::new(SourceKey::new("db", "eu"), view, sink.clone());
        p.process(pg::relation(
            None,
            REL,
            "public",
            "users",
            &[("id", INT8_OID, true), ("email", TEXT_OID, false)],
        ))
        .await
        .unwrap();
        (p, sink)
    }

    fn id_of(op: &Operation) -> Option<&Value> {
        op.values.get("id")
    }

    // ==== transaction tests ====

    #[tokio::test]
    async fn insert_carries_transaction_position() {
        let (mut p, sink) = processor(entry("users", WriteMode::Clone)).await;
        p.process(pg::begin(0x100, 7)).await.unwrap();
        p.process(pg::insert(None, REL, &[Some("1"), Some("a@x")])).await.unwrap();
        p.process(pg::commit(0x100)).await.unwrap();

        let ops = sink.ops.lock();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OpKind::Insert);
        assert_eq!(ops[0].lsn, Lsn(0x100));
        assert_eq!(id_of(&ops[0]), Some(&Value::Int(1)));
        assert_eq!(ops[0].values.get("email"), Some(&Value::String("a@x".into())));
        assert_eq!(ops[0].source_table, "public.users");
        assert_eq!(*sink.committed.lock(), vec![Lsn(0x108)]);
    }

    #[tokio::test]
    async fn unknown_relation_is_a_protocol_error() {
        let (mut p, _) = processor(entry("users", WriteMode::Clone)).await;
        let err = p.process(pg::insert(None, 99, &[Some("1")])).await.unwrap_err();
        assert!(matches!(err, StreamerError::Protocol(_)));
    }

    #[tokio::test]
    async fn unmapped_table_is_dropped() {
        let (mut p, sink) = processor(entry("users", WriteMode::Clone)).await;
        p.process(pg::relation(None, 2, "public", "audit", &[("id", INT8_OID, true)]))
            .await
            .unwrap();
        p.process(pg::insert(None, 2, &[Some("1")])).await.unwrap();
        assert!(sink.ops.lock().is_empty());
    }

    #[tokio::test]
    async fn missing_destination_is_dropped() {
        let mut e = entry("users", WriteMode::Clone);
        e.present = false;
        let (mut p, sink) = processor(e).await;
        p.process(pg::insert(None, REL, &[Some("1"), Some("a")])).await.unwrap();
        assert!(sink.ops.lock().is_empty());
    }

    // ==== row image tests ====

    #[tokio::test]
    async fn update_key_image_and_toast() {
        let (mut p, sink) = processor(entry("users", WriteMode::Clone)).await;
        p.process(pg::update(REL, Some((b'K', &[Some("1"), None][..])), &[Some("2"), Some("\u{0}")]))
            .await
            .unwrap();
        p.process(pg::update(REL, None, &[Some("3"), Some("c")])).await.unwrap();
        p.process(pg::update(REL, Some((b'O', &[Some("3"), Some("c")][..])), &[Some("3"), Some("d")]))
            .await
            .unwrap();

        let ops = sink.ops.lock();
        assert_eq!(ops[0].identity, Identity::Key);
        assert_eq!(ops[0].key.len(), 1);
        assert_eq!(ops[0].key.get("id"), Some(&Value::Int(1)));
        // unchanged TOAST column is not written
        assert!(!ops[0].values.contains_key("email"));

        assert_eq!(ops[1].identity, Identity::None);
        assert_eq!(ops[1].key.get("id"), Some(&Value::Int(3)));
        assert_eq!(ops[1].key.len(), 1);

        assert_eq!(ops[2].identity, Identity::Full);
        assert_eq!(ops[2].key.get("email"), Some(&Value::String("c".into())));
    }

    #[tokio::test]
    async fn delete_uses_old_image() {
        let (mut p, sink) = processor(entry("users", WriteMode::Clone)).await;
        p.process(pg::delete(REL, b'K', &[Some("5"), None])).await.unwrap();
        let ops = sink.ops.lock();
        assert_eq!(ops[0].kind, OpKind::Delete);
        assert_eq!(ops[0].key.get("id"), Some(&Value::Int(5)));
    }

    #[tokio::test]
    async fn append_ignores_deletes() {
        let (mut p, sink) = processor(entry("users", WriteMode::Append)).await;
        p.process(pg::delete(REL, b'K', &[Some("5"), None])).await.unwrap();
        assert!(sink.ops.lock().is_empty());
    }

    // ==== expression tests ====

    #[tokio::test]
    async fn filter_drops_rows() {
        let mut e = entry("users", WriteMode::Clone);
        e.filter = Some(compile("id > 5"));
        let (mut p, sink) = processor(e).await;
        for id in 1..=10 {
            let id = id.to_string();
            p.process(pg::insert(None, REL, &[Some(id.as_str()), Some("a")]))
                .await
                .unwrap();
        }
        let ids: Vec<Value> = sink.ops.lock().iter().filter_map(|o| id_of(o).cloned()).collect();
        assert_eq!(ids, (6..=10).map(Value::Int).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn failing_filter_keeps_rows() {
        for src in ["email + 1 > 1", "id"] {
            let mut e = entry("users", WriteMode::Clone);
            e.filter = Some(compile(src));
            let (mut p, sink) = processor(e).await;
            p.process(pg::insert(None, REL, &[Some("1"), Some("a")])).await.unwrap();
            assert_eq!(sink.ops.lock().len(), 1, "{src}");
        }
    }

    #[tokio::test]
    async fn set_replaces_values() {
        let mut e = entry("users", WriteMode::Clone);
        e.set.insert("email".into(), compile("email.upperAscii()"));
        e.set.insert("id".into(), compile("email + 1"));
        let (mut p, sink) = processor(e).await;
        p.process(pg::insert(None, REL, &[Some("4"), Some("a@x")])).await.unwrap();

        let ops = sink.ops.lock();
        assert_eq!(ops[0].values.len(), 2);
        assert_eq!(ops[0].values.get("email"), Some(&Value::String("A@X".into())));
        // failed expression falls back to the column's own value
        assert_eq!(ops[0].values.get("id"), Some(&Value::Int(4)));
    }

    // ==== streaming tests ====

    #[tokio::test]
    async fn streamed_transaction_waits_for_commit() {
        let (mut p, sink) = processor(entry("users", WriteMode::Clone)).await;
        p.process(pg::stream_start(100)).await.unwrap();
        p.process(pg::insert(Some(100), REL, &[Some("1"), Some("a")])).await.unwrap();
        p.process(pg::insert(Some(101), REL, &[Some("2"), Some("b")])).await.unwrap();
        p.process(pg::insert(Some(102), REL, &[Some("3"), Some("c")])).await.unwrap();
        p.process(pg::stream_stop()).await.unwrap();
        assert!(sink.ops.lock().is_empty());
        assert_eq!(p.open_streams(), 1);

        p.process(pg::stream_abort(100, 101)).await.unwrap();
        p.process(pg::stream_commit(100, 0x500)).await.unwrap();

        let ops = sink.ops.lock();
        let ids: Vec<_> = ops.iter().filter_map(id_of).cloned().collect();
        assert_eq!(ids, vec![Value::Int(1), Value::Int(3)]);
        assert!(ops.iter().all(|o| o.lsn == Lsn(0x500)));
        assert_eq!(*sink.committed.lock(), vec![Lsn(0x508)]);
        assert_eq!(p.open_streams(), 0);
    }

    #[tokio::test]
    async fn aborted_stream_is_discarded() {
        let (mut p, sink) = processor(entry("users", WriteMode::Clone)).await;
        p.process(pg::stream_start(100)).await.unwrap();
        p.process(pg::insert(Some(100), REL, &[Some("1"), Some("a")])).await.unwrap();
        p.process(pg::stream_stop()).await.unwrap();
        p.process(pg::stream_abort(100, 100)).await.unwrap();
        assert_eq!(p.open_streams(), 0);
        assert!(sink.ops.lock().is_empty());
    }
}
