//! Applies decoded changes to the destination.
//!
//! | Mode    | Insert                  | Update                        | Delete                       |
//! |---------|-------------------------|-------------------------------|------------------------------|
//! | clone   | insert, ignore conflict | update located row            | delete located row           |
//! | history | open a version          | close open version + open new | close open version, deleted  |
//! | append  | insert                  | insert new values             | ignored                      |
//!
//! Updates and deletes that find no row are [`StreamerError::Sync`]: the
//! destination has drifted from the source.

pub mod statement;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::types::ToSql;
use tracing::trace;

use crate::error::{Result, StreamerError};
use crate::lsn::Lsn;
use crate::mapping::{MappingEntry, WriteMode};
use crate::value::Row;

pub use statement::Statement;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Insert => "insert",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which prior row image came with an update or delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    /// No old image; the row is located by the new primary key values.
    None,
    /// Replica identity key columns.
    Key,
    /// The full prior row.
    Full,
}

/// One row change, ready to be written.
#[derive(Debug, Clone)]
pub struct Operation {
    pub kind: OpKind,
    pub entry: Arc<MappingEntry>,
    pub sid: String,
    /// Table the change was decoded from (may be a partition of `entry`).
    pub source_table: String,
    /// Values to write. Unchanged TOAST columns are absent.
    pub values: Row,
    /// Row image that locates the destination row for updates and deletes.
    pub key: Row,
    pub identity: Identity,
    pub lsn: Lsn,
}

impl Operation {
    pub fn database(&self) -> &str {
        &self.entry.db_name
    }
}

/// Executes parameterized statements with text parameters.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Returns the number of rows affected.
    async fn execute(&self, sql: &str, params: &[Option<String>]) -> Result<u64>;

    async fn batch_execute(&self, sql: &str) -> Result<()>;

    /// The underlying connection is gone; nothing further can succeed.
    fn is_closed(&self) -> bool {
        false
    }
}

#[async_trait]
impl Executor for tokio_postgres::Client {
    async fn execute(&self, sql: &str, params: &[Option<String>]) -> Result<u64> {
        let refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        Ok(tokio_postgres::Client::execute(self, sql, &refs).await?)
    }

    async fn batch_execute(&self, sql: &str) -> Result<()> {
        Ok(tokio_postgres::Client::batch_execute(self, sql).await?)
    }

    fn is_closed(&self) -> bool {
        tokio_postgres::Client::is_closed(self)
    }
}

#[async_trait]
impl Executor for deadpool_postgres::Object {
    async fn execute(&self, sql: &str, params: &[Option<String>]) -> Result<u64> {
        let client: &tokio_postgres::Client = self;
        Executor::execute(client, sql, params).await
    }

    async fn batch_execute(&self, sql: &str) -> Result<()> {
        let client: &tokio_postgres::Client = self;
        Executor::batch_execute(client, sql).await
    }

    fn is_closed(&self) -> bool {
        let client: &tokio_postgres::Client = self;
        client.is_closed()
    }
}

#[async_trait]
impl<E: Executor + ?Sized> Executor for Arc<E> {
    async fn execute(&self, sql: &str, params: &[Option<String>]) -> Result<u64> {
        (**self).execute(sql, params).await
    }

    async fn batch_execute(&self, sql: &str) -> Result<()> {
        (**self).batch_execute(sql).await
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}

async fn run<E: Executor + ?Sized>(exec: &E, st: Statement) -> Result<u64> {
    trace!(sql = %st.sql, params = ?st.params, "executing");
    exec.execute(&st.sql, &st.params).await
}

fn no_row(op: &Operation) -> StreamerError {
    StreamerError::Sync(format!(
        "{} on {} (sid {}): no matching row in {}",
        op.kind, op.source_table, op.sid, op.entry.target
    ))
}

fn expect_rows(rows: u64, op: &Operation) -> Result<u64> {
    if rows == 0 { Err(no_row(op)) } else { Ok(rows) }
}

/// Apply `op` according to its entry's write mode. Returns rows affected.
///
/// `now` stamps history versions; one value is used for both the close and
/// the open of an update so validity intervals never overlap.
pub async fn apply<E: Executor + ?Sized>(exec: &E, op: &Operation, now: DateTime<Utc>) -> Result<u64> {
    let e = op.entry.as_ref();
    match (e.mode, op.kind) {
        (WriteMode::Clone, OpKind::Insert) => {
            run(exec, statement::clone_insert(e, &op.sid, &op.values)?).await
        }
        (WriteMode::Clone, OpKind::Update) => {
            let st = statement::clone_update(e, &op.sid, &op.values, &op.key)?;
            expect_rows(run(exec, st).await?, op)
        }
        (WriteMode::Clone, OpKind::Delete) => {
            let st = statement::clone_delete(e, &op.sid, &op.key)?;
            expect_rows(run(exec, st).await?, op)
        }

        (WriteMode::History, OpKind::Insert) => {
            run(exec, statement::history_insert(e, &op.sid, &op.values, now)?).await
        }
        (WriteMode::History, OpKind::Update) => {
            let close = statement::history_close(e, &op.sid, &op.key, now, false)?;
            let open = statement::history_insert(e, &op.sid, &op.values, now)?;
            let closed = run(exec, close).await?;
            // The new version is written even when there was nothing to close.
            let opened = run(exec, open).await?;
            if closed == 0 {
                return Err(no_row(op));
            }
            Ok(closed + opened)
        }
        (WriteMode::History, OpKind::Delete) => {
            let st = statement::history_close(e, &op.sid, &op.key, now, true)?;
            expect_rows(run(exec, st).await?, op)
        }

        (WriteMode::Append, OpKind::Insert | OpKind::Update) => {
            run(exec, statement::append_insert(e, &op.sid, &op.values)?).await
        }
        (WriteMode::Append, OpKind::Delete) => Ok(0),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use super::*;
    use crate::mapping::testing::entry;
    use crate::value::Value;

    /// Records statements; answers with scripted row counts (default 1).
    #[derive(Default)]
    pub struct RecordingExecutor {
        pub statements: Mutex<Vec<(String, Vec<Option<String>>)>>,
        pub batches: Mutex<Vec<String>>,
        pub rows: Mutex<VecDeque<Result<u64>>>,
        /// Fail every batch statement containing this text.
        pub fail_batch: Mutex<Option<String>>,
    }

    impl RecordingExecutor {
        pub fn script(&self, results: impl IntoIterator<Item = Result<u64>>) {
            self.rows.lock().extend(results);
        }

        pub fn sql(&self) -> Vec<String> {
            self.statements.lock().iter().map(|(s, _)| s.clone()).collect()
        }
    }

    #[async_trait]
    impl Executor for RecordingExecutor {
        async fn execute(&self, sql: &str, params: &[Option<String>]) -> Result<u64> {
            self.statements.lock().push((sql.to_string(), params.to_vec()));
            self.rows.lock().pop_front().unwrap_or(Ok(1))
        }

        async fn batch_execute(&self, sql: &str) -> Result<()> {
            self.batches.lock().push(sql.to_string());
            match self.fail_batch.lock().as_deref() {
                Some(needle) if sql.contains(needle) => {
                    Err(StreamerError::Destination("connection closed".into()))
                }
                _ => Ok(()),
            }
        }
    }

    pub fn op(kind: OpKind, mode: WriteMode, id: i64, email: Option<&str>) -> Operation {
        let mut values = Row::new();
        values.insert("id".into(), Value::Int(id));
        if let Some(e) = email {
            values.insert("email".into(), Value::String(e.into()));
        }
        let mut key = Row::new();
        key.insert("id".into(), Value::Int(id));
        Operation {
            kind,
            entry: Arc::new(entry("users", mode)),
            sid: "eu".into(),
            source_table: "users".into(),
            values,
            key,
            identity: Identity::Key,
            lsn: Lsn(100),
        }
    }
}
