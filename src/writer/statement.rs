//! Parameterized statements for the three write modes.
//!
//! Every value is bound as a text parameter and cast in SQL to the
//! destination column's type (`$1::text::integer`), so one code path serves
//! all column types and PostgreSQL's input functions do the parsing.

use chrono::{DateTime, SecondsFormat, Utc};
use pg_escape::quote_identifier;

use crate::error::{Result, StreamerError};
use crate::mapping::{MappingEntry, SID_COLUMN, WriteMode};
use crate::value::{Row, Value};

pub const CDC_START: &str = "cdc_start";
pub const CDC_END: &str = "cdc_end";
pub const CDC_DELETED: &str = "cdc_deleted";
/// `cdc_end` of the open (current) version of a row.
pub const OPEN_END: &str = "9999-01-01 00:00:00+00";

/// Columns maintained by the writer itself, never taken from change values.
pub fn is_managed(column: &str) -> bool {
    matches!(column, SID_COLUMN | CDC_START | CDC_END | CDC_DELETED)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Option<String>>,
}

/// `schema.table` -> `"schema"."table"`.
pub fn quote_table(qualified: &str) -> String {
    match qualified.split_once('.') {
        Some((s, t)) => format!("{}.{}", quote_identifier(s), quote_identifier(t)),
        None => quote_identifier(qualified).into_owned(),
    }
}

fn timestamp_text(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

struct Builder<'a> {
    entry: &'a MappingEntry,
    params: Vec<Option<String>>,
}

impl<'a> Builder<'a> {
    fn new(entry: &'a MappingEntry) -> Self {
        Self {
            entry,
            params: Vec::new(),
        }
    }

    /// Bind `value` for `column` and return the placeholder expression.
    fn bind(&mut self, column: &str, value: Option<String>) -> String {
        let cast = self
            .entry
            .dest_column(column)
            .map_or("text", |c| c.cast_type.as_str());
        self.params.push(value);
        format!("${}::text::{cast}", self.params.len())
    }

    /// Destination columns present in `values`, in name order.
    fn projection<'v>(&self, values: &'v Row) -> Result<Vec<(&'v str, &'v Value)>> {
        let cols: Vec<_> = values
            .iter()
            .filter(|(name, _)| !is_managed(name) && self.entry.dest_column(name).is_some())
            .map(|(name, v)| (name.as_str(), v))
            .collect();
        if cols.is_empty() {
            return Err(StreamerError::Write(format!(
                "no column of {} exists in {}",
                self.entry.qualified(),
                self.entry.target
            )));
        }
        Ok(cols)
    }

    /// `WHERE` conditions: the source identifier plus the row image in `key`.
    fn predicate(&mut self, sid: &str, key: &Row) -> Result<Vec<String>> {
        let mut conds = Vec::new();
        if self.entry.has_sid_column() {
            let p = self.bind(SID_COLUMN, Some(sid.to_string()));
            conds.push(format!("{} = {p}", quote_identifier(SID_COLUMN)));
        }
        let before = conds.len();
        for (name, value) in key {
            if is_managed(name) || self.entry.dest_column(name).is_none() {
                continue;
            }
            let cond = match value.to_sql_text() {
                None => format!("{} IS NULL", quote_identifier(name)),
                text => format!("{} = {}", quote_identifier(name), self.bind(name, text)),
            };
            conds.push(cond);
        }
        if conds.len() == before {
            return Err(StreamerError::Write(format!(
                "no key columns to locate a row of {} in {}",
                self.entry.qualified(),
                self.entry.target
            )));
        }
        Ok(conds)
    }

    fn insert(&mut self, sid: &str, values: &Row, extra: &[(&str, Option<String>)]) -> Result<String> {
        let mut names = Vec::new();
        let mut placeholders = Vec::new();
        if self.entry.has_sid_column() {
            names.push(quote_identifier(SID_COLUMN).into_owned());
            placeholders.push(self.bind(SID_COLUMN, Some(sid.to_string())));
        }
        for (name, value) in self.projection(values)? {
            names.push(quote_identifier(name).into_owned());
            placeholders.push(self.bind(name, value.to_sql_text()));
        }
        for (name, value) in extra {
            names.push(quote_identifier(name).into_owned());
            placeholders.push(self.bind(name, value.clone()));
        }
        Ok(format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_table(&self.entry.target),
            names.join(", "),
            placeholders.join(", ")
        ))
    }

    fn finish(self, sql: String) -> Statement {
        Statement {
            sql,
            params: self.params,
        }
    }
}

fn require_history_columns(entry: &MappingEntry) -> Result<()> {
    for col in [CDC_START, CDC_END, CDC_DELETED] {
        if entry.dest_column(col).is_none() {
            return Err(StreamerError::Write(format!(
                "{} is not a history table: missing {col}",
                entry.target
            )));
        }
    }
    Ok(())
}

pub fn clone_insert(entry: &MappingEntry, sid: &str, values: &Row) -> Result<Statement> {
    let mut b = Builder::new(entry);
    let sql = b.insert(sid, values, &[])?;
    Ok(b.finish(format!("{sql} ON CONFLICT DO NOTHING")))
}

pub fn clone_update(entry: &MappingEntry, sid: &str, values: &Row, key: &Row) -> Result<Statement> {
    let mut b = Builder::new(entry);
    let mut sets = Vec::new();
    for (name, value) in b.projection(values)? {
        sets.push(format!("{} = {}", quote_identifier(name), b.bind(name, value.to_sql_text())));
    }
    let conds = b.predicate(sid, key)?;
    let sql = format!(
        "UPDATE {} SET {} WHERE {}",
        quote_table(&entry.target),
        sets.join(", "),
        conds.join(" AND ")
    );
    Ok(b.finish(sql))
}

pub fn clone_delete(entry: &MappingEntry, sid: &str, key: &Row) -> Result<Statement> {
    let mut b = Builder::new(entry);
    let conds = b.predicate(sid, key)?;
    let sql = format!("DELETE FROM {} WHERE {}", quote_table(&entry.target), conds.join(" AND "));
    Ok(b.finish(sql))
}

pub fn append_insert(entry: &MappingEntry, sid: &str, values: &Row) -> Result<Statement> {
    let mut b = Builder::new(entry);
    let sql = b.insert(sid, values, &[])?;
    Ok(b.finish(sql))
}

/// New open version of a row, valid from `now`.
pub fn history_insert(
    entry: &MappingEntry,
    sid: &str,
    values: &Row,
    now: DateTime<Utc>,
) -> Result<Statement> {
    require_history_columns(entry)?;
    let mut b = Builder::new(entry);
    let sql = b.insert(
        sid,
        values,
        &[
            (CDC_START, Some(timestamp_text(now))),
            (CDC_END, Some(OPEN_END.to_string())),
            (CDC_DELETED, Some("false".to_string())),
        ],
    )?;
    Ok(b.finish(sql))
}

/// Close the open version located by `key`; optionally mark it deleted.
pub fn history_close(
    entry: &MappingEntry,
    sid: &str,
    key: &Row,
    now: DateTime<Utc>,
    deleted: bool,
) -> Result<Statement> {
    require_history_columns(entry)?;
    let mut b = Builder::new(entry);
    let mut sets = vec![format!(
        "{} = {}",
        quote_identifier(CDC_END),
        b.bind(CDC_END, Some(timestamp_text(now)))
    )];
    if deleted {
        sets.push(format!("{} = true", quote_identifier(CDC_DELETED)));
    }
    let mut conds = b.predicate(sid, key)?;
    let open = b.bind(CDC_END, Some(OPEN_END.to_string()));
    conds.push(format!("{} = {open}", quote_identifier(CDC_END)));
    let sql = format!(
        "UPDATE {} SET {} WHERE {}",
        quote_table(&entry.target),
        sets.join(", "),
        conds.join(" AND ")
    );
    Ok(b.finish(sql))
}

/// `CREATE TABLE` for an entry's target: the sid column, the source
/// columns with their declared types, and the history columns for history
/// tables. Clone tables with a source primary key get `(sid, pk...)`.
pub fn create_table(entry: &MappingEntry) -> String {
    let mut cols = vec![format!("{} text NOT NULL", quote_identifier(SID_COLUMN))];
    for c in entry.source_columns.iter().filter(|c| !is_managed(&c.name)) {
        cols.push(format!("{} {}", quote_identifier(&c.name), c.declared));
    }
    if entry.mode == WriteMode::History {
        cols.push(format!("{} timestamptz NOT NULL DEFAULT now()", quote_identifier(CDC_START)));
        cols.push(format!(
            "{} timestamptz NOT NULL DEFAULT '{OPEN_END}'",
            quote_identifier(CDC_END)
        ));
        cols.push(format!("{} boolean NOT NULL DEFAULT false", quote_identifier(CDC_DELETED)));
    }
    let pk = entry.primary_key();
    if entry.mode == WriteMode::Clone && !pk.is_empty() {
        let key: Vec<String> = std::iter::once(SID_COLUMN)
            .chain(pk)
            .map(|c| quote_identifier(c).into_owned())
            .collect();
        cols.push(format!("PRIMARY KEY ({})", key.join(", ")));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_table(&entry.target),
        cols.join(", ")
    )
}
