use std::collections::{BTreeMap, HashMap};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use regex::Regex;

use super::catalog::{ColumnMeta, TableMeta, Tables};
use super::source::{SourceDatabase, TableConfig, WriteMode};
use crate::error::{Result, StreamerError};
use crate::expr::{Environment, ExpressionEngine, Program};

/// Column that carries the source identifier in destination tables.
pub const SID_COLUMN: &str = "sid";

/// One live source table merged with its configuration.
#[derive(Debug, Clone)]
pub struct MappingEntry {
    /// Position in the snapshot; reassigned on every refresh.
    pub id: usize,
    /// Stable across refreshes; used for worker routing.
    pub route_key: u64,
    pub db_id: i64,
    pub db_name: String,
    pub schema: String,
    pub table: String,
    pub mode: WriteMode,
    /// Qualified destination table.
    pub target: String,
    pub partitions: Vec<String>,
    pub partitions_regex: Option<Regex>,
    pub filter: Option<Arc<dyn Program>>,
    pub set: BTreeMap<String, Arc<dyn Program>>,
    pub source_columns: Vec<ColumnMeta>,
    pub dest_columns: Vec<ColumnMeta>,
    /// The destination table exists.
    pub present: bool,
    /// The table is configured for replication.
    pub replicated: bool,
}

impl MappingEntry {
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    pub fn dest_column(&self, name: &str) -> Option<&ColumnMeta> {
        self.dest_columns.iter().find(|c| c.name == name)
    }

    pub fn has_sid_column(&self) -> bool {
        self.dest_column(SID_COLUMN).is_some()
    }

    /// Source primary key column names, in column order.
    pub fn primary_key(&self) -> Vec<&str> {
        self.source_columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// `table` is one of this entry's partitions, by catalog or by regex.
    fn has_partition(&self, table: &str, qualified: &str) -> bool {
        self.partitions.iter().any(|p| p == qualified)
            || self.partitions_regex.as_ref().is_some_and(|re| re.is_match(table))
    }
}

pub fn route_key(db: &str, schema: &str, table: &str) -> u64 {
    let mut h = DefaultHasher::new();
    (db, schema, table).hash(&mut h);
    h.finish()
}

/// Split `schema.table`; bare names fall into `default_schema`.
pub fn split_qualified<'a>(name: &'a str, default_schema: &'a str) -> (&'a str, &'a str) {
    name.split_once('.').unwrap_or((default_schema, name))
}

/// An immutable, fully built mapping snapshot.
#[derive(Debug, Default)]
pub struct MappingTable {
    entries: Vec<Arc<MappingEntry>>,
    databases: Vec<SourceDatabase>,
    default_schema: String,
}

/// Settings that shape how a snapshot is built.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub default_schema: String,
    pub destination_schema: String,
}

impl MappingTable {
    /// Merge definitions with live source metadata (`sources`, keyed by
    /// database name) and destination metadata. Any expression or regex
    /// that does not compile fails the whole build.
    pub fn build(
        defs: Vec<SourceDatabase>,
        sources: &HashMap<String, Tables>,
        dest: &Tables,
        engine: &dyn ExpressionEngine,
        opts: &BuildOptions,
    ) -> Result<MappingTable> {
        let mut entries = Vec::new();
        for db in &defs {
            let Some(live) = sources.get(&db.name) else {
                continue;
            };
            let configured: HashMap<String, &TableConfig> = db
                .tables
                .iter()
                .map(|(name, cfg)| {
                    let (s, t) = split_qualified(name, &opts.default_schema);
                    (format!("{s}.{t}"), cfg)
                })
                .collect();

            for (qualified, meta) in live {
                let cfg = configured.get(qualified).copied();
                entries.push(build_entry(db, meta, cfg, dest, engine, opts)?);
            }
        }

        entries.sort_by(|a: &MappingEntry, b: &MappingEntry| {
            (a.db_id, &a.schema, &a.table).cmp(&(b.db_id, &b.schema, &b.table))
        });
        for (id, e) in entries.iter_mut().enumerate() {
            e.id = id;
        }

        Ok(MappingTable {
            entries: entries.into_iter().map(Arc::new).collect(),
            databases: defs,
            default_schema: opts.default_schema.clone(),
        })
    }

    pub fn entries(&self) -> &[Arc<MappingEntry>] {
        &self.entries
    }

    pub fn databases(&self) -> &[SourceDatabase] {
        &self.databases
    }

    pub fn get(&self, id: usize) -> Option<&Arc<MappingEntry>> {
        self.entries.get(id)
    }

    /// Resolve an incoming table to its replicated entry. An exact name
    /// match wins over any partition regex.
    pub fn find(&self, db: &str, qualified: &str) -> Option<&Arc<MappingEntry>> {
        let (schema, table) = split_qualified(qualified, &self.default_schema);
        let candidates = || {
            self.entries
                .iter()
                .filter(move |e| e.replicated && e.db_name == db && e.schema == schema)
        };
        candidates()
            .find(|e| e.table == table)
            .or_else(|| {
                let full = format!("{schema}.{table}");
                candidates().find(|e| e.has_partition(table, &full))
            })
    }

    /// Tables to publish for `db`: every replicated table, with tables that
    /// have partitions replaced by their partitions.
    pub fn base_tables(&self, db: &str) -> Vec<String> {
        let mut out = Vec::new();
        for e in self.entries.iter().filter(|e| e.replicated && e.db_name == db) {
            if e.partitions.is_empty() {
                out.push(e.qualified());
            } else {
                out.extend(e.partitions.iter().cloned());
            }
        }
        out
    }
}

fn build_entry(
    db: &SourceDatabase,
    meta: &TableMeta,
    cfg: Option<&TableConfig>,
    dest: &Tables,
    engine: &dyn ExpressionEngine,
    opts: &BuildOptions,
) -> Result<MappingEntry> {
    let qualified = meta.qualified();
    let target = match cfg.and_then(|c| c.target.as_deref()) {
        Some(t) => {
            let (s, n) = split_qualified(t, &opts.destination_schema);
            format!("{s}.{n}")
        }
        None => format!("{}.{}", opts.destination_schema, meta.name),
    };
    let dest_meta = dest.get(&target);

    let mut entry = MappingEntry {
        id: 0,
        route_key: route_key(&db.name, &meta.schema, &meta.name),
        db_id: db.id,
        db_name: db.name.clone(),
        schema: meta.schema.clone(),
        table: meta.name.clone(),
        mode: cfg.map(|c| c.mode).unwrap_or_default(),
        target,
        partitions: meta.partitions.clone(),
        partitions_regex: None,
        filter: None,
        set: BTreeMap::new(),
        source_columns: meta.columns.clone(),
        dest_columns: dest_meta.map(|d| d.columns.clone()).unwrap_or_default(),
        present: dest_meta.is_some(),
        replicated: cfg.is_some(),
    };
    let Some(cfg) = cfg else {
        return Ok(entry);
    };

    if let Some(re) = cfg.partitions_regex.as_deref().filter(|r| !r.is_empty()) {
        entry.partitions_regex = Some(Regex::new(re).map_err(|e| {
            StreamerError::Mapping(format!("{qualified}: bad partitions_regex {re:?}: {e}"))
        })?);
    }

    let mut env = Environment::new();
    for col in &meta.columns {
        env.declare(&col.name, col.value_type());
    }
    if let Some(filter) = cfg.filter.as_deref().filter(|f| !f.trim().is_empty()) {
        entry.filter = Some(engine.compile(filter, &env).map_err(|e| {
            StreamerError::Mapping(format!("{qualified}: cannot compile filter {filter:?}: {e}"))
        })?);
    }
    for (column, expr) in &cfg.set {
        let program = engine.compile(expr, &env).map_err(|e| {
            StreamerError::Mapping(format!("{qualified}: cannot compile set {column}: {e}"))
        })?;
        entry.set.insert(column.clone(), program);
    }
    Ok(entry)
}
