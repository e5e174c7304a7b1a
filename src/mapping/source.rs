//! Configured mapping definitions and where they come from.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StreamerError};

/// How changes to a table are written to the destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Mirror the current row state.
    #[default]
    Clone,
    /// Versioned rows with a validity interval.
    History,
    /// Insert-only.
    Append,
}

impl WriteMode {
    pub fn as_str(self) -> &'static str {
        match self {
            WriteMode::Clone => "clone",
            WriteMode::History => "history",
            WriteMode::Append => "append",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableConfig {
    #[serde(default)]
    pub mode: WriteMode,
    /// Destination table; defaults to the source table name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Other source tables of the same schema routed to this entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partitions_regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Destination column -> expression.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceUrl {
    pub url: String,
    pub sid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceDatabase {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub urls: Vec<SourceUrl>,
    /// Keyed by `schema.table` (or bare `table` in the default schema).
    #[serde(default)]
    pub tables: BTreeMap<String, TableConfig>,
}

/// Yields the configured databases and tables.
#[async_trait]
pub trait MappingSource: Send + Sync {
    /// Current definitions, read from the backing store on first use.
    async fn load(&self) -> Result<Vec<SourceDatabase>>;

    /// Re-read the backing store.
    async fn refresh(&self) -> Result<Vec<SourceDatabase>>;
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MappingFile {
    databases: Vec<SourceDatabase>,
}

/// Parse a YAML mapping document (`databases: [...]`).
///
/// Databases without an explicit `id` are numbered by position.
pub fn parse_yaml(text: &str) -> Result<Vec<SourceDatabase>> {
    let file: MappingFile = serde_yaml::from_str(text)?;
    let mut dbs = file.databases;
    for (idx, db) in dbs.iter_mut().enumerate() {
        if db.id == 0 {
            db.id = idx as i64 + 1;
        }
        if db.name.is_empty() {
            return Err(StreamerError::Config(format!("database #{} has no name", idx + 1)));
        }
    }
    Ok(dbs)
}

/// Definitions read from a YAML file.
pub struct FileMappingSource {
    path: PathBuf,
    cached: RwLock<Option<Vec<SourceDatabase>>>,
}

impl FileMappingSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: RwLock::new(None),
        }
    }
}

#[async_trait]
impl MappingSource for FileMappingSource {
    async fn load(&self) -> Result<Vec<SourceDatabase>> {
        let cached = self.cached.read().clone();
        match cached {
            Some(dbs) => Ok(dbs),
            None => self.refresh().await,
        }
    }

    async fn refresh(&self) -> Result<Vec<SourceDatabase>> {
        let text = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            StreamerError::Config(format!("cannot read {}: {e}", self.path.display()))
        })?;
        let dbs = parse_yaml(&text)?;
        debug!(path = %self.path.display(), databases = dbs.len(), "mapping file loaded");
        *self.cached.write() = Some(dbs.clone());
        Ok(dbs)
    }
}

/// In-memory definitions, replaceable at runtime.
#[derive(Default)]
pub struct StaticMappingSource {
    dbs: RwLock<Vec<SourceDatabase>>,
}

impl StaticMappingSource {
    pub fn new(dbs: Vec<SourceDatabase>) -> Self {
        Self {
            dbs: RwLock::new(dbs),
        }
    }

    /// Swap the definitions; takes effect on the next mapping refresh.
    pub fn replace(&self, dbs: Vec<SourceDatabase>) {
        *self.dbs.write() = dbs;
    }
}

#[async_trait]
impl MappingSource for StaticMappingSource {
    async fn load(&self) -> Result<Vec<SourceDatabase>> {
        Ok(self.dbs.read().clone())
    }

    async fn refresh(&self) -> Result<Vec<SourceDatabase>> {
        self.load().await
    }
}
