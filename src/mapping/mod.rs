//! Table mapping: which source tables go where, and how.
//!
//! A [`MappingTable`] is an immutable snapshot built from three inputs: the
//! configured definitions ([`MappingSource`]), live metadata of every source
//! database, and destination metadata. [`TableMapper`] rebuilds it on demand
//! and swaps it in atomically; readers hold an `Arc` to whatever snapshot
//! was current when they asked and never see a partial rebuild.

pub mod catalog;
pub mod source;
mod table;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::client::{ConnectionKind, PgConnection};
use crate::config::SourceConfig;
use crate::error::{Result, StreamerError};
use crate::expr::ExpressionEngine;

pub use catalog::{CatalogQuery, ColumnMeta, TableMeta, Tables, fetch_tables};
pub use source::{
    FileMappingSource, MappingSource, SourceDatabase, SourceUrl, StaticMappingSource, TableConfig,
    WriteMode,
};
pub use table::{BuildOptions, MappingEntry, MappingTable, SID_COLUMN, route_key, split_qualified};

#[cfg(test)]
pub(crate) use table::testing;

/// Read access to whichever snapshot is current.
pub trait MappingView: Send + Sync {
    fn snapshot(&self) -> Arc<MappingTable>;
}

impl MappingView for Arc<MappingTable> {
    fn snapshot(&self) -> Arc<MappingTable> {
        Arc::clone(self)
    }
}

impl MappingView for TableMapper {
    fn snapshot(&self) -> Arc<MappingTable> {
        TableMapper::snapshot(self)
    }
}

/// Owns the current mapping snapshot and knows how to rebuild it.
pub struct TableMapper {
    source: Arc<dyn MappingSource>,
    engine: Arc<dyn ExpressionEngine>,
    destination: deadpool_postgres::Pool,
    opts: BuildOptions,
    application_name: String,
    current: RwLock<Arc<MappingTable>>,
    refreshing: tokio::sync::Mutex<()>,
}

impl TableMapper {
    pub fn new(
        source: Arc<dyn MappingSource>,
        engine: Arc<dyn ExpressionEngine>,
        destination: deadpool_postgres::Pool,
        opts: BuildOptions,
        application_name: String,
    ) -> Self {
        Self {
            source,
            engine,
            destination,
            opts,
            application_name,
            current: RwLock::new(Arc::new(MappingTable::default())),
            refreshing: tokio::sync::Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<MappingTable> {
        Arc::clone(&self.current.read())
    }

    /// Rebuild the snapshot. On failure the previous snapshot stays current.
    pub async fn refresh(&self) -> Result<Arc<MappingTable>> {
        let _guard = self.refreshing.lock().await;

        let dest = {
            let obj = self.destination.get().await?;
            let mut client: &tokio_postgres::Client = &obj;
            fetch_tables(&mut client, &self.opts.destination_schema).await?
        };
        if dest.is_empty() {
            warn!(
                schema = %self.opts.destination_schema,
                "destination schema has no tables; check privileges and schema name"
            );
        }

        let defs = self.source.refresh().await?;
        let mut sources = HashMap::new();
        for db in &defs {
            match self.source_tables(db).await {
                Ok(tables) => {
                    debug!(database = %db.name, tables = tables.len(), "source metadata fetched");
                    sources.insert(db.name.clone(), tables);
                }
                Err(e) => warn!(database = %db.name, error = %e, "cannot fetch source metadata"),
            }
        }

        let table = Arc::new(MappingTable::build(
            defs,
            &sources,
            &dest,
            self.engine.as_ref(),
            &self.opts,
        )?);
        info!(
            entries = table.entries().len(),
            replicated = table.entries().iter().filter(|e| e.replicated).count(),
            "mapping refreshed"
        );
        *self.current.write() = Arc::clone(&table);
        Ok(table)
    }

    /// Metadata from the first reachable URL of `db`.
    async fn source_tables(&self, db: &SourceDatabase) -> Result<Tables> {
        let mut last_err = StreamerError::Config(format!("database {} has no urls", db.name));
        for url in &db.urls {
            let attempt = async {
                let mut cfg = SourceConfig::from_url(&url.url)?;
                cfg.application_name = self.application_name.clone();
                let mut conn = PgConnection::connect(&cfg, ConnectionKind::Regular).await?;
                let tables = fetch_tables(&mut conn, "%").await;
                conn.close().await;
                tables
            };
            match attempt.await {
                Ok(tables) => return Ok(tables),
                Err(e) => {
                    debug!(database = %db.name, sid = %url.sid, error = %e, "metadata fetch failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    pub fn destination(&self) -> &deadpool_postgres::Pool {
        &self.destination
    }

    pub fn options(&self) -> &BuildOptions {
        &self.opts
    }
}
