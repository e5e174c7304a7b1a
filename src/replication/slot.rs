//! Slot and publication lifecycle on a source database.
//!
//! A source URL owns one logical slot and one publication of the same name.
//! They are only meaningful as a pair: a slot without its publication (or
//! the reverse) is left over from an interrupted setup and is removed so
//! the pair is recreated, and the tables re-copied, from scratch.

use std::collections::BTreeSet;

use pg_escape::{quote_identifier, quote_literal};
use tracing::{debug, info};

use crate::client::PgConnection;
use crate::error::{Result, StreamerError};
use crate::lsn::Lsn;
use crate::writer::statement::quote_table;

/// Longest identifier PostgreSQL keeps.
const MAX_NAME: usize = 63;

/// Shared slot and publication name for one source URL:
/// `<prefix>_<database>_<sid>`, lowercased, anything outside `[a-z0-9_]`
/// replaced by `_`.
pub fn slot_name(prefix: &str, database: &str, sid: &str) -> String {
    let mut name: String = format!("{prefix}_{database}_{sid}")
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' { c } else { '_' }
        })
        .collect();
    name.truncate(MAX_NAME);
    name
}

/// pgoutput options for a server major version.
pub fn plugin_options(major: u32, publication: &str) -> Vec<(&'static str, String)> {
    let mut opts = vec![
        ("proto_version", if major >= 14 { "2" } else { "1" }.to_string()),
        ("publication_names", publication.to_string()),
    ];
    if major >= 14 {
        opts.push(("binary", "false".into()));
        opts.push(("messages", "true".into()));
        opts.push(("streaming", "true".into()));
    }
    opts
}

/// What a leftover slot or publication requires before setup proceeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cleanup {
    None,
    DropSlot,
    DropPublication,
}

pub fn cleanup_for(slot_exists: bool, publication_exists: bool) -> Cleanup {
    match (slot_exists, publication_exists) {
        (true, false) => Cleanup::DropSlot,
        (false, true) => Cleanup::DropPublication,
        _ => Cleanup::None,
    }
}

/// Tables to add to and drop from a publication so it holds exactly `wanted`.
pub fn publication_diff(published: &BTreeSet<String>, wanted: &[String]) -> (Vec<String>, Vec<String>) {
    let wanted_set: BTreeSet<&String> = wanted.iter().collect();
    let add = wanted
        .iter()
        .filter(|t| !published.contains(*t))
        .cloned()
        .collect();
    let drop = published
        .iter()
        .filter(|t| !wanted_set.contains(t))
        .cloned()
        .collect();
    (add, drop)
}

#[derive(Debug, Clone)]
pub struct SlotInfo {
    pub active: bool,
    pub confirmed_flush: Option<Lsn>,
}

pub async fn find_slot(conn: &mut PgConnection, name: &str) -> Result<Option<SlotInfo>> {
    let rows = conn
        .simple_query(&format!(
            "SELECT active, confirmed_flush_lsn FROM pg_replication_slots WHERE slot_name = {}",
            quote_literal(name)
        ))
        .await?;
    let Some(row) = rows.first() else {
        return Ok(None);
    };
    Ok(Some(SlotInfo {
        active: row.get("active") == Some("t"),
        confirmed_flush: row.get("confirmed_flush_lsn").map(Lsn::parse).transpose()?,
    }))
}

pub async fn publication_exists(conn: &mut PgConnection, name: &str) -> Result<bool> {
    let rows = conn
        .simple_query(&format!(
            "SELECT 1 FROM pg_publication WHERE pubname = {}",
            quote_literal(name)
        ))
        .await?;
    Ok(!rows.is_empty())
}

pub async fn published_tables(conn: &mut PgConnection, name: &str) -> Result<BTreeSet<String>> {
    let rows = conn
        .simple_query(&format!(
            "SELECT schemaname, tablename FROM pg_publication_tables WHERE pubname = {}",
            quote_literal(name)
        ))
        .await?;
    rows.iter()
        .map(|r| -> Result<String> {
            Ok(format!("{}.{}", r.require("schemaname")?, r.require("tablename")?))
        })
        .collect()
}

fn table_list(tables: &[String]) -> String {
    tables.iter().map(|t| quote_table(t)).collect::<Vec<_>>().join(", ")
}

pub async fn create_publication(conn: &mut PgConnection, name: &str, tables: &[String]) -> Result<()> {
    let mut sql = format!("CREATE PUBLICATION {}", quote_identifier(name));
    if !tables.is_empty() {
        sql.push_str(" FOR TABLE ");
        sql.push_str(&table_list(tables));
    }
    info!(publication = name, tables = tables.len(), "creating publication");
    conn.execute(&sql).await
}

pub async fn drop_publication(conn: &mut PgConnection, name: &str) -> Result<()> {
    info!(publication = name, "dropping publication");
    conn.execute(&format!("DROP PUBLICATION IF EXISTS {}", quote_identifier(name)))
        .await
}

pub async fn alter_publication(
    conn: &mut PgConnection,
    name: &str,
    add: &[String],
    drop: &[String],
) -> Result<()> {
    if !drop.is_empty() {
        info!(publication = name, tables = ?drop, "removing tables from publication");
        conn.execute(&format!(
            "ALTER PUBLICATION {} DROP TABLE {}",
            quote_identifier(name),
            table_list(drop)
        ))
        .await?;
    }
    if !add.is_empty() {
        info!(publication = name, tables = ?add, "adding tables to publication");
        conn.execute(&format!(
            "ALTER PUBLICATION {} ADD TABLE {}",
            quote_identifier(name),
            table_list(add)
        ))
        .await?;
    }
    Ok(())
}

/// Result of slot and publication setup.
#[derive(Debug, Clone)]
pub struct Setup {
    /// Where streaming starts.
    pub start: Lsn,
    /// The slot was just created; every table needs a full sync, and the
    /// connection is inside the snapshot transaction that must be committed
    /// once the copies are done.
    pub created: bool,
    /// Tables added to an existing publication.
    pub new_tables: Vec<String>,
}

/// Bring slot and publication in line with `tables`.
///
/// When the slot has to be created this leaves `conn` inside a repeatable
/// read transaction running on the slot's snapshot.
pub async fn prepare(conn: &mut PgConnection, name: &str, tables: &[String]) -> Result<Setup> {
    let mut slot = find_slot(conn, name).await?;
    let mut has_publication = publication_exists(conn, name).await?;

    match cleanup_for(slot.is_some(), has_publication) {
        Cleanup::DropSlot => {
            info!(slot = name, "slot has no publication, dropping it");
            if slot.as_ref().is_some_and(|s| s.active) {
                return Err(StreamerError::Server(format!("replication slot {name} is active")));
            }
            conn.drop_replication_slot(name).await?;
            slot = None;
        }
        Cleanup::DropPublication => {
            drop_publication(conn, name).await?;
            has_publication = false;
        }
        Cleanup::None => {}
    }

    if slot.as_ref().is_some_and(|s| s.active) {
        return Err(StreamerError::Server(format!(
            "replication slot {name} is active in another session"
        )));
    }

    let new_tables = if has_publication {
        let published = published_tables(conn, name).await?;
        let (add, drop) = publication_diff(&published, tables);
        alter_publication(conn, name, &add, &drop).await?;
        add
    } else {
        create_publication(conn, name, tables).await?;
        tables.to_vec()
    };

    match slot {
        Some(info) => {
            let start = info.confirmed_flush.unwrap_or(Lsn::ZERO);
            debug!(slot = name, %start, "slot exists");
            Ok(Setup {
                start,
                created: false,
                new_tables,
            })
        }
        None => {
            conn.execute("BEGIN READ ONLY ISOLATION LEVEL REPEATABLE READ").await?;
            let start = conn
                .create_replication_slot(name, crate::client::SnapshotAction::Use)
                .await?;
            info!(slot = name, %start, "replication slot created");
            Ok(Setup {
                start,
                created: true,
                new_tables: tables.to_vec(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_sanitized() {
        assert_eq!(slot_name("streamer", "Shop-DB", "eu.1"), "streamer_shop_db_eu_1");
        assert_eq!(slot_name("s", &"x".repeat(100), "a").len(), MAX_NAME);
    }

    #[test]
    fn options_follow_server_version() {
        let v13 = plugin_options(13, "p");
        assert_eq!(
            v13,
            vec![("proto_version", "1".to_string()), ("publication_names", "p".to_string())]
        );

        let v16 = plugin_options(16, "p");
        assert!(v16.contains(&("proto_version", "2".into())));
        assert!(v16.contains(&("streaming", "true".into())));
        assert!(v16.contains(&("messages", "true".into())));
    }

    #[test]
    fn leftovers_are_cleaned_up() {
        assert_eq!(cleanup_for(true, false), Cleanup::DropSlot);
        assert_eq!(cleanup_for(false, true), Cleanup::DropPublication);
        assert_eq!(cleanup_for(true, true), Cleanup::None);
        assert_eq!(cleanup_for(false, false), Cleanup::None);
    }

    #[test]
    fn diff_adds_missing_and_drops_unmapped() {
        let published: BTreeSet<String> = ["public.a", "public.old"].iter().map(|s| s.to_string()).collect();
        let wanted = vec!["public.a".to_string(), "public.b".to_string()];
        let (add, drop) = publication_diff(&published, &wanted);
        assert_eq!(add, ["public.b"]);
        assert_eq!(drop, ["public.old"]);
    }
}
