//! Live table and column metadata from `pg_catalog`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use pg_escape::quote_literal;

use crate::client::PgConnection;
use crate::error::{Result, StreamerError};
use crate::value::{ValueType, type_for_name};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    /// `pg_type.typname`, e.g. `int4`.
    pub type_name: String,
    /// Type without modifier, usable in a cast (`character varying`).
    pub cast_type: String,
    /// Declared type with modifier (`character varying(20)`).
    pub declared: String,
    pub primary_key: bool,
}

impl ColumnMeta {
    pub fn value_type(&self) -> ValueType {
        type_for_name(&self.type_name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableMeta {
    pub schema: String,
    pub name: String,
    /// Columns in `attnum` order.
    pub columns: Vec<ColumnMeta>,
    /// Qualified names of inheriting tables or partitions.
    pub partitions: Vec<String>,
}

impl TableMeta {
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnMeta> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Tables keyed by `schema.table`.
pub type Tables = BTreeMap<String, TableMeta>;

/// Text-mode query access to a catalog.
#[async_trait]
pub trait CatalogQuery: Send {
    async fn query_text(&mut self, sql: &str) -> Result<Vec<Vec<Option<String>>>>;
}

#[async_trait]
impl CatalogQuery for PgConnection {
    async fn query_text(&mut self, sql: &str) -> Result<Vec<Vec<Option<String>>>> {
        let rows = self.simple_query(sql).await?;
        Ok(rows.into_iter().map(|r| r.into_values()).collect())
    }
}

#[async_trait]
impl<'c> CatalogQuery for &'c tokio_postgres::Client {
    async fn query_text(&mut self, sql: &str) -> Result<Vec<Vec<Option<String>>>> {
        let mut out = Vec::new();
        for msg in self.simple_query(sql).await? {
            if let tokio_postgres::SimpleQueryMessage::Row(row) = msg {
                out.push((0..row.len()).map(|i| row.get(i).map(str::to_string)).collect());
            }
        }
        Ok(out)
    }
}

fn tables_query(schema_like: &str) -> String {
    format!(
        r"WITH parts AS (
    SELECT h.inhparent AS parent,
           string_agg(pn.nspname || '.' || pc.relname, ',' ORDER BY pc.relname) AS partitions
    FROM pg_catalog.pg_inherits h
    JOIN pg_catalog.pg_class pc ON pc.oid = h.inhrelid
    JOIN pg_catalog.pg_namespace pn ON pn.oid = pc.relnamespace
    GROUP BY h.inhparent
)
SELECT n.nspname, c.relname, a.attname, t.typname,
       format_type(a.atttypid, NULL), format_type(a.atttypid, a.atttypmod),
       EXISTS (
           SELECT 1 FROM pg_catalog.pg_index i
           WHERE i.indrelid = c.oid AND i.indisprimary AND a.attnum = ANY(i.indkey)
       ),
       p.partitions
FROM pg_catalog.pg_class c
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
JOIN pg_catalog.pg_attribute a ON a.attrelid = c.oid AND a.attnum > 0 AND NOT a.attisdropped
JOIN pg_catalog.pg_type t ON t.oid = a.atttypid
LEFT JOIN parts p ON p.parent = c.oid
WHERE c.relkind IN ('r', 'p')
  AND NOT c.relispartition
  AND n.nspname LIKE {}
  AND n.nspname NOT LIKE 'pg\_%'
  AND n.nspname <> 'information_schema'
ORDER BY n.nspname, c.relname, a.attnum",
        quote_literal(schema_like)
    )
}

/// Fetch base tables (regular and partitioned, excluding partitions) whose
/// schema matches the `LIKE` pattern.
pub async fn fetch_tables<Q>(q: &mut Q, schema_like: &str) -> Result<Tables>
where
    Q: CatalogQuery + ?Sized,
{
    let rows = q.query_text(&tables_query(schema_like)).await?;
    parse_tables(rows)
}

fn parse_tables(rows: Vec<Vec<Option<String>>>) -> Result<Tables> {
    let mut tables = Tables::new();
    for row in rows {
        let mut cells = row.into_iter();
        let mut next = |what: &str| -> Result<Option<String>> {
            cells
                .next()
                .ok_or_else(|| StreamerError::Protocol(format!("catalog row missing {what}")))
        };
        let required = |v: Option<String>, what: &str| {
            v.ok_or_else(|| StreamerError::Protocol(format!("catalog {what} is null")))
        };
        let schema = required(next("schema")?, "schema")?;
        let name = required(next("table")?, "table")?;
        let column = required(next("column")?, "column")?;
        let type_name = required(next("type")?, "type")?;
        let cast_type = required(next("cast type")?, "cast type")?;
        let declared = required(next("declared type")?, "declared type")?;
        let primary_key = next("pk")?.as_deref() == Some("t");
        let partitions = next("partitions")?;

        let table = tables
            .entry(format!("{schema}.{name}"))
            .or_insert_with(|| TableMeta {
                schema: schema.clone(),
                name: name.clone(),
                columns: Vec::new(),
                partitions: partitions
                    .as_deref()
                    .map(|p| p.split(',').map(str::to_string).collect())
                    .unwrap_or_default(),
            });
        table.columns.push(ColumnMeta {
            name: column,
            type_name,
            cast_type,
            declared,
            primary_key,
        });
    }
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[Option<&str>]) -> Vec<Option<String>> {
        cells.iter().map(|c| c.map(str::to_string)).collect()
    }

    #[test]
    fn groups_columns_by_table() {
        let rows = vec![
            row(&[Some("public"), Some("users"), Some("id"), Some("int4"), Some("integer"), Some("integer"), Some("t"), None]),
            row(&[Some("public"), Some("users"), Some("name"), Some("varchar"), Some("character varying"), Some("character varying(20)"), Some("f"), None]),
            row(&[Some("public"), Some("events"), Some("id"), Some("int8"), Some("bigint"), Some("bigint"), Some("f"), Some("public.events_1,public.events_2")]),
        ];
        let tables = parse_tables(rows).unwrap();
        assert_eq!(tables.len(), 2);

        let users = &tables["public.users"];
        assert_eq!(users.columns.len(), 2);
        assert!(users.column("id").unwrap().primary_key);
        assert_eq!(users.column("name").unwrap().value_type(), ValueType::String);
        assert_eq!(users.column("name").unwrap().declared, "character varying(20)");

        assert_eq!(
            tables["public.events"].partitions,
            vec!["public.events_1".to_string(), "public.events_2".to_string()]
        );
    }

    #[test]
    fn short_rows_are_protocol_errors() {
        let err = parse_tables(vec![row(&[Some("public"), Some("users")])]).unwrap_err();
        assert!(matches!(err, StreamerError::Protocol(_)));
    }

    #[test]
    fn schema_pattern_is_quoted() {
        let sql = tables_query("it's");
        assert!(sql.contains("LIKE 'it''s'"));
    }
}
