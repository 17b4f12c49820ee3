//! Source catalog discovery.
//!
//! Queries the source's system catalogs once, right after the snapshot is
//! established, and produces the immutable table/index/sequence/extension
//! lists the whole run works from. The catalog is also serialized to
//! `schema.json` in the work directory so a resumed run and the final report
//! see the same plan.

use std::fs;
use std::path::Path;

use pg_escape::quote_identifier;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ErrorKind, Result};
use crate::pgclone_error;
use crate::pgsql::{PgConnection, qualified_name};

/// Namespaces that never take part in a copy.
const EXCLUDED_NAMESPACES: &str = "('pg_catalog', 'information_schema', 'pgclone')";

/// One partition of a table COPY: a closed `[min, max]` range on the
/// partition key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablePart {
    pub part_number: u32,
    pub part_count: u32,
    pub min: i64,
    pub max: i64,
}

/// An index of a source table, with its backing constraint when one exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceIndex {
    pub index_oid: u32,
    /// Zero when the index has no backing constraint.
    pub constraint_oid: u32,
    pub nspname: String,
    pub relname: String,
    pub constraint_name: String,
    pub index_def: String,
    pub constraint_def: String,
    pub table_oid: u32,
}

impl SourceIndex {
    pub fn has_constraint(&self) -> bool {
        self.constraint_oid != 0
    }
}

/// A table to copy, with its size, partition plan and index list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceTable {
    pub oid: u32,
    pub nspname: String,
    pub relname: String,
    pub bytes: i64,
    pub bytes_pretty: String,
    pub reltuples: i64,
    /// Single-column integer key the COPY can be partitioned on.
    pub part_key: Option<String>,
    /// Non-empty only for tables large enough to split.
    pub parts: Vec<TablePart>,
    pub indexes: Vec<SourceIndex>,
}

impl SourceTable {
    pub fn qualified_name(&self) -> String {
        qualified_name(&self.nspname, &self.relname)
    }

    pub fn is_partitioned(&self) -> bool {
        !self.parts.is_empty()
    }

    /// The COPY .. TO STDOUT statement for the whole table or one part.
    pub fn copy_out_sql(&self, part: Option<&TablePart>) -> String {
        match (part, &self.part_key) {
            (Some(part), Some(key)) => format!(
                "COPY (SELECT * FROM {} WHERE {} BETWEEN {} AND {}) TO STDOUT",
                self.qualified_name(),
                quote_identifier(key),
                part.min,
                part.max
            ),
            _ => format!("COPY {} TO STDOUT", self.qualified_name()),
        }
    }

    pub fn copy_in_sql(&self) -> String {
        format!("COPY {} FROM STDIN", self.qualified_name())
    }

    /// Index list in the on-disk `(index_oid, constraint_oid)` pair form.
    pub fn index_oid_pairs(&self) -> Vec<(u32, u32)> {
        self.indexes
            .iter()
            .map(|index| (index.index_oid, index.constraint_oid))
            .collect()
    }
}

/// A sequence and its current position on the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSequence {
    pub oid: u32,
    pub nspname: String,
    pub relname: String,
    pub last_value: i64,
    pub is_called: bool,
}

impl SourceSequence {
    pub fn qualified_name(&self) -> String {
        qualified_name(&self.nspname, &self.relname)
    }
}

/// A configuration table of an extension, copied with the extension since
/// pg_dump leaves user rows of such tables to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionConfig {
    pub nspname: String,
    pub relname: String,
    /// Filter clause from extcondition, starting with WHERE when present.
    pub condition: String,
}

/// An extension installed on the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceExtension {
    pub oid: u32,
    pub name: String,
    pub configs: Vec<ExtensionConfig>,
}

/// Everything the catalog queries discovered, in dependency-free form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceCatalog {
    pub tables: Vec<SourceTable>,
    pub sequences: Vec<SourceSequence>,
    pub extensions: Vec<SourceExtension>,
    pub largeobject_count: i64,
}

impl SourceCatalog {
    /// Fetches the whole catalog on the given (snapshot-bounded) connection.
    pub async fn fetch(conn: &PgConnection, split_threshold_bytes: u64) -> Result<Self> {
        let mut tables = list_tables(conn).await?;
        attach_indexes(conn, &mut tables).await?;
        plan_table_parts(conn, &mut tables, split_threshold_bytes).await?;

        let sequences = list_sequences(conn).await?;
        let extensions = list_extensions(conn).await?;
        let largeobject_count = count_large_objects(conn).await?;

        info!(
            tables = tables.len(),
            sequences = sequences.len(),
            extensions = extensions.len(),
            largeobjects = largeobject_count,
            "fetched source catalog"
        );

        Ok(SourceCatalog {
            tables,
            sequences,
            extensions,
            largeobject_count,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Ordinary tables, largest first so the biggest COPYs start early.
/// Extension-owned tables are excluded; their data travels with the
/// extension handling.
async fn list_tables(conn: &PgConnection) -> Result<Vec<SourceTable>> {
    let sql = format!(
        "SELECT c.oid, n.nspname, c.relname, \
                pg_total_relation_size(c.oid) AS bytes, \
                pg_size_pretty(pg_total_relation_size(c.oid)) AS bytes_pretty, \
                greatest(c.reltuples, 0)::bigint AS reltuples \
           FROM pg_catalog.pg_class c \
           JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
          WHERE c.relkind = 'r' \
            AND c.relpersistence = 'p' \
            AND n.nspname NOT IN {EXCLUDED_NAMESPACES} \
            AND NOT EXISTS \
                (SELECT 1 FROM pg_catalog.pg_depend d \
                  WHERE d.classid = 'pg_catalog.pg_class'::regclass \
                    AND d.objid = c.oid AND d.deptype = 'e') \
          ORDER BY bytes DESC, c.oid"
    );

    let rows = conn.query(&sql, &[]).await?;
    let tables = rows
        .iter()
        .map(|row| SourceTable {
            oid: row.get("oid"),
            nspname: row.get("nspname"),
            relname: row.get("relname"),
            bytes: row.get("bytes"),
            bytes_pretty: row.get("bytes_pretty"),
            reltuples: row.get("reltuples"),
            part_key: None,
            parts: Vec::new(),
            indexes: Vec::new(),
        })
        .collect();

    Ok(tables)
}

/// Fetches every user index with its optional backing constraint and attaches
/// them to their tables.
async fn attach_indexes(conn: &PgConnection, tables: &mut [SourceTable]) -> Result<()> {
    let sql = format!(
        "SELECT x.indrelid AS table_oid, \
                i.oid AS index_oid, \
                coalesce(con.oid, 0::oid) AS constraint_oid, \
                n.nspname, i.relname, \
                coalesce(con.conname, '') AS constraint_name, \
                pg_get_indexdef(i.oid) AS index_def, \
                coalesce(pg_get_constraintdef(con.oid), '') AS constraint_def \
           FROM pg_catalog.pg_index x \
           JOIN pg_catalog.pg_class i ON i.oid = x.indexrelid \
           JOIN pg_catalog.pg_class r ON r.oid = x.indrelid \
           JOIN pg_catalog.pg_namespace n ON n.oid = i.relnamespace \
           LEFT JOIN pg_catalog.pg_constraint con \
                  ON con.conindid = i.oid AND con.contype IN ('p', 'u', 'x') \
          WHERE r.relkind = 'r' \
            AND n.nspname NOT IN {EXCLUDED_NAMESPACES} \
          ORDER BY x.indrelid, i.oid"
    );

    let rows = conn.query(&sql, &[]).await?;
    for row in rows {
        let index = SourceIndex {
            table_oid: row.get("table_oid"),
            index_oid: row.get("index_oid"),
            constraint_oid: row.get("constraint_oid"),
            nspname: row.get("nspname"),
            relname: row.get("relname"),
            constraint_name: row.get("constraint_name"),
            index_def: row.get("index_def"),
            constraint_def: row.get("constraint_def"),
        };
        if let Some(table) = tables.iter_mut().find(|table| table.oid == index.table_oid) {
            table.indexes.push(index);
        }
    }

    Ok(())
}

/// Finds the partition key and computes the part ranges for tables larger
/// than the split threshold. A table qualifies when it has a single-column
/// not-null unique btree index on an integer column, primary key preferred.
async fn plan_table_parts(
    conn: &PgConnection,
    tables: &mut [SourceTable],
    split_threshold_bytes: u64,
) -> Result<()> {
    if split_threshold_bytes == 0 {
        return Ok(());
    }

    let key_sql = "SELECT a.attname \
                     FROM pg_catalog.pg_index i \
                     JOIN pg_catalog.pg_attribute a \
                       ON a.attrelid = i.indrelid AND a.attnum = i.indkey[0] \
                    WHERE i.indrelid = $1::oid \
                      AND i.indisunique \
                      AND i.indnatts = 1 \
                      AND a.attnotnull \
                      AND a.atttypid IN (20, 21, 23) \
                    ORDER BY i.indisprimary DESC \
                    LIMIT 1";

    for table in tables.iter_mut() {
        if (table.bytes as u64) < split_threshold_bytes {
            continue;
        }

        let rows = conn.query(key_sql, &[&table.oid]).await?;
        let Some(row) = rows.first() else {
            debug!(
                oid = table.oid,
                table = %table.qualified_name(),
                "table is large enough to split but has no suitable partition key"
            );
            continue;
        };
        let key: String = row.get(0);

        let minmax_sql = format!(
            "SELECT min({key})::bigint, max({key})::bigint FROM {}",
            table.qualified_name(),
            key = quote_identifier(&key),
        );
        let row = conn.query_one(&minmax_sql, &[]).await?;
        let (min, max): (Option<i64>, Option<i64>) = (row.get(0), row.get(1));
        let (Some(min), Some(max)) = (min, max) else {
            // Empty table, nothing to split.
            continue;
        };

        table.parts = compute_parts(min, max, table.bytes as u64, split_threshold_bytes);
        if !table.parts.is_empty() {
            table.part_key = Some(key);
            info!(
                table = %table.qualified_name(),
                bytes = %table.bytes_pretty,
                parts = table.parts.len(),
                key = table.part_key.as_deref().unwrap_or_default(),
                "split table copy into partitions"
            );
        }
    }

    Ok(())
}

/// Splits the closed key domain `[min, max]` into `ceil(bytes / threshold)`
/// consecutive, non-overlapping ranges that cover it entirely.
pub fn compute_parts(min: i64, max: i64, bytes: u64, threshold: u64) -> Vec<TablePart> {
    if threshold == 0 || bytes < threshold || min > max {
        return Vec::new();
    }

    let wanted = bytes.div_ceil(threshold);
    let domain = (max - min + 1) as u64;
    let part_count = wanted.min(domain) as u32;
    if part_count <= 1 {
        return Vec::new();
    }

    let width = domain / part_count as u64;
    let remainder = domain % part_count as u64;

    let mut parts = Vec::with_capacity(part_count as usize);
    let mut lower = min;
    for part_number in 0..part_count {
        // Spread the remainder over the first ranges to keep sizes within one.
        let extra = if (part_number as u64) < remainder { 1 } else { 0 };
        let upper = lower + (width + extra) as i64 - 1;
        parts.push(TablePart {
            part_number,
            part_count,
            min: lower,
            max: upper,
        });
        lower = upper + 1;
    }

    debug_assert_eq!(parts.last().map(|part| part.max), Some(max));
    parts
}

async fn list_sequences(conn: &PgConnection) -> Result<Vec<SourceSequence>> {
    let sql = format!(
        "SELECT c.oid, n.nspname, c.relname \
           FROM pg_catalog.pg_class c \
           JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
          WHERE c.relkind = 'S' \
            AND n.nspname NOT IN {EXCLUDED_NAMESPACES} \
            AND NOT EXISTS \
                (SELECT 1 FROM pg_catalog.pg_depend d \
                  WHERE d.classid = 'pg_catalog.pg_class'::regclass \
                    AND d.objid = c.oid AND d.deptype = 'e') \
          ORDER BY n.nspname, c.relname"
    );

    let rows = conn.query(&sql, &[]).await?;
    let mut sequences = Vec::with_capacity(rows.len());
    for row in rows {
        let mut sequence = SourceSequence {
            oid: row.get("oid"),
            nspname: row.get("nspname"),
            relname: row.get("relname"),
            last_value: 0,
            is_called: false,
        };

        let values_sql = format!(
            "SELECT last_value, is_called FROM {}",
            sequence.qualified_name()
        );
        let values = conn.query_one(&values_sql, &[]).await?;
        sequence.last_value = values.get("last_value");
        sequence.is_called = values.get("is_called");

        sequences.push(sequence);
    }

    Ok(sequences)
}

async fn list_extensions(conn: &PgConnection) -> Result<Vec<SourceExtension>> {
    let rows = conn
        .query(
            "SELECT e.oid, e.extname FROM pg_catalog.pg_extension e \
              WHERE e.extname <> 'plpgsql' ORDER BY e.extname",
            &[],
        )
        .await?;

    let mut extensions: Vec<SourceExtension> = rows
        .iter()
        .map(|row| SourceExtension {
            oid: row.get("oid"),
            name: row.get("extname"),
            configs: Vec::new(),
        })
        .collect();

    // Configuration tables registered with pg_extension_config_dump carry
    // user data that the schema restore does not recreate.
    let config_rows = conn
        .query(
            "SELECT e.oid AS extension_oid, n.nspname, c.relname, \
                    coalesce(cond.condition, '') AS condition \
               FROM pg_catalog.pg_extension e \
              CROSS JOIN LATERAL \
                    unnest(e.extconfig, e.extcondition) AS cond(tbloid, condition) \
               JOIN pg_catalog.pg_class c ON c.oid = cond.tbloid \
               JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
              ORDER BY e.oid",
            &[],
        )
        .await?;

    for row in config_rows {
        let extension_oid: u32 = row.get("extension_oid");
        if let Some(extension) = extensions
            .iter_mut()
            .find(|extension| extension.oid == extension_oid)
        {
            extension.configs.push(ExtensionConfig {
                nspname: row.get("nspname"),
                relname: row.get("relname"),
                condition: row.get("condition"),
            });
        }
    }

    Ok(extensions)
}

async fn count_large_objects(conn: &PgConnection) -> Result<i64> {
    let row = conn
        .query_one("SELECT count(*) FROM pg_catalog.pg_largeobject_metadata", &[])
        .await?;
    Ok(row.get(0))
}

/// Restores every sequence on the target with setval.
pub async fn reset_sequences(target: &PgConnection, sequences: &[SourceSequence]) -> Result<()> {
    for sequence in sequences {
        let sql = format!(
            "SELECT pg_catalog.setval({}, {}, {})",
            pg_escape::quote_literal(&sequence.qualified_name()),
            sequence.last_value.max(1),
            sequence.is_called,
        );
        target.query_one(&sql, &[]).await.map_err(|err| {
            pgclone_error!(
                ErrorKind::TargetDatabase,
                "failed to reset sequence",
                format!("{}: {err}", sequence.qualified_name())
            )
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_covers(parts: &[TablePart], min: i64, max: i64) {
        assert_eq!(parts.first().unwrap().min, min);
        assert_eq!(parts.last().unwrap().max, max);
        for pair in parts.windows(2) {
            // Consecutive and non-overlapping.
            assert_eq!(pair[1].min, pair[0].max + 1);
        }
    }

    #[test]
    fn parts_cover_domain_without_overlap() {
        let parts = compute_parts(1, 10_000_000, 10 << 30, 1 << 30);
        assert_eq!(parts.len(), 10);
        assert_covers(&parts, 1, 10_000_000);
        assert!(parts.iter().all(|part| part.part_count == 10));
    }

    #[test]
    fn parts_spread_remainder() {
        let parts = compute_parts(0, 9, 4096, 1024);
        assert_eq!(parts.len(), 4);
        assert_covers(&parts, 0, 9);
        // Domain of 10 over 4 parts: widths 3, 3, 2, 2.
        let widths: Vec<i64> = parts.iter().map(|p| p.max - p.min + 1).collect();
        assert_eq!(widths, vec![3, 3, 2, 2]);
    }

    #[test]
    fn small_table_is_not_split() {
        assert!(compute_parts(1, 1000, 100, 1024).is_empty());
    }

    #[test]
    fn disabled_threshold_never_splits() {
        assert!(compute_parts(1, 1000, u64::MAX, 0).is_empty());
    }

    #[test]
    fn inverted_range_is_not_split() {
        assert!(compute_parts(10, 1, 4096, 1024).is_empty());
    }

    #[test]
    fn narrow_domain_caps_part_count() {
        // 3 distinct key values cannot make more than 3 parts.
        let parts = compute_parts(5, 7, 10 << 30, 1 << 30);
        assert_eq!(parts.len(), 3);
        assert_covers(&parts, 5, 7);
    }

    #[test]
    fn single_value_domain_is_not_split() {
        assert!(compute_parts(42, 42, 10 << 30, 1 << 30).is_empty());
    }

    #[test]
    fn copy_sql_for_whole_table_and_part() {
        let table = SourceTable {
            oid: 16384,
            nspname: "public".to_string(),
            relname: "events".to_string(),
            bytes: 0,
            bytes_pretty: "0 bytes".to_string(),
            reltuples: 0,
            part_key: Some("id".to_string()),
            parts: vec![TablePart {
                part_number: 0,
                part_count: 2,
                min: 1,
                max: 500,
            }],
            indexes: Vec::new(),
        };

        assert_eq!(table.copy_in_sql(), "COPY public.events FROM STDIN");
        assert_eq!(table.copy_out_sql(None), "COPY public.events TO STDOUT");
        assert_eq!(
            table.copy_out_sql(Some(&table.parts[0])),
            "COPY (SELECT * FROM public.events WHERE id BETWEEN 1 AND 500) TO STDOUT"
        );
    }

    #[test]
    fn catalog_round_trips_through_json() {
        let catalog = SourceCatalog {
            tables: vec![SourceTable {
                oid: 1,
                nspname: "public".into(),
                relname: "t".into(),
                bytes: 10,
                bytes_pretty: "10 bytes".into(),
                reltuples: 1,
                part_key: None,
                parts: Vec::new(),
                indexes: vec![SourceIndex {
                    index_oid: 2,
                    constraint_oid: 0,
                    nspname: "public".into(),
                    relname: "t_idx".into(),
                    constraint_name: String::new(),
                    index_def: "CREATE INDEX t_idx ON public.t (a)".into(),
                    constraint_def: String::new(),
                    table_oid: 1,
                }],
            }],
            sequences: Vec::new(),
            extensions: Vec::new(),
            largeobject_count: 3,
        };

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("schema.json");
        catalog.save(&path).unwrap();
        assert_eq!(SourceCatalog::load(&path).unwrap(), catalog);
    }
}
