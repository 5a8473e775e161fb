//! Declarative table schema and additive reconciliation.
//!
//! The desired shape of a table is a static list of [`ColumnSpec`]s. On
//! startup [`ensure`] diffs it against what SQLite reports and adds any
//! missing columns. Existing columns are never dropped, renamed or retyped,
//! so rows written by older releases stay readable.

use rusqlite::Connection;

use super::DbError;

/// Name of the samples table.
pub const SAMPLE_TABLE: &str = "net_metrics";

/// SQLite storage class of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
}

impl ColumnType {
    pub fn as_sql(self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
        }
    }
}

/// One column of a desired table shape.
#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub ty: ColumnType,
    /// Only honored when the table is created; columns added later are
    /// always nullable.
    pub required: bool,
}

const fn required(name: &'static str, ty: ColumnType) -> ColumnSpec {
    ColumnSpec { name, ty, required: true }
}

const fn optional(name: &'static str, ty: ColumnType) -> ColumnSpec {
    ColumnSpec { name, ty, required: false }
}

/// Current shape of the samples table. Append new columns at the end.
pub const SAMPLE_COLUMNS: &[ColumnSpec] = &[
    required("ts_utc", ColumnType::Text),
    required("host", ColumnType::Text),
    required("iface", ColumnType::Text),
    optional("bytes_sent_delta", ColumnType::Integer),
    optional("bytes_recv_delta", ColumnType::Integer),
    optional("packets_sent_delta", ColumnType::Integer),
    optional("packets_recv_delta", ColumnType::Integer),
    optional("errin_delta", ColumnType::Integer),
    optional("errout_delta", ColumnType::Integer),
    optional("dropin_delta", ColumnType::Integer),
    optional("dropout_delta", ColumnType::Integer),
    optional("bytes_sent_rate", ColumnType::Real),
    optional("bytes_recv_rate", ColumnType::Real),
    optional("packets_sent_rate", ColumnType::Real),
    optional("packets_recv_rate", ColumnType::Real),
    optional("ping_min_ms", ColumnType::Real),
    optional("ping_avg_ms", ColumnType::Real),
    optional("ping_max_ms", ColumnType::Real),
    optional("ping_jitter_ms", ColumnType::Real),
    optional("ping_loss_pct", ColumnType::Real),
    optional("ping_sent", ColumnType::Integer),
    optional("ping_received", ColumnType::Integer),
    optional("dns_ms", ColumnType::Real),
    optional("dns_ok", ColumnType::Integer),
    optional("avail_ok", ColumnType::Integer),
    optional("thr_down_mbps", ColumnType::Real),
    optional("thr_up_mbps", ColumnType::Real),
    optional("thr_method", ColumnType::Text),
];

/// What [`ensure`] changed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SchemaReport {
    pub created: bool,
    pub added: Vec<String>,
}

impl SchemaReport {
    #[cfg(test)]
    pub fn is_unchanged(&self) -> bool {
        !self.created && self.added.is_empty()
    }
}

/// Make sure `table` exists with at least the `desired` columns.
///
/// A missing table is created with every desired column. An existing table
/// gets `ALTER TABLE ... ADD COLUMN` for each column it lacks, all inside
/// one transaction. Calling this again with the same descriptor is a no-op.
pub fn ensure(conn: &Connection, table: &str, desired: &[ColumnSpec]) -> Result<SchemaReport, DbError> {
    validate_identifier(table)?;
    for col in desired {
        validate_identifier(col.name)?;
    }

    let existing = existing_columns(conn, table)?;
    let mut report = SchemaReport::default();

    if existing.is_empty() {
        let defs: Vec<String> = desired
            .iter()
            .map(|c| {
                if c.required {
                    format!("{} {} NOT NULL", c.name, c.ty.as_sql())
                } else {
                    format!("{} {}", c.name, c.ty.as_sql())
                }
            })
            .collect();
        conn.execute_batch(&format!("CREATE TABLE IF NOT EXISTS {} ({});", table, defs.join(", ")))?;
        report.created = true;
        return Ok(report);
    }

    let tx = conn.unchecked_transaction()?;
    for col in desired {
        match existing.iter().find(|(name, _)| name.eq_ignore_ascii_case(col.name)) {
            Some((_, ty)) => {
                if !ty.eq_ignore_ascii_case(col.ty.as_sql()) {
                    tracing::warn!(
                        "Schema: column {}.{} is declared {} but {} is expected; leaving it as is",
                        table,
                        col.name,
                        ty,
                        col.ty.as_sql()
                    );
                }
            }
            None => {
                tx.execute_batch(&format!(
                    "ALTER TABLE {} ADD COLUMN {} {};",
                    table,
                    col.name,
                    col.ty.as_sql()
                ))?;
                report.added.push(col.name.to_string());
            }
        }
    }
    tx.commit()?;

    Ok(report)
}

/// Create a single-column index if it does not already exist.
pub fn ensure_index(conn: &Connection, table: &str, column: &str) -> Result<(), DbError> {
    validate_identifier(table)?;
    validate_identifier(column)?;
    conn.execute_batch(&format!(
        "CREATE INDEX IF NOT EXISTS idx_{table}_{column} ON {table}({column});"
    ))?;
    Ok(())
}

/// Column names and declared types of `table`, empty if it does not exist.
pub fn existing_columns(conn: &Connection, table: &str) -> Result<Vec<(String, String)>, DbError> {
    validate_identifier(table)?;
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({});", table))?;
    let cols = stmt
        .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(cols)
}

fn validate_identifier(name: &str) -> Result<(), DbError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(DbError::Schema(format!("invalid identifier {:?}", name)))
    }
}
