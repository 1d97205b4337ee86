//! Pre-built view layouts and rows.

use crate::models::RawRow;

/// Columns of `SELECT *` over the view joined with `pg_roles` and `pg_database`,
/// trimmed to what the collector cares about.
pub const DEFAULT_VIEW_COLUMNS: [&str; 11] = [
    "userid",
    "dbid",
    "queryid",
    "query",
    "calls",
    "total_exec_time",
    "rows",
    "shared_blks_hit",
    "rolname",
    "datname",
    "oid",
];

/// A statistics row with the given text, context and `calls`/`rows` counters.
pub fn statement(query: &str, datname: &str, rolname: &str, calls: i64, rows: i64) -> RawRow {
    RawRow::new()
        .with("query", query)
        .with("datname", datname)
        .with("rolname", rolname)
        .with("calls", calls)
        .with("rows", rows)
}
