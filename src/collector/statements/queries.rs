//! SQL and column sets for `pg_stat_statements` collection.

use std::collections::BTreeSet;

use crate::models::MetricColumn;

/// Columns without which no delta can be computed.
pub const REQUIRED_COLUMNS: [&str; 3] = ["calls", "query", "rows"];

/// Non-metric columns used for tagging and identity.
pub const TAG_COLUMNS: [&str; 3] = ["datname", "rolname", "query"];

pub const OPTIONAL_COLUMNS: [&str; 1] = ["queryid"];

pub const COUNT_QUERY: &str = "SELECT COUNT(*) AS count FROM pg_stat_statements(false)";

/// `pg_stat_statements(showtext)` appeared in 9.4.
pub const COUNT_QUERY_LT_9_4: &str = "SELECT COUNT(*) AS count FROM pg_stat_statements";

pub const MAX_SETTING_QUERY: &str =
    "SELECT setting FROM pg_settings WHERE name = 'pg_stat_statements.max'";

/// Every column the collector selects when the view has it.
pub fn desired_columns() -> BTreeSet<&'static str> {
    MetricColumn::ALL
        .iter()
        .map(|c| c.name())
        .chain(TAG_COLUMNS)
        .chain(OPTIONAL_COLUMNS)
        .collect()
}

/// Builds the statistics query.
///
/// `userid`/`dbid` are resolved to role and database names; rows hidden from
/// the current role and `EXPLAIN` statements are skipped.
pub fn build_statements_query(cols: &str, view: &str, filters: &str, limit: u32) -> String {
    format!(
        r#"
            SELECT {cols}
              FROM {view} as pg_stat_statements
              LEFT JOIN pg_roles
                     ON pg_stat_statements.userid = pg_roles.oid
              LEFT JOIN pg_database
                     ON pg_stat_statements.dbid = pg_database.oid
              WHERE query != '<insufficient privilege>'
              AND query NOT LIKE 'EXPLAIN %'
              {filters}
              LIMIT {limit}
        "#
    )
}

/// Zero-row query whose result descriptor lists the view's columns.
pub fn build_columns_query(view: &str) -> String {
    build_statements_query("*", view, "", 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desired_columns_cover_required_ones() {
        let desired = desired_columns();
        for column in REQUIRED_COLUMNS {
            assert!(desired.contains(column), "{column} missing");
        }
        assert!(desired.contains("queryid"));
        assert!(desired.contains("total_exec_time"));
        assert!(!desired.contains("userid"));
    }

    #[test]
    fn statements_query_interpolates_parts() {
        let q = build_statements_query(
            "calls, query",
            "public.pg_stat_statements",
            "AND pg_database.datname = $1",
            500,
        );
        assert!(q.contains("SELECT calls, query"));
        assert!(q.contains("FROM public.pg_stat_statements as pg_stat_statements"));
        assert!(q.contains("AND pg_database.datname = $1"));
        assert!(q.trim_end().ends_with("LIMIT 500"));
    }

    #[test]
    fn columns_query_returns_no_rows() {
        let q = build_columns_query("pg_stat_statements");
        assert!(q.contains("SELECT *"));
        assert!(q.trim_end().ends_with("LIMIT 0"));
    }
}
