use std::collections::VecDeque;

use crate::collector::source::{QueryError, QueryResult, StatementsSource};
use crate::models::{ColumnValue, RawRow};

use super::scenarios::DEFAULT_VIEW_COLUMNS;

/// In-memory [`StatementsSource`] answering the collector's queries.
///
/// Queries are recognized by their text: the `pg_settings` lookup, the
/// `COUNT(*)` query, the `LIMIT 0` column discovery query, and otherwise the statistics
/// query, whose rows are projected to the selected columns and filtered by
/// `$1` when given.
#[derive(Debug, Clone)]
pub struct MockSource {
    pub columns: Vec<String>,
    pub rows: Vec<RawRow>,
    pub statement_count: i64,
    pub max_statements: i64,
    pub version: Option<(u32, u32, u32)>,
    failures: VecDeque<QueryError>,
    targeted: Vec<(String, QueryError)>,
    executed: Vec<String>,
}

impl Default for MockSource {
    fn default() -> Self {
        Self {
            columns: DEFAULT_VIEW_COLUMNS.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
            statement_count: 0,
            max_statements: 5000,
            version: Some((16, 2, 0)),
            failures: VecDeque::new(),
            targeted: Vec::new(),
            executed: Vec::new(),
        }
    }
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_rows(mut self, rows: Vec<RawRow>) -> Self {
        self.set_rows(rows);
        self
    }

    /// Replaces the view contents.
    pub fn set_rows(&mut self, rows: Vec<RawRow>) {
        self.statement_count = rows.len() as i64;
        self.rows = rows;
    }

    /// Makes the next query fail with `error`. Failures queue up.
    pub fn fail_next(&mut self, error: QueryError) {
        self.failures.push_back(error);
    }

    /// Makes the next query whose text contains `needle` fail with `error`.
    pub fn fail_next_matching(&mut self, needle: impl Into<String>, error: QueryError) {
        self.targeted.push((needle.into(), error));
    }

    /// Every query text received so far.
    pub fn executed(&self) -> &[String] {
        &self.executed
    }

    /// Number of column discovery queries received so far.
    pub fn discovery_count(&self) -> usize {
        self.executed.iter().filter(|q| is_column_discovery(q)).count()
    }

    fn statements(&self, sql: &str, params: &[&str]) -> QueryResult {
        let selected = selected_columns(sql);
        let columns: Vec<String> = if selected == ["*"] {
            self.columns.clone()
        } else {
            selected
        };

        let rows = self
            .rows
            .iter()
            .filter(|row| match params.first() {
                Some(dbname) => matches!(row.get("datname"), Some(ColumnValue::Text(d)) if d == dbname),
                None => true,
            })
            .map(|row| {
                let mut projected = RawRow::new();
                for column in &columns {
                    if let Some(value) = row.get(column) {
                        projected.insert(column.clone(), value.clone());
                    }
                }
                projected
            })
            .collect();

        QueryResult { columns, rows }
    }
}

impl StatementsSource for MockSource {
    fn query(&mut self, sql: &str, params: &[&str]) -> Result<QueryResult, QueryError> {
        self.executed.push(sql.to_string());
        if let Some(error) = self.failures.pop_front() {
            return Err(error);
        }
        if let Some(pos) = self.targeted.iter().position(|(needle, _)| sql.contains(needle.as_str())) {
            return Err(self.targeted.remove(pos).1);
        }

        if sql.contains("pg_settings") {
            return Ok(QueryResult {
                columns: vec!["setting".to_string()],
                rows: vec![RawRow::new().with("setting", self.max_statements.to_string())],
            });
        }
        if sql.contains("COUNT(*)") {
            return Ok(QueryResult {
                columns: vec!["count".to_string()],
                rows: vec![RawRow::new().with("count", self.statement_count)],
            });
        }
        if is_column_discovery(sql) {
            return Ok(QueryResult {
                columns: self.columns.clone(),
                rows: Vec::new(),
            });
        }
        Ok(self.statements(sql, params))
    }

    fn server_version(&mut self) -> Option<(u32, u32, u32)> {
        self.version
    }
}

fn is_column_discovery(sql: &str) -> bool {
    sql.trim_end().ends_with("LIMIT 0")
}

/// Column list between `SELECT` and the first `FROM`.
fn selected_columns(sql: &str) -> Vec<String> {
    let Some(start) = sql.find("SELECT") else {
        return Vec::new();
    };
    let rest = &sql[start + "SELECT".len()..];
    let end = rest.find("FROM").unwrap_or(rest.len());
    rest[..end]
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}
