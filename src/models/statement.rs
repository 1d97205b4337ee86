//! Rows of the statistics view, before and after normalization.

use std::collections::HashMap;

use thiserror::Error;

use super::metric::{Counter, MetricColumn, Metrics};

/// A single column value as returned by the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<i64> for ColumnValue {
    fn from(v: i64) -> Self {
        ColumnValue::Int(v)
    }
}

impl From<f64> for ColumnValue {
    fn from(v: f64) -> Self {
        ColumnValue::Float(v)
    }
}

impl From<&str> for ColumnValue {
    fn from(v: &str) -> Self {
        ColumnValue::Text(v.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(v: String) -> Self {
        ColumnValue::Text(v)
    }
}

impl<T: Into<ColumnValue>> From<Option<T>> for ColumnValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(ColumnValue::Null, Into::into)
    }
}

/// One record of the statistics view: column name to value.
///
/// The set of columns depends on the server and extension version, so every
/// access goes through [`RawRow::get`] and handles absence explicitly.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRow {
    values: HashMap<String, ColumnValue>,
}

impl RawRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<ColumnValue>) {
        self.values.insert(column.into(), value.into());
    }

    /// Builder-style [`RawRow::insert`].
    pub fn with(mut self, column: impl Into<String>, value: impl Into<ColumnValue>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn get(&self, column: &str) -> Option<&ColumnValue> {
        self.values.get(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn text(&self, column: &str) -> Option<String> {
        match self.get(column) {
            Some(ColumnValue::Text(s)) => Some(s.clone()),
            _ => None,
        }
    }
}

/// Error converting a [`RawRow`] into a [`StatementRow`].
#[derive(Debug, Error, PartialEq)]
pub enum RowError {
    #[error("row has no query text")]
    MissingQuery,
}

/// Typed statistics row. Optional columns carry explicit presence.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementRow {
    pub query: String,
    pub datname: Option<String>,
    pub rolname: Option<String>,
    pub queryid: Option<i64>,
    pub metrics: Metrics,
}

impl StatementRow {
    pub fn from_raw(raw: &RawRow) -> Result<Self, RowError> {
        let query = raw.text("query").ok_or(RowError::MissingQuery)?;
        let queryid = match raw.get("queryid") {
            Some(ColumnValue::Int(v)) => Some(*v),
            _ => None,
        };

        let mut metrics = Metrics::new();
        for column in MetricColumn::ALL {
            match raw.get(column.name()) {
                Some(ColumnValue::Int(v)) => {
                    metrics.insert(column, Counter::Int(*v));
                }
                Some(ColumnValue::Float(v)) => {
                    metrics.insert(column, Counter::Float(*v));
                }
                _ => {}
            }
        }

        Ok(Self {
            query,
            datname: raw.text("datname"),
            rolname: raw.text("rolname"),
            queryid,
            metrics,
        })
    }
}

/// Parsed metadata returned by the obfuscator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryMetadata {
    /// Comma-separated table names referenced by the statement.
    pub tables_csv: String,
    /// Statement commands, e.g. `SELECT`, `UPDATE`.
    pub commands: Vec<String>,
}

impl QueryMetadata {
    /// Splits [`QueryMetadata::tables_csv`]. Returns `None` when no table was found.
    pub fn parse_tables_csv(&self) -> Option<Vec<String>> {
        let tables: Vec<String> = self
            .tables_csv
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        (!tables.is_empty()).then_some(tables)
    }
}

/// Key of a logical query in a given context across collection cycles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowIdentity {
    pub query_signature: String,
    pub datname: Option<String>,
    pub rolname: Option<String>,
}

/// Statistics row with obfuscated text, signature and parsed metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRow {
    /// `row.query` holds the obfuscated text.
    pub row: StatementRow,
    pub query_signature: String,
    pub metadata: QueryMetadata,
}

impl NormalizedRow {
    pub fn identity(&self) -> RowIdentity {
        RowIdentity {
            query_signature: self.query_signature.clone(),
            datname: self.row.datname.clone(),
            rolname: self.row.rolname.clone(),
        }
    }
}
