//! Query execution seam between the collector and the database driver.

use thiserror::Error;

use crate::models::RawRow;

/// Classified failure of a statistics query.
///
/// The driver adapter classifies errors once; the collector matches on the
/// kind and never inspects error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryErrorKind {
    /// `pg_stat_statements` is not in `shared_preload_libraries`.
    ExtensionNotLoaded,
    /// The extension (or configured view) does not exist in this database.
    ExtensionNotCreated,
    /// Statement timeout or explicit cancellation.
    Canceled,
    /// Syntax error or access rule violation (SQLSTATE class 42).
    Programming,
    /// Any other server-side error.
    Database,
    /// No usable connection.
    Connection,
}

impl QueryErrorKind {
    /// Tag value reported with the statement metrics error counter.
    pub fn error_tag(self) -> &'static str {
        match self {
            QueryErrorKind::ExtensionNotLoaded => {
                "error:database-ObjectNotInPrerequisiteState-pg_stat_statements_not_loaded"
            }
            QueryErrorKind::ExtensionNotCreated => {
                "error:database-UndefinedTable-pg_stat_statements_not_created"
            }
            QueryErrorKind::Canceled => "error:database-QueryCanceled",
            QueryErrorKind::Programming => "error:database-ProgrammingError",
            QueryErrorKind::Database => "error:database-DatabaseError",
            QueryErrorKind::Connection => "error:database-OperationalError",
        }
    }

    /// Whether the cached column list may be the cause and must be rediscovered.
    pub fn invalidates_column_cache(self) -> bool {
        matches!(
            self,
            QueryErrorKind::Canceled
                | QueryErrorKind::Programming
                | QueryErrorKind::ExtensionNotCreated
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub message: String,
}

impl QueryError {
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Rows plus the column names of the result descriptor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<RawRow>,
}

/// Blocking query execution against one database.
pub trait StatementsSource {
    /// Runs `sql` with text parameters bound to `$1..$n`.
    ///
    /// `columns` must be filled even when no row is returned.
    fn query(&mut self, sql: &str, params: &[&str]) -> Result<QueryResult, QueryError>;

    /// Server version as `(major, minor, patch)`, if known.
    fn server_version(&mut self) -> Option<(u32, u32, u32)>;
}

impl<T: StatementsSource + ?Sized> StatementsSource for Box<T> {
    fn query(&mut self, sql: &str, params: &[&str]) -> Result<QueryResult, QueryError> {
        (**self).query(sql, params)
    }

    fn server_version(&mut self) -> Option<(u32, u32, u32)> {
        (**self).server_version()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_invalidation_follows_error_class() {
        assert!(QueryErrorKind::Canceled.invalidates_column_cache());
        assert!(QueryErrorKind::Programming.invalidates_column_cache());
        assert!(QueryErrorKind::ExtensionNotCreated.invalidates_column_cache());
        assert!(!QueryErrorKind::ExtensionNotLoaded.invalidates_column_cache());
        assert!(!QueryErrorKind::Connection.invalidates_column_cache());
        assert!(!QueryErrorKind::Database.invalidates_column_cache());
    }

    #[test]
    fn error_tags_are_distinct() {
        let kinds = [
            QueryErrorKind::ExtensionNotLoaded,
            QueryErrorKind::ExtensionNotCreated,
            QueryErrorKind::Canceled,
            QueryErrorKind::Programming,
            QueryErrorKind::Database,
            QueryErrorKind::Connection,
        ];
        let tags: std::collections::HashSet<_> = kinds.iter().map(|k| k.error_tag()).collect();
        assert_eq!(tags.len(), kinds.len());
        assert!(tags.iter().all(|t| t.starts_with("error:database-")));
    }
}
