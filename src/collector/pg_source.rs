//! [`StatementsSource`] backed by the synchronous `postgres` client.

use native_tls::TlsConnector;
use postgres::error::SqlState;
use postgres::types::{ToSql, Type};
use postgres::{Client, NoTls, Row};
use postgres_native_tls::MakeTlsConnector;
use tracing::{debug, info};

use super::source::{QueryError, QueryErrorKind, QueryResult, StatementsSource};
use crate::config::ConfigError;
use crate::models::{ColumnValue, RawRow};

/// PostgreSQL connection used by one collection worker.
///
/// Connects lazily and reconnects on the next query after a connection
/// failure. Connection parameters follow libpq environment variables:
/// - PGHOST (default: localhost)
/// - PGPORT (default: 5432)
/// - PGUSER (default: $USER)
/// - PGPASSWORD (default: empty)
/// - PGDATABASE (default: same as PGUSER)
pub struct PgSource {
    connection_string: String,
    database: String,
    tls: bool,
    client: Option<Client>,
    server_version: Option<(u32, u32, u32)>,
    last_error: Option<String>,
}

impl PgSource {
    /// Creates a source from environment variables.
    ///
    /// Uses $USER as default if PGUSER is not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let user = std::env::var("PGUSER")
            .or_else(|_| std::env::var("USER"))
            .map_err(|_| ConfigError::EnvNotSet("PGUSER or USER".to_string()))?;

        let host = std::env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string());
        let port = std::env::var("PGPORT").unwrap_or_else(|_| "5432".to_string());
        let password = std::env::var("PGPASSWORD").unwrap_or_default();
        let database = std::env::var("PGDATABASE").unwrap_or_else(|_| user.clone());

        let connection_string = if password.is_empty() {
            format!("host={host} port={port} user={user} dbname={database}")
        } else {
            format!(
                "host={host} port={port} user={user} password={password} dbname={database}"
            )
        };

        Ok(Self::with_connection_string(connection_string, database))
    }

    pub fn with_connection_string(connection_string: String, database: String) -> Self {
        Self {
            connection_string,
            database,
            tls: false,
            client: None,
            server_version: None,
            last_error: None,
        }
    }

    /// Negotiates TLS through the platform TLS library.
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Same connection parameters, different database.
    pub fn for_database(&self, database: &str) -> Self {
        Self {
            connection_string: replace_dbname(&self.connection_string, database),
            database: database.to_string(),
            tls: self.tls,
            client: None,
            server_version: None,
            last_error: None,
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn try_connect(&mut self) -> Result<(), QueryError> {
        self.ensure_connected()
    }

    fn ensure_connected(&mut self) -> Result<(), QueryError> {
        if self.client.is_some() {
            return Ok(());
        }

        let mut client = match self.connect() {
            Ok(client) => client,
            Err(e) => {
                self.last_error = Some(e.message.clone());
                self.server_version = None;
                return Err(e);
            }
        };

        // Determine server version once per (re)connect.
        self.server_version = client
            .query_one("SHOW server_version_num", &[])
            .ok()
            .and_then(|row| row.try_get::<_, String>(0).ok())
            .and_then(|v| v.parse::<i32>().ok())
            .map(parse_server_version_num);
        info!(
            database = %self.database,
            version = ?self.server_version,
            "connected to PostgreSQL"
        );

        self.client = Some(client);
        self.last_error = None;
        Ok(())
    }

    fn connect(&self) -> Result<Client, QueryError> {
        let result = if self.tls {
            let connector = TlsConnector::builder().build().map_err(|e| {
                QueryError::new(QueryErrorKind::Connection, format!("TLS setup failed: {e}"))
            })?;
            Client::connect(&self.connection_string, MakeTlsConnector::new(connector))
        } else {
            Client::connect(&self.connection_string, NoTls)
        };
        result.map_err(|e| QueryError::new(QueryErrorKind::Connection, format_postgres_error(&e)))
    }
}

impl StatementsSource for PgSource {
    fn query(&mut self, sql: &str, params: &[&str]) -> Result<QueryResult, QueryError> {
        self.ensure_connected()?;
        let Some(client) = self.client.as_mut() else {
            return Err(QueryError::new(QueryErrorKind::Connection, "not connected"));
        };

        match run_query(client, sql, params) {
            Ok(result) => Ok(result),
            Err(e) => {
                let err = classify_error(&e);
                if err.kind == QueryErrorKind::Connection || e.is_closed() {
                    debug!(error = %err, "dropping PostgreSQL connection");
                    self.client = None;
                    self.server_version = None;
                }
                self.last_error = Some(err.message.clone());
                Err(err)
            }
        }
    }

    fn server_version(&mut self) -> Option<(u32, u32, u32)> {
        self.ensure_connected().ok()?;
        self.server_version
    }
}

fn run_query(
    client: &mut Client,
    sql: &str,
    params: &[&str],
) -> Result<QueryResult, postgres::Error> {
    let params: Vec<&(dyn ToSql + Sync)> = params
        .iter()
        .map(|p| p as &(dyn ToSql + Sync))
        .collect();
    let statement = client.prepare(sql)?;
    let columns: Vec<String> = statement
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    let rows = client
        .query(&statement, &params)?
        .iter()
        .map(raw_row)
        .collect();

    Ok(QueryResult { columns, rows })
}

fn raw_row(row: &Row) -> RawRow {
    let mut raw = RawRow::new();
    for (idx, column) in row.columns().iter().enumerate() {
        raw.insert(column.name(), column_value(row, idx, column.type_()));
    }
    raw
}

/// Converts a column to [`ColumnValue`]. Unsupported types become `Null`.
fn column_value(row: &Row, idx: usize, ty: &Type) -> ColumnValue {
    let value = if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx).map(ColumnValue::from)
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx)
            .map(|v| ColumnValue::from(v.map(i64::from)))
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx)
            .map(|v| ColumnValue::from(v.map(i64::from)))
    } else if *ty == Type::OID {
        row.try_get::<_, Option<u32>>(idx)
            .map(|v| ColumnValue::from(v.map(i64::from)))
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(idx).map(ColumnValue::from)
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(idx)
            .map(|v| ColumnValue::from(v.map(f64::from)))
    } else if [Type::TEXT, Type::VARCHAR, Type::NAME, Type::BPCHAR].contains(ty) {
        row.try_get::<_, Option<String>>(idx).map(ColumnValue::from)
    } else {
        return ColumnValue::Null;
    };
    value.unwrap_or(ColumnValue::Null)
}

fn classify_error(e: &postgres::Error) -> QueryError {
    classify(e.code(), format_postgres_error(e))
}

/// Maps an SQLSTATE and message to a [`QueryErrorKind`]. Errors without a
/// SQLSTATE never reached the server and count as connection failures.
fn classify(code: Option<&SqlState>, message: String) -> QueryError {
    let Some(code) = code else {
        return QueryError::new(QueryErrorKind::Connection, message);
    };

    let kind = if *code == SqlState::OBJECT_NOT_IN_PREREQUISITE_STATE
        && message.contains("pg_stat_statements must be loaded")
    {
        QueryErrorKind::ExtensionNotLoaded
    } else if *code == SqlState::UNDEFINED_TABLE && message.contains("pg_stat_statements") {
        QueryErrorKind::ExtensionNotCreated
    } else if *code == SqlState::QUERY_CANCELED {
        QueryErrorKind::Canceled
    } else if code.code().starts_with("42") {
        QueryErrorKind::Programming
    } else if code.code().starts_with("08") || code.code().starts_with("57P") {
        QueryErrorKind::Connection
    } else {
        QueryErrorKind::Database
    };
    QueryError::new(kind, message)
}

/// `server_version_num` to `(major, minor, patch)`.
///
/// Since PG 10 the number is `major * 10000 + minor`; before that it was
/// `major * 10000 + minor * 100 + patch` with a two-part major version.
pub fn parse_server_version_num(num: i32) -> (u32, u32, u32) {
    let num = num.max(0) as u32;
    if num >= 100_000 {
        (num / 10_000, num % 10_000, 0)
    } else {
        (num / 10_000, (num / 100) % 100, num % 100)
    }
}

/// Replaces the `dbname=xxx` parameter in a libpq-style connection string.
///
/// If the connection string contains `dbname=...`, it is replaced with the new database name.
/// If it does not contain `dbname=`, the parameter is appended.
fn replace_dbname(connection_string: &str, new_db: &str) -> String {
    let mut found = false;
    let parts: Vec<String> = connection_string
        .split_whitespace()
        .map(|token| {
            if token.starts_with("dbname=") {
                found = true;
                format!("dbname={new_db}")
            } else {
                token.to_string()
            }
        })
        .collect();

    if found {
        parts.join(" ")
    } else {
        format!("{connection_string} dbname={new_db}")
    }
}

/// Formats PostgreSQL error message for display.
pub(crate) fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        format!("{}: {}", db_error.severity(), db_error.message())
    } else {
        let msg = e.to_string();
        if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else if msg.contains("password authentication failed") {
            "password authentication failed".to_string()
        } else {
            msg
        }
    }
}
