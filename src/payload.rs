//! Outbound event shapes: full-query-text events and the metrics payload.

use serde::Serialize;

use crate::models::{Metrics, NormalizedRow};

/// Maximum length (in characters) of query text in the metrics payload.
pub const MAX_QUERY_TEXT_LEN: usize = 200;

pub const EVENT_SOURCE: &str = "postgres";

/// Per-cycle values shared by every event of the cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct EventContext {
    pub host: String,
    pub agent_version: String,
    /// Global tags without `db:` tags.
    pub tags_no_db: Vec<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: f64,
}

/// Full-query-text event: untruncated statement text of one query identity.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FqtEvent {
    pub timestamp: f64,
    pub host: String,
    pub ddagentversion: String,
    pub ddsource: String,
    pub ddtags: String,
    pub dbm_type: String,
    pub db: FqtDb,
    pub postgres: FqtPostgres,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FqtDb {
    pub instance: Option<String>,
    pub query_signature: String,
    pub statement: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FqtPostgres {
    pub datname: Option<String>,
    pub rolname: Option<String>,
}

/// One delta row of the metrics payload.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsRow {
    #[serde(flatten)]
    pub metrics: Metrics,
    pub query: String,
    pub query_signature: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rolname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queryid: Option<i64>,
    pub dd_tables: Option<Vec<String>>,
    pub dd_commands: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsPayload {
    pub host: String,
    pub timestamp: f64,
    pub min_collection_interval: f64,
    pub tags: Vec<String>,
    pub postgres_rows: Vec<MetricsRow>,
    pub postgres_version: String,
    pub ddagentversion: String,
}

/// Builds the full-query-text event for a row. The statement is not truncated.
pub fn fqt_event(row: &NormalizedRow, ctx: &EventContext) -> FqtEvent {
    let mut tags = ctx.tags_no_db.clone();
    if let Some(datname) = &row.row.datname {
        tags.push(format!("db:{datname}"));
    }
    if let Some(rolname) = &row.row.rolname {
        tags.push(format!("rolname:{rolname}"));
    }

    FqtEvent {
        timestamp: ctx.timestamp_ms,
        host: ctx.host.clone(),
        ddagentversion: ctx.agent_version.clone(),
        ddsource: EVENT_SOURCE.to_string(),
        ddtags: tags.join(","),
        dbm_type: "fqt".to_string(),
        db: FqtDb {
            instance: row.row.datname.clone(),
            query_signature: row.query_signature.clone(),
            statement: row.row.query.clone(),
        },
        postgres: FqtPostgres {
            datname: row.row.datname.clone(),
            rolname: row.row.rolname.clone(),
        },
    }
}

/// Flattens a delta row for the metrics payload.
pub fn metrics_row(row: NormalizedRow) -> MetricsRow {
    let dd_tables = row.metadata.parse_tables_csv();
    MetricsRow {
        metrics: row.row.metrics,
        query: truncate_chars(&row.row.query, MAX_QUERY_TEXT_LEN).to_string(),
        query_signature: row.query_signature,
        datname: row.row.datname,
        rolname: row.row.rolname,
        queryid: row.row.queryid,
        dd_tables,
        dd_commands: row.metadata.commands,
    }
}

pub fn metrics_payload(
    rows: Vec<NormalizedRow>,
    ctx: &EventContext,
    collection_interval_secs: f64,
    postgres_version: String,
) -> MetricsPayload {
    MetricsPayload {
        host: ctx.host.clone(),
        timestamp: ctx.timestamp_ms,
        min_collection_interval: collection_interval_secs,
        tags: ctx.tags_no_db.clone(),
        postgres_rows: rows.into_iter().map(metrics_row).collect(),
        postgres_version,
        ddagentversion: ctx.agent_version.clone(),
    }
}

/// `v<major>.<minor>.<patch>`, or an empty string when the version is unknown.
pub fn format_postgres_version(version: Option<(u32, u32, u32)>) -> String {
    match version {
        Some((major, minor, patch)) => format!("v{major}.{minor}.{patch}"),
        None => String::new(),
    }
}

/// Truncates to at most `max` characters without splitting one.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Counter, MetricColumn, QueryMetadata, StatementRow};

    fn ctx() -> EventContext {
        EventContext {
            host: "db-1".to_string(),
            agent_version: "0.1.0".to_string(),
            tags_no_db: vec!["env:prod".to_string()],
            timestamp_ms: 1_700_000_000_000.0,
        }
    }

    fn row(query: &str) -> NormalizedRow {
        let mut metrics = Metrics::new();
        metrics.insert(MetricColumn::Calls, Counter::Int(3));
        metrics.insert(MetricColumn::TotalExecTime, Counter::Float(1.5));
        NormalizedRow {
            row: StatementRow {
                query: query.to_string(),
                datname: Some("app".to_string()),
                rolname: Some("web".to_string()),
                queryid: Some(42),
                metrics,
            },
            query_signature: "abc".to_string(),
            metadata: QueryMetadata {
                tables_csv: "users,orders".to_string(),
                commands: vec!["SELECT".to_string()],
            },
        }
    }

    #[test]
    fn fqt_event_keeps_full_text_and_row_tags() {
        let long = format!("SELECT {} FROM users", "a, ".repeat(200));
        let event = fqt_event(&row(&long), &ctx());

        assert_eq!(event.db.statement, long);
        assert_eq!(event.ddtags, "env:prod,db:app,rolname:web");
        assert_eq!(event.dbm_type, "fqt");
        assert_eq!(event.ddsource, "postgres");
        assert_eq!(event.db.instance.as_deref(), Some("app"));
    }

    #[test]
    fn metrics_row_truncates_and_flattens_metadata() {
        let long = "x".repeat(500);
        let out = metrics_row(row(&long));
        assert_eq!(out.query.chars().count(), MAX_QUERY_TEXT_LEN);

        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["calls"], 3);
        assert_eq!(json["total_exec_time"], 1.5);
        assert_eq!(json["queryid"], 42);
        assert_eq!(json["dd_tables"], serde_json::json!(["users", "orders"]));
        assert_eq!(json["dd_commands"], serde_json::json!(["SELECT"]));
    }

    #[test]
    fn metrics_payload_shape() {
        let payload = metrics_payload(
            vec![row("SELECT ?")],
            &ctx(),
            10.0,
            format_postgres_version(Some((16, 2, 0))),
        );
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["host"], "db-1");
        assert_eq!(json["min_collection_interval"], 10.0);
        assert_eq!(json["tags"], serde_json::json!(["env:prod"]));
        assert_eq!(json["postgres_version"], "v16.2.0");
        assert_eq!(json["ddagentversion"], "0.1.0");
        assert_eq!(json["postgres_rows"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(format_postgres_version(None), "");
    }
}
