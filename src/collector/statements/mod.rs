//! `pg_stat_statements` metrics job.
//!
//! One cycle discovers the view's columns, fetches the cumulative counters,
//! obfuscates and fingerprints the statements, turns counters into deltas,
//! samples full query text, and hands both payloads to an [`EventSink`].
//! Query failures are classified, counted and end the cycle without a payload;
//! the next cycle starts over.

mod columns;
mod normalize;
pub(crate) mod queries;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::config::{ConfigError, StatementMetricsConfig};
use crate::deltas::StatementMetrics;
use crate::diagnostics::DiagnosticSink;
use crate::models::{ColumnValue, MetricColumn, NormalizedRow, RawRow, RowIdentity};
use crate::obfuscate::Obfuscator;
use crate::payload::{EventContext, format_postgres_version, metrics_payload};
use crate::sampler::FullTextSampler;
use crate::sink::{EventSink, SinkError};

use super::source::{QueryError, QueryResult, StatementsSource};

pub use columns::StatColumnCache;
pub use normalize::normalize_queries;
pub use queries::{REQUIRED_COLUMNS, build_columns_query, build_statements_query};

pub const ERROR_METRIC: &str = "dd.postgres.statement_metrics.error";
pub const MISSING_COLUMNS_TAG: &str =
    "error:database-missing_pg_stat_statements_required_columns";
pub const QUERY_ROWS_RAW_METRIC: &str = "dd.postgres.queries.query_rows_raw";
pub const STATEMENTS_COUNT_METRIC: &str = "postgresql.pg_stat_statements.count";
pub const STATEMENTS_MAX_METRIC: &str = "postgresql.pg_stat_statements.max";

const DBSTRICT_FILTER: &str = "AND pg_database.datname = $1";

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("failed to emit payload: {0}")]
    Sink(#[from] SinkError),
}

/// Result of one collection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A metrics payload with `rows` delta rows was sent, preceded by
    /// `fqt_events` full-query-text events.
    Emitted { rows: usize, fqt_events: usize },
    /// Nothing to report: query failure, missing columns, or no deltas yet.
    NoRows,
    /// The shutdown flag was set before the cycle finished.
    Cancelled,
    /// An error aborted the cycle after deltas were computed.
    Failed,
}

/// Periodic statement metrics collection for one database connection.
pub struct StatementMetricsJob<S, O> {
    source: S,
    obfuscator: O,
    config: StatementMetricsConfig,
    obfuscator_options: String,
    column_cache: StatColumnCache,
    state: StatementMetrics<RowIdentity>,
    full_text: FullTextSampler,
    running: Arc<AtomicBool>,
}

impl<S: StatementsSource, O: Obfuscator> StatementMetricsJob<S, O> {
    pub fn new(source: S, obfuscator: O, config: StatementMetricsConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let full_text = FullTextSampler::new(
            config.full_statement_text_cache_max_size,
            config.full_statement_text_ttl(),
        );
        Ok(Self {
            source,
            obfuscator,
            obfuscator_options: config.obfuscator_options_json(),
            config,
            column_cache: StatColumnCache::new(),
            state: StatementMetrics::new(),
            full_text,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Shares a shutdown flag; the job stops between stages once it is `false`.
    pub fn with_shutdown_flag(mut self, running: Arc<AtomicBool>) -> Self {
        self.running = running;
        self
    }

    pub fn config(&self) -> &StatementMetricsConfig {
        &self.config
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Number of query identities with a stored baseline.
    pub fn tracked_identities(&self) -> usize {
        self.state.len()
    }

    /// Runs one cycle. Never fails: errors are logged and reported as
    /// [`CycleOutcome::Failed`].
    pub fn run_cycle(
        &mut self,
        diag: &mut dyn DiagnosticSink,
        events: &mut dyn EventSink,
    ) -> CycleOutcome {
        match self.collect(diag, events) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    database = %self.config.dbname,
                    error = %e,
                    "statement metrics cycle failed"
                );
                CycleOutcome::Failed
            }
        }
    }

    fn collect(
        &mut self,
        diag: &mut dyn DiagnosticSink,
        events: &mut dyn EventSink,
    ) -> Result<CycleOutcome, CollectError> {
        if !self.is_running() {
            return Ok(CycleOutcome::Cancelled);
        }

        let raw = self.load_pg_stat_statements(diag);
        if raw.is_empty() {
            return Ok(CycleOutcome::NoRows);
        }
        self.emit_pg_stat_statements_metrics(diag);

        if !self.is_running() {
            return Ok(CycleOutcome::Cancelled);
        }

        let rows = self.collect_metrics_rows(&raw, diag);
        if rows.is_empty() {
            return Ok(CycleOutcome::NoRows);
        }

        let ctx = EventContext {
            host: self.config.host.clone(),
            agent_version: self.config.agent_version.clone(),
            tags_no_db: self.config.tags_no_db(),
            timestamp_ms: chrono::Utc::now().timestamp_millis() as f64,
        };

        let mut fqt_events = 0;
        for event in self.full_text.sample(&rows, &ctx, Instant::now()) {
            events.query_sample(&event)?;
            fqt_events += 1;
        }

        let row_count = rows.len();
        let payload = metrics_payload(
            rows,
            &ctx,
            self.config.collection_interval().as_secs_f64(),
            format_postgres_version(self.source.server_version()),
        );
        events.query_metrics(&payload)?;

        debug!(rows = row_count, fqt_events, "statement metrics emitted");
        Ok(CycleOutcome::Emitted {
            rows: row_count,
            fqt_events,
        })
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Normalized delta rows of this cycle.
    fn collect_metrics_rows(
        &mut self,
        raw: &[RawRow],
        diag: &mut dyn DiagnosticSink,
    ) -> Vec<NormalizedRow> {
        let rows = normalize_queries(raw, &self.obfuscator, &self.obfuscator_options);
        let Some(first) = rows.first() else {
            return Vec::new();
        };
        let metric_columns: BTreeSet<MetricColumn> = first.row.metrics.keys().copied().collect();

        let rows = self
            .state
            .compute_deltas(rows, &metric_columns, NormalizedRow::identity);
        diag.gauge(QUERY_ROWS_RAW_METRIC, rows.len() as f64, &self.config.tags);
        rows
    }

    /// Raw statistics rows, or nothing when the view cannot be queried.
    fn load_pg_stat_statements(&mut self, diag: &mut dyn DiagnosticSink) -> Vec<RawRow> {
        let available = match self.stat_columns() {
            Ok(columns) => columns,
            Err(e) => {
                self.query_failed(diag, &e);
                return Vec::new();
            }
        };

        let missing: Vec<&str> = REQUIRED_COLUMNS
            .iter()
            .copied()
            .filter(|c| !available.contains(*c))
            .collect();
        if !missing.is_empty() {
            warn!(
                view = %self.config.pg_stat_statements_view,
                missing = %missing.join(", "),
                "unable to collect statement metrics because required columns are missing"
            );
            diag.count(ERROR_METRIC, 1.0, &self.error_tags(MISSING_COLUMNS_TAG));
            return Vec::new();
        }

        let desired = queries::desired_columns();
        let columns: Vec<&str> = available
            .iter()
            .map(String::as_str)
            .filter(|c| desired.contains(*c))
            .collect();

        let (filters, params) = if self.config.dbstrict {
            (DBSTRICT_FILTER, vec![self.config.dbname.clone()])
        } else {
            ("", Vec::new())
        };
        let sql = build_statements_query(
            &columns.join(", "),
            &self.config.pg_stat_statements_view,
            filters,
            self.config.statements_limit,
        );
        let params: Vec<&str> = params.iter().map(String::as_str).collect();

        match self.execute(&sql, &params) {
            Ok(result) => result.rows,
            Err(e) => {
                self.query_failed(diag, &e);
                Vec::new()
            }
        }
    }

    /// Columns of the statistics view, discovered once and cached.
    fn stat_columns(&mut self) -> Result<BTreeSet<String>, QueryError> {
        if let Some(columns) = self.column_cache.get() {
            return Ok(columns.clone());
        }

        let sql = build_columns_query(&self.config.pg_stat_statements_view);
        let result = self.execute(&sql, &[])?;
        let columns: BTreeSet<String> = result.columns.into_iter().collect();
        debug!(count = columns.len(), "discovered statistics view columns");
        self.column_cache.set(columns.iter().cloned());
        Ok(columns)
    }

    /// Runs a statistics query, dropping the cached column list on errors that
    /// may be caused by a stale one.
    fn execute(&mut self, sql: &str, params: &[&str]) -> Result<QueryResult, QueryError> {
        let result = self.source.query(sql, params);
        if let Err(e) = &result
            && e.kind.invalidates_column_cache()
        {
            debug!(kind = ?e.kind, "invalidating statistics view column cache");
            self.column_cache.invalidate();
        }
        result
    }

    fn query_failed(&self, diag: &mut dyn DiagnosticSink, e: &QueryError) {
        warn!(
            database = %self.config.dbname,
            kind = ?e.kind,
            error = %e,
            "unable to collect statement metrics"
        );
        diag.count(ERROR_METRIC, 1.0, &self.error_tags(e.kind.error_tag()));
    }

    fn error_tags(&self, tag: &str) -> Vec<String> {
        let mut tags = self.config.tags.clone();
        tags.push(tag.to_string());
        tags
    }

    /// Extension occupancy: current statement count and `pg_stat_statements.max`.
    fn emit_pg_stat_statements_metrics(&mut self, diag: &mut dyn DiagnosticSink) {
        let count_query = match self.source.server_version() {
            Some(version) if version < (9, 4, 0) => queries::COUNT_QUERY_LT_9_4,
            _ => queries::COUNT_QUERY,
        };

        for (metric, sql, column) in [
            (STATEMENTS_COUNT_METRIC, count_query, "count"),
            (STATEMENTS_MAX_METRIC, queries::MAX_SETTING_QUERY, "setting"),
        ] {
            match self.execute(sql, &[]) {
                Ok(result) => match first_number(&result, column) {
                    Some(value) => diag.count(metric, value, &self.config.tags),
                    None => warn!(metric, "query returned no usable value"),
                },
                Err(e) => warn!(metric, error = %e, "failed to read pg_stat_statements capacity"),
            }
        }
    }
}

/// Numeric value of `column` in the first row, parsing text settings.
fn first_number(result: &QueryResult, column: &str) -> Option<f64> {
    match result.rows.first()?.get(column)? {
        ColumnValue::Int(v) => Some(*v as f64),
        ColumnValue::Float(v) => Some(*v),
        ColumnValue::Text(v) => v.trim().parse().ok(),
        ColumnValue::Null => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::{MockSource, statement};
    use crate::collector::source::QueryErrorKind;
    use crate::diagnostics::MemorySink;
    use crate::models::Counter;
    use crate::obfuscate::LiteralObfuscator;
    use crate::sink::MemoryEventSink;

    type Job = StatementMetricsJob<MockSource, LiteralObfuscator>;

    fn job(source: MockSource) -> Job {
        let config = StatementMetricsConfig {
            host: "db-1".to_string(),
            tags: vec!["env:test".to_string(), "db:ignored".to_string()],
            ..Default::default()
        };
        StatementMetricsJob::new(source, LiteralObfuscator::new(), config).unwrap()
    }

    fn cycle(job: &mut Job) -> (CycleOutcome, MemorySink, MemoryEventSink) {
        let mut diag = MemorySink::new();
        let mut events = MemoryEventSink::new();
        let outcome = job.run_cycle(&mut diag, &mut events);
        (outcome, diag, events)
    }

    fn error_tags(diag: &MemorySink) -> Vec<String> {
        diag.named(ERROR_METRIC)
            .flat_map(|s| s.tags.iter().filter(|t| t.starts_with("error:")).cloned())
            .collect()
    }

    #[test]
    fn first_cycle_only_records_baselines() {
        let source = MockSource::new().with_rows(vec![statement("SELECT 1", "app", "web", 5, 5)]);
        let mut job = job(source);

        let (outcome, diag, events) = cycle(&mut job);
        assert_eq!(outcome, CycleOutcome::NoRows);
        assert!(events.metrics.is_empty());
        assert!(events.samples.is_empty());
        assert_eq!(diag.last(QUERY_ROWS_RAW_METRIC), Some(0.0));
        assert_eq!(job.tracked_identities(), 1);
    }

    #[test]
    fn increasing_counters_emit_deltas_and_one_fqt_event() {
        let mut source = MockSource::new();
        source.set_rows(vec![statement("SELECT * FROM users WHERE id = 1", "app", "web", 5, 5)]);
        let mut job = job(source);
        cycle(&mut job);

        job.source_mut()
            .set_rows(vec![statement("SELECT * FROM users WHERE id = 1", "app", "web", 8, 9)]);
        let (outcome, diag, events) = cycle(&mut job);

        assert_eq!(outcome, CycleOutcome::Emitted { rows: 1, fqt_events: 1 });
        let payload = &events.metrics[0];
        let row = &payload.postgres_rows[0];
        assert_eq!(row.metrics[&MetricColumn::Calls], Counter::Int(3));
        assert_eq!(row.metrics[&MetricColumn::Rows], Counter::Int(4));
        assert_eq!(row.query, "SELECT * FROM users WHERE id = ?");
        assert_eq!(row.dd_tables, Some(vec!["users".to_string()]));
        assert_eq!(payload.tags, vec!["env:test".to_string()]);
        assert_eq!(payload.postgres_version, "v16.2.0");
        assert_eq!(payload.min_collection_interval, 10.0);
        assert_eq!(diag.last(QUERY_ROWS_RAW_METRIC), Some(1.0));

        let event = &events.samples[0];
        assert_eq!(event.db.statement, "SELECT * FROM users WHERE id = ?");
        assert_eq!(event.ddtags, "env:test,db:app,rolname:web");

        // Same identity within the TTL: metrics again, no second FQT event.
        job.source_mut()
            .set_rows(vec![statement("SELECT * FROM users WHERE id = 2", "app", "web", 10, 9)]);
        let (outcome, _, events) = cycle(&mut job);
        assert_eq!(outcome, CycleOutcome::Emitted { rows: 1, fqt_events: 0 });
        assert!(events.samples.is_empty());
    }

    #[test]
    fn counter_reset_emits_new_absolute_values() {
        let mut job = job(MockSource::new().with_rows(vec![statement("SELECT 1", "app", "web", 8, 8)]));
        cycle(&mut job);

        job.source_mut()
            .set_rows(vec![statement("SELECT 1", "app", "web", 2, 2)]);
        let (outcome, _, events) = cycle(&mut job);

        assert_eq!(outcome, CycleOutcome::Emitted { rows: 1, fqt_events: 1 });
        let row = &events.metrics[0].postgres_rows[0];
        assert_eq!(row.metrics[&MetricColumn::Calls], Counter::Int(2));
        assert_eq!(row.metrics[&MetricColumn::Rows], Counter::Int(2));
    }

    #[test]
    fn missing_required_column_counts_once_and_stops() {
        let source = MockSource::new()
            .with_columns(["query", "calls", "datname", "rolname"])
            .with_rows(vec![statement("SELECT 1", "app", "web", 5, 5)]);
        let mut job = job(source);

        let (outcome, diag, events) = cycle(&mut job);
        assert_eq!(outcome, CycleOutcome::NoRows);
        assert!(events.metrics.is_empty());
        assert_eq!(error_tags(&diag), vec![MISSING_COLUMNS_TAG.to_string()]);
        // Only column discovery ran.
        assert_eq!(job.source().executed().len(), 1);
    }

    #[test]
    fn extension_not_loaded_keeps_column_cache() {
        let mut job = job(MockSource::new().with_rows(vec![statement("SELECT 1", "app", "web", 1, 1)]));
        cycle(&mut job);
        assert_eq!(job.source().discovery_count(), 1);

        job.source_mut().fail_next(QueryError::new(
            QueryErrorKind::ExtensionNotLoaded,
            "pg_stat_statements must be loaded via shared_preload_libraries",
        ));
        let (outcome, diag, _) = cycle(&mut job);
        assert_eq!(outcome, CycleOutcome::NoRows);
        assert_eq!(
            error_tags(&diag),
            vec![QueryErrorKind::ExtensionNotLoaded.error_tag().to_string()]
        );

        cycle(&mut job);
        assert_eq!(job.source().discovery_count(), 1);
    }

    #[test]
    fn programming_error_forces_column_rediscovery() {
        let mut job = job(MockSource::new().with_rows(vec![statement("SELECT 1", "app", "web", 1, 1)]));
        cycle(&mut job);

        job.source_mut().fail_next(QueryError::new(
            QueryErrorKind::Programming,
            "column \"total_exec_time\" does not exist",
        ));
        let (_, diag, _) = cycle(&mut job);
        assert_eq!(
            error_tags(&diag),
            vec![QueryErrorKind::Programming.error_tag().to_string()]
        );

        cycle(&mut job);
        assert_eq!(job.source().discovery_count(), 2);
    }

    #[test]
    fn capacity_query_error_forces_column_rediscovery() {
        let mut job = job(MockSource::new().with_rows(vec![statement("SELECT 1", "app", "web", 1, 1)]));
        cycle(&mut job);

        job.source_mut().fail_next_matching(
            "COUNT(*)",
            QueryError::new(QueryErrorKind::Programming, "relation \"pg_database\" does not exist"),
        );
        let (_, diag, _) = cycle(&mut job);
        assert_eq!(diag.named(STATEMENTS_COUNT_METRIC).count(), 0);
        assert_eq!(diag.named(STATEMENTS_MAX_METRIC).count(), 1);
        assert_eq!(job.source().discovery_count(), 1);

        cycle(&mut job);
        assert_eq!(job.source().discovery_count(), 2);
    }

    #[test]
    fn obfuscation_failure_drops_only_that_row() {
        let rows = |calls| {
            vec![
                statement("SELECT 1", "app", "web", calls, 1),
                statement("SELECT 'broken", "app", "web", calls, 1),
                statement("UPDATE t SET a = 1", "app", "web", calls, 1),
            ]
        };
        let mut job = job(MockSource::new().with_rows(rows(1)));
        cycle(&mut job);
        assert_eq!(job.tracked_identities(), 2);

        job.source_mut().set_rows(rows(2));
        let (outcome, _, _) = cycle(&mut job);
        assert_eq!(outcome, CycleOutcome::Emitted { rows: 2, fqt_events: 2 });
    }

    #[test]
    fn capacity_counts_follow_successful_fetch() {
        let mut source = MockSource::new().with_rows(vec![statement("SELECT 1", "app", "web", 1, 1)]);
        source.max_statements = 5000;
        let mut job = job(source);

        let (_, diag, _) = cycle(&mut job);
        assert_eq!(diag.last(STATEMENTS_COUNT_METRIC), Some(1.0));
        assert_eq!(diag.last(STATEMENTS_MAX_METRIC), Some(5000.0));
        assert!(
            job.source()
                .executed()
                .iter()
                .any(|q| q == queries::COUNT_QUERY)
        );
    }

    #[test]
    fn old_servers_use_plain_count_query() {
        let mut source = MockSource::new().with_rows(vec![statement("SELECT 1", "app", "web", 1, 1)]);
        source.version = Some((9, 3, 25));
        let mut job = job(source);
        cycle(&mut job);

        assert!(
            job.source()
                .executed()
                .iter()
                .any(|q| q == queries::COUNT_QUERY_LT_9_4)
        );
    }

    #[test]
    fn dbstrict_filters_by_configured_database() {
        let source = MockSource::new().with_rows(vec![
            statement("SELECT 1", "app", "web", 1, 1),
            statement("SELECT 2", "other", "web", 1, 1),
        ]);
        let config = StatementMetricsConfig {
            dbname: "app".to_string(),
            dbstrict: true,
            ..Default::default()
        };
        let mut job = StatementMetricsJob::new(source, LiteralObfuscator::new(), config).unwrap();
        cycle(&mut job);

        assert_eq!(job.tracked_identities(), 1);
        assert!(
            job.source()
                .executed()
                .iter()
                .any(|q| q.contains(DBSTRICT_FILTER))
        );
    }

    #[test]
    fn cleared_shutdown_flag_cancels_cycle() {
        let running = Arc::new(AtomicBool::new(false));
        let mut job = job(MockSource::new().with_rows(vec![statement("SELECT 1", "app", "web", 1, 1)]))
            .with_shutdown_flag(running.clone());

        let (outcome, _, _) = cycle(&mut job);
        assert_eq!(outcome, CycleOutcome::Cancelled);
        assert!(job.source().executed().is_empty());

        running.store(true, Ordering::SeqCst);
        let (outcome, _, _) = cycle(&mut job);
        assert_eq!(outcome, CycleOutcome::NoRows);
    }

    #[test]
    fn sink_failure_fails_cycle_and_next_cycle_recovers() {
        let mut job = job(MockSource::new().with_rows(vec![statement("SELECT 1", "app", "web", 1, 1)]));
        cycle(&mut job);

        job.source_mut()
            .set_rows(vec![statement("SELECT 1", "app", "web", 2, 2)]);
        let mut diag = MemorySink::new();
        let mut broken = MemoryEventSink::new();
        broken.fail_with = Some(std::io::ErrorKind::BrokenPipe);
        assert_eq!(job.run_cycle(&mut diag, &mut broken), CycleOutcome::Failed);

        job.source_mut()
            .set_rows(vec![statement("SELECT 1", "app", "web", 3, 3)]);
        let (outcome, _, events) = cycle(&mut job);
        assert_eq!(outcome, CycleOutcome::Emitted { rows: 1, fqt_events: 0 });
        assert_eq!(
            events.metrics[0].postgres_rows[0].metrics[&MetricColumn::Calls],
            Counter::Int(1)
        );
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = StatementMetricsConfig {
            full_statement_text_samples_per_hour_per_query: 0.0,
            ..Default::default()
        };
        assert!(StatementMetricsJob::new(MockSource::new(), LiteralObfuscator::new(), config).is_err());
    }
}
