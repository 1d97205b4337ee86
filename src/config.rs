//! Statement metrics collection settings.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_COLLECTION_INTERVAL: f64 = 10.0;
pub const DEFAULT_STATEMENTS_LIMIT: u32 = 10_000;
pub const DEFAULT_PG_STAT_STATEMENTS_VIEW: &str = "pg_stat_statements";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} not set")]
    EnvNotSet(String),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Settings of one statement metrics worker.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct StatementMetricsConfig {
    /// Seconds between cycles. Non-positive values fall back to the default.
    pub collection_interval: f64,
    /// View (optionally schema-qualified) exposing `pg_stat_statements` columns.
    pub pg_stat_statements_view: String,
    /// Database the worker connects to.
    pub dbname: String,
    /// Only collect statements executed in `dbname`.
    pub dbstrict: bool,
    pub statements_limit: u32,
    pub full_statement_text_cache_max_size: usize,
    pub full_statement_text_samples_per_hour_per_query: f64,
    /// Passed verbatim (as JSON) to the obfuscator.
    pub obfuscator_options: serde_json::Value,
    /// Global tags, `key:value`.
    pub tags: Vec<String>,
    /// Reported host name.
    pub host: String,
    /// Reported collector version.
    pub agent_version: String,
}

impl Default for StatementMetricsConfig {
    fn default() -> Self {
        Self {
            collection_interval: DEFAULT_COLLECTION_INTERVAL,
            pg_stat_statements_view: DEFAULT_PG_STAT_STATEMENTS_VIEW.to_string(),
            dbname: "postgres".to_string(),
            dbstrict: false,
            statements_limit: DEFAULT_STATEMENTS_LIMIT,
            full_statement_text_cache_max_size: 10_000,
            full_statement_text_samples_per_hour_per_query: 1.0,
            obfuscator_options: serde_json::Value::Object(serde_json::Map::new()),
            tags: Vec::new(),
            host: String::new(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl StatementMetricsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rate = self.full_statement_text_samples_per_hour_per_query;
        if !(rate.is_finite() && rate > 0.0) {
            return Err(ConfigError::Invalid {
                field: "full_statement_text_samples_per_hour_per_query",
                reason: format!("must be a positive number, got {rate}"),
            });
        }
        if Duration::try_from_secs_f64(3600.0 / rate).is_err() {
            return Err(ConfigError::Invalid {
                field: "full_statement_text_samples_per_hour_per_query",
                reason: format!("{rate} gives an expiry too long to represent"),
            });
        }
        let interval = self.collection_interval;
        let out_of_range = interval > 0.0 && Duration::try_from_secs_f64(interval).is_err();
        if interval.is_nan() || out_of_range {
            return Err(ConfigError::Invalid {
                field: "collection_interval",
                reason: format!("{interval} seconds is out of range"),
            });
        }
        if self.full_statement_text_cache_max_size == 0 {
            return Err(ConfigError::Invalid {
                field: "full_statement_text_cache_max_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.statements_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "statements_limit",
                reason: "must be greater than zero".to_string(),
            });
        }
        // The view name is interpolated into SQL.
        let view = &self.pg_stat_statements_view;
        let valid_view = !view.is_empty()
            && view
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
        if !valid_view {
            return Err(ConfigError::Invalid {
                field: "pg_stat_statements_view",
                reason: format!("'{view}' is not a plain relation name"),
            });
        }
        Ok(())
    }

    /// Effective collection interval.
    pub fn collection_interval(&self) -> Duration {
        let default = Duration::from_secs_f64(DEFAULT_COLLECTION_INTERVAL);
        if self.collection_interval > 0.0 {
            Duration::try_from_secs_f64(self.collection_interval).unwrap_or(default)
        } else {
            default
        }
    }

    /// How long a query identity stays in the full-text seen cache.
    ///
    /// Saturates for rates rejected by [`Self::validate`].
    pub fn full_statement_text_ttl(&self) -> Duration {
        let rate = self.full_statement_text_samples_per_hour_per_query;
        Duration::try_from_secs_f64(3600.0 / rate).unwrap_or(Duration::MAX)
    }

    pub fn obfuscator_options_json(&self) -> String {
        self.obfuscator_options.to_string()
    }

    /// Global tags without `db:` tags; database attribution is carried per row.
    pub fn tags_no_db(&self) -> Vec<String> {
        self.tags
            .iter()
            .filter(|t| !t.starts_with("db:"))
            .cloned()
            .collect()
    }
}
