//! Cumulative counter columns of `pg_stat_statements` and their values.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::Serialize;

/// Cumulative counter columns tracked across collection cycles.
///
/// Every column here only grows until the statistics view is reset or the
/// entry is evicted, so consumers must diff consecutive samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricColumn {
    Calls,
    Rows,
    /// PG < 13 name of the execution time column.
    TotalTime,
    /// PG 13+ name of the execution time column.
    TotalExecTime,
    SharedBlksHit,
    SharedBlksRead,
    SharedBlksDirtied,
    SharedBlksWritten,
    LocalBlksHit,
    LocalBlksRead,
    LocalBlksDirtied,
    LocalBlksWritten,
    TempBlksRead,
    TempBlksWritten,
}

impl MetricColumn {
    pub const ALL: [MetricColumn; 14] = [
        MetricColumn::Calls,
        MetricColumn::Rows,
        MetricColumn::TotalTime,
        MetricColumn::TotalExecTime,
        MetricColumn::SharedBlksHit,
        MetricColumn::SharedBlksRead,
        MetricColumn::SharedBlksDirtied,
        MetricColumn::SharedBlksWritten,
        MetricColumn::LocalBlksHit,
        MetricColumn::LocalBlksRead,
        MetricColumn::LocalBlksDirtied,
        MetricColumn::LocalBlksWritten,
        MetricColumn::TempBlksRead,
        MetricColumn::TempBlksWritten,
    ];

    /// Column name as it appears in the statistics view.
    pub fn name(self) -> &'static str {
        match self {
            MetricColumn::Calls => "calls",
            MetricColumn::Rows => "rows",
            MetricColumn::TotalTime => "total_time",
            MetricColumn::TotalExecTime => "total_exec_time",
            MetricColumn::SharedBlksHit => "shared_blks_hit",
            MetricColumn::SharedBlksRead => "shared_blks_read",
            MetricColumn::SharedBlksDirtied => "shared_blks_dirtied",
            MetricColumn::SharedBlksWritten => "shared_blks_written",
            MetricColumn::LocalBlksHit => "local_blks_hit",
            MetricColumn::LocalBlksRead => "local_blks_read",
            MetricColumn::LocalBlksDirtied => "local_blks_dirtied",
            MetricColumn::LocalBlksWritten => "local_blks_written",
            MetricColumn::TempBlksRead => "temp_blks_read",
            MetricColumn::TempBlksWritten => "temp_blks_written",
        }
    }

    pub fn from_name(name: &str) -> Option<MetricColumn> {
        MetricColumn::ALL.into_iter().find(|c| c.name() == name)
    }
}

/// A single counter value. Call and block counters are `bigint`,
/// timings are `double precision`.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(untagged)]
pub enum Counter {
    Int(i64),
    Float(f64),
}

impl Counter {
    pub fn as_f64(self) -> f64 {
        match self {
            Counter::Int(v) => v as f64,
            Counter::Float(v) => v,
        }
    }

    pub fn is_zero(self) -> bool {
        match self {
            Counter::Int(v) => v == 0,
            Counter::Float(v) => v == 0.0,
        }
    }

    /// `self - other`. Mixed integer/float operands produce a float.
    pub fn delta(self, other: Counter) -> Counter {
        match (self, other) {
            (Counter::Int(a), Counter::Int(b)) => Counter::Int(a.saturating_sub(b)),
            (a, b) => Counter::Float(a.as_f64() - b.as_f64()),
        }
    }

    pub fn sum(self, other: Counter) -> Counter {
        match (self, other) {
            (Counter::Int(a), Counter::Int(b)) => Counter::Int(a.saturating_add(b)),
            (a, b) => Counter::Float(a.as_f64() + b.as_f64()),
        }
    }
}

impl PartialEq for Counter {
    fn eq(&self, other: &Self) -> bool {
        self.partial_cmp(other) == Some(Ordering::Equal)
    }
}

impl PartialOrd for Counter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Counter::Int(a), Counter::Int(b)) => Some(a.cmp(b)),
            (a, b) => a.as_f64().partial_cmp(&b.as_f64()),
        }
    }
}

impl From<i64> for Counter {
    fn from(v: i64) -> Self {
        Counter::Int(v)
    }
}

impl From<f64> for Counter {
    fn from(v: f64) -> Self {
        Counter::Float(v)
    }
}

/// Counter values of one row. Columns the view does not expose are absent.
pub type Metrics = BTreeMap<MetricColumn, Counter>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_names_round_trip() {
        for column in MetricColumn::ALL {
            assert_eq!(MetricColumn::from_name(column.name()), Some(column));
        }
        assert_eq!(MetricColumn::from_name("query"), None);
    }

    #[test]
    fn delta_of_mixed_counters_is_float() {
        assert_eq!(Counter::Int(8).delta(Counter::Int(5)), Counter::Int(3));
        let d = Counter::Float(10.5).delta(Counter::Int(10));
        assert!(matches!(d, Counter::Float(v) if (v - 0.5).abs() < 1e-9));
    }

    #[test]
    fn int_and_float_compare_by_value() {
        assert!(Counter::Int(2) < Counter::Float(2.5));
        assert_eq!(Counter::Int(3), Counter::Float(3.0));
        assert!(Counter::Int(0).is_zero());
    }

    #[test]
    fn metrics_serialize_with_view_column_names() {
        let mut metrics = Metrics::new();
        metrics.insert(MetricColumn::Calls, Counter::Int(3));
        metrics.insert(MetricColumn::TotalExecTime, Counter::Float(1.5));
        let json = serde_json::to_string(&metrics).unwrap();
        assert_eq!(json, r#"{"calls":3,"total_exec_time":1.5}"#);
    }
}
