//! Per-interval deltas over cumulative `pg_stat_statements` counters.
//!
//! The statistics view only reports totals since the last reset, so the
//! collector remembers the previous sample of every row and reports the
//! difference. Rows are keyed by an arbitrary identity (for statements:
//! signature, database and role).
//!
//! Rules per row:
//! - first observation: store baseline, emit nothing;
//! - every tracked counter grew or stayed: emit `new - old`;
//! - any tracked counter went down: the entry was reset or evicted on the
//!   server, emit the new absolute values;
//! - every emitted counter is zero: emit nothing.
//!
//! Identities missing from a cycle are forgotten.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;

use crate::models::{MetricColumn, Metrics, NormalizedRow, StatementRow};

/// Row type carrying cumulative counters.
pub trait CounterRow {
    fn metrics(&self) -> &Metrics;
    fn metrics_mut(&mut self) -> &mut Metrics;
}

impl CounterRow for StatementRow {
    fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    fn metrics_mut(&mut self) -> &mut Metrics {
        &mut self.metrics
    }
}

impl CounterRow for NormalizedRow {
    fn metrics(&self) -> &Metrics {
        &self.row.metrics
    }

    fn metrics_mut(&mut self) -> &mut Metrics {
        &mut self.row.metrics
    }
}

/// Outcome of diffing a single row against its baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowDelta {
    FirstSeen,
    Increased,
    Reset,
}

/// Delta tracking state, owned by one collection worker.
#[derive(Debug)]
pub struct StatementMetrics<K> {
    previous: HashMap<K, Metrics>,
}

impl<K> Default for StatementMetrics<K> {
    fn default() -> Self {
        Self {
            previous: HashMap::new(),
        }
    }
}

impl<K: Hash + Eq + Clone> StatementMetrics<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of identities with a stored baseline.
    pub fn len(&self) -> usize {
        self.previous.len()
    }

    pub fn is_empty(&self) -> bool {
        self.previous.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.previous.contains_key(key)
    }

    pub fn reset(&mut self) {
        self.previous.clear();
    }

    /// Computes deltas for `rows` and replaces the stored baselines.
    ///
    /// Only `metric_columns` are diffed; other counters pass through as
    /// absolute values. Rows sharing a key are merged first by summing their
    /// tracked counters.
    pub fn compute_deltas<R, F>(
        &mut self,
        rows: Vec<R>,
        metric_columns: &BTreeSet<MetricColumn>,
        key_fn: F,
    ) -> Vec<R>
    where
        R: CounterRow,
        F: Fn(&R) -> K,
    {
        let merged = merge_duplicate_rows(rows, metric_columns, &key_fn);

        let mut current = HashMap::with_capacity(merged.len());
        let mut out = Vec::new();

        for (key, mut row) in merged {
            let absolute = tracked(row.metrics(), metric_columns);
            let outcome = match self.previous.get(&key) {
                None => RowDelta::FirstSeen,
                Some(prev) => diff_into(row.metrics_mut(), prev, &absolute),
            };
            current.insert(key, absolute);

            if outcome == RowDelta::FirstSeen {
                continue;
            }
            let all_zero = metric_columns
                .iter()
                .filter_map(|c| row.metrics().get(c))
                .all(|v| v.is_zero());
            if all_zero {
                continue;
            }
            out.push(row);
        }

        // Full replacement evicts identities absent from this cycle.
        self.previous = current;
        out
    }
}

/// Tracked subset of a row's counters, used as the stored baseline.
fn tracked(metrics: &Metrics, metric_columns: &BTreeSet<MetricColumn>) -> Metrics {
    metrics
        .iter()
        .filter(|(c, _)| metric_columns.contains(c))
        .map(|(c, v)| (*c, *v))
        .collect()
}

/// Rewrites the tracked counters of `metrics` as deltas against `prev`.
fn diff_into(metrics: &mut Metrics, prev: &Metrics, absolute: &Metrics) -> RowDelta {
    // Column set changed under us (extension upgrade): start over.
    if !absolute.keys().eq(prev.keys()) {
        return RowDelta::FirstSeen;
    }

    let regressed = absolute.iter().any(|(c, new)| *new < prev[c]);
    if regressed {
        return RowDelta::Reset;
    }

    for (column, new) in absolute {
        metrics.insert(*column, new.delta(prev[column]));
    }
    RowDelta::Increased
}

/// Collapses rows with the same key, keeping first-seen order.
fn merge_duplicate_rows<R, K, F>(
    rows: Vec<R>,
    metric_columns: &BTreeSet<MetricColumn>,
    key_fn: &F,
) -> Vec<(K, R)>
where
    R: CounterRow,
    K: Hash + Eq + Clone,
    F: Fn(&R) -> K,
{
    let mut index: HashMap<K, usize> = HashMap::with_capacity(rows.len());
    let mut merged: Vec<(K, R)> = Vec::with_capacity(rows.len());

    for row in rows {
        let key = key_fn(&row);
        match index.entry(key.clone()) {
            Entry::Occupied(slot) => {
                let target = merged[*slot.get()].1.metrics_mut();
                for (column, value) in row.metrics() {
                    if !metric_columns.contains(column) {
                        continue;
                    }
                    target
                        .entry(*column)
                        .and_modify(|v| *v = v.sum(*value))
                        .or_insert(*value);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(merged.len());
                merged.push((key, row));
            }
        }
    }

    merged
}
