//! Rate limiting of full-query-text events.
//!
//! Full statement text is bulkier and more sensitive than the metrics, so each
//! query identity is reported at most once per TTL (`3600 / samples per hour`).

use std::time::{Duration, Instant};

use crate::models::{NormalizedRow, RowIdentity};
use crate::payload::{EventContext, FqtEvent, fqt_event};
use crate::util::TtlCache;

#[derive(Debug)]
pub struct FullTextSampler {
    seen: TtlCache<RowIdentity>,
}

impl FullTextSampler {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            seen: TtlCache::new(max_size, ttl),
        }
    }

    /// Number of identities currently rate limited.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Events for identities not reported within the TTL.
    ///
    /// An identity is marked as seen when its event is yielded, so the
    /// iterator must be drained to send every event; it cannot be restarted.
    pub fn sample<'a>(
        &'a mut self,
        rows: &'a [NormalizedRow],
        ctx: &'a EventContext,
        now: Instant,
    ) -> FullTextSamples<'a> {
        FullTextSamples {
            seen: &mut self.seen,
            rows: rows.iter(),
            ctx,
            now,
        }
    }
}

/// Single-pass iterator returned by [`FullTextSampler::sample`].
pub struct FullTextSamples<'a> {
    seen: &'a mut TtlCache<RowIdentity>,
    rows: std::slice::Iter<'a, NormalizedRow>,
    ctx: &'a EventContext,
    now: Instant,
}

impl Iterator for FullTextSamples<'_> {
    type Item = FqtEvent;

    fn next(&mut self) -> Option<FqtEvent> {
        for row in self.rows.by_ref() {
            if self.seen.insert_if_absent(row.identity(), self.now) {
                return Some(fqt_event(row, self.ctx));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Metrics, QueryMetadata, StatementRow};

    fn row(signature: &str, datname: &str) -> NormalizedRow {
        NormalizedRow {
            row: StatementRow {
                query: format!("SELECT {signature}"),
                datname: Some(datname.to_string()),
                rolname: Some("r".to_string()),
                queryid: None,
                metrics: Metrics::new(),
            },
            query_signature: signature.to_string(),
            metadata: QueryMetadata::default(),
        }
    }

    fn ctx() -> EventContext {
        EventContext {
            host: "h".to_string(),
            agent_version: "v".to_string(),
            tags_no_db: vec![],
            timestamp_ms: 0.0,
        }
    }

    #[test]
    fn new_identities_yield_one_event_each() {
        let mut sampler = FullTextSampler::new(100, Duration::from_secs(3600));
        let rows = vec![row("a", "d1"), row("a", "d2"), row("b", "d1"), row("a", "d1")];
        let events: Vec<_> = sampler.sample(&rows, &ctx(), Instant::now()).collect();

        assert_eq!(events.len(), 3);
        assert_eq!(sampler.len(), 3);
    }

    #[test]
    fn repeat_within_ttl_is_suppressed_then_allowed_once() {
        let ttl = Duration::from_secs(900);
        let mut sampler = FullTextSampler::new(100, ttl);
        let rows = vec![row("a", "d")];
        let start = Instant::now();

        assert_eq!(sampler.sample(&rows, &ctx(), start).count(), 1);
        assert_eq!(
            sampler
                .sample(&rows, &ctx(), start + Duration::from_secs(899))
                .count(),
            0
        );
        assert_eq!(sampler.sample(&rows, &ctx(), start + ttl).count(), 1);
        assert_eq!(sampler.sample(&rows, &ctx(), start + ttl).count(), 0);
    }

    #[test]
    fn undrained_iterator_only_marks_yielded_rows() {
        let mut sampler = FullTextSampler::new(100, Duration::from_secs(60));
        let rows = vec![row("a", "d"), row("b", "d")];
        let now = Instant::now();

        let first = sampler.sample(&rows, &ctx(), now).next();
        assert!(first.is_some());
        assert_eq!(sampler.len(), 1);

        let rest: Vec<_> = sampler.sample(&rows, &ctx(), now).collect();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].db.query_signature, "b");
    }
}
