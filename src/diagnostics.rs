//! Internal diagnostic counters and gauges.

use tracing::info;

/// Destination of the collector's own health metrics.
pub trait DiagnosticSink {
    fn count(&mut self, metric: &str, value: f64, tags: &[String]);
    fn gauge(&mut self, metric: &str, value: f64, tags: &[String]);
}

/// Emits every sample as a structured log event.
#[derive(Debug, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn count(&mut self, metric: &str, value: f64, tags: &[String]) {
        info!(metric, value, tags = %tags.join(","), kind = "count", "diagnostic");
    }

    fn gauge(&mut self, metric: &str, value: f64, tags: &[String]) {
        info!(metric, value, tags = %tags.join(","), kind = "gauge", "diagnostic");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    Count,
    Gauge,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub kind: SampleKind,
    pub metric: String,
    pub value: f64,
    pub tags: Vec<String>,
}

/// Records samples for inspection in tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub samples: Vec<Sample>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named<'a>(&'a self, metric: &'a str) -> impl Iterator<Item = &'a Sample> + 'a {
        self.samples.iter().filter(move |s| s.metric == metric)
    }

    /// Last recorded value of `metric`.
    pub fn last(&self, metric: &str) -> Option<f64> {
        self.named(metric).last().map(|s| s.value)
    }

    fn record(&mut self, kind: SampleKind, metric: &str, value: f64, tags: &[String]) {
        self.samples.push(Sample {
            kind,
            metric: metric.to_string(),
            value,
            tags: tags.to_vec(),
        });
    }
}

impl DiagnosticSink for MemorySink {
    fn count(&mut self, metric: &str, value: f64, tags: &[String]) {
        self.record(SampleKind::Count, metric, value, tags);
    }

    fn gauge(&mut self, metric: &str, value: f64, tags: &[String]) {
        self.record(SampleKind::Gauge, metric, value, tags);
    }
}
