//! Event transport for assembled payloads.

use std::io::{self, Write};

use serde::Serialize;
use thiserror::Error;

use crate::payload::{FqtEvent, MetricsPayload};

#[derive(Serialize)]
struct Envelope<'a, T> {
    #[serde(rename = "type")]
    kind: &'a str,
    event: &'a T,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("write failed: {0}")]
    Io(#[from] io::Error),
    #[error("serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Receives the two kinds of payloads produced by a cycle.
pub trait EventSink {
    fn query_sample(&mut self, event: &FqtEvent) -> Result<(), SinkError>;
    fn query_metrics(&mut self, payload: &MetricsPayload) -> Result<(), SinkError>;
}

/// Writes one JSON document per line, tagged with its event type.
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_line<T: Serialize>(&mut self, kind: &str, event: &T) -> Result<(), SinkError> {
        serde_json::to_writer(&mut self.writer, &Envelope { kind, event })?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

impl<W: Write> EventSink for JsonLinesSink<W> {
    fn query_sample(&mut self, event: &FqtEvent) -> Result<(), SinkError> {
        self.write_line("dbm-samples", event)
    }

    fn query_metrics(&mut self, payload: &MetricsPayload) -> Result<(), SinkError> {
        self.write_line("dbm-metrics", payload)
    }
}

/// Keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    pub samples: Vec<FqtEvent>,
    pub metrics: Vec<MetricsPayload>,
    /// When set, every call fails with this I/O error kind.
    pub fail_with: Option<io::ErrorKind>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn check(&self) -> Result<(), SinkError> {
        match self.fail_with {
            Some(kind) => Err(SinkError::Io(io::Error::from(kind))),
            None => Ok(()),
        }
    }
}

impl EventSink for MemoryEventSink {
    fn query_sample(&mut self, event: &FqtEvent) -> Result<(), SinkError> {
        self.check()?;
        self.samples.push(event.clone());
        Ok(())
    }

    fn query_metrics(&mut self, payload: &MetricsPayload) -> Result<(), SinkError> {
        self.check()?;
        self.metrics.push(payload.clone());
        Ok(())
    }
}
