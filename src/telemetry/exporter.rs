//! Span data model and exporter implementations.
//!
//! A [`SpanExporter`] receives every finished span. Shipping spans to a
//! collector is somebody else's job; the exporters here cover local needs:
//!
//! - [`LogExporter`] - one structured `tracing` event per span
//! - [`NullExporter`] - discards everything
//! - [`InMemoryExporter`] - keeps spans for assertions in tests

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use super::context::TraceContext;

/// A span attribute value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Text value.
    String(String),
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Floating-point value.
    Float(f64),
}

impl AttributeValue {
    /// Returns the value if this is a string attribute.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value if this is a boolean attribute.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the value if this is an integer attribute.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the value if this is a float attribute.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<usize> for AttributeValue {
    fn from(value: usize) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// Final status of a span.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "lowercase")]
pub enum SpanStatus {
    /// No status was set.
    #[default]
    Unset,
    /// The operation completed successfully.
    Ok,
    /// The operation failed.
    Error {
        /// Description of the failure.
        message: String,
    },
}

/// A timestamped annotation on a span, such as a recorded error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanEvent {
    /// Event name (`exception` for recorded errors).
    pub name: String,
    /// Event message.
    pub message: String,
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
}

/// A finished span as handed to a [`SpanExporter`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanRecord {
    /// Span name, e.g. `process_dns_task`.
    pub name: String,
    /// Identity and parent linkage.
    pub context: TraceContext,
    /// Attributes in key order.
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Final status.
    pub status: SpanStatus,
    /// Recorded events.
    pub events: Vec<SpanEvent>,
    /// Wall-clock start.
    pub start_time: DateTime<Utc>,
    /// Monotonic duration between start and end.
    #[serde(rename = "duration_ms", with = "crate::types::duration_ms")]
    pub duration: Duration,
}

impl SpanRecord {
    /// Looks up an attribute by key.
    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    /// Returns `true` if the span ended with an error status.
    pub fn is_error(&self) -> bool {
        matches!(self.status, SpanStatus::Error { .. })
    }
}

/// Destination of finished spans.
///
/// `export` runs synchronously when a span ends (including when it is
/// dropped), so implementations must not block.
pub trait SpanExporter: Send + Sync + 'static {
    /// Receives one finished span.
    fn export(&self, span: SpanRecord);

    /// Exporter name for diagnostics.
    fn name(&self) -> &'static str;
}

/// Emits each finished span as a structured `tracing` event.
#[derive(Debug, Default)]
pub struct LogExporter;

impl LogExporter {
    /// Creates a log exporter.
    pub fn new() -> Self {
        Self
    }
}

impl SpanExporter for LogExporter {
    fn export(&self, span: SpanRecord) {
        let attributes = serde_json::to_string(&span.attributes).unwrap_or_default();
        let parent = span.context.parent_span_id.as_deref().unwrap_or("-");
        match &span.status {
            SpanStatus::Error { message } => tracing::warn!(
                target: "dns_worker::spans",
                span_name = %span.name,
                trace_id = %span.context.trace_id,
                span_id = %span.context.span_id,
                parent_span_id = %parent,
                duration_ms = span.duration.as_secs_f64() * 1000.0,
                error = %message,
                attributes = %attributes,
                "span finished with error"
            ),
            _ => tracing::debug!(
                target: "dns_worker::spans",
                span_name = %span.name,
                trace_id = %span.context.trace_id,
                span_id = %span.context.span_id,
                parent_span_id = %parent,
                duration_ms = span.duration.as_secs_f64() * 1000.0,
                attributes = %attributes,
                "span finished"
            ),
        }
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Discards every span.
#[derive(Debug, Default)]
pub struct NullExporter;

impl NullExporter {
    /// Creates a null exporter.
    pub fn new() -> Self {
        Self
    }
}

impl SpanExporter for NullExporter {
    fn export(&self, _span: SpanRecord) {}

    fn name(&self) -> &'static str {
        "null"
    }
}

/// Collects finished spans in memory.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use dns_worker::telemetry::{InMemoryExporter, Tracer};
///
/// let exporter = Arc::new(InMemoryExporter::new());
/// let tracer = Tracer::new(exporter.clone());
///
/// tracer.start("work", None).end();
/// assert_eq!(exporter.spans_named("work").len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryExporter {
    spans: Mutex<Vec<SpanRecord>>,
}

impl InMemoryExporter {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every span collected so far, in end order.
    pub fn spans(&self) -> Vec<SpanRecord> {
        self.spans.lock().clone()
    }

    /// Returns the collected spans with the given name.
    pub fn spans_named(&self, name: &str) -> Vec<SpanRecord> {
        self.spans
            .lock()
            .iter()
            .filter(|s| s.name == name)
            .cloned()
            .collect()
    }

    /// Number of collected spans.
    pub fn len(&self) -> usize {
        self.spans.lock().len()
    }

    /// Returns `true` if nothing was collected.
    pub fn is_empty(&self) -> bool {
        self.spans.lock().is_empty()
    }

    /// Forgets every collected span.
    pub fn clear(&self) {
        self.spans.lock().clear();
    }
}

impl SpanExporter for InMemoryExporter {
    fn export(&self, span: SpanRecord) {
        self.spans.lock().push(span);
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}
