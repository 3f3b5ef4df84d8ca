//! Logging setup, trace-context propagation and the span factory.
//!
//! The worker never reaches for a global tracer. A [`Tracer`] is built once
//! around a [`SpanExporter`] and passed by value into the components that
//! emit spans, so tests can swap in an [`InMemoryExporter`] and assert on
//! the exact span tree.
//!
//! # Span tree per task
//!
//! ```text
//! process_dns_task            (child of the coordinator's span)
//! └── lookup_all_records
//!     ├── lookup_a_record
//!     ├── lookup_aaaa_record
//!     └── ...
//! ```

mod context;
mod exporter;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

pub use context::{TraceContext, TRACEPARENT, TRACESTATE};
pub use exporter::{
    AttributeValue, InMemoryExporter, LogExporter, NullExporter, SpanEvent, SpanExporter,
    SpanRecord, SpanStatus,
};

/// Installs the process-wide `tracing` subscriber.
///
/// Filter comes from `RUST_LOG`, defaulting to `info`.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Span factory handed to the resolution engine and the worker.
#[derive(Clone)]
pub struct Tracer {
    exporter: Arc<dyn SpanExporter>,
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("exporter", &self.exporter.name())
            .finish()
    }
}

impl Tracer {
    /// Creates a tracer that sends finished spans to `exporter`.
    pub fn new(exporter: Arc<dyn SpanExporter>) -> Self {
        Self { exporter }
    }

    /// A tracer that discards every span.
    pub fn noop() -> Self {
        Self::new(Arc::new(NullExporter::new()))
    }

    /// Starts a span. With a parent the span joins the parent's trace,
    /// otherwise it starts a new one.
    pub fn start(&self, name: impl Into<String>, parent: Option<&TraceContext>) -> Span {
        let context = parent.map_or_else(TraceContext::new_root, TraceContext::child);
        Span {
            record: Some(SpanRecord {
                name: name.into(),
                context: context.clone(),
                attributes: Default::default(),
                status: SpanStatus::Unset,
                events: Vec::new(),
                start_time: Utc::now(),
                duration: Default::default(),
            }),
            context,
            started: Instant::now(),
            exporter: Arc::clone(&self.exporter),
        }
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new(Arc::new(LogExporter::new()))
    }
}

/// An in-progress span. Exported when [`end`](Span::end) is called or when
/// it is dropped, whichever comes first.
pub struct Span {
    record: Option<SpanRecord>,
    context: TraceContext,
    started: Instant,
    exporter: Arc<dyn SpanExporter>,
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("name", &self.record.as_ref().map(|r| r.name.as_str()))
            .field("context", &self.context)
            .finish()
    }
}

impl Span {
    /// This span's identity, used as the parent of nested spans.
    pub fn context(&self) -> &TraceContext {
        &self.context
    }

    /// Sets or replaces an attribute.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        if let Some(record) = self.record.as_mut() {
            record.attributes.insert(key.into(), value.into());
        }
    }

    /// Records an error event on the span without changing its status.
    pub fn record_error(&mut self, message: impl Into<String>) {
        if let Some(record) = self.record.as_mut() {
            record.events.push(SpanEvent {
                name: "exception".to_string(),
                message: message.into(),
                timestamp: Utc::now(),
            });
        }
    }

    /// Sets the final status.
    pub fn set_status(&mut self, status: SpanStatus) {
        if let Some(record) = self.record.as_mut() {
            record.status = status;
        }
    }

    /// Ends the span and exports it.
    pub fn end(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if let Some(mut record) = self.record.take() {
            record.duration = self.started.elapsed();
            self.exporter.export(record);
        }
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        self.finish();
    }
}
