//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use dns_worker::resolver::{
    ChaosConfig, DnsLookup, FixedRandom, LookupError, RandomSource, ResolutionEngine,
};
use dns_worker::stream::{InMemoryStream, StreamError, StreamLog};
use dns_worker::telemetry::{InMemoryExporter, Tracer};
use dns_worker::types::{Envelope, EnvelopeId, RecordType};
use dns_worker::{Worker, WorkerConfig};

/// One recorded resolver invocation.
#[derive(Debug, Clone)]
pub struct Call {
    pub domain: String,
    pub record_type: RecordType,
    pub started: Instant,
    pub finished: Instant,
}

/// Fake resolver: answers `<domain>-<type>` after `delay`, records every call.
pub struct RecordingLookup {
    delay: Duration,
    calls: Mutex<Vec<Call>>,
}

impl RecordingLookup {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn domains(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.domain.clone()).collect()
    }
}

#[async_trait]
impl DnsLookup for RecordingLookup {
    async fn lookup(&self, domain: &str, record_type: &RecordType) -> Result<String, LookupError> {
        let started = Instant::now();
        tokio::time::sleep(self.delay).await;
        self.calls.lock().push(Call {
            domain: domain.to_string(),
            record_type: record_type.clone(),
            started,
            finished: Instant::now(),
        });
        Ok(format!("{domain}-{record_type}\n"))
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// In-memory log whose appends to one stream fail.
pub struct BrokenStream {
    pub inner: Arc<InMemoryStream>,
    pub broken: String,
    /// Refuse only payloads containing this text; every payload when `None`.
    pub only_containing: Option<String>,
}

impl BrokenStream {
    pub fn new(inner: Arc<InMemoryStream>, broken: &str) -> Self {
        Self {
            inner,
            broken: broken.to_string(),
            only_containing: None,
        }
    }

    pub fn only_containing(mut self, needle: &str) -> Self {
        self.only_containing = Some(needle.to_string());
        self
    }
}

#[async_trait]
impl StreamLog for BrokenStream {
    async fn ensure_subscription(
        &self,
        stream: &str,
        subscription: &str,
    ) -> Result<(), StreamError> {
        self.inner.ensure_subscription(stream, subscription).await
    }

    async fn read_pending(
        &self,
        stream: &str,
        subscription: &str,
        reader: &str,
        after: Option<&EnvelopeId>,
        count: usize,
    ) -> Result<Vec<Envelope>, StreamError> {
        self.inner
            .read_pending(stream, subscription, reader, after, count)
            .await
    }

    async fn read_new(
        &self,
        stream: &str,
        subscription: &str,
        reader: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Envelope>, StreamError> {
        self.inner
            .read_new(stream, subscription, reader, count, block)
            .await
    }

    async fn ack(
        &self,
        stream: &str,
        subscription: &str,
        id: &EnvelopeId,
    ) -> Result<(), StreamError> {
        self.inner.ack(stream, subscription, id).await
    }

    async fn append(&self, stream: &str, payload: &str) -> Result<EnvelopeId, StreamError> {
        let refused = stream == self.broken
            && self
                .only_containing
                .as_deref()
                .is_none_or(|needle| payload.contains(needle));
        if refused {
            return Err(StreamError::backend(format!("append to {stream} refused")));
        }
        self.inner.append(stream, payload).await
    }

    async fn ping(&self) -> Result<(), StreamError> {
        self.inner.ping().await
    }

    fn name(&self) -> &'static str {
        "broken"
    }
}

/// Config for loop tests: short blocking reads, quick backoff.
pub fn test_config(location: &str) -> WorkerConfig {
    WorkerConfig {
        location: location.to_string(),
        block_ms: 50,
        error_backoff_ms: 10,
        ..WorkerConfig::default()
    }
}

/// Engine with chaos disabled and concurrent execution.
pub fn plain_engine(lookup: Arc<dyn DnsLookup>, tracer: Tracer) -> ResolutionEngine {
    engine(
        lookup,
        Arc::new(FixedRandom(0.5)),
        tracer,
        ChaosConfig::disabled(),
    )
}

pub fn engine(
    lookup: Arc<dyn DnsLookup>,
    random: Arc<dyn RandomSource>,
    tracer: Tracer,
    chaos: ChaosConfig,
) -> ResolutionEngine {
    ResolutionEngine::new(lookup, random, tracer, chaos)
}

/// Worker over `log` with a recording resolver and an in-memory exporter.
pub fn worker(
    log: Arc<dyn StreamLog>,
    lookup: Arc<dyn DnsLookup>,
    exporter: Arc<InMemoryExporter>,
    config: &WorkerConfig,
) -> Worker {
    let tracer = Tracer::new(exporter);
    Worker::new(log, plain_engine(lookup, tracer.clone()), tracer, config)
}

/// Polls `check` until it holds or five seconds pass.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
