//! The task consumption loop.
//!
//! One [`Worker`] runs per location. Each iteration of [`Worker::run`]:
//!
//! 1. **Drain pending.** Re-reads entries delivered to this reader earlier
//!    but never acknowledged (a crash, a restart, a `leave-pending`
//!    publish failure) and processes them first.
//! 2. **Await new.** Blocks on the log for never-delivered entries, up to
//!    the configured block duration. An empty batch is a normal timeout.
//! 3. **Process batch.** Handles each entry in delivery order and acks it.
//!
//! ```text
//! Idle -> DrainPending -> AwaitNew -> ProcessBatch -> Idle
//!   \__________\______________\___________\_______-> Cancelled
//! ```
//!
//! Cancellation is checked between iterations, between drained batches and
//! while waiting for new entries. A resolution that has started always runs
//! to completion.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{PublishFailurePolicy, WorkerConfig};
use crate::constants::ALL_LOOKUPS_FAILED;
use crate::resolver::ResolutionEngine;
use crate::stream::{publish, StreamError, StreamLog, Subscription};
use crate::telemetry::{SpanStatus, TraceContext, Tracer};
use crate::types::{Envelope, EnvelopeId, ResultStatus, Task, TaskResult};

/// Errors that stop the loop.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The subscription could not be created at startup.
    #[error("failed to create subscription {subscription} on stream {stream}: {source}")]
    Subscription {
        /// Task stream.
        stream: String,
        /// Subscription name.
        subscription: String,
        /// Log error.
        #[source]
        source: StreamError,
    },
}

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// Between iterations, or not started.
    Idle,
    /// Re-processing unacknowledged entries.
    DrainPending,
    /// Waiting for new entries.
    AwaitNew,
    /// Processing a batch of new entries.
    ProcessBatch,
    /// Stopped after cancellation.
    Cancelled,
}

impl LoopState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::DrainPending,
            2 => Self::AwaitNew,
            3 => Self::ProcessBatch,
            4 => Self::Cancelled,
            _ => Self::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::DrainPending => 1,
            Self::AwaitNew => 2,
            Self::ProcessBatch => 3,
            Self::Cancelled => 4,
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::DrainPending => "drain_pending",
            Self::AwaitNew => "await_new",
            Self::ProcessBatch => "process_batch",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Live counters of a running worker, shared with the health surface.
#[derive(Debug, Default)]
pub struct WorkerStats {
    state: AtomicU8,
    processed: AtomicU64,
    failed: AtomicU64,
    malformed: AtomicU64,
    publish_failures: AtomicU64,
    ack_failures: AtomicU64,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Current loop state.
    pub state: LoopState,
    /// Tasks resolved (including failed ones).
    pub processed: u64,
    /// Tasks whose lookups all failed.
    pub failed: u64,
    /// Undecodable entries dropped.
    pub malformed: u64,
    /// Results that could not be published.
    pub publish_failures: u64,
    /// Acks that failed.
    pub ack_failures: u64,
}

impl WorkerStats {
    /// Current loop state.
    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Relaxed))
    }

    /// Copies every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            state: self.state(),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
        }
    }

    fn set_state(&self, state: LoopState) {
        self.state.store(state.as_u8(), Ordering::Relaxed);
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// What happened to one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeOutcome {
    /// Resolved, result handled, entry acked.
    Processed,
    /// Undecodable, entry acked without processing.
    Dropped,
    /// Result publish failed and the entry was left pending.
    LeftPending,
}

/// A processed task and what happened when its result was published.
#[derive(Debug)]
pub struct TaskOutcome {
    /// The built result.
    pub result: TaskResult,
    /// Id of the published result, or the publish error.
    pub published: Result<EnvelopeId, StreamError>,
}

/// Consumes tasks for one location and publishes their results.
pub struct Worker {
    log: Arc<dyn StreamLog>,
    engine: ResolutionEngine,
    tracer: Tracer,
    location: String,
    subscription: Subscription,
    results_stream: String,
    batch_size: usize,
    block: Duration,
    error_backoff: Duration,
    publish_failure_policy: PublishFailurePolicy,
    dead_letter_stream: Option<String>,
    stats: Arc<WorkerStats>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("log", &self.log.name())
            .field("location", &self.location)
            .field("subscription", &self.subscription)
            .field("results_stream", &self.results_stream)
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Builds a worker from its collaborators and the loop settings in
    /// `config`.
    pub fn new(
        log: Arc<dyn StreamLog>,
        engine: ResolutionEngine,
        tracer: Tracer,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            log,
            engine,
            tracer,
            location: config.location.clone(),
            subscription: config.subscription(),
            results_stream: config.results_stream.clone(),
            batch_size: config.batch_size.max(1),
            block: config.block(),
            error_backoff: config.error_backoff(),
            publish_failure_policy: config.publish_failure_policy,
            dead_letter_stream: config.dead_letter_stream.clone(),
            stats: Arc::new(WorkerStats::default()),
        }
    }

    /// The subscription this worker reads from.
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Shared counters, readable while the loop runs.
    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Creates the subscription, then consumes until `cancel` fires.
    ///
    /// # Errors
    ///
    /// [`WorkerError::Subscription`] if the subscription cannot be created.
    /// Every later failure is logged and retried.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), WorkerError> {
        let sub = &self.subscription;
        self.log
            .ensure_subscription(&sub.stream, &sub.name)
            .await
            .map_err(|source| WorkerError::Subscription {
                stream: sub.stream.clone(),
                subscription: sub.name.clone(),
                source,
            })?;

        tracing::info!(
            location = %self.location,
            stream = %sub.stream,
            subscription = %sub.name,
            reader = %sub.reader,
            "worker started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            self.stats.set_state(LoopState::DrainPending);
            if let Err(e) = self.drain_pending(&cancel).await {
                tracing::error!(error = %e, "failed to read pending tasks");
                self.backoff(&cancel).await;
                continue;
            }
            if cancel.is_cancelled() {
                break;
            }

            self.stats.set_state(LoopState::AwaitNew);
            let read = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                read = self.log.read_new(
                    &sub.stream,
                    &sub.name,
                    &sub.reader,
                    self.batch_size,
                    self.block,
                ) => read,
            };

            match read {
                Ok(batch) if batch.is_empty() => {
                    tracing::debug!(subscription = %sub.name, "no new tasks");
                },
                Ok(batch) => {
                    self.stats.set_state(LoopState::ProcessBatch);
                    tracing::debug!(count = batch.len(), "received new tasks");
                    for envelope in &batch {
                        self.process_envelope(envelope).await;
                    }
                },
                Err(e) => {
                    tracing::error!(error = %e, "failed to read new tasks");
                    self.backoff(&cancel).await;
                },
            }
            self.stats.set_state(LoopState::Idle);
        }

        self.stats.set_state(LoopState::Cancelled);
        tracing::info!(location = %self.location, "worker stopped");
        Ok(())
    }

    /// Processes every pending entry of this reader, oldest first, and
    /// returns how many were handled.
    ///
    /// Pages through the pending list with a cursor, so entries that stay
    /// pending (a failed ack, the `leave-pending` policy) are passed over
    /// and every entry behind them is still reached. Entries passed over
    /// are retried on the next drain.
    pub async fn drain_pending(&self, cancel: &CancellationToken) -> Result<usize, StreamError> {
        let sub = &self.subscription;
        let mut cursor: Option<EnvelopeId> = None;
        let mut handled = 0;

        while !cancel.is_cancelled() {
            let batch = self
                .log
                .read_pending(
                    &sub.stream,
                    &sub.name,
                    &sub.reader,
                    cursor.as_ref(),
                    self.batch_size,
                )
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            cursor = Some(last.id.clone());

            for envelope in &batch {
                handled += 1;
                self.process_envelope(envelope).await;
            }
        }

        if handled > 0 {
            tracing::info!(count = handled, "processed pending tasks");
        }
        Ok(handled)
    }

    /// Decodes, processes and acks one entry.
    pub async fn process_envelope(&self, envelope: &Envelope) -> EnvelopeOutcome {
        let task = match envelope.decode_task() {
            Ok(task) => task,
            Err(e) => {
                WorkerStats::bump(&self.stats.malformed);
                tracing::warn!(id = %envelope.id, error = %e, "dropping undecodable task");
                if let Some(dead_letter) = &self.dead_letter_stream {
                    if let Err(e) = self.log.append(dead_letter, &envelope.payload).await {
                        tracing::warn!(
                            id = %envelope.id,
                            stream = %dead_letter,
                            error = %e,
                            "failed to copy undecodable task to dead-letter stream"
                        );
                    }
                }
                self.ack(&envelope.id).await;
                return EnvelopeOutcome::Dropped;
            },
        };

        let outcome = self.process_task(&task).await;
        if outcome.published.is_err()
            && self.publish_failure_policy == PublishFailurePolicy::LeavePending
        {
            tracing::warn!(
                id = %envelope.id,
                task_id = %task.task_id,
                "leaving task pending after failed publish"
            );
            return EnvelopeOutcome::LeftPending;
        }
        self.ack(&envelope.id).await;
        EnvelopeOutcome::Processed
    }

    /// Resolves `task`, builds its result and publishes it. Does not ack.
    pub async fn process_task(&self, task: &Task) -> TaskOutcome {
        let started = Instant::now();
        let inbound = task.trace_context.as_ref().and_then(TraceContext::extract);

        let mut span = self.tracer.start("process_dns_task", inbound.as_ref());
        if inbound.is_none() {
            tracing::warn!(
                task_id = %task.task_id,
                "task has no usable trace context, starting a new trace"
            );
            span.set_attribute("trace.context_missing", true);
        }
        span.set_attribute("task.id", task.task_id.as_str());
        span.set_attribute("trace.id", task.trace_id.as_str());
        span.set_attribute("dns.domain", task.domain.as_str());
        span.set_attribute("worker.location", self.location.as_str());
        span.set_attribute("dns.record_types.count", task.record_types.len());

        tracing::info!(
            task_id = %task.task_id,
            trace_id = %span.context().short_trace_id(),
            domain = %task.domain,
            record_types = task.record_types.len(),
            "processing task"
        );

        let resolution = self
            .engine
            .resolve_all(&task.domain, &task.record_types, span.context())
            .await;
        let result =
            TaskResult::from_lookups(task, &self.location, resolution.records, started.elapsed());

        WorkerStats::bump(&self.stats.processed);
        span.set_attribute("execution.mode", resolution.mode.as_str());
        span.set_attribute("task.status", result.status.to_string());
        span.set_attribute(
            "processing_time_ms",
            result.processing_time.as_secs_f64() * 1000.0,
        );
        let mut status = SpanStatus::Ok;
        if result.status == ResultStatus::Failed {
            WorkerStats::bump(&self.stats.failed);
            span.record_error(ALL_LOOKUPS_FAILED);
            status = SpanStatus::Error {
                message: ALL_LOOKUPS_FAILED.to_string(),
            };
        }

        let published = publish(self.log.as_ref(), &self.results_stream, &result).await;
        match &published {
            Ok(id) => tracing::info!(
                task_id = %result.task_id,
                status = %result.status,
                result_id = %id,
                processing_time_ms = result.processing_time.as_secs_f64() * 1000.0,
                "published result"
            ),
            Err(e) => {
                WorkerStats::bump(&self.stats.publish_failures);
                tracing::error!(
                    task_id = %result.task_id,
                    stream = %self.results_stream,
                    error = %e,
                    "failed to publish result"
                );
                span.set_attribute("error", true);
                span.set_attribute("error.message", e.to_string());
                span.record_error(e.to_string());
                status = SpanStatus::Error {
                    message: e.to_string(),
                };
            },
        }
        span.set_status(status);
        span.end();

        TaskOutcome { result, published }
    }

    async fn ack(&self, id: &EnvelopeId) {
        let sub = &self.subscription;
        if let Err(e) = self.log.ack(&sub.stream, &sub.name, id).await {
            WorkerStats::bump(&self.stats.ack_failures);
            tracing::error!(id = %id, error = %e, "failed to acknowledge task");
        }
    }

    async fn backoff(&self, cancel: &CancellationToken) {
        tokio::select! {
            () = cancel.cancelled() => {},
            () = tokio::time::sleep(self.error_backoff) => {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{ChaosConfig, DnsLookup, FixedRandom, LookupError};
    use crate::stream::InMemoryStream;
    use crate::telemetry::InMemoryExporter;
    use crate::types::RecordType;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    struct EchoLookup;

    #[async_trait]
    impl DnsLookup for EchoLookup {
        async fn lookup(
            &self,
            domain: &str,
            record_type: &RecordType,
        ) -> Result<String, LookupError> {
            Ok(format!("{domain}/{record_type}\n"))
        }

        fn name(&self) -> &'static str {
            "echo"
        }
    }

    fn worker(log: Arc<InMemoryStream>, exporter: Arc<InMemoryExporter>) -> Worker {
        let tracer = Tracer::new(exporter);
        let engine = ResolutionEngine::new(
            Arc::new(EchoLookup),
            Arc::new(FixedRandom(0.5)),
            tracer.clone(),
            ChaosConfig::disabled(),
        );
        let config = WorkerConfig {
            location: "test-loc".to_string(),
            ..WorkerConfig::default()
        };
        Worker::new(log, engine, tracer, &config)
    }

    #[tokio::test]
    async fn process_task_publishes_result() {
        let log = Arc::new(InMemoryStream::new());
        let worker = worker(log.clone(), Arc::new(InMemoryExporter::new()));
        let task = Task::new("example.com", vec![RecordType::A]);

        let outcome = worker.process_task(&task).await;
        assert!(outcome.published.is_ok());
        assert_eq!(outcome.result.location, "test-loc");
        assert_eq!(outcome.result.status, ResultStatus::Success);
        assert_eq!(
            outcome.result.records[&RecordType::A].records,
            vec!["example.com/A"]
        );

        let published = log.entries("dns:results");
        assert_eq!(published.len(), 1);
        let back: TaskResult = serde_json::from_str(&published[0].payload).unwrap();
        assert_eq!(back.task_id, task.task_id);
    }

    #[tokio::test]
    async fn inbound_trace_context_becomes_parent() {
        let log = Arc::new(InMemoryStream::new());
        let exporter = Arc::new(InMemoryExporter::new());
        let worker = worker(log, exporter.clone());

        let upstream = TraceContext::new_root();
        let mut carrier = HashMap::new();
        upstream.inject(&mut carrier);
        let task = Task::new("example.com", vec![RecordType::A]).with_trace_context(carrier);
        worker.process_task(&task).await;

        let span = exporter.spans_named("process_dns_task").remove(0);
        assert_eq!(span.context.trace_id, upstream.trace_id);
        assert_eq!(
            span.context.parent_span_id.as_deref(),
            Some(upstream.span_id.as_str())
        );
        assert!(span.attribute("trace.context_missing").is_none());
    }

    #[tokio::test]
    async fn missing_trace_context_starts_new_trace() {
        let log = Arc::new(InMemoryStream::new());
        let exporter = Arc::new(InMemoryExporter::new());
        let worker = worker(log, exporter.clone());

        worker
            .process_task(&Task::new("example.com", vec![RecordType::A]))
            .await;

        let span = exporter.spans_named("process_dns_task").remove(0);
        assert_eq!(span.context.parent_span_id, None);
        assert_eq!(
            span.attribute("trace.context_missing").and_then(|v| v.as_bool()),
            Some(true)
        );
    }

    #[tokio::test]
    async fn malformed_entry_is_dropped_and_acked() {
        let log = Arc::new(InMemoryStream::new());
        let worker = worker(log.clone(), Arc::new(InMemoryExporter::new()));
        let sub = worker.subscription().clone();
        log.ensure_subscription(&sub.stream, &sub.name).await.unwrap();
        log.append(&sub.stream, "not json").await.unwrap();

        let batch = log
            .read_new(&sub.stream, &sub.name, &sub.reader, 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(
            worker.process_envelope(&batch[0]).await,
            EnvelopeOutcome::Dropped
        );
        assert_eq!(log.pending_count(&sub.stream, &sub.name), 0);
        assert!(log.is_empty("dns:results"));
        assert_eq!(worker.stats().snapshot().malformed, 1);
    }

    #[test]
    fn loop_state_round_trips_through_u8() {
        for state in [
            LoopState::Idle,
            LoopState::DrainPending,
            LoopState::AwaitNew,
            LoopState::ProcessBatch,
            LoopState::Cancelled,
        ] {
            assert_eq!(LoopState::from_u8(state.as_u8()), state);
        }
    }
}
