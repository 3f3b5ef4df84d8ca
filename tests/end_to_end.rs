//! End-to-end: a coordinator-shaped task goes through the running loop and
//! comes back as a published result.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use dns_worker::stream::{InMemoryStream, StreamLog};
use dns_worker::telemetry::{InMemoryExporter, TraceContext};
use dns_worker::types::{RecordType, ResultStatus, Task, TaskResult};

use common::{test_config, wait_until, worker, RecordingLookup};

#[tokio::test]
async fn example_com_a_and_aaaa_round_trip() {
    let log = Arc::new(InMemoryStream::new());
    let config = test_config("us-west-2");
    let sub = config.subscription();
    // Subscribe up front so the task below is published after the worker's
    // cursor exists; the worker's own ensure_subscription is then a no-op.
    log.ensure_subscription(&sub.stream, &sub.name).await.unwrap();

    let lookup = Arc::new(RecordingLookup::new(Duration::from_millis(30)));
    let exporter = Arc::new(InMemoryExporter::new());
    let worker = worker(log.clone(), lookup.clone(), exporter.clone(), &config);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { worker.run(cancel).await }
    });

    // Publish as the coordinator would.
    let upstream = TraceContext::new_root();
    let mut carrier = HashMap::new();
    upstream.inject(&mut carrier);
    let payload = serde_json::json!({
        "task_id": "task-123",
        "trace_id": upstream.trace_id,
        "domain": "example.com",
        "location": "ignored",
        "record_types": ["A", "AAAA"],
        "timestamp": "2024-05-01T12:00:00Z",
        "trace_context": carrier,
    });
    log.append(&sub.stream, &payload.to_string()).await.unwrap();

    assert!(wait_until(|| log.len("dns:results") == 1).await);
    cancel.cancel();
    handle.await.unwrap().unwrap();

    let published = log.entries("dns:results");
    let raw = &published[0].payload;
    let result: TaskResult = serde_json::from_str(raw).unwrap();
    assert_eq!(result.task_id, "task-123");
    assert_eq!(result.trace_id, upstream.trace_id);
    assert_eq!(result.location, "us-west-2");
    assert_eq!(result.status, ResultStatus::Success);
    assert_eq!(result.error, None);
    assert_eq!(
        result.records.keys().cloned().collect::<Vec<_>>(),
        vec![RecordType::A, RecordType::Aaaa]
    );
    let longest = result
        .records
        .values()
        .map(|r| r.duration)
        .max()
        .unwrap();
    assert!(result.processing_time >= longest);
    assert_eq!(lookup.calls().len(), 2);

    // Wire shape the coordinator reads.
    let json: Value = serde_json::from_str(raw).unwrap();
    assert_eq!(json["status"], "success");
    assert!(json["processing_time_ms"].as_f64().unwrap() >= 30.0);
    assert_eq!(json["records"]["AAAA"]["records"][0], "example.com-AAAA");
    assert_eq!(json["records"]["A"]["chaos_injected"], false);

    // The task's span tree hangs off the coordinator's span.
    let task_span = exporter.spans_named("process_dns_task").remove(0);
    assert_eq!(task_span.context.trace_id, upstream.trace_id);
    let lookups = exporter.spans_named("lookup_all_records");
    assert_eq!(
        lookups[0].context.parent_span_id.as_deref(),
        Some(task_span.context.span_id.as_str())
    );

    assert_eq!(log.pending_count(&sub.stream, &sub.name), 0);
}

#[tokio::test]
async fn task_built_with_library_types_is_accepted() {
    let log = Arc::new(InMemoryStream::new());
    let config = test_config("us-west-2");
    let sub = config.subscription();
    log.ensure_subscription(&sub.stream, &sub.name).await.unwrap();

    let task = Task::new("example.org", vec![RecordType::Mx]);
    dns_worker::publish(log.as_ref(), &sub.stream, &task).await.unwrap();

    let lookup = Arc::new(RecordingLookup::new(Duration::ZERO));
    let worker = worker(
        log.clone(),
        lookup,
        Arc::new(InMemoryExporter::new()),
        &config,
    );
    let batch = log
        .read_new(&sub.stream, &sub.name, &sub.reader, 10, Duration::ZERO)
        .await
        .unwrap();
    worker.process_envelope(&batch[0]).await;

    let result: TaskResult =
        serde_json::from_str(&log.entries("dns:results")[0].payload).unwrap();
    assert_eq!(result.task_id, task.task_id);
    assert_eq!(
        result.records[&RecordType::Mx].records,
        vec!["example.org-MX"]
    );
}

