//! Integration tests for the Loglink pipeline.
//!
//! These tests drive the public API end to end: spans and log records are
//! produced through a `Telemetry` pipeline and observed at the export sink.

use pipeline::config::PipelineConfig;
use pipeline::export::InMemorySink;
use pipeline::models::{Level, LogRecord, SpanData, SpanStatus};
use pipeline::registry;
use pipeline::telemetry::Telemetry;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Creates a pipeline backed by a fresh in-memory sink.
fn test_pipeline(config: PipelineConfig) -> (Telemetry, Arc<InMemorySink>) {
    let sink = Arc::new(InMemorySink::new());
    let telemetry = Telemetry::init(config, sink.clone()).unwrap();
    (telemetry, sink)
}

fn base_config() -> PipelineConfig {
    PipelineConfig::new("integration-service")
        .with_app_name("integration-app")
        .with_console(false)
}

fn span_named<'a>(spans: &'a [SpanData], name: &str) -> &'a SpanData {
    spans
        .iter()
        .find(|s| s.name == name)
        .unwrap_or_else(|| panic!("span {name} not exported"))
}

#[derive(Debug)]
struct StepFailed(&'static str);

impl fmt::Display for StepFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step failed: {}", self.0)
    }
}

impl std::error::Error for StepFailed {}

#[tokio::test]
async fn test_nested_spans_correlate_records() {
    let (telemetry, sink) = test_pipeline(base_config().with_min_level(Level::Info));
    let tracer = telemetry.tracer().clone();
    let logger = telemetry.logger().clone();

    let outer = tracer.start_span("outer");
    logger.info("hello");
    let inner = tracer.start_span("inner");
    logger.debug("world");
    tracer.end_span(&inner).unwrap();
    tracer.end_span(&outer).unwrap();

    telemetry.shutdown().await;

    let logs = sink.logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].message(), "hello");
    assert_eq!(logs[0].trace_id(), outer.trace_id().to_string());
    assert_eq!(logs[0].span_id(), outer.span_id().to_string());
    assert_eq!(logs[0].app_name(), "integration-app");

    let spans = sink.spans();
    assert_eq!(spans.len(), 2);
    let outer_data = span_named(&spans, "outer");
    let inner_data = span_named(&spans, "inner");
    assert!(outer_data.is_root());
    assert_eq!(inner_data.parent_span_id.as_deref(), Some(outer_data.span_id.as_str()));
    assert_eq!(inner_data.trace_id, outer_data.trace_id);
    assert_eq!(outer_data.status, SpanStatus::Ok);
    assert_eq!(outer_data.service, "integration-service");
    assert!(outer_data.end_time >= outer_data.start_time);
}

#[tokio::test]
async fn test_records_without_span_use_zero_ids() {
    let (telemetry, sink) = test_pipeline(base_config());

    telemetry.logger().warning("no context");
    telemetry.shutdown().await;

    let record = &sink.logs()[0];
    assert_eq!(record.trace_id(), "00000000000000000000000000000000");
    assert_eq!(record.span_id(), "0000000000000000");
}

#[tokio::test]
async fn test_batches_split_by_batch_size_in_order() {
    let (telemetry, sink) = test_pipeline(base_config().with_batch_size(4));

    for i in 0..10 {
        telemetry.logger().info(format!("record {i}"));
    }
    telemetry.shutdown().await;

    let sizes: Vec<usize> = sink.log_batches().iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![4, 4, 2]);

    let messages: Vec<String> = sink
        .logs()
        .iter()
        .map(|r| r.message().to_string())
        .collect();
    let expected: Vec<String> = (0..10).map(|i| format!("record {i}")).collect();
    assert_eq!(messages, expected);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let sink = Arc::new(InMemorySink::new().failing_first(2));
    let config = base_config().with_retries(3, Duration::from_millis(1), Duration::from_millis(5));
    let telemetry = Telemetry::init(config, sink.clone()).unwrap();

    telemetry.logger().error("eventually delivered");
    let report = telemetry.shutdown().await;

    assert_eq!(sink.logs().len(), 1);
    assert_eq!(report.logs.retries, 2);
    assert_eq!(report.logs.dropped, 0);
}

#[tokio::test]
async fn test_error_three_levels_deep_marks_every_span() {
    let (telemetry, sink) = test_pipeline(base_config());
    let tracer = telemetry.tracer().clone();
    let logger = telemetry.logger().clone();

    let result: Result<(), StepFailed> = tracer.in_span("level_1", || {
        tracer.in_span("level_2", || {
            tracer.in_span("level_3", || {
                logger.info("about to fail");
                Err(StepFailed("level 3"))
            })
        })
    });

    let err = result.unwrap_err();
    logger.exception("processing failed", &err);
    telemetry.shutdown().await;

    let spans = sink.spans();
    for name in ["level_1", "level_2", "level_3"] {
        let span = span_named(&spans, name);
        assert_eq!(span.status, SpanStatus::Error, "{name}");
        let event = span.event("exception").unwrap();
        assert_eq!(
            event.attributes.get("exception.message"),
            Some(&serde_json::json!("step failed: level 3"))
        );
    }

    let logs = sink.logs();
    let level_3 = span_named(&spans, "level_3");
    assert_eq!(logs[0].span_id(), level_3.span_id);
    assert_eq!(logs[1].level(), Level::Error);
    assert_eq!(logs[1].trace_id(), "0".repeat(32));
    assert_eq!(
        logs[1].attribute("exception.type"),
        Some(&serde_json::json!("StepFailed"))
    );
}

#[tokio::test]
async fn test_threads_do_not_share_context() {
    let (telemetry, sink) = test_pipeline(base_config());

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let tracer = telemetry.tracer().clone();
            let logger = telemetry.logger().clone();
            std::thread::spawn(move || {
                let guard = tracer.scoped_span(format!("thread-{i}"));
                for n in 0..5 {
                    logger.bind("thread", i).info(format!("message {n}"));
                }
                guard.span().span_id().to_string()
            })
        })
        .collect();
    let span_ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    telemetry.shutdown().await;

    let logs = sink.logs();
    assert_eq!(logs.len(), 20);
    for record in &logs {
        let thread = record.attribute("thread").and_then(serde_json::Value::as_u64).unwrap();
        let index = usize::try_from(thread).unwrap();
        assert_eq!(record.span_id(), span_ids[index]);
    }
    assert_eq!(sink.spans().len(), 4);
    assert!(sink.spans().iter().all(SpanData::is_root));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_tasks_keep_their_span_across_awaits() {
    let (telemetry, sink) = test_pipeline(base_config());

    let tasks: Vec<_> = (0..3)
        .map(|i| {
            let tracer = telemetry.tracer().clone();
            let logger = telemetry.logger().clone();
            tokio::spawn(async move {
                tracer
                    .in_span_async(format!("task-{i}"), async {
                        let span_id = registry::current().unwrap().span_id().to_string();
                        for _ in 0..3 {
                            tokio::task::yield_now().await;
                            logger.bind("task", i).info("tick");
                        }
                        Ok::<_, StepFailed>(span_id)
                    })
                    .await
            })
        })
        .collect();

    let mut span_ids = Vec::new();
    for task in tasks {
        span_ids.push(task.await.unwrap().unwrap());
    }
    telemetry.shutdown().await;

    let logs: Vec<LogRecord> = sink.logs();
    assert_eq!(logs.len(), 9);
    for record in &logs {
        let task = record.attribute("task").and_then(serde_json::Value::as_u64).unwrap();
        assert_eq!(record.span_id(), span_ids[usize::try_from(task).unwrap()]);
    }
}

#[tokio::test]
async fn test_child_task_inherits_parent_span() {
    let (telemetry, sink) = test_pipeline(base_config());
    let tracer = telemetry.tracer().clone();

    let parent = tracer.start_span("request");
    let child_tracer = tracer.clone();
    registry::scope(async move {
        let child = child_tracer.start_span("db-query");
        child_tracer.end_span(&child).unwrap();
    })
    .await;
    tracer.end_span(&parent).unwrap();

    telemetry.shutdown().await;

    let spans = sink.spans();
    let query = span_named(&spans, "db-query");
    assert_eq!(query.parent_span_id.as_deref(), Some(parent.span_id().to_string().as_str()));
    assert_eq!(query.trace_id, parent.trace_id().to_string());
}

#[tokio::test]
async fn test_slow_backend_does_not_block_logging() {
    let sink = Arc::new(InMemorySink::new().with_delay(Duration::from_millis(200)));
    let mut config = base_config().with_batch_size(1);
    config.shutdown_timeout = Duration::from_millis(300);
    let telemetry = Telemetry::init(config, sink.clone()).unwrap();

    let started = std::time::Instant::now();
    for i in 0..50 {
        telemetry.logger().info(format!("fast {i}"));
    }
    assert!(started.elapsed() < Duration::from_millis(200));

    let report = telemetry.shutdown().await;
    assert!(!report.flush.is_complete());
    assert!(report.logs.dropped > 0);
}
