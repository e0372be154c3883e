//! Leveled logging facade.
//!
//! A [`Logger`] builds a [`RawRecord`] at the call site, drops it early when
//! it is below the configured level, enriches it once with the current trace
//! context, and hands the resulting [`LogRecord`] to every registered
//! [`RecordSink`].
//!
//! ```
//! use pipeline::facade::{Logger, MemorySink};
//! use pipeline::models::Level;
//! use std::sync::Arc;
//!
//! let memory = Arc::new(MemorySink::new());
//! let logger = Logger::builder("demo-app")
//!     .min_level(Level::Info)
//!     .sink(memory.clone())
//!     .build();
//!
//! logger.bind("channel", "demo").info("hello");
//! logger.debug("filtered");
//!
//! let records = memory.records();
//! assert_eq!(records.len(), 1);
//! assert_eq!(records[0].app_name(), "demo-app");
//! ```

use crate::enrich::Enricher;
use crate::export::BatchExporter;
use crate::models::{Level, Location, LogRecord, RawRecord};
use crate::span::short_type_name;
use serde::Serialize;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::warn;

/// Errors reported by a record sink.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The sink refused the record.
    #[error("Sink '{sink}' rejected record: {reason}")]
    Rejected {
        /// Sink name.
        sink: String,
        /// Why the record was refused.
        reason: String,
    },
}

/// Destination for enriched log records.
///
/// `emit` is called on the logging thread and must not block on I/O.
pub trait RecordSink: Send + Sync {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Accepts one record.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink cannot take the record.
    fn emit(&self, record: &LogRecord) -> Result<(), SinkError>;
}

/// Forwards records to a batching exporter.
#[derive(Debug, Clone)]
pub struct ExportSink {
    exporter: BatchExporter<LogRecord>,
}

impl ExportSink {
    /// Wraps an already started exporter.
    #[must_use]
    pub fn new(exporter: BatchExporter<LogRecord>) -> Self {
        Self { exporter }
    }

    /// The wrapped exporter.
    #[must_use]
    pub fn exporter(&self) -> &BatchExporter<LogRecord> {
        &self.exporter
    }
}

impl RecordSink for ExportSink {
    fn name(&self) -> &str {
        "export"
    }

    fn emit(&self, record: &LogRecord) -> Result<(), SinkError> {
        self.exporter.submit(record.clone());
        Ok(())
    }
}

/// Renders records through `tracing`, so whatever subscriber the binary
/// installed prints them.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleSink;

macro_rules! console_event {
    ($macro:ident, $record:expr, $location:expr) => {
        tracing::$macro!(
            target: "loglink::console",
            app = $record.app_name(),
            trace_id = $record.trace_id(),
            span_id = $record.span_id(),
            severity = $record.level().as_str(),
            location = %$location,
            "{}",
            $record.message()
        )
    };
}

impl RecordSink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    fn emit(&self, record: &LogRecord) -> Result<(), SinkError> {
        let loc = record.location();
        let location = match &loc.function {
            Some(function) => format!("{}:{}:{}", loc.module, function, loc.line),
            None => format!("{}:{}", loc.module, loc.line),
        };
        match record.level() {
            Level::Trace => console_event!(trace, record, location),
            Level::Debug => console_event!(debug, record, location),
            Level::Info | Level::Success => console_event!(info, record, location),
            Level::Warning => console_event!(warn, record, location),
            Level::Error | Level::Critical => console_event!(error, record, location),
        }
        Ok(())
    }
}

/// Collects records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<LogRecord>>,
    reject: bool,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sink that refuses every record.
    #[must_use]
    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::default()
        }
    }

    /// Records received so far.
    #[must_use]
    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl RecordSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn emit(&self, record: &LogRecord) -> Result<(), SinkError> {
        if self.reject {
            return Err(SinkError::Rejected {
                sink: self.name().to_string(),
                reason: "configured to reject".to_string(),
            });
        }
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}

struct LoggerCore {
    enricher: Enricher,
    min_level: Level,
    sinks: Vec<Arc<dyn RecordSink>>,
}

/// Builder for [`Logger`].
pub struct LoggerBuilder {
    app_name: String,
    min_level: Level,
    sinks: Vec<Arc<dyn RecordSink>>,
}

impl LoggerBuilder {
    /// Sets the minimum level. Defaults to `Info`.
    #[must_use]
    pub fn min_level(mut self, level: Level) -> Self {
        self.min_level = level;
        self
    }

    /// Registers a record sink. Sinks receive records in registration order.
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Builds the logger.
    #[must_use]
    pub fn build(self) -> Logger {
        Logger {
            core: Arc::new(LoggerCore {
                enricher: Enricher::new(self.app_name),
                min_level: self.min_level,
                sinks: self.sinks,
            }),
            bound: Arc::new(HashMap::new()),
            function: None,
        }
    }
}

/// Leveled, trace-aware logger handle.
///
/// Cloning is cheap. Handles derived with [`Logger::bind`] or
/// [`Logger::with_function`] share sinks and level with their origin.
#[derive(Clone)]
pub struct Logger {
    core: Arc<LoggerCore>,
    bound: Arc<HashMap<String, serde_json::Value>>,
    function: Option<Arc<str>>,
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("app_name", &self.core.enricher.app_name())
            .field("min_level", &self.core.min_level)
            .field("sinks", &self.core.sinks.len())
            .field("bound", &self.bound)
            .field("function", &self.function)
            .finish()
    }
}

impl Logger {
    /// Starts building a logger for the given application name.
    #[must_use]
    pub fn builder(app_name: impl Into<String>) -> LoggerBuilder {
        LoggerBuilder {
            app_name: app_name.into(),
            min_level: Level::Info,
            sinks: Vec::new(),
        }
    }

    /// Returns a derived logger that adds `key = value` to every record.
    #[must_use]
    pub fn bind(&self, key: impl Into<String>, value: impl Serialize) -> Self {
        let mut bound = (*self.bound).clone();
        bound.insert(
            key.into(),
            serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
        );
        Self {
            core: Arc::clone(&self.core),
            bound: Arc::new(bound),
            function: self.function.clone(),
        }
    }

    /// Returns a derived logger whose records name `function` as their origin.
    #[must_use]
    pub fn with_function(&self, function: impl Into<String>) -> Self {
        Self {
            core: Arc::clone(&self.core),
            bound: Arc::clone(&self.bound),
            function: Some(Arc::from(function.into())),
        }
    }

    /// Whether records at `level` would be delivered.
    #[must_use]
    pub fn is_enabled(&self, level: Level) -> bool {
        level >= self.core.min_level
    }

    /// The configured minimum level.
    #[must_use]
    pub fn min_level(&self) -> Level {
        self.core.min_level
    }

    /// Logs `message` at `level`.
    #[track_caller]
    pub fn log(&self, level: Level, message: impl Into<String>) {
        if !self.is_enabled(level) {
            return;
        }
        let raw = self.raw(level, message.into(), std::panic::Location::caller());
        self.dispatch(raw);
    }

    /// Logs at `Trace`.
    #[track_caller]
    pub fn trace(&self, message: impl Into<String>) {
        self.log(Level::Trace, message);
    }

    /// Logs at `Debug`.
    #[track_caller]
    pub fn debug(&self, message: impl Into<String>) {
        self.log(Level::Debug, message);
    }

    /// Logs at `Info`.
    #[track_caller]
    pub fn info(&self, message: impl Into<String>) {
        self.log(Level::Info, message);
    }

    /// Logs at `Success`.
    #[track_caller]
    pub fn success(&self, message: impl Into<String>) {
        self.log(Level::Success, message);
    }

    /// Logs at `Warning`.
    #[track_caller]
    pub fn warning(&self, message: impl Into<String>) {
        self.log(Level::Warning, message);
    }

    /// Logs at `Error`.
    #[track_caller]
    pub fn error(&self, message: impl Into<String>) {
        self.log(Level::Error, message);
    }

    /// Logs at `Critical`.
    #[track_caller]
    pub fn critical(&self, message: impl Into<String>) {
        self.log(Level::Critical, message);
    }

    /// Logs `message` at `Error` with the error's details attached.
    ///
    /// Adds `exception.type`, `exception.message`, `exception.chain` (the
    /// messages of all sources) and `exception.stacktrace`. The backtrace is
    /// captured regardless of `RUST_BACKTRACE`.
    #[track_caller]
    pub fn exception<E: std::error::Error + ?Sized>(&self, message: impl Into<String>, err: &E) {
        if !self.is_enabled(Level::Error) {
            return;
        }
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }

        let mut raw = self
            .raw(Level::Error, message.into(), std::panic::Location::caller())
            .with_attribute("exception.type", short_type_name::<E>())
            .with_attribute("exception.message", err.to_string())
            .with_attribute("exception.chain", chain);

        let backtrace = Backtrace::force_capture();
        if backtrace.status() == BacktraceStatus::Captured {
            raw = raw.with_attribute("exception.stacktrace", backtrace.to_string());
        }
        self.dispatch(raw);
    }

    fn raw(&self, level: Level, message: String, caller: &std::panic::Location<'_>) -> RawRecord {
        let location = Location::from_caller(caller, self.function.as_deref());
        let mut raw = RawRecord::new(level, message, location);
        raw.attributes.extend(
            self.bound
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        raw
    }

    fn dispatch(&self, raw: RawRecord) {
        let record = self.core.enricher.enrich(raw);
        for sink in &self.core.sinks {
            if let Err(err) = sink.emit(&record) {
                warn!(sink = sink.name(), error = %err, "Record sink failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SPAN_ID_KEY, TRACE_ID_KEY};
    use crate::span::Tracer;
    use std::fmt;

    fn logger_with(level: Level) -> (Logger, Arc<MemorySink>) {
        let memory = Arc::new(MemorySink::new());
        let logger = Logger::builder("test-app")
            .min_level(level)
            .sink(memory.clone())
            .build();
        (logger, memory)
    }

    #[derive(Debug)]
    struct Inner;

    impl fmt::Display for Inner {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "disk full")
        }
    }

    impl std::error::Error for Inner {}

    #[derive(Debug)]
    struct Outer(Inner);

    impl fmt::Display for Outer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "write failed")
        }
    }

    impl std::error::Error for Outer {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[derive(Debug)]
    struct Tagged<E>(&'static str, E);

    impl<E: fmt::Display> fmt::Display for Tagged<E> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}: {}", self.0, self.1)
        }
    }

    impl<E: fmt::Debug + fmt::Display> std::error::Error for Tagged<E> {}

    #[test]
    fn test_level_filter() {
        let (logger, memory) = logger_with(Level::Warning);

        logger.info("dropped");
        logger.success("dropped");
        logger.warning("kept");
        logger.critical("kept too");

        let levels: Vec<Level> = memory.records().iter().map(LogRecord::level).collect();
        assert_eq!(levels, vec![Level::Warning, Level::Critical]);
    }

    #[test]
    fn test_all_levels_pass_at_trace() {
        let (logger, memory) = logger_with(Level::Trace);

        logger.trace("t");
        logger.debug("d");
        logger.info("i");
        logger.success("s");
        logger.warning("w");
        logger.error("e");
        logger.critical("c");

        assert_eq!(memory.records().len(), 7);
    }

    #[test]
    fn test_records_outside_span_carry_sentinels() {
        let (logger, memory) = logger_with(Level::Info);
        logger.info("no span");

        let record = &memory.records()[0];
        assert_eq!(record.trace_id(), "0".repeat(32));
        assert_eq!(record.span_id(), "0".repeat(16));
        assert_eq!(record.app_name(), "test-app");
    }

    #[test]
    fn test_records_inside_span_carry_its_ids() {
        let (logger, memory) = logger_with(Level::Info);
        let tracer = Tracer::new("svc");

        let guard = tracer.scoped_span("work");
        logger.info("inside");
        let trace_id = guard.span().trace_id().to_string();
        let span_id = guard.span().span_id().to_string();
        drop(guard);

        let record = &memory.records()[0];
        assert_eq!(record.trace_id(), trace_id);
        assert_eq!(record.span_id(), span_id);
    }

    #[test]
    fn test_bind_is_scoped_to_derived_logger() {
        let (logger, memory) = logger_with(Level::Info);
        let channel = logger.bind("channel", "demo").bind("attempt", 2);

        channel.info("bound");
        logger.info("plain");

        let records = memory.records();
        assert_eq!(records[0].attribute("channel"), Some(&serde_json::json!("demo")));
        assert_eq!(records[0].attribute("attempt"), Some(&serde_json::json!(2)));
        assert!(records[1].attribute("channel").is_none());
    }

    #[test]
    fn test_bound_ids_cannot_spoof_context() {
        let (logger, memory) = logger_with(Level::Info);
        logger
            .bind(TRACE_ID_KEY, "spoofed")
            .bind(SPAN_ID_KEY, "spoofed")
            .info("x");

        let record = &memory.records()[0];
        assert_eq!(record.trace_id(), "0".repeat(32));
        assert_eq!(record.span_id(), "0".repeat(16));
    }

    #[test]
    fn test_call_site_location() {
        let (logger, memory) = logger_with(Level::Info);
        let line = line!() + 1;
        logger.with_function("handler").info("here");

        let location = memory.records()[0].location().clone();
        assert_eq!(location.line, line);
        assert!(location.module.ends_with("facade.rs"));
        assert_eq!(location.function.as_deref(), Some("handler"));
    }

    #[test]
    fn test_exception_attributes() {
        let (logger, memory) = logger_with(Level::Info);
        logger.exception("saving failed", &Outer(Inner));

        let record = &memory.records()[0];
        assert_eq!(record.level(), Level::Error);
        assert_eq!(record.message(), "saving failed");
        assert_eq!(record.attribute("exception.type"), Some(&serde_json::json!("Outer")));
        assert_eq!(
            record.attribute("exception.message"),
            Some(&serde_json::json!("write failed"))
        );
        assert_eq!(
            record.attribute("exception.chain"),
            Some(&serde_json::json!(["disk full"]))
        );
    }

    #[test]
    fn test_exception_captures_stacktrace() {
        let (logger, memory) = logger_with(Level::Info);
        logger.exception("saving failed", &Inner);

        let stacktrace = memory.records()[0]
            .attribute("exception.stacktrace")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);
        assert!(stacktrace.is_some_and(|trace| !trace.is_empty()));
    }

    #[test]
    fn test_exception_type_of_boxed_and_generic_errors() {
        let (logger, memory) = logger_with(Level::Info);

        let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(Inner);
        logger.exception("boxed", &*boxed);
        logger.exception("generic", &Tagged("io", Inner));

        let records = memory.records();
        assert_eq!(records[0].attribute("exception.type"), Some(&serde_json::json!("Error")));
        assert_eq!(records[1].attribute("exception.type"), Some(&serde_json::json!("Tagged")));
    }

    #[test]
    fn test_failing_sink_does_not_block_others() {
        let memory = Arc::new(MemorySink::new());
        let logger = Logger::builder("app")
            .sink(Arc::new(MemorySink::rejecting()))
            .sink(memory.clone())
            .build();

        logger.info("still delivered");

        assert_eq!(memory.records().len(), 1);
    }

    #[test]
    fn test_console_sink_accepts_every_level() {
        let (logger, memory) = logger_with(Level::Trace);
        for level in [
            Level::Trace,
            Level::Debug,
            Level::Info,
            Level::Success,
            Level::Warning,
            Level::Error,
            Level::Critical,
        ] {
            logger.with_function("render").log(level, "render me");
        }

        for record in memory.records() {
            assert!(ConsoleSink.emit(&record).is_ok());
        }
    }

    #[tokio::test]
    async fn test_export_sink_submits_to_exporter() {
        use crate::export::{BatchConfig, InMemorySink};
        use std::time::Duration;

        let backend = Arc::new(InMemorySink::new());
        let exporter = BatchExporter::<LogRecord>::start(backend.clone(), BatchConfig::default());
        let logger = Logger::builder("app")
            .sink(Arc::new(ExportSink::new(exporter.clone())))
            .build();

        logger.info("one");
        assert_eq!(exporter.queued(), 1);

        exporter.shutdown(Duration::from_secs(1)).await;
        logger.info("after shutdown");

        assert_eq!(backend.logs().len(), 1);
        assert_eq!(backend.logs()[0].message(), "one");
        assert_eq!(exporter.stats().dropped, 1);
    }
}
