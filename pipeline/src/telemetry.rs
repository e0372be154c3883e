//! Pipeline lifecycle.
//!
//! [`Telemetry`] owns everything one configured pipeline needs: the tracer,
//! the logger and the two batching exporters behind them. It is an explicit
//! value rather than process-wide state; re-initializing means shutting the
//! old value down and building a new one.

use crate::config::{ConfigError, PipelineConfig};
use crate::export::{BatchExporter, ExportError, ExportStats, FlushOutcome, OtlpHttpSink, Sink};
use crate::facade::{ConsoleSink, ExportSink, Logger, RecordSink};
use crate::models::{LogRecord, SpanData};
use crate::span::Tracer;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Errors that can occur while setting up a pipeline.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The export client could not be created.
    #[error("Exporter setup failed: {0}")]
    Export(#[from] ExportError),
}

/// Outcome of flushing both exporters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    /// Log exporter outcome.
    pub logs: FlushOutcome,
    /// Span exporter outcome.
    pub spans: FlushOutcome,
}

impl FlushReport {
    /// Returns true if both exporters drained before the deadline.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.logs == FlushOutcome::Completed && self.spans == FlushOutcome::Completed
    }
}

/// Final state of a pipeline after shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// How the final flush went.
    pub flush: FlushReport,
    /// Log exporter counters at shutdown.
    pub logs: ExportStats,
    /// Span exporter counters at shutdown.
    pub spans: ExportStats,
}

/// A running logging and tracing pipeline.
#[derive(Debug)]
pub struct Telemetry {
    config: PipelineConfig,
    tracer: Tracer,
    logger: Logger,
    log_exporter: BatchExporter<LogRecord>,
    span_exporter: BatchExporter<SpanData>,
}

impl Telemetry {
    /// Builds a pipeline that exports to `sink`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn init(config: PipelineConfig, sink: Arc<dyn Sink>) -> Result<Self, TelemetryError> {
        Self::init_with_sinks(config, sink, Vec::new())
    }

    /// Builds a pipeline that exports over OTLP/HTTP to `config.endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the HTTP client
    /// cannot be created.
    pub fn init_otlp(config: PipelineConfig) -> Result<Self, TelemetryError> {
        config.validate_config()?;
        let sink = OtlpHttpSink::new(
            config.endpoint.clone(),
            config.service_name.clone(),
            config.shutdown_timeout.max(Duration::from_secs(1)),
        )?;
        Self::init(config, Arc::new(sink))
    }

    /// Builds a pipeline with additional record sinks.
    ///
    /// The extra sinks receive every record after the export sink and the
    /// console sink (if enabled).
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn init_with_sinks(
        config: PipelineConfig,
        sink: Arc<dyn Sink>,
        extra: Vec<Arc<dyn RecordSink>>,
    ) -> Result<Self, TelemetryError> {
        config.validate_config()?;

        let batch = config.batch_config();
        let log_exporter = BatchExporter::<LogRecord>::start(Arc::clone(&sink), batch.clone());
        let span_exporter = BatchExporter::<SpanData>::start(sink, batch);

        let tracer = Tracer::new(config.service_name.clone()).with_exporter(span_exporter.clone());

        let mut builder = Logger::builder(config.app_name.clone())
            .min_level(config.min_level)
            .sink(Arc::new(ExportSink::new(log_exporter.clone())));
        if config.console {
            builder = builder.sink(Arc::new(ConsoleSink));
        }
        for sink in extra {
            builder = builder.sink(sink);
        }

        info!(
            service = %config.service_name,
            app = %config.app_name,
            endpoint = %config.endpoint,
            min_level = %config.min_level,
            "Telemetry initialized"
        );

        Ok(Self {
            logger: builder.build(),
            tracer,
            config,
            log_exporter,
            span_exporter,
        })
    }

    /// The configuration this pipeline was built from.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The tracer; clones share the span exporter.
    #[must_use]
    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// The root logger.
    #[must_use]
    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Log exporter counters.
    #[must_use]
    pub fn log_stats(&self) -> ExportStats {
        self.log_exporter.stats()
    }

    /// Span exporter counters.
    #[must_use]
    pub fn span_stats(&self) -> ExportStats {
        self.span_exporter.stats()
    }

    /// Exports everything buffered so far, bounded by the shutdown timeout.
    pub async fn flush(&self) -> FlushReport {
        let timeout = self.config.shutdown_timeout;
        let (logs, spans) = tokio::join!(
            self.log_exporter.flush_now(timeout),
            self.span_exporter.flush_now(timeout)
        );
        FlushReport { logs, spans }
    }

    /// Flushes both exporters and stops their workers.
    pub async fn shutdown(self) -> ShutdownReport {
        let timeout = self.config.shutdown_timeout;
        let (logs, spans) = tokio::join!(
            self.log_exporter.shutdown(timeout),
            self.span_exporter.shutdown(timeout)
        );
        let report = ShutdownReport {
            flush: FlushReport { logs, spans },
            logs: self.log_exporter.stats(),
            spans: self.span_exporter.stats(),
        };

        if report.flush.is_complete() {
            info!(
                logs_exported = report.logs.exported,
                spans_exported = report.spans.exported,
                "Telemetry shut down"
            );
        } else {
            warn!(
                logs_dropped = report.logs.dropped,
                spans_dropped = report.spans.dropped,
                "Telemetry shut down before all data was exported"
            );
        }
        report
    }

    /// Shuts this pipeline down and replaces it with a freshly built one.
    ///
    /// # Errors
    ///
    /// Returns an error if the new configuration is invalid. The old pipeline
    /// is shut down either way.
    pub async fn reinit(
        self,
        config: PipelineConfig,
        sink: Arc<dyn Sink>,
    ) -> Result<(Self, ShutdownReport), TelemetryError> {
        let report = self.shutdown().await;
        let telemetry = Self::init(config, sink)?;
        Ok((telemetry, report))
    }
}
