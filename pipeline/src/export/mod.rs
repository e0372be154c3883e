//! Export of log records and spans to a telemetry backend.
//!
//! The [`Sink`] trait is the contract with the network client; the
//! [`BatchExporter`] decouples call sites from it. Implementations:
//!
//! - [`OtlpHttpSink`] - OTLP/HTTP JSON client for a collector
//! - [`InMemorySink`] - records every export call, for tests and development

pub mod batch;
pub mod memory;
pub mod otlp;

pub use batch::{BatchConfig, BatchExporter, ExportStats, FlushOutcome};
pub use memory::InMemorySink;
pub use otlp::OtlpHttpSink;

use crate::models::{LogRecord, SpanData};
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Reasons an export call can fail.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExportError {
    /// The backend could not be reached.
    #[error("Network error: {0}")]
    Network(String),

    /// The backend answered but refused the batch.
    #[error("Backend rejected batch: {0}")]
    Rejected(String),

    /// The batch could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Outcome of a single export call.
pub type ExportResult = Result<(), ExportError>;

/// A remote destination for batches of records and spans.
///
/// Implementations must be thread-safe; the exporter calls them from a
/// background task and never concurrently for the same item kind.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Exports a batch of log records.
    async fn export(&self, batch: &[LogRecord]) -> ExportResult;

    /// Exports a batch of closed spans.
    async fn export_spans(&self, batch: &[SpanData]) -> ExportResult;
}

type ExportFuture<'a> = Pin<Box<dyn Future<Output = ExportResult> + Send + 'a>>;

/// Items a [`BatchExporter`] knows how to ship through a [`Sink`].
pub trait BatchItem: Send + Sync + Sized + 'static {
    /// Label used in diagnostics.
    const KIND: &'static str;

    /// Sends `batch` through the matching sink method.
    fn export_batch<'a>(sink: &'a dyn Sink, batch: &'a [Self]) -> ExportFuture<'a>;
}

impl BatchItem for LogRecord {
    const KIND: &'static str = "logs";

    fn export_batch<'a>(sink: &'a dyn Sink, batch: &'a [Self]) -> ExportFuture<'a> {
        sink.export(batch)
    }
}

impl BatchItem for SpanData {
    const KIND: &'static str = "spans";

    fn export_batch<'a>(sink: &'a dyn Sink, batch: &'a [Self]) -> ExportFuture<'a> {
        sink.export_spans(batch)
    }
}
