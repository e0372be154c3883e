//! In-memory sink.
//!
//! Keeps every successfully exported batch in memory. Useful for tests and
//! local development; it can also simulate a flaky or slow backend.

use super::{ExportError, ExportResult, Sink};
use crate::models::{LogRecord, SpanData};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Sink that stores exported batches instead of sending them anywhere.
///
/// # Example
///
/// ```
/// use pipeline::export::{InMemorySink, Sink};
///
/// # tokio_test::block_on(async {
/// let sink = InMemorySink::new();
/// sink.export(&[]).await.unwrap();
/// assert_eq!(sink.log_call_count(), 1);
/// # });
/// ```
#[derive(Debug, Default)]
pub struct InMemorySink {
    logs: Arc<RwLock<Vec<Vec<LogRecord>>>>,
    spans: Arc<RwLock<Vec<Vec<SpanData>>>>,
    fail_first: usize,
    attempts: AtomicUsize,
    failures: AtomicUsize,
    delay: Option<Duration>,
}

impl InMemorySink {
    /// Creates an empty sink that accepts every batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the first `n` export calls (of any kind) fail with a network error.
    #[must_use]
    pub fn failing_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    /// Delays every export call by `delay`.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    async fn attempt(&self) -> ExportResult {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(ExportError::Network(format!(
                "simulated failure {} of {}",
                attempt + 1,
                self.fail_first
            )));
        }
        Ok(())
    }

    /// Every successfully exported log batch, in export order.
    #[must_use]
    pub fn log_batches(&self) -> Vec<Vec<LogRecord>> {
        self.logs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Every successfully exported span batch, in export order.
    #[must_use]
    pub fn span_batches(&self) -> Vec<Vec<SpanData>> {
        self.spans
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// All exported log records, flattened.
    #[must_use]
    pub fn logs(&self) -> Vec<LogRecord> {
        self.log_batches().into_iter().flatten().collect()
    }

    /// All exported spans, flattened.
    #[must_use]
    pub fn spans(&self) -> Vec<SpanData> {
        self.span_batches().into_iter().flatten().collect()
    }

    /// Number of successful log export calls.
    #[must_use]
    pub fn log_call_count(&self) -> usize {
        self.logs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Number of successful span export calls.
    #[must_use]
    pub fn span_call_count(&self) -> usize {
        self.spans.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Number of export calls that were failed on purpose.
    #[must_use]
    pub fn failed_attempts(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for InMemorySink {
    async fn export(&self, batch: &[LogRecord]) -> ExportResult {
        self.attempt().await?;
        self.logs
            .write()
            .map_err(|_| ExportError::Rejected("log buffer lock poisoned".to_string()))?
            .push(batch.to_vec());
        Ok(())
    }

    async fn export_spans(&self, batch: &[SpanData]) -> ExportResult {
        self.attempt().await?;
        self.spans
            .write()
            .map_err(|_| ExportError::Rejected("span buffer lock poisoned".to_string()))?
            .push(batch.to_vec());
        Ok(())
    }
}
