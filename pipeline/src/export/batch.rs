//! Bounded, asynchronous batching in front of a [`Sink`].
//!
//! `submit` only touches an in-memory queue, so logging and span-closing call
//! sites never wait on the network. A background Tokio task flushes the queue
//! whenever a full batch is available or the flush interval elapses, retries
//! failed batches with exponential backoff, and drops them once the retry
//! budget is spent. Export failures are only visible through diagnostics and
//! [`ExportStats`].
//!
//! Overflow policy: when the queue is full the oldest queued item is dropped.

use super::{BatchItem, Sink};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Smallest flush interval the worker accepts; a zero period cannot tick.
pub const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(1);

/// Tuning knobs for a [`BatchExporter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    /// Maximum number of items per export call.
    pub batch_size: usize,
    /// Maximum number of items waiting in the queue.
    pub max_queue_size: usize,
    /// Interval between timer-driven flushes.
    pub flush_interval: Duration,
    /// Retries after the first failed attempt of a batch.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on every further retry.
    pub initial_backoff: Duration,
    /// Upper bound for the retry delay.
    pub max_backoff: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 512,
            max_queue_size: 2048,
            flush_interval: Duration::from_secs(5),
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Snapshot of an exporter's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportStats {
    /// Items acknowledged by the sink.
    pub exported: u64,
    /// Items lost to overflow, exhausted retries, shutdown or flush timeout.
    pub dropped: u64,
    /// Batches dropped after exhausting their retries.
    pub failed_batches: u64,
    /// Retry attempts made.
    pub retries: u64,
}

/// Result of a forced flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Every queued item was handed to the sink before the deadline.
    Completed,
    /// The deadline passed; the remaining queued items were discarded.
    TimedOut {
        /// Number of items discarded from the queue.
        discarded: usize,
    },
}

#[derive(Debug, Default)]
struct Counters {
    exported: AtomicU64,
    dropped: AtomicU64,
    failed_batches: AtomicU64,
    retries: AtomicU64,
}

#[derive(Clone, Copy)]
enum DrainMode {
    FullBatches,
    All,
}

struct Shared<T> {
    sink: Arc<dyn Sink>,
    config: BatchConfig,
    queue: Mutex<VecDeque<T>>,
    export_lock: tokio::sync::Mutex<()>,
    wake: Notify,
    closed: AtomicBool,
    counters: Counters,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: BatchItem> Shared<T> {
    fn queue(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn count_dropped(&self, n: usize) {
        self.counters.dropped.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Exports queued items in submission order, one batch at a time.
    async fn drain(&self, mode: DrainMode) {
        let _exporting = self.export_lock.lock().await;
        loop {
            let batch: Vec<T> = {
                let mut queue = self.queue();
                let ready = match mode {
                    DrainMode::FullBatches => queue.len() >= self.config.batch_size,
                    DrainMode::All => !queue.is_empty(),
                };
                if !ready {
                    break;
                }
                let n = queue.len().min(self.config.batch_size);
                queue.drain(..n).collect()
            };

            let mut in_flight = InFlight {
                shared: self,
                len: batch.len(),
                settled: false,
            };
            self.export_with_retry(&batch).await;
            in_flight.settled = true;
        }
    }

    async fn export_with_retry(&self, batch: &[T]) {
        let mut backoff = self.config.initial_backoff;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                self.counters.retries.fetch_add(1, Ordering::Relaxed);
                debug!(
                    kind = T::KIND,
                    attempt,
                    delay_ms = backoff.as_millis() as u64,
                    "Retrying batch export"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(self.config.max_backoff);
            }

            match T::export_batch(self.sink.as_ref(), batch).await {
                Ok(()) => {
                    self.counters
                        .exported
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    if attempt > 0 {
                        info!(kind = T::KIND, attempt, "Batch exported after retry");
                    }
                    return;
                }
                Err(e) => {
                    warn!(
                        kind = T::KIND,
                        attempt,
                        batch_size = batch.len(),
                        error = %e,
                        "Batch export failed"
                    );
                }
            }
        }

        self.counters.failed_batches.fetch_add(1, Ordering::Relaxed);
        self.count_dropped(batch.len());
        warn!(
            kind = T::KIND,
            max_retries = self.config.max_retries,
            dropped = batch.len(),
            "Dropping batch after exhausting retries"
        );
    }

    fn discard_queue(&self) -> usize {
        let discarded = {
            let mut queue = self.queue();
            let n = queue.len();
            queue.clear();
            n
        };
        self.count_dropped(discarded);
        discarded
    }

    fn stop_worker(&self) {
        self.closed.store(true, Ordering::Release);
        self.wake.notify_one();
    }
}

/// Counts a batch as dropped if its export future is cancelled midway.
struct InFlight<'a, T: BatchItem> {
    shared: &'a Shared<T>,
    len: usize,
    settled: bool,
}

impl<T: BatchItem> Drop for InFlight<'_, T> {
    fn drop(&mut self) {
        if !self.settled {
            self.shared.count_dropped(self.len);
        }
    }
}

async fn run_worker<T: BatchItem>(shared: Arc<Shared<T>>) {
    let period = shared.config.flush_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => shared.drain(DrainMode::All).await,
            () = shared.wake.notified() => {
                if shared.closed.load(Ordering::Acquire) {
                    break;
                }
                shared.drain(DrainMode::FullBatches).await;
            }
        }
    }
    debug!(kind = T::KIND, "Export worker stopped");
}

/// Stops the worker when the last exporter handle goes away.
struct WorkerStop<T: BatchItem>(Arc<Shared<T>>);

impl<T: BatchItem> Drop for WorkerStop<T> {
    fn drop(&mut self) {
        self.0.stop_worker();
    }
}

/// Non-blocking batching front-end for a [`Sink`].
///
/// Cheap to clone; clones share the queue, the worker and the counters.
///
/// # Example
///
/// ```
/// use pipeline::export::{BatchConfig, BatchExporter, FlushOutcome, InMemorySink};
/// use pipeline::models::LogRecord;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let sink = Arc::new(InMemorySink::new());
/// let exporter: BatchExporter<LogRecord> = BatchExporter::start(sink.clone(), BatchConfig::default());
///
/// assert_eq!(exporter.flush_now(Duration::from_secs(1)).await, FlushOutcome::Completed);
/// assert_eq!(sink.log_call_count(), 0);
/// # }
/// ```
pub struct BatchExporter<T: BatchItem> {
    shared: Arc<Shared<T>>,
    _stop: Arc<WorkerStop<T>>,
    _item: PhantomData<fn(T)>,
}

impl<T: BatchItem> Clone for BatchExporter<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _stop: Arc::clone(&self._stop),
            _item: PhantomData,
        }
    }
}

impl<T: BatchItem> std::fmt::Debug for BatchExporter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchExporter")
            .field("kind", &T::KIND)
            .field("config", &self.shared.config)
            .field("queued", &self.queued())
            .finish_non_exhaustive()
    }
}

impl<T: BatchItem> BatchExporter<T> {
    /// Creates the exporter and spawns its flush worker.
    ///
    /// `batch_size` and `max_queue_size` are clamped to at least 1, and
    /// `flush_interval` to at least one millisecond.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    #[must_use]
    pub fn start(sink: Arc<dyn Sink>, mut config: BatchConfig) -> Self {
        config.batch_size = config.batch_size.max(1);
        config.max_queue_size = config.max_queue_size.max(1);
        config.flush_interval = config.flush_interval.max(MIN_FLUSH_INTERVAL);

        let shared = Arc::new(Shared {
            sink,
            config,
            queue: Mutex::new(VecDeque::new()),
            export_lock: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
            worker: Mutex::new(None),
        });

        let handle = tokio::spawn(run_worker(Arc::clone(&shared)));
        *shared.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        Self {
            _stop: Arc::new(WorkerStop(Arc::clone(&shared))),
            shared,
            _item: PhantomData,
        }
    }

    /// Queues an item for export. Never blocks on I/O and never fails.
    ///
    /// If the queue is full the oldest queued item is dropped. After
    /// [`BatchExporter::shutdown`] every submitted item is dropped.
    pub fn submit(&self, item: T) {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            shared.count_dropped(1);
            debug!(kind = T::KIND, "Exporter is shut down, dropping item");
            return;
        }

        let (len, evicted) = {
            let mut queue = shared.queue();
            let evicted = if queue.len() >= shared.config.max_queue_size {
                queue.pop_front().is_some()
            } else {
                false
            };
            queue.push_back(item);
            (queue.len(), evicted)
        };

        if evicted {
            shared.count_dropped(1);
            debug!(kind = T::KIND, "Export queue full, dropped oldest item");
        }
        if len >= shared.config.batch_size {
            shared.wake.notify_one();
        }
    }

    /// Exports everything queued right now, waiting at most `timeout`.
    ///
    /// On timeout the items still queued are discarded and counted as
    /// dropped, as is a batch whose export was cut short.
    pub async fn flush_now(&self, timeout: Duration) -> FlushOutcome {
        match tokio::time::timeout(timeout, self.shared.drain(DrainMode::All)).await {
            Ok(()) => FlushOutcome::Completed,
            Err(_) => {
                let discarded = self.shared.discard_queue();
                warn!(
                    kind = T::KIND,
                    discarded,
                    timeout_ms = timeout.as_millis() as u64,
                    "Flush timed out, discarding queued items"
                );
                FlushOutcome::TimedOut { discarded }
            }
        }
    }

    /// Stops accepting items, flushes within `timeout`, and stops the worker.
    ///
    /// Calling it again is harmless.
    pub async fn shutdown(&self, timeout: Duration) -> FlushOutcome {
        self.shared.closed.store(true, Ordering::Release);
        let outcome = self.flush_now(timeout).await;
        self.shared.stop_worker();

        let worker = self
            .shared
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut handle) = worker {
            if tokio::time::timeout(timeout, &mut handle).await.is_err() {
                handle.abort();
            }
        }

        let stats = self.stats();
        debug!(
            kind = T::KIND,
            exported = stats.exported,
            dropped = stats.dropped,
            "Exporter shut down"
        );
        outcome
    }

    /// Returns true once [`BatchExporter::shutdown`] has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Number of items waiting in the queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.queue().len()
    }

    /// Current counter values.
    #[must_use]
    pub fn stats(&self) -> ExportStats {
        let c = &self.shared.counters;
        ExportStats {
            exported: c.exported.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            failed_batches: c.failed_batches.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
        }
    }

    /// The effective configuration.
    #[must_use]
    pub fn config(&self) -> &BatchConfig {
        &self.shared.config
    }
}
