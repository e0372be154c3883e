//! Span lifecycle management.
//!
//! A [`Tracer`] opens spans as children of the current span, registers them
//! with the [`registry`], and on close records the outcome and hands a
//! [`SpanData`] snapshot to the span exporter.
//!
//! Every opened span is closed exactly once. The preferred way to get that
//! guarantee is a scoped acquisition:
//!
//! ```
//! use pipeline::span::Tracer;
//!
//! let tracer = Tracer::new("demo-service");
//!
//! let result: Result<u32, std::num::ParseIntError> = tracer.in_span("parse", || "42".parse());
//! assert_eq!(result.unwrap(), 42);
//!
//! {
//!     let guard = tracer.scoped_span("block");
//!     assert_eq!(pipeline::registry::current().unwrap().span_id(), guard.span().span_id());
//! }
//! assert!(pipeline::registry::current().is_none());
//! ```

use crate::export::BatchExporter;
use crate::models::{SpanData, SpanEvent, SpanId, SpanStatus, TraceId};
use crate::registry::{self, ContextError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;
use tracing::{error, trace};

/// Errors that can occur when closing a span.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpanError {
    /// The span was already closed.
    #[error("Span '{0}' is already closed")]
    AlreadyClosed(String),

    /// An ancestor was closed while a descendant was still current.
    #[error("Span '{name}' closed out of order while '{current}' is still open")]
    OutOfOrder {
        /// The span being closed.
        name: String,
        /// The span that is still current.
        current: String,
    },

    /// The registry had no span to pop.
    #[error(transparent)]
    Context(ContextError),
}

#[derive(Debug, Default)]
struct SpanState {
    end_time: Option<DateTime<Utc>>,
    status: SpanStatus,
    events: Vec<SpanEvent>,
    attributes: HashMap<String, serde_json::Value>,
}

#[derive(Debug)]
struct SpanInner {
    name: String,
    trace_id: TraceId,
    span_id: SpanId,
    parent_span_id: Option<SpanId>,
    parent: Option<Weak<SpanInner>>,
    start_time: DateTime<Utc>,
    state: Mutex<SpanState>,
}

/// Handle to a live span.
///
/// Cloning the handle is cheap; all clones refer to the same span. The parent
/// link is a weak back-pointer and never keeps the parent alive.
#[derive(Debug, Clone)]
pub struct Span {
    inner: Arc<SpanInner>,
}

impl Span {
    fn new(name: impl Into<String>, parent: Option<&Span>) -> Self {
        let trace_id = parent.map_or_else(TraceId::random, Span::trace_id);
        Self {
            inner: Arc::new(SpanInner {
                name: name.into(),
                trace_id,
                span_id: SpanId::random(),
                parent_span_id: parent.map(Span::span_id),
                parent: parent.map(|p| Arc::downgrade(&p.inner)),
                start_time: Utc::now(),
                state: Mutex::new(SpanState::default()),
            }),
        }
    }

    /// Creates an open root span that is not registered anywhere.
    #[must_use]
    pub fn root(name: impl Into<String>) -> Self {
        Self::new(name, None)
    }

    /// Creates an open child span that is not registered anywhere.
    #[must_use]
    pub fn child_of(name: impl Into<String>, parent: &Span) -> Self {
        Self::new(name, Some(parent))
    }

    fn state(&self) -> MutexGuard<'_, SpanState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The span name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The trace this span belongs to.
    #[must_use]
    pub fn trace_id(&self) -> TraceId {
        self.inner.trace_id
    }

    /// This span's id.
    #[must_use]
    pub fn span_id(&self) -> SpanId {
        self.inner.span_id
    }

    /// The parent's span id, `None` for root spans.
    #[must_use]
    pub fn parent_span_id(&self) -> Option<SpanId> {
        self.inner.parent_span_id
    }

    /// The parent span, if it is still alive.
    #[must_use]
    pub fn parent(&self) -> Option<Span> {
        self.inner
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| Span { inner })
    }

    /// When the span was opened.
    #[must_use]
    pub fn start_time(&self) -> DateTime<Utc> {
        self.inner.start_time
    }

    /// When the span was closed, `None` while open.
    #[must_use]
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.state().end_time
    }

    /// Returns true until the span is closed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state().end_time.is_none()
    }

    /// Current status (`Unset` while open).
    #[must_use]
    pub fn status(&self) -> SpanStatus {
        self.state().status
    }

    /// Events recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<SpanEvent> {
        self.state().events.clone()
    }

    /// Sets an attribute on the span.
    pub fn set_attribute(&self, key: impl Into<String>, value: impl Serialize) {
        self.state().attributes.insert(
            key.into(),
            serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
        );
    }

    /// Records an event on the span.
    pub fn add_event(&self, event: SpanEvent) {
        self.state().events.push(event);
    }

    /// Transitions `OPEN -> CLOSED`. Fails if the span is already closed.
    fn close(&self, failure: Option<SpanEvent>) -> Result<(), SpanError> {
        let mut state = self.state();
        if state.end_time.is_some() {
            return Err(SpanError::AlreadyClosed(self.inner.name.clone()));
        }
        state.end_time = Some(Utc::now());
        state.status = match failure {
            Some(event) => {
                state.events.push(event);
                SpanStatus::Error
            }
            None => SpanStatus::Ok,
        };
        Ok(())
    }

    fn to_data(&self, service: &str) -> SpanData {
        let state = self.state();
        SpanData {
            trace_id: self.inner.trace_id.to_string(),
            span_id: self.inner.span_id.to_string(),
            parent_span_id: self.inner.parent_span_id.map(|id| id.to_string()),
            name: self.inner.name.clone(),
            service: service.to_string(),
            status: state.status,
            start_time: self.inner.start_time,
            end_time: state.end_time.unwrap_or_else(Utc::now),
            attributes: state.attributes.clone(),
            events: state.events.clone(),
        }
    }
}

/// Short name of a type: last path segment, ignoring closure markers,
/// generic arguments, references and trait-object bounds.
pub(crate) fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();

    let mut depth = 0usize;
    let mut outer = String::with_capacity(full.len());
    for c in full.chars() {
        match c {
            '<' => depth += 1,
            '>' => depth = depth.saturating_sub(1),
            _ if depth == 0 => outer.push(c),
            _ => {}
        }
    }

    let head = outer.split(" + ").next().unwrap_or_default();
    let head = head
        .trim_start_matches('&')
        .trim_start_matches("mut ")
        .trim_start_matches("dyn ");

    head.split("::")
        .filter(|segment| !segment.is_empty() && !segment.starts_with('{'))
        .last()
        .unwrap_or("anonymous")
        .to_string()
}

fn exception_event<E: std::error::Error + ?Sized>(err: &E) -> SpanEvent {
    SpanEvent::exception(&short_type_name::<E>(), err.to_string()).with_attribute("exception.escaped", true)
}

/// Opens and closes spans and forwards closed spans to the exporter.
///
/// The tracer is an explicit context object: cloning it is cheap and every
/// clone shares the same exporter.
#[derive(Clone)]
pub struct Tracer {
    service: Arc<str>,
    exporter: Option<BatchExporter<SpanData>>,
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("service", &self.service)
            .field("exporting", &self.exporter.is_some())
            .finish()
    }
}

impl Tracer {
    /// Creates a tracer that records spans without exporting them.
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into().into(),
            exporter: None,
        }
    }

    /// Sends every closed span to `exporter`.
    #[must_use]
    pub fn with_exporter(mut self, exporter: BatchExporter<SpanData>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// The service name stamped on exported spans.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Opens a span as a child of the current span and makes it current.
    pub fn start_span(&self, name: impl Into<String>) -> Span {
        let parent = registry::current();
        let span = Span::new(name, parent.as_ref());
        trace!(span = %span.name(), span_id = %span.span_id(), "Span opened");
        registry::push(span.clone());
        span
    }

    /// Closes `span` with status `Ok` and restores its parent as current.
    ///
    /// # Errors
    ///
    /// See [`SpanError`]. The span is exported even when the registry is
    /// found unbalanced.
    pub fn end_span(&self, span: &Span) -> Result<(), SpanError> {
        self.finish(span, None)
    }

    /// Closes `span` with status `Error`, recording `err` as an exception event.
    ///
    /// # Errors
    ///
    /// See [`SpanError`].
    pub fn end_span_with_error<E: std::error::Error + ?Sized>(
        &self,
        span: &Span,
        err: &E,
    ) -> Result<(), SpanError> {
        self.finish(span, Some(exception_event(err)))
    }

    fn finish(&self, span: &Span, failure: Option<SpanEvent>) -> Result<(), SpanError> {
        if let Err(e) = span.close(failure) {
            error!(span = %span.name(), span_id = %span.span_id(), "Span closed twice");
            return Err(e);
        }

        let popped = registry::pop_expected(span);
        self.export(span);

        match popped {
            Ok(_) => Ok(()),
            Err(ContextError::NotOnTop { expected, found }) => Err(SpanError::OutOfOrder {
                name: expected,
                current: found,
            }),
            Err(e) => Err(SpanError::Context(e)),
        }
    }

    /// Closes a span that was never pushed on the calling thread's stack.
    fn finish_detached(&self, span: &Span, failure: Option<SpanEvent>) {
        if span.close(failure).is_err() {
            error!(span = %span.name(), span_id = %span.span_id(), "Span closed twice");
            return;
        }
        self.export(span);
    }

    fn export(&self, span: &Span) {
        trace!(span = %span.name(), status = %span.status(), "Span closed");
        if let Some(exporter) = &self.exporter {
            exporter.submit(span.to_data(&self.service));
        }
    }

    /// Opens a span that is closed when the returned guard is dropped.
    ///
    /// The span ends with status `Error` if [`SpanGuard::record_error`] was
    /// called or if the guard is dropped while the thread is panicking.
    pub fn scoped_span(&self, name: impl Into<String>) -> SpanGuard {
        SpanGuard {
            tracer: self.clone(),
            span: self.start_span(name),
            failure: None,
            _not_send: PhantomData,
        }
    }

    /// Runs `f` inside a span named `name`.
    ///
    /// An `Err` is recorded on the span and returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns whatever `f` returns.
    pub fn in_span<T, E, F>(&self, name: impl Into<String>, f: F) -> Result<T, E>
    where
        E: std::error::Error,
        F: FnOnce() -> Result<T, E>,
    {
        let mut guard = self.scoped_span(name);
        let result = f();
        if let Err(ref e) = result {
            guard.record_error(e);
        }
        result
    }

    /// Like [`Tracer::in_span`], naming the span after `f` itself.
    ///
    /// Passing a function item yields that function's name; passing a closure
    /// yields the name of the function that defines it.
    ///
    /// # Errors
    ///
    /// Returns whatever `f` returns.
    pub fn trace_fn<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: std::error::Error,
        F: FnOnce() -> Result<T, E>,
    {
        self.in_span(short_type_name::<F>(), f)
    }

    /// Runs `future` inside a span named `name`.
    ///
    /// The future gets its own registry scope, so the span stays current
    /// across `.await` points and on whichever thread polls it. If the future
    /// is dropped before completing, the span is closed with status `Error`.
    ///
    /// # Errors
    ///
    /// Returns whatever `future` resolves to.
    pub async fn in_span_async<T, E, F>(&self, name: impl Into<String>, future: F) -> Result<T, E>
    where
        E: std::error::Error,
        F: Future<Output = Result<T, E>>,
    {
        let parent = registry::current();
        let span = Span::new(name, parent.as_ref());
        let mut closer = DetachedCloser {
            tracer: self,
            span: span.clone(),
            done: false,
        };

        let result = registry::scope_with(span, future).await;

        closer.done = true;
        let failure = result.as_ref().err().map(exception_event);
        self.finish_detached(&closer.span, failure);
        result
    }
}

struct DetachedCloser<'a> {
    tracer: &'a Tracer,
    span: Span,
    done: bool,
}

impl Drop for DetachedCloser<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let event = if std::thread::panicking() {
            SpanEvent::exception("panic", "future panicked inside span")
        } else {
            SpanEvent::new("cancelled")
        };
        self.tracer.finish_detached(&self.span, Some(event));
    }
}

/// RAII handle for a span opened by [`Tracer::scoped_span`].
///
/// Not `Send`: the span is registered on the current thread's stack and must
/// be closed there.
pub struct SpanGuard {
    tracer: Tracer,
    span: Span,
    failure: Option<SpanEvent>,
    _not_send: PhantomData<*const ()>,
}

impl SpanGuard {
    /// The guarded span.
    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Marks the span as failed with `err`; the last recorded error wins.
    pub fn record_error<E: std::error::Error + ?Sized>(&mut self, err: &E) {
        self.failure = Some(exception_event(err));
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        let failure = self.failure.take().or_else(|| {
            std::thread::panicking()
                .then(|| SpanEvent::exception("panic", "thread panicked inside span"))
        });
        // diagnostics were already emitted by `finish`
        let _ = self.tracer.finish(&self.span, failure);
    }
}
