//! Per-execution-context registry of active spans.
//!
//! Every thread owns a stack of open spans; the top of the stack is the
//! "current" span read by the enricher. Async code can opt into a stack owned
//! by the task instead of the thread with [`scope`], which keeps the current
//! span stable across `.await` points even when the runtime moves the task
//! between worker threads.
//!
//! The stacks are never shared, so no locking is involved. Push/pop balance
//! is the caller's responsibility; [`crate::span::SpanGuard`] provides it.

use crate::span::Span;
use std::cell::RefCell;
use std::future::Future;
use thiserror::Error;
use tracing::error;

thread_local! {
    static THREAD_STACK: RefCell<Vec<Span>> = const { RefCell::new(Vec::new()) };
}

tokio::task_local! {
    static TASK_STACK: RefCell<Vec<Span>>;
}

/// Errors raised by unbalanced registry usage.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    /// `pop` was called with no open span in this execution context.
    #[error("No active span to pop in the current execution context")]
    Empty,

    /// The span being closed is not the innermost open span.
    #[error("Span '{expected}' is not the current span (current is '{found}')")]
    NotOnTop {
        /// Name of the span the caller tried to close.
        expected: String,
        /// Name of the span actually on top of the stack.
        found: String,
    },
}

fn in_task_scope() -> bool {
    TASK_STACK.try_with(|_| ()).is_ok()
}

fn with_stack<R>(f: impl FnOnce(&mut Vec<Span>) -> R) -> R {
    if in_task_scope() {
        TASK_STACK.with(|stack| f(&mut stack.borrow_mut()))
    } else {
        THREAD_STACK.with(|stack| f(&mut stack.borrow_mut()))
    }
}

/// Returns the innermost open span of the calling execution context.
#[must_use]
pub fn current() -> Option<Span> {
    with_stack(|stack| stack.last().cloned())
}

/// Makes `span` the current span of the calling execution context.
pub fn push(span: Span) {
    with_stack(|stack| stack.push(span));
}

/// Removes and returns the current span.
///
/// # Errors
///
/// Returns [`ContextError::Empty`] if no span is open in this context.
pub fn pop() -> Result<Span, ContextError> {
    with_stack(Vec::pop).ok_or_else(|| {
        error!("Attempted to pop a span from an empty trace context");
        ContextError::Empty
    })
}

/// Pops `span` if and only if it is the current span.
///
/// The stack is left untouched when `span` is not on top, so that an
/// out-of-order close is reported instead of being papered over.
///
/// # Errors
///
/// Returns [`ContextError::Empty`] for an empty stack and
/// [`ContextError::NotOnTop`] when another span is current.
pub fn pop_expected(span: &Span) -> Result<Span, ContextError> {
    let outcome = with_stack(|stack| match stack.last() {
        None => Err(ContextError::Empty),
        Some(top) if top.span_id() == span.span_id() => stack.pop().ok_or(ContextError::Empty),
        Some(top) => Err(ContextError::NotOnTop {
            expected: span.name().to_string(),
            found: top.name().to_string(),
        }),
    });

    if let Err(ref e) = outcome {
        error!(span = %span.name(), span_id = %span.span_id(), error = %e, "Unbalanced span close");
    }
    outcome
}

/// Number of open spans in the calling execution context.
#[must_use]
pub fn depth() -> usize {
    with_stack(|stack| stack.len())
}

/// Runs `future` with its own span stack, seeded with the caller's current span.
///
/// Spans opened inside the future are children of the span that was current
/// when `scope` was called, and never leak into the calling thread's stack.
pub async fn scope<F: Future>(future: F) -> F::Output {
    let seed: Vec<Span> = current().into_iter().collect();
    TASK_STACK.scope(RefCell::new(seed), future).await
}

/// Runs `future` with its own span stack whose only entry is `span`.
pub(crate) async fn scope_with<F: Future>(span: Span, future: F) -> F::Output {
    TASK_STACK.scope(RefCell::new(vec![span]), future).await
}
