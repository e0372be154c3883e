//! Data models for the Loglink pipeline.
//!
//! This module contains the record and span value types that flow from the
//! call site to the exporters.

pub mod log;
pub mod trace;

pub use log::{
    Level, Location, LogRecord, ParseLevelError, RawRecord, APP_NAME_KEY, SPAN_ID_KEY,
    TRACE_ID_KEY,
};
pub use trace::{SpanData, SpanEvent, SpanId, SpanStatus, TraceId};
