//! Loglink Pipeline Library
//!
//! Trace-correlated logging: every log record emitted inside a span carries
//! that span's trace and span ids, and both records and closed spans are
//! exported in batches to an OTLP collector.
//!
//! # Modules
//!
//! - [`models`] - Log record and span data types
//! - [`registry`] - Per-thread / per-task stack of active spans
//! - [`span`] - Span lifecycle (`Tracer`, scoped spans)
//! - [`enrich`] - Injects trace context into log records
//! - [`export`] - Batching exporter and sinks (OTLP/HTTP, in-memory)
//! - [`facade`] - Leveled logger and record sinks
//! - [`config`] - Pipeline configuration
//! - [`telemetry`] - Pipeline lifecycle
//!
//! # Example
//!
//! ```
//! use pipeline::config::PipelineConfig;
//! use pipeline::export::InMemorySink;
//! use pipeline::telemetry::Telemetry;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let sink = Arc::new(InMemorySink::new());
//! let config = PipelineConfig::new("demo-service").with_console(false);
//! let telemetry = Telemetry::init(config, sink.clone()).unwrap();
//!
//! {
//!     let _span = telemetry.tracer().scoped_span("request");
//!     telemetry.logger().info("handling request");
//! }
//!
//! telemetry.shutdown().await;
//! assert_eq!(sink.logs()[0].trace_id(), sink.spans()[0].trace_id);
//! # });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod enrich;
pub mod export;
pub mod facade;
pub mod models;
pub mod registry;
pub mod span;
pub mod telemetry;

pub use config::{ConfigError, PipelineConfig};
pub use facade::Logger;
pub use models::Level;
pub use span::{Span, Tracer};
pub use telemetry::Telemetry;

/// Re-export common dependencies for convenience.
pub use chrono;
pub use serde_json;
