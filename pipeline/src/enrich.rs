//! Trace-context enrichment of log records.

use crate::models::{
    LogRecord, RawRecord, SpanId, TraceId, APP_NAME_KEY, SPAN_ID_KEY, TRACE_ID_KEY,
};
use crate::registry;
use serde_json::Value;
use std::sync::Arc;

/// Injects the current span's identifiers and the application name.
///
/// Every enriched record carries `trace_id`, `span_id` and `app_name`. With no
/// active span the ids are the all-zero sentinels of the same width, so the
/// correlation fields are never optional downstream.
#[derive(Debug, Clone)]
pub struct Enricher {
    app_name: Arc<str>,
}

impl Enricher {
    /// Creates an enricher stamping `app_name` on every record.
    #[must_use]
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into().into(),
        }
    }

    /// The configured application name.
    #[must_use]
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Turns a raw record into an immutable, correlated `LogRecord`.
    #[must_use]
    pub fn enrich(&self, raw: RawRecord) -> LogRecord {
        let (trace_id, span_id) = registry::current().map_or(
            (TraceId::INVALID, SpanId::INVALID),
            |span| (span.trace_id(), span.span_id()),
        );

        let mut record = LogRecord::from_raw(raw);
        record.insert_attribute(TRACE_ID_KEY, Value::String(trace_id.to_string()));
        record.insert_attribute(SPAN_ID_KEY, Value::String(span_id.to_string()));
        record.insert_attribute(APP_NAME_KEY, Value::String(self.app_name.to_string()));
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Level, Location};
    use crate::span::Tracer;

    fn raw(message: &str) -> RawRecord {
        RawRecord::new(
            Level::Info,
            message,
            Location {
                module: "tests".to_string(),
                function: None,
                line: 1,
            },
        )
    }

    #[test]
    fn test_enrich_without_span_uses_zero_sentinel() {
        let record = Enricher::new("demo-app").enrich(raw("no span"));

        assert_eq!(record.trace_id(), "0".repeat(32));
        assert_eq!(record.span_id(), "0".repeat(16));
        assert_eq!(record.app_name(), "demo-app");
    }

    #[test]
    fn test_enrich_inside_span_uses_its_ids() {
        let tracer = Tracer::new("svc");
        let enricher = Enricher::new("demo-app");

        let span = tracer.start_span("outer");
        let record = enricher.enrich(raw("inside"));
        tracer.end_span(&span).unwrap();

        assert_eq!(record.trace_id(), span.trace_id().to_string());
        assert_eq!(record.span_id(), span.span_id().to_string());
        assert_eq!(record.trace_id().len(), 32);
        assert_eq!(record.span_id().len(), 16);
        assert!(record
            .trace_id()
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_enrich_follows_innermost_span() {
        let tracer = Tracer::new("svc");
        let enricher = Enricher::new("app");

        let outer = tracer.start_span("outer");
        let inner = tracer.start_span("inner");
        let in_inner = enricher.enrich(raw("a"));
        tracer.end_span(&inner).unwrap();
        let in_outer = enricher.enrich(raw("b"));
        tracer.end_span(&outer).unwrap();

        assert_eq!(in_inner.span_id(), inner.span_id().to_string());
        assert_eq!(in_outer.span_id(), outer.span_id().to_string());
        assert_eq!(in_inner.trace_id(), in_outer.trace_id());
    }

    #[test]
    fn test_enrich_overrides_spoofed_correlation_attributes() {
        let record = Enricher::new("real-app").enrich(
            raw("spoof")
                .with_attribute("trace_id", "not-a-trace")
                .with_attribute("app_name", "fake")
                .with_attribute("channel", "INFO"),
        );

        assert_eq!(record.trace_id(), "0".repeat(32));
        assert_eq!(record.app_name(), "real-app");
        assert_eq!(record.attribute("channel"), Some(&Value::from("INFO")));
    }
}
