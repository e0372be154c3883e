//! OTLP/HTTP JSON encoding and the collector sink.
//!
//! Batches are converted to the typed OTLP request messages
//! (`ExportLogsServiceRequest`, `ExportTraceServiceRequest`), serialized with
//! their serde mapping (hex-encoded ids, camelCase field names) and posted to
//! `/v1/logs` and `/v1/traces` of an OpenTelemetry collector.

use super::{ExportError, ExportResult, Sink};
use crate::models::{LogRecord, SpanData, SpanEvent, SpanStatus, SPAN_ID_KEY, TRACE_ID_KEY};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{
    any_value, AnyValue, ArrayValue, InstrumentationScope, KeyValue, KeyValueList,
};
use opentelemetry_proto::tonic::logs::v1::{
    LogRecord as OtlpLogRecord, ResourceLogs, ScopeLogs,
};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::{
    span, status, ResourceSpans, ScopeSpans, Span as OtlpSpan, Status,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Instrumentation scope reported with every batch.
const SCOPE_NAME: &str = "loglink";

fn unix_nanos(ts: DateTime<Utc>) -> u64 {
    ts.timestamp_nanos_opt()
        .and_then(|nanos| u64::try_from(nanos).ok())
        .unwrap_or_default()
}

fn string_value(s: impl Into<String>) -> AnyValue {
    AnyValue {
        value: Some(any_value::Value::StringValue(s.into())),
    }
}

/// Converts a JSON attribute value to an OTLP `AnyValue`.
fn json_to_any_value(value: &Value) -> AnyValue {
    let value = match value {
        Value::Null => None,
        Value::Bool(b) => Some(any_value::Value::BoolValue(*b)),
        Value::Number(n) => Some(match n.as_i64() {
            Some(i) => any_value::Value::IntValue(i),
            None => any_value::Value::DoubleValue(n.as_f64().unwrap_or_default()),
        }),
        Value::String(s) => Some(any_value::Value::StringValue(s.clone())),
        Value::Array(values) => Some(any_value::Value::ArrayValue(ArrayValue {
            values: values.iter().map(json_to_any_value).collect(),
        })),
        Value::Object(map) => Some(any_value::Value::KvlistValue(KeyValueList {
            values: map.iter().map(|(k, v)| key_value(k, v)).collect(),
        })),
    };
    AnyValue { value }
}

fn key_value(key: &str, value: &Value) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(json_to_any_value(value)),
    }
}

/// Converts an attribute map to a sorted OTLP `KeyValue` list.
fn attributes_to_key_values<'a>(
    attributes: impl IntoIterator<Item = (&'a String, &'a Value)>,
) -> Vec<KeyValue> {
    let mut pairs: Vec<(&String, &Value)> = attributes.into_iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    pairs.into_iter().map(|(k, v)| key_value(k, v)).collect()
}

fn resource(service_name: &str) -> Resource {
    Resource {
        attributes: vec![KeyValue {
            key: "service.name".to_string(),
            value: Some(string_value(service_name)),
        }],
        ..Default::default()
    }
}

fn scope() -> InstrumentationScope {
    InstrumentationScope {
        name: SCOPE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        ..Default::default()
    }
}

/// Decodes a hex id; the all-zero sentinel and malformed ids become empty.
fn id_bytes(id: &str) -> Vec<u8> {
    match hex::decode(id) {
        Ok(bytes) if bytes.iter().any(|b| *b != 0) => bytes,
        _ => Vec::new(),
    }
}

/// Encodes one log record as an OTLP `LogRecord`.
#[must_use]
pub fn encode_log_record(record: &LogRecord) -> OtlpLogRecord {
    let location = record.location();
    let mut attributes: HashMap<String, Value> = record
        .attributes()
        .iter()
        .filter(|(k, _)| k.as_str() != TRACE_ID_KEY && k.as_str() != SPAN_ID_KEY)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    attributes.insert("code.filepath".to_string(), Value::from(location.module.as_str()));
    attributes.insert("code.lineno".to_string(), Value::from(location.line));
    if let Some(function) = &location.function {
        attributes.insert("code.function".to_string(), Value::from(function.as_str()));
    }

    let (trace_id, span_id) = match (id_bytes(record.trace_id()), id_bytes(record.span_id())) {
        (trace_id, span_id) if !trace_id.is_empty() && !span_id.is_empty() => (trace_id, span_id),
        _ => (Vec::new(), Vec::new()),
    };

    let timestamp = unix_nanos(record.timestamp());
    OtlpLogRecord {
        time_unix_nano: timestamp,
        observed_time_unix_nano: timestamp,
        severity_number: record.level().severity_number(),
        severity_text: record.level().as_str().to_string(),
        body: Some(string_value(record.message())),
        attributes: attributes_to_key_values(&attributes),
        trace_id,
        span_id,
        ..Default::default()
    }
}

fn encode_event(event: &SpanEvent) -> span::Event {
    span::Event {
        time_unix_nano: unix_nanos(event.timestamp),
        name: event.name.clone(),
        attributes: attributes_to_key_values(&event.attributes),
        ..Default::default()
    }
}

fn encode_status(span: &SpanData) -> Status {
    match span.status {
        SpanStatus::Unset => Status {
            code: status::StatusCode::Unset as i32,
            ..Default::default()
        },
        SpanStatus::Ok => Status {
            code: status::StatusCode::Ok as i32,
            ..Default::default()
        },
        SpanStatus::Error => Status {
            code: status::StatusCode::Error as i32,
            message: span
                .event("exception")
                .and_then(|e| e.attributes.get("exception.message"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
    }
}

/// Encodes one closed span as an OTLP `Span`.
#[must_use]
pub fn encode_span(span: &SpanData) -> OtlpSpan {
    OtlpSpan {
        trace_id: id_bytes(&span.trace_id),
        span_id: id_bytes(&span.span_id),
        parent_span_id: span
            .parent_span_id
            .as_deref()
            .map(id_bytes)
            .unwrap_or_default(),
        name: span.name.clone(),
        kind: span::SpanKind::Internal as i32,
        start_time_unix_nano: unix_nanos(span.start_time),
        end_time_unix_nano: unix_nanos(span.end_time),
        attributes: attributes_to_key_values(&span.attributes),
        events: span.events.iter().map(encode_event).collect(),
        status: Some(encode_status(span)),
        ..Default::default()
    }
}

/// Builds an `ExportLogsServiceRequest`.
#[must_use]
pub fn logs_request(service_name: &str, batch: &[LogRecord]) -> ExportLogsServiceRequest {
    ExportLogsServiceRequest {
        resource_logs: vec![ResourceLogs {
            resource: Some(resource(service_name)),
            scope_logs: vec![ScopeLogs {
                scope: Some(scope()),
                log_records: batch.iter().map(encode_log_record).collect(),
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

/// Builds an `ExportTraceServiceRequest`.
///
/// Spans carry their own service name; one resource entry is emitted per
/// distinct service, in order of first appearance.
#[must_use]
pub fn traces_request(batch: &[SpanData]) -> ExportTraceServiceRequest {
    let mut services: Vec<&str> = Vec::new();
    for span in batch {
        if !services.contains(&span.service.as_str()) {
            services.push(&span.service);
        }
    }

    let resource_spans = services
        .into_iter()
        .map(|service| ResourceSpans {
            resource: Some(resource(service)),
            scope_spans: vec![ScopeSpans {
                scope: Some(scope()),
                spans: batch
                    .iter()
                    .filter(|s| s.service == service)
                    .map(encode_span)
                    .collect(),
                ..Default::default()
            }],
            ..Default::default()
        })
        .collect();

    ExportTraceServiceRequest { resource_spans }
}

/// Sink that posts OTLP/HTTP JSON requests to a collector.
#[derive(Debug, Clone)]
pub struct OtlpHttpSink {
    client: reqwest::Client,
    endpoint: String,
    service_name: String,
}

impl OtlpHttpSink {
    /// Creates a sink for the collector at `endpoint` (e.g. `http://localhost:4318`).
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Network`] if the HTTP client cannot be built.
    pub fn new(
        endpoint: impl Into<String>,
        service_name: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ExportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExportError::Network(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            service_name: service_name.into(),
        })
    }

    /// The collector base URL.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post<B: Serialize>(&self, path: &str, body: &B) -> ExportResult {
        let payload =
            serde_json::to_vec(body).map_err(|e| ExportError::Serialization(e.to_string()))?;
        let url = format!("{}{path}", self.endpoint);

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| ExportError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ExportError::Rejected(format!("{status}: {detail}")));
        }

        debug!(%url, %status, "OTLP request accepted");
        Ok(())
    }
}

#[async_trait]
impl Sink for OtlpHttpSink {
    async fn export(&self, batch: &[LogRecord]) -> ExportResult {
        self.post("/v1/logs", &logs_request(&self.service_name, batch))
            .await
    }

    async fn export_spans(&self, batch: &[SpanData]) -> ExportResult {
        self.post("/v1/traces", &traces_request(batch)).await
    }
}
