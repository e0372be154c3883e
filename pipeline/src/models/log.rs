//! Log data model.
//!
//! Defines the raw record built by the logging facade and the enriched
//! `LogRecord` that travels through sinks and exporters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::Location as CallerLocation;
use std::str::FromStr;
use thiserror::Error;

/// Attribute key carrying the hex trace id of the active span.
pub const TRACE_ID_KEY: &str = "trace_id";
/// Attribute key carrying the hex span id of the active span.
pub const SPAN_ID_KEY: &str = "span_id";
/// Attribute key carrying the configured application name.
pub const APP_NAME_KEY: &str = "app_name";

/// Log severity level.
///
/// Ordered from least to most severe, so `level >= min_level` filters records.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Very fine-grained diagnostics.
    Trace,
    /// Debug information.
    Debug,
    /// Informational messages.
    #[default]
    Info,
    /// A successfully completed operation.
    Success,
    /// Warning conditions.
    Warning,
    /// Error conditions.
    Error,
    /// Critical conditions.
    Critical,
}

impl Level {
    /// Returns the OTLP severity number for this level.
    ///
    /// See <https://opentelemetry.io/docs/specs/otel/logs/data-model/#field-severitynumber>.
    #[must_use]
    pub fn severity_number(self) -> i32 {
        match self {
            Self::Trace => 1,
            Self::Debug => 5,
            Self::Info => 9,
            Self::Success => 10,
            Self::Warning => 13,
            Self::Error => 17,
            Self::Critical => 21,
        }
    }

    /// Returns the upper-case severity text used on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Success => "SUCCESS",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a level name cannot be parsed.
#[derive(Debug, Error)]
#[error("Unknown log level: {0}")]
pub struct ParseLevelError(pub String);

impl FromStr for Level {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "success" => Ok(Self::Success),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" | "fatal" => Ok(Self::Critical),
            other => Err(ParseLevelError(other.to_string())),
        }
    }
}

/// Logical source location of a log call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Location {
    /// Source module (file path of the call site).
    pub module: String,
    /// Enclosing function, when the caller provided one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    /// Line number of the call site.
    pub line: u32,
}

impl Location {
    /// Builds a location from a `#[track_caller]` site.
    #[must_use]
    pub fn from_caller(caller: &CallerLocation<'_>, function: Option<&str>) -> Self {
        Self {
            module: caller.file().to_string(),
            function: function.map(str::to_string),
            line: caller.line(),
        }
    }
}

/// A log record as constructed at the call site, before enrichment.
#[derive(Debug, Clone)]
pub struct RawRecord {
    /// Timestamp when the log call was made.
    pub timestamp: DateTime<Utc>,
    /// Severity level.
    pub level: Level,
    /// Where the call was made.
    pub location: Location,
    /// The free-form message.
    pub message: String,
    /// Extra attributes (bound attributes plus per-call ones).
    pub attributes: HashMap<String, serde_json::Value>,
}

impl RawRecord {
    /// Creates a raw record stamped with the current time.
    #[must_use]
    pub fn new(level: Level, message: impl Into<String>, location: Location) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            location,
            message: message.into(),
            attributes: HashMap::new(),
        }
    }

    /// Adds an attribute to the record.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        self.attributes.insert(
            key.into(),
            serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
        );
        self
    }
}

/// An enriched log record.
///
/// Produced only by the enricher; the fields are read-only afterwards so a
/// record is immutable for the rest of its life in the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    timestamp: DateTime<Utc>,
    level: Level,
    location: Location,
    message: String,
    attributes: HashMap<String, serde_json::Value>,
}

impl LogRecord {
    pub(crate) fn from_raw(raw: RawRecord) -> Self {
        Self {
            timestamp: raw.timestamp,
            level: raw.level,
            location: raw.location,
            message: raw.message,
            attributes: raw.attributes,
        }
    }

    /// Timestamp of the log call.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Severity level.
    #[must_use]
    pub fn level(&self) -> Level {
        self.level
    }

    /// Call-site location.
    #[must_use]
    pub fn location(&self) -> &Location {
        &self.location
    }

    /// The log message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// All attributes, including the injected correlation fields.
    #[must_use]
    pub fn attributes(&self) -> &HashMap<String, serde_json::Value> {
        &self.attributes
    }

    /// Returns a single attribute.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&serde_json::Value> {
        self.attributes.get(key)
    }

    /// The injected trace id (32 hex chars).
    #[must_use]
    pub fn trace_id(&self) -> &str {
        self.str_attribute(TRACE_ID_KEY)
    }

    /// The injected span id (16 hex chars).
    #[must_use]
    pub fn span_id(&self) -> &str {
        self.str_attribute(SPAN_ID_KEY)
    }

    /// The injected application name.
    #[must_use]
    pub fn app_name(&self) -> &str {
        self.str_attribute(APP_NAME_KEY)
    }

    fn str_attribute(&self, key: &str) -> &str {
        self.attributes
            .get(key)
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
    }

    pub(crate) fn insert_attribute(&mut self, key: &str, value: serde_json::Value) {
        self.attributes.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn here() -> Location {
        Location {
            module: "src/main.rs".to_string(),
            function: Some("main".to_string()),
            line: 10,
        }
    }

    #[test]
    fn test_level_ordering() {
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Success);
        assert!(Level::Warning < Level::Error);
        assert!(Level::Error < Level::Critical);
    }

    #[test]
    fn test_level_default_is_info() {
        assert_eq!(Level::default(), Level::Info);
        assert_eq!(crate::config::PipelineConfig::default().min_level, Level::Info);
    }

    #[test]
    fn test_level_display() {
        assert_eq!(Level::Trace.to_string(), "TRACE");
        assert_eq!(Level::Warning.to_string(), "WARNING");
        assert_eq!(Level::Critical.to_string(), "CRITICAL");
    }

    #[test]
    fn test_level_severity_numbers() {
        assert_eq!(Level::Trace.severity_number(), 1);
        assert_eq!(Level::Debug.severity_number(), 5);
        assert_eq!(Level::Info.severity_number(), 9);
        assert_eq!(Level::Warning.severity_number(), 13);
        assert_eq!(Level::Error.severity_number(), 17);
        assert_eq!(Level::Critical.severity_number(), 21);
    }

    #[test]
    fn test_level_from_str() {
        assert_eq!("DEBUG".parse::<Level>().unwrap(), Level::Debug);
        assert_eq!(" info ".parse::<Level>().unwrap(), Level::Info);
        assert_eq!("warn".parse::<Level>().unwrap(), Level::Warning);
        assert_eq!("fatal".parse::<Level>().unwrap(), Level::Critical);
        assert!("verbose".parse::<Level>().is_err());
    }

    #[test]
    fn test_level_serialization() {
        assert_eq!(serde_json::to_string(&Level::Error).unwrap(), "\"error\"");
        let level: Level = serde_json::from_str("\"warning\"").unwrap();
        assert_eq!(level, Level::Warning);
    }

    #[test]
    fn test_raw_record_with_attributes() {
        let raw = RawRecord::new(Level::Info, "hello", here())
            .with_attribute("user_id", "123")
            .with_attribute("count", 42);

        assert_eq!(raw.attributes.len(), 2);
        assert_eq!(raw.attributes.get("count"), Some(&json!(42)));
    }

    #[test]
    fn test_log_record_accessors() {
        let mut record = LogRecord::from_raw(RawRecord::new(Level::Warning, "careful", here()));
        record.insert_attribute(TRACE_ID_KEY, json!("ab".repeat(16)));
        record.insert_attribute(SPAN_ID_KEY, json!("cd".repeat(8)));
        record.insert_attribute(APP_NAME_KEY, json!("demo-app"));

        assert_eq!(record.level(), Level::Warning);
        assert_eq!(record.message(), "careful");
        assert_eq!(record.trace_id().len(), 32);
        assert_eq!(record.span_id().len(), 16);
        assert_eq!(record.app_name(), "demo-app");
        assert_eq!(record.location().line, 10);
    }

    #[test]
    fn test_log_record_missing_correlation_is_empty() {
        let record = LogRecord::from_raw(RawRecord::new(Level::Info, "plain", here()));
        assert_eq!(record.trace_id(), "");
        assert_eq!(record.span_id(), "");
    }

    #[test]
    fn test_log_record_serialization() {
        let record = LogRecord::from_raw(
            RawRecord::new(Level::Error, "Something failed", here()).with_attribute("code", "E001"),
        );

        let json = serde_json::to_string(&record).unwrap();

        assert!(json.contains("\"level\":\"error\""));
        assert!(json.contains("\"message\":\"Something failed\""));
        assert!(json.contains("\"code\":\"E001\""));
        assert!(json.contains("\"function\":\"main\""));
    }
}
