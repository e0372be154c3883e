//! Pipeline configuration.
//!
//! Every option has an independent default and can be overridden through
//! environment variables (a `.env` file is honoured):
//!
//! | Variable | Default |
//! |---|---|
//! | `LOGLINK_SERVICE_NAME` | `app` |
//! | `LOGLINK_APP_NAME` | service name |
//! | `LOGLINK_ENDPOINT` | `http://localhost:4318` |
//! | `LOGLINK_LOG_LEVEL` | `INFO` |
//! | `LOGLINK_BATCH_SIZE` | `512` |
//! | `LOGLINK_MAX_QUEUE_SIZE` | `2048` |
//! | `LOGLINK_FLUSH_INTERVAL_MS` | `5000` |
//! | `LOGLINK_MAX_RETRIES` | `3` |
//! | `LOGLINK_INITIAL_BACKOFF_MS` | `100` |
//! | `LOGLINK_MAX_BACKOFF_MS` | `5000` |
//! | `LOGLINK_SHUTDOWN_TIMEOUT_MS` | `5000` |
//! | `LOGLINK_CONSOLE` | `true` |

use crate::export::BatchConfig;
use crate::models::Level;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError};

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable holds a value of the wrong shape.
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue {
        /// The variable name.
        key: String,
        /// The offending value.
        value: String,
    },

    /// The assembled configuration is inconsistent.
    #[error("Validation failed: {0}")]
    ValidationError(#[from] validator::ValidationErrors),
}

fn validate_batching(config: &PipelineConfig) -> Result<(), ValidationError> {
    if config.max_queue_size < config.batch_size {
        return Err(ValidationError::new("max_queue_size_below_batch_size"));
    }
    if config.flush_interval.is_zero() {
        return Err(ValidationError::new("flush_interval_zero"));
    }
    Ok(())
}

/// Configuration for the logging and tracing pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Validate)]
#[validate(schema(function = "validate_batching"))]
pub struct PipelineConfig {
    /// Service name reported as the `service.name` resource attribute.
    #[validate(length(min = 1, message = "Service name cannot be empty"))]
    pub service_name: String,
    /// Application name injected into every log record.
    #[validate(length(min = 1, message = "App name cannot be empty"))]
    pub app_name: String,
    /// Collector base URL.
    #[validate(url(message = "Endpoint must be a valid URL"))]
    pub endpoint: String,
    /// Records below this level are discarded at the call site.
    pub min_level: Level,
    /// Maximum records or spans per export call.
    #[validate(range(min = 1, message = "Batch size must be at least 1"))]
    pub batch_size: usize,
    /// Maximum queued records or spans per exporter.
    pub max_queue_size: usize,
    /// Interval between timer-driven flushes.
    pub flush_interval: Duration,
    /// Retries after a failed export attempt.
    pub max_retries: u32,
    /// First retry delay.
    pub initial_backoff: Duration,
    /// Retry delay cap.
    pub max_backoff: Duration,
    /// How long shutdown waits for buffered data to be exported.
    pub shutdown_timeout: Duration,
    /// Whether records are also rendered on the console.
    pub console: bool,
}

impl PipelineConfig {
    /// Creates a configuration with defaults for the given service.
    ///
    /// The application name defaults to the service name.
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        let service_name = service_name.into();
        let defaults = BatchConfig::default();
        Self {
            app_name: service_name.clone(),
            service_name,
            endpoint: "http://localhost:4318".to_string(),
            min_level: Level::Info,
            batch_size: defaults.batch_size,
            max_queue_size: defaults.max_queue_size,
            flush_interval: defaults.flush_interval,
            max_retries: defaults.max_retries,
            initial_backoff: defaults.initial_backoff,
            max_backoff: defaults.max_backoff,
            shutdown_timeout: Duration::from_secs(5),
            console: true,
        }
    }

    /// Sets the application name.
    #[must_use]
    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    /// Sets the collector endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Sets the minimum level.
    #[must_use]
    pub fn with_min_level(mut self, level: Level) -> Self {
        self.min_level = level;
        self
    }

    /// Sets the batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the flush interval.
    #[must_use]
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Sets the retry count and backoff bounds.
    #[must_use]
    pub fn with_retries(mut self, max_retries: u32, initial: Duration, max: Duration) -> Self {
        self.max_retries = max_retries;
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Enables or disables the console sink.
    #[must_use]
    pub fn with_console(mut self, console: bool) -> Self {
        self.console = console;
        self
    }

    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed or the result is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed or the result is invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let service_name = lookup("LOGLINK_SERVICE_NAME").unwrap_or_else(|| "app".to_string());
        let mut config = Self::new(service_name);

        if let Some(app_name) = lookup("LOGLINK_APP_NAME") {
            config.app_name = app_name;
        }
        if let Some(endpoint) = lookup("LOGLINK_ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Some(level) = parse(&lookup, "LOGLINK_LOG_LEVEL")? {
            config.min_level = level;
        }
        if let Some(size) = parse(&lookup, "LOGLINK_BATCH_SIZE")? {
            config.batch_size = size;
        }
        if let Some(size) = parse(&lookup, "LOGLINK_MAX_QUEUE_SIZE")? {
            config.max_queue_size = size;
        }
        if let Some(ms) = parse(&lookup, "LOGLINK_FLUSH_INTERVAL_MS")? {
            config.flush_interval = Duration::from_millis(ms);
        }
        if let Some(retries) = parse(&lookup, "LOGLINK_MAX_RETRIES")? {
            config.max_retries = retries;
        }
        if let Some(ms) = parse(&lookup, "LOGLINK_INITIAL_BACKOFF_MS")? {
            config.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "LOGLINK_MAX_BACKOFF_MS")? {
            config.max_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "LOGLINK_SHUTDOWN_TIMEOUT_MS")? {
            config.shutdown_timeout = Duration::from_millis(ms);
        }
        if let Some(console) = parse(&lookup, "LOGLINK_CONSOLE")? {
            config.console = console;
        }

        config.validate_config()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The service or app name is empty
    /// - The endpoint is not a URL
    /// - The batch size is zero or larger than the queue
    /// - The flush interval is zero
    pub fn validate_config(&self) -> Result<(), ConfigError> {
        self.validate()?;
        Ok(())
    }

    /// The batching parameters shared by the log and span exporters.
    #[must_use]
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            batch_size: self.batch_size,
            max_queue_size: self.max_queue_size,
            flush_interval: self.flush_interval,
            max_retries: self.max_retries,
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new("app")
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    lookup(key)
        .map(|value| {
            value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            })
        })
        .transpose()
}
