//! Loglink CLI
//!
//! Runs the logging and tracing demos against a collector, or against an
//! in-memory sink with `--memory`.
//!
//! # Usage
//!
//! ```bash
//! loglink --help
//! loglink logger --level debug
//! loglink --memory tracer
//! ```

#![deny(unsafe_code)]

use anyhow::Result;
use clap::{Parser, Subcommand};
use pipeline::export::InMemorySink;
use pipeline::models::{Level, SpanData};
use pipeline::{Logger, PipelineConfig, Telemetry, Tracer};
use std::sync::Arc;

/// Loglink CLI - trace-correlated logging demos
#[derive(Parser)]
#[command(name = "loglink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Collector base URL (OTLP/HTTP)
    #[arg(
        short,
        long,
        env = "LOGLINK_ENDPOINT",
        default_value = "http://localhost:4318"
    )]
    endpoint: String,

    /// Service name reported to the collector
    #[arg(short, long, env = "LOGLINK_SERVICE_NAME", default_value = "demo-service")]
    service: String,

    /// Application name stamped on log records (defaults to the service name)
    #[arg(short, long, env = "LOGLINK_APP_NAME")]
    app: Option<String>,

    /// Minimum log level
    #[arg(short, long, env = "LOGLINK_LOG_LEVEL", default_value = "info")]
    level: Level,

    /// Keep exported data in memory and print a summary instead
    #[arg(long)]
    memory: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Emit records at every level, with a bound channel and an exception
    Logger,
    /// Run nested spans with an error raised three levels deep
    Tracer,
}

#[derive(Debug, thiserror::Error)]
#[error("Sample error in method3")]
struct SampleError;

struct Analyzer {
    tracer: Tracer,
    logger: Logger,
}

impl Analyzer {
    fn method1(&self) -> Result<(), SampleError> {
        self.tracer.trace_fn(|| {
            self.logger.info("Processing in method1");
            self.method2()
        })
    }

    fn method2(&self) -> Result<(), SampleError> {
        self.tracer.trace_fn(|| {
            self.tracer.in_span("data_transform", || {
                self.logger.info("Transforming data");
                self.method3()
            })
        })
    }

    fn method3(&self) -> Result<(), SampleError> {
        self.tracer.trace_fn(|| {
            self.logger.info("Processing in method3");
            Err(SampleError)
        })
    }

    fn perform_analysis(&self) -> Result<(), SampleError> {
        self.tracer.trace_fn(|| {
            self.logger.info("Starting analysis");
            let result = self.tracer.in_span("analysis_context", || self.method1());
            if let Err(ref e) = result {
                self.logger.exception(format!("Analysis failed: {e}"), e);
            }
            result
        })
    }
}

fn run_logger_demo(logger: &Logger) {
    let channel = logger.bind("channel", "INFO");
    channel.debug("Debug message to channel INFO");
    channel.info("Info message to channel INFO");

    logger.warning("Warning message");
    logger.error("Error message");
    logger.critical("Critical message");
    logger.success("Success message");

    if let Err(e) = "1/0".parse::<f64>() {
        logger.exception("An error occurred", &e);
    }
}

fn run_tracer_demo(tracer: &Tracer, logger: &Logger) {
    logger.info("Starting application");

    let analyzer = Analyzer {
        tracer: tracer.clone(),
        logger: logger.with_function("analyzer"),
    };

    let result: Result<(), SampleError> = tracer.in_span("application", || {
        let _ = tracer.in_span("analysis_run_1", || analyzer.perform_analysis());

        if tracer
            .in_span("analysis_run_2", || analyzer.perform_analysis())
            .is_err()
        {
            logger.error("Analysis run 2 failed");
        }
        Ok(())
    });

    if let Err(e) = result {
        logger.exception("Application failed", &e);
    }
}

fn print_summary(sink: &InMemorySink) {
    let logs = sink.logs();
    let spans = sink.spans();

    println!();
    println!("Exported {} log records, {} spans", logs.len(), spans.len());
    for record in &logs {
        println!(
            "  [{:<8}] {} trace={} span={}",
            record.level(),
            record.message(),
            record.trace_id(),
            record.span_id()
        );
    }
    for span in &spans {
        print_span(span);
    }
}

fn print_span(span: &SpanData) {
    println!(
        "  span {:<16} {:?} trace={} id={} parent={} {}ms",
        span.name,
        span.status,
        span.trace_id,
        span.span_id,
        span.parent_span_id.as_deref().unwrap_or("-"),
        span.duration().num_milliseconds()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let Some(command) = cli.command else {
        println!("Loglink CLI v{}", env!("CARGO_PKG_VERSION"));
        println!("Use --help for usage information");
        return Ok(());
    };

    let mut config = PipelineConfig::from_env()?
        .with_endpoint(cli.endpoint)
        .with_min_level(cli.level);
    config.app_name = cli.app.unwrap_or_else(|| cli.service.clone());
    config.service_name = cli.service;

    let memory = cli.memory.then(|| Arc::new(InMemorySink::new()));
    let telemetry = match &memory {
        Some(sink) => Telemetry::init(config, sink.clone())?,
        None => Telemetry::init_otlp(config)?,
    };

    match command {
        Commands::Logger => run_logger_demo(telemetry.logger()),
        Commands::Tracer => run_tracer_demo(telemetry.tracer(), telemetry.logger()),
    }

    let report = telemetry.shutdown().await;
    tracing::info!(
        logs_exported = report.logs.exported,
        logs_dropped = report.logs.dropped,
        spans_exported = report.spans.exported,
        spans_dropped = report.spans.dropped,
        "Demo finished"
    );

    if let Some(sink) = memory {
        print_summary(&sink);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline::models::SpanStatus;

    #[test]
    fn test_cli_parse() {
        // Verify CLI can parse without arguments
        let cli = Cli::try_parse_from(["loglink"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_cli_tracer_command() {
        let cli = Cli::try_parse_from(["loglink", "--memory", "--level", "debug", "tracer"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Tracer)));
        assert!(cli.memory);
        assert_eq!(cli.level, Level::Debug);
    }

    #[test]
    fn test_cli_rejects_unknown_level() {
        let cli = Cli::try_parse_from(["loglink", "--level", "loud", "logger"]);
        assert!(cli.is_err());
    }

    #[tokio::test]
    async fn test_tracer_demo_exports_error_chain() {
        let sink = Arc::new(InMemorySink::new());
        let config = PipelineConfig::new("demo-service").with_console(false);
        let telemetry = Telemetry::init(config, sink.clone()).unwrap();

        run_tracer_demo(telemetry.tracer(), telemetry.logger());
        telemetry.shutdown().await;

        let spans = sink.spans();
        let names: Vec<&str> = spans.iter().map(|s| s.name.as_str()).collect();
        for expected in ["application", "analysis_run_2", "perform_analysis", "method3", "data_transform"] {
            assert!(names.contains(&expected), "missing span {expected}");
        }

        let method3 = spans.iter().find(|s| s.name == "method3").unwrap();
        assert_eq!(method3.status, SpanStatus::Error);
        let application = spans.iter().find(|s| s.name == "application").unwrap();
        assert_eq!(application.status, SpanStatus::Ok);
        assert!(spans.iter().all(|s| s.trace_id == application.trace_id));
    }

    #[tokio::test]
    async fn test_logger_demo_respects_level() {
        let sink = Arc::new(InMemorySink::new());
        let config = PipelineConfig::new("demo-service")
            .with_console(false)
            .with_min_level(Level::Info);
        let telemetry = Telemetry::init(config, sink.clone()).unwrap();

        run_logger_demo(telemetry.logger());
        telemetry.shutdown().await;

        let logs = sink.logs();
        assert_eq!(logs.len(), 6);
        assert!(logs.iter().all(|r| r.level() >= Level::Info));
        assert_eq!(logs.last().unwrap().message(), "An error occurred");
    }
}
