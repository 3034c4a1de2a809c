//! Logging configuration and initialization.
//!
//! This module sets up the tracing subscriber based on the application
//! configuration, supporting stdout, stderr, and file output with
//! configurable formats.

use crate::config::{LogFormat, LoggingConfig};
use std::fs::OpenOptions;
use std::io;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the logging system based on configuration.
///
/// Returns a guard that must be kept alive for the duration of the program
/// to ensure all logs are flushed.
///
/// # Arguments
///
/// * `config` - The logging configuration
/// * `level_override` - Optional level override from the CLI
/// * `trace_deps` - If true, include verbose logging from dependencies
pub fn init_logging(
    config: &LoggingConfig,
    level_override: Option<&str>,
    trace_deps: bool,
) -> io::Result<WorkerGuard> {
    let level = level_override.unwrap_or(&config.level);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(level, trace_deps)));

    let (writer, guard) = open_writer(&config.output)?;

    match config.format {
        LogFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_target(config.include_target);

            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .init();
        }
        LogFormat::Compact => {
            let layer = fmt::layer()
                .compact()
                .with_writer(writer)
                .with_target(config.include_target);

            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .init();
        }
        LogFormat::Pretty => {
            let layer = fmt::layer()
                .pretty()
                .with_writer(writer)
                .with_target(config.include_target);

            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .init();
        }
    }

    Ok(guard)
}

/// Builds the filter directives for a level name. Unknown names fall back
/// to `info`.
pub fn filter_directives(level: &str, trace_deps: bool) -> String {
    let level = match level.to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    };

    if trace_deps {
        level.to_string()
    } else {
        format!("{},hyper=warn,hyper_util=warn,fast_socks5=warn", level)
    }
}

fn open_writer(output: &str) -> io::Result<(NonBlocking, WorkerGuard)> {
    Ok(match output.to_lowercase().as_str() {
        "stdout" => tracing_appender::non_blocking(io::stdout()),
        "stderr" => tracing_appender::non_blocking(io::stderr()),
        _ => {
            let file = OpenOptions::new().create(true).append(true).open(output)?;
            tracing_appender::non_blocking(file)
        }
    })
}
