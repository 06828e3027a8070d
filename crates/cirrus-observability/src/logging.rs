//! Structured logging with JSON/pretty output

use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::{FileLoggingConfig, LogFormat, LoggingConfig};
use crate::error::Result;

/// Guard that must be held to keep the async file writer running
pub struct LogGuard {
    _guard: Option<WorkerGuard>,
}

impl LogGuard {
    fn new(guard: Option<WorkerGuard>) -> Self {
        Self { _guard: guard }
    }
}

/// Initialize logging with the given configuration
///
/// Returns a guard that must be held for the lifetime of the application
/// to ensure logs are flushed properly.
pub fn init_logging(config: &LoggingConfig) -> Result<LogGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if let Some(ref directives) = config.filter_directives {
            EnvFilter::new(directives)
        } else {
            EnvFilter::new(config.level.as_str())
        }
    });

    let (file_writer, guard) = if let Some(file_config) = &config.file {
        let (writer, guard) = create_file_writer(file_config);
        (Some(writer), Some(guard))
    } else {
        (None, None)
    };

    // Separate branches because of tracing-subscriber's layer type system
    match (config.format, file_writer) {
        (LogFormat::Pretty, Some(file_writer)) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_writer(io::stdout)
                        .with_target(config.include_target)
                        .pretty(),
                )
                .with(
                    fmt::layer()
                        .with_writer(file_writer)
                        .with_target(config.include_target)
                        .with_ansi(false)
                        .json(),
                )
                .init();
        }
        (LogFormat::Pretty, None) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_writer(io::stdout)
                        .with_target(config.include_target)
                        .pretty(),
                )
                .init();
        }
        (LogFormat::Json, Some(file_writer)) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_writer(io::stdout)
                        .with_target(config.include_target)
                        .json(),
                )
                .with(
                    fmt::layer()
                        .with_writer(file_writer)
                        .with_target(config.include_target)
                        .with_ansi(false)
                        .json(),
                )
                .init();
        }
        (LogFormat::Json, None) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_writer(io::stdout)
                        .with_target(config.include_target)
                        .json(),
                )
                .init();
        }
        (LogFormat::Compact, Some(file_writer)) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_writer(io::stdout)
                        .with_target(config.include_target)
                        .compact(),
                )
                .with(
                    fmt::layer()
                        .with_writer(file_writer)
                        .with_target(config.include_target)
                        .with_ansi(false)
                        .json(),
                )
                .init();
        }
        (LogFormat::Compact, None) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_writer(io::stdout)
                        .with_target(config.include_target)
                        .compact(),
                )
                .init();
        }
    }

    Ok(LogGuard::new(guard))
}

fn create_file_writer(
    config: &FileLoggingConfig,
) -> (tracing_appender::non_blocking::NonBlocking, WorkerGuard) {
    let appender = tracing_appender::rolling::daily(&config.directory, &config.prefix);
    tracing_appender::non_blocking(appender)
}
