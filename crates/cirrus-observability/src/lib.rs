//! Cirrus observability - logging, metrics, and user-log sinks
//!
//! Provides the controller's structured logging (JSON/pretty via tracing),
//! the Prometheus metrics collection, and the pluggable sinks that persist
//! captured user function output.

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod sink;

pub use config::*;
pub use error::{ObservabilityError, Result};
pub use logging::{init_logging, LogGuard};
pub use metrics::CirrusMetrics;
pub use sink::{JsonSink, LogSink, PlainSink, SinkRegistry, UserLogRecord};

/// Initialize logging from the observability configuration
///
/// Returns a guard that must be held for the lifetime of the application.
pub fn init_observability(config: &ObservabilityConfig) -> Result<LogGuard> {
    let guard = init_logging(&config.logging)?;
    tracing::info!("Observability initialized");
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ObservabilityConfig::default();
        assert_eq!(config.logging.level, LogLevel::Info);
    }
}
