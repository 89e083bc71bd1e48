//! Logging initialization
//!
//! `RUST_LOG` wins when set; otherwise `--log-level` is used as the filter.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The log filter directive could not be parsed
    #[error("invalid log filter {directive:?}: {message}")]
    InvalidFilter { directive: String, message: String },

    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Build the filter from `RUST_LOG` directives, falling back to `level`
pub fn build_filter(level: &str, env_directives: Option<&str>) -> Result<EnvFilter, TelemetryError> {
    let directive = env_directives
        .filter(|d| !d.trim().is_empty())
        .unwrap_or(level);
    EnvFilter::try_new(directive).map_err(|e| TelemetryError::InvalidFilter {
        directive: directive.to_string(),
        message: e.to_string(),
    })
}

/// Install the global subscriber
pub fn init_logging(level: &str, format: LogFormat) -> Result<(), TelemetryError> {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = build_filter(level, env.as_deref())?;
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    }
    .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_is_used_without_env_directives() {
        let filter = build_filter("debug", None).unwrap();
        assert_eq!(filter.to_string(), "debug");
    }

    #[test]
    fn env_directives_win() {
        let filter = build_filter("info", Some("ant_agent=trace")).unwrap();
        assert_eq!(filter.to_string(), "ant_agent=trace");

        let blank = build_filter("warn", Some("  ")).unwrap();
        assert_eq!(blank.to_string(), "warn");
    }

    #[test]
    fn garbage_level_is_rejected() {
        let err = build_filter("ant_agent=loud", None).unwrap_err();
        assert!(matches!(err, TelemetryError::InvalidFilter { .. }));
        assert!(err.to_string().contains("ant_agent=loud"));
    }
}
