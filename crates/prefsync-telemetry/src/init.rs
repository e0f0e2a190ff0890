//! Tracing subscriber installation for prefsync binaries.
//!
//! Logs go to stderr so command output on stdout stays machine-readable.
//! `RUST_LOG` overrides the configured level when present.

use std::io;

use once_cell::sync::OnceCell;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Result, TelemetryError};

/// Level used when neither the caller nor `RUST_LOG` chooses one.
pub const DEFAULT_LOG_LEVEL: &str = "info";

static COMPONENT: OnceCell<String> = OnceCell::new();

/// Subscriber settings chosen by the embedding binary.
#[derive(Debug, Clone)]
pub struct LoggingConfig<'a> {
    /// Filter directive, e.g. `warn` or `prefsync_config=debug`.
    pub level: &'a str,
    /// Line format.
    pub format: LogFormat,
    /// Name of the binary or service installing the subscriber.
    pub component: &'a str,
    /// Emit a line when each `preference_store.*` span closes, with timings.
    pub span_timings: bool,
}

impl Default for LoggingConfig<'_> {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL,
            format: LogFormat::default(),
            component: component(),
            span_timings: false,
        }
    }
}

/// Line format of emitted logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event.
    Json,
    /// Human-readable single-line events.
    #[default]
    Pretty,
}

/// Install the global subscriber.
///
/// # Errors
///
/// Returns `Subscriber` when a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level));
    let spans = if config.span_timings {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(true)
        .with_span_events(spans);

    let installed = match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(layer.json().flatten_event(true))
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(layer.compact())
            .try_init(),
    };
    installed.map_err(|source| TelemetryError::Subscriber { source })?;

    let _ = COMPONENT.set(config.component.to_string());
    Ok(())
}

/// Component recorded by the first successful [`init_logging`] call, or
/// `prefsync` before logging is installed.
#[must_use]
pub fn component() -> &'static str {
    COMPONENT.get().map_or("prefsync", String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_favour_readable_output() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(!config.span_timings);
    }

    #[test]
    fn second_installation_is_rejected() {
        let config = LoggingConfig {
            component: "telemetry-tests",
            ..LoggingConfig::default()
        };
        let first = init_logging(&config);
        assert!(init_logging(&config).is_err());
        if first.is_ok() {
            assert_eq!(component(), "telemetry-tests");
            assert_eq!(LoggingConfig::default().component, "telemetry-tests");
        }
    }
}
