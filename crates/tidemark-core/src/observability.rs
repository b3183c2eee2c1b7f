//! Observability infrastructure for tidemark.
//!
//! Structured logging with consistent spans. Call [`init_logging`] once at
//! process start; library code only emits `tracing` events and spans.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl LogFormat {
    /// Reads the format from `TIDEMARK_LOG_FORMAT` (`json` selects JSON).
    #[must_use]
    pub fn from_env() -> Self {
        match std::env::var("TIDEMARK_LOG_FORMAT") {
            Ok(value) if value.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Initializes the logging subsystem.
///
/// Safe to call multiple times; subsequent calls are no-ops. Logs are
/// written to standard error.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `tidemark_flow=debug`)
///
/// # Example
///
/// ```rust
/// use tidemark_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json().with_writer(std::io::stderr))
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty().with_writer(std::io::stderr))
                    .init();
            }
        }
    });
}

/// Creates the span wrapping one reconciliation tick.
///
/// # Example
///
/// ```rust
/// use tidemark_core::observability::reconciliation_span;
///
/// let span = reconciliation_span("nightly_sensor", "tick_01");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn reconciliation_span(sensor: &str, tick_id: &str) -> Span {
    tracing::info_span!("reconciliation", sensor = sensor, tick_id = tick_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn reconciliation_span_can_be_entered() {
        let span = reconciliation_span("sensor", "tick_1");
        let _guard = span.enter();
        tracing::info!("inside reconciliation span");
    }
}
