use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, LoggingConfig};

/// Build the filter: `RUST_LOG` wins, otherwise the configured level.
fn env_filter(level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}")),
    }
}

/// Initialize the global subscriber from the `[logging]` section.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = env_filter(&config.level)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    match config.format {
        LogFormat::Json => Registry::default()
            .with(filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .try_init(),
        LogFormat::Pretty => Registry::default()
            .with(filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init(),
    }
    .wrap_err("Failed to install tracing subscriber")?;

    tracing::info!(
        level = %config.level,
        format = ?config.format,
        "Waypoint logging initialized"
    );
    Ok(())
}

/// Create a request-scoped tracing span
pub fn create_request_span(method: &str, path: &str, request_id: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        http.method = method,
        http.path = path,
        request.id = request_id,
        http.status_code = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    )
}
