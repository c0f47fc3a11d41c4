//! Tracing subscriber setup with format selection.

use super::TracingConfig;
use super::config::{DEFAULT_LOG_FILTER, LogFormat};
use anyhow::{Context, Result};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Guard returned by [`init_tracing`].
///
/// Keep it alive for the duration of the program.
#[must_use]
pub struct TracingGuard {
    _private: (),
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn fmt_layer(config: &TracingConfig) -> BoxedLayer {
    let layer = fmt::layer()
        .with_file(config.include_location())
        .with_line_number(config.include_location())
        .with_target(config.include_target())
        .with_thread_ids(config.include_thread_ids());

    match config.log_format() {
        LogFormat::Json => layer
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .flatten_event(true)
            .boxed(),
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
    }
}

/// Install the global subscriber described by `config`.
///
/// An unparsable filter falls back to the default filter.
///
/// # Example
///
/// ```ignore
/// let _guard = init_tracing(TracingConfig::default())?;
/// ```
pub fn init_tracing(config: TracingConfig) -> Result<TracingGuard> {
    let filter = EnvFilter::try_new(config.log_filter()).unwrap_or_else(|e| {
        eprintln!(
            "Warning: invalid log filter '{}' ({}), using '{}'",
            config.log_filter(),
            e,
            DEFAULT_LOG_FILTER
        );
        EnvFilter::new(DEFAULT_LOG_FILTER)
    });

    tracing_subscriber::registry()
        .with(fmt_layer(&config))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(TracingGuard { _private: () })
}
