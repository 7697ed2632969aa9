//! Global tracing subscriber setup.

use crate::tracing_layer::{ExtractionEvent, ExtractionEventLayer};
use tokio::sync::mpsc::UnboundedSender;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "tabula=info";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines on stderr.
    #[default]
    Plain,
    /// One JSON object per event on stderr.
    Json,
}

/// Builds the filter from `RUST_LOG`, else [`DEFAULT_FILTER`].
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the global subscriber.
///
/// With `events`, engine events are also forwarded to that channel. Fails if
/// a global subscriber is already installed.
pub fn init_tracing(
    format: LogFormat,
    events: Option<UnboundedSender<ExtractionEvent>>,
) -> anyhow::Result<()> {
    let plain = (format == LogFormat::Plain).then(|| fmt::layer().with_writer(std::io::stderr));
    let json = (format == LogFormat::Json).then(|| {
        fmt::layer()
            .json()
            .with_current_span(false)
            .with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(env_filter())
        .with(plain)
        .with(json)
        .with(events.map(ExtractionEventLayer::new))
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}
