//! Structured logging setup. `init_tracing_with_default_env_filter` is
//! the first call every binary's `main` makes, before anything else runs.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TracingFormat {
    #[default]
    Text,
    Json,
}

/// Installs the global `tracing` subscriber. `RUST_LOG` (falling back to
/// `info`) selects verbosity; `format` selects the on-the-wire shape, text
/// for local development and json for anything log-shipped.
pub fn init_tracing_with_default_env_filter(service_name: &str, format: TracingFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true);

    match format {
        TracingFormat::Text => subscriber.init(),
        TracingFormat::Json => subscriber.json().init(),
    }

    tracing::info!(service = service_name, "tracing initialized");
}
