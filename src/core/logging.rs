//! Tracing subscriber setup.
//!
//! Library code only emits `tracing` events; binaries and tests call
//! [`init_tracing`] once to get them on stderr.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Install a global fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Safe to call more than once; if another subscriber is already installed
/// it is left in place.
pub fn init_tracing(format: LogFormat) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(filter);

        let result = match format {
            LogFormat::Pretty => registry
                .with(fmt::layer().with_target(true).with_thread_ids(true))
                .try_init(),
            LogFormat::Json => registry
                .with(fmt::layer().json().with_target(true).with_current_span(true))
                .try_init(),
        };

        if result.is_err() {
            tracing::debug!("Global tracing subscriber already initialized - keeping it");
        }
    });
}
