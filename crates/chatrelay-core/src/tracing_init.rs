//! Tracing/logging initialization.
//!
//! The relay binary sets up `tracing_subscriber` with an env-filter and
//! optional JSON output. `RUST_LOG` always wins over the configured filter.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Initialise the global tracing subscriber from the logging section.
///
/// * `logging.filter` -- default filter when `RUST_LOG` is not set
///   (e.g. `"chatrelay_server=info"`).
/// * `logging.json` -- when `true`, emit structured JSON log lines instead of
///   the human-readable format.
pub fn init_tracing(logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| logging.filter.clone()),
    );
    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
