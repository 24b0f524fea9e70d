//! Tracing subscriber setup shared by the adapter and bridge binaries.
//!
//! Records at `ERROR` go to stderr, everything else to stdout, so a worker
//! supervisor can tell failures apart without parsing the lines.

use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- filter used when `RUST_LOG` is not set
///   (e.g. `"busadapter_daemon=debug"`).
/// * `log_json` -- emit one JSON object per line instead of the
///   human-readable format.
///
/// Calling this twice is harmless: the second call leaves the first
/// subscriber in place.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    let writer = std::io::stderr
        .with_max_level(Level::ERROR)
        .or_else(std::io::stdout);

    let result = if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(writer))
            .try_init()
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "tracing subscriber already installed");
    }
}
