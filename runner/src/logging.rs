//! Development-time tracing.
//!
//! Tracing goes to stderr and is not persisted. Run artifacts (manifest,
//! attempt records, captured output) are written by `io::store` regardless of
//! the log level.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set. Otherwise the level is `warn`, raised to `info`
/// and `debug` for this crate by one or two `-v` flags.
///
/// # Example
/// ```bash
/// RUST_LOG=paperloop=debug paperloop run --spec spec.json
/// ```
pub fn init(verbose: u8) {
    let fallback = match verbose {
        0 => "warn",
        1 => "warn,paperloop=info",
        _ => "warn,paperloop=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
