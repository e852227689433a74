//! Shared logging bootstrap for Recorral binaries.

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Parse a log-level string, defaulting to INFO for unknown values.
pub fn parse_level(s: &str) -> Level {
    match s.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize the global tracing subscriber.
///
/// `json` switches to machine-readable output for log shipping.
pub fn init_logging(level: Level, json: bool) {
    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
