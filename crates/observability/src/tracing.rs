//! Tracing/logging initialization.
//!
//! Filtering comes from `RUST_LOG` (default `info`). Output is compact
//! unless `MEDIASYNC_LOG_FORMAT=json`.

use tracing_subscriber::EnvFilter;

/// Environment variable selecting the log output format.
pub const LOG_FORMAT_ENV: &str = "MEDIASYNC_LOG_FORMAT";

/// Output format of the process-wide subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    /// Parse a format name; anything other than `json` is compact.
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Compact
        }
    }

    pub fn from_env() -> Self {
        std::env::var(LOG_FORMAT_ENV)
            .map(|value| Self::parse(&value))
            .unwrap_or(LogFormat::Compact)
    }
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with_format(LogFormat::from_env());
}

pub fn init_with_format(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    let _ = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
}
