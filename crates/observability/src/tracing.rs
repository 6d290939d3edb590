//! Tracing subscriber initialization.
//!
//! Connections, discovery queries and queue consumers each run on their own
//! named thread, so thread names are part of every record.

use tracing_subscriber::EnvFilter;

/// Output format for log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Human-readable, for local runs.
    Pretty,
}

impl LogFormat {
    /// `"pretty"`/`"text"` select [`LogFormat::Pretty`]; anything else is JSON.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Used when `RUST_LOG` is unset or invalid.
    pub default_directive: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_directive: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl LogConfig {
    /// Reads `KEYLINE_LOG_FORMAT`; the filter itself comes from `RUST_LOG`.
    pub fn from_env() -> Self {
        let format = std::env::var("KEYLINE_LOG_FORMAT")
            .map(|v| LogFormat::parse(&v))
            .unwrap_or_default();
        Self {
            format,
            ..Self::default()
        }
    }

    pub fn with_default_directive(mut self, directive: impl Into<String>) -> Self {
        self.default_directive = directive.into();
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_directive))
    }
}

/// Install the global subscriber.
///
/// Returns `false` if one was already installed (the call is then a no-op).
pub fn init(config: &LogConfig) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(config.filter())
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_thread_names(true)
        .with_target(false);

    match config.format {
        LogFormat::Json => builder.json().try_init().is_ok(),
        LogFormat::Pretty => builder.pretty().try_init().is_ok(),
    }
}
