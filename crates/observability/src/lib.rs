//! Process-wide logging setup shared by the binaries.

/// Initialize logging with settings taken from the environment.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&tracing::LogConfig::from_env());
}

/// Subscriber configuration (filters, output format).
pub mod tracing;
