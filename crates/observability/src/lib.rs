//! Logging setup shared by every node in the process.

pub mod tracing;

pub use crate::tracing::LoggingConfig;

/// Initialize logging with defaults (`info`, JSON).
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init_with(&LoggingConfig::default());
}

/// Initialize logging from configuration.
pub fn init_with(config: &LoggingConfig) {
    tracing::init_with(config);
}
