//! Process-wide logging setup for the textguard binaries.

/// Initialize structured logging with the default settings.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    tracing::init(&tracing::LogSettings::from_env());
}

pub mod tracing;
