//! Process-wide logging setup for schedulers, workers and the reconciler.

/// Tracing subscriber configuration.
pub mod tracing;

pub use self::tracing::{LogFormat, LogSettings};

/// Initialize logging from the environment (`RUST_LOG`, `SYNCWARDEN_LOG_FORMAT`).
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init(&LogSettings::from_env());
}

/// Route logs through the test harness's captured output.
pub fn init_for_tests() {
    tracing::init_for_tests();
}
