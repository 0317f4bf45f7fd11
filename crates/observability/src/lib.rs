//! Tracing/logging setup shared by the jobrelay binaries.

pub mod subscriber;

pub use subscriber::{LogConfig, LogFormat, LogFormatError};

/// Initialize process-wide logging with JSON output and `RUST_LOG` filtering.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    subscriber::init(&LogConfig::default());
}

/// Like [`init`], with an explicit configuration.
pub fn init_with(config: &LogConfig) {
    subscriber::init(config);
}
