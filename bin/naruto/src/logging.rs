//! Sets up the global `tracing` subscriber for the binary.
//!
//! Scaled down from the teacher's `cliutil::LoggingConfig` (which also wires
//! an optional chrome-trace sink and file sink selected by environment
//! variables): this binary has no trace-viewer audience, so it keeps just
//! the `RUST_LOG`-driven console layer.

use tracing_subscriber::filter::{EnvFilter, LevelFilter};

/// Initializes the subscriber. Safe to call once at process start; a second
/// call (e.g. from a test harness) is ignored rather than panicking.
pub fn init() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}
