// Logging setup. Components only emit `tracing` events; installing a
// subscriber is left to the binary or test.

use tracing_subscriber::{fmt, EnvFilter};

/// Install a formatted subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter`. Safe to call more than once; later calls are ignored.
pub fn init(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(true)
        .try_init();
}

/// Subscriber that writes through the test harness' captured output.
pub fn init_for_tests() {
    let _ = fmt()
        .with_env_filter(EnvFilter::new("rtflow=debug"))
        .with_test_writer()
        .try_init();
}
