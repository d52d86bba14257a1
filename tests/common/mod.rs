//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Once;

/// Installs a tracing subscriber once per test binary. Controlled by
/// `RUST_LOG`; defaults to warnings only so test output stays clean.
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}
