#![deny(unsafe_code)]

//! Shared `tracing` setup.
//!
//! Every binary and integration test goes through [`init`] so filtering is
//! controlled uniformly through `DEFS_LOG` (falling back to `RUST_LOG`, then
//! to `info`). Initialization is idempotent: repeated calls are no-ops, which
//! keeps `#[tokio::test]` suites from fighting over the global subscriber.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Environment variable consulted first for the log filter.
pub const ENV_FILTER_VAR: &str = "DEFS_LOG";

/// Installs the global subscriber with an env-derived filter.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(ENV_FILTER_VAR)
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}

/// Installs a verbose subscriber for tests; falls back to [`init`] behaviour
/// when a filter is already configured in the environment.
pub fn init_for_tests() {
    if std::env::var_os(ENV_FILTER_VAR).is_some() || std::env::var_os("RUST_LOG").is_some() {
        init();
        return;
    }
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("debug"))
            .with_test_writer()
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init();
        init();
        init_for_tests();
    }
}
