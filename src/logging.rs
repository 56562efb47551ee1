//! Tracing subscriber setup
//!
//! The library only emits `tracing` events; binaries and test harnesses call
//! [`init`] once to get them on stderr.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the filter directive (e.g. `pvrsd_bench=debug`).
pub const LOG_ENV: &str = "PVRSD_LOG";

/// Install a formatted subscriber filtered by `PVRSD_LOG`, falling back to `default_filter`.
///
/// Returns `false` if a global subscriber was already installed; calling it
/// twice is harmless.
pub fn init(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let _ = init("warn");
        assert!(!init("warn"));
    }
}
