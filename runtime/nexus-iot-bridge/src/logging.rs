//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::RuntimeConfig;

/// Target used for log output produced by scripts
pub const SCRIPT_TARGET: &str = "script";

/// Build the filter: `RUST_LOG` when set, otherwise the configured filter
pub fn env_filter(config: &RuntimeConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .unwrap_or_else(|_| EnvFilter::new(crate::config::DEFAULT_LOG_FILTER))
}

/// Install a formatting subscriber for the process.
///
/// Returns false if a global subscriber was already installed.
pub fn init_tracing(config: &RuntimeConfig) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice() {
        let config = RuntimeConfig::default().with_log_filter("nexus_iot_bridge=debug");
        let first = init_tracing(&config);
        // the second install always fails, whoever won the first
        assert!(!init_tracing(&config));
        let _ = first;
    }

    #[test]
    fn test_bad_filter_falls_back() {
        let config = RuntimeConfig::default().with_log_filter("==not a filter==");
        let _ = env_filter(&config);
    }
}
