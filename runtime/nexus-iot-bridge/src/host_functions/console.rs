//! Console host functions.
//!
//! Script log output is forwarded to `tracing` under the `script` target.
//! Raw `stdout`/`stderr` writes bypass the subscriber.

use std::io::Write;

use serde::{Deserialize, Serialize};

use super::HostResult;
use crate::context::Runtime;
use crate::error::{status, ScriptError};
use crate::logging::SCRIPT_TARGET;

/// Log level of a script message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Debug output
    Debug,
    /// Informational output
    Info,
    /// Warning
    Warn,
    /// Error
    Error,
}

impl From<i32> for LogLevel {
    fn from(level: i32) -> Self {
        match level {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }
}

/// Log a message
///
/// # Arguments
/// * `rt` - The runtime
/// * `level` - The log level (0=debug, 1=info, 2=warn, 3=error)
/// * `message` - The message to log
pub fn log(rt: &Runtime, level: i32, message: &str) -> HostResult<()> {
    let script = rt.argv().into_iter().nth(1).unwrap_or_default();

    match LogLevel::from(level) {
        LogLevel::Debug => tracing::debug!(target: SCRIPT_TARGET, script = %script, "{}", message),
        LogLevel::Info => tracing::info!(target: SCRIPT_TARGET, script = %script, "{}", message),
        LogLevel::Warn => tracing::warn!(target: SCRIPT_TARGET, script = %script, "{}", message),
        LogLevel::Error => tracing::error!(target: SCRIPT_TARGET, script = %script, "{}", message),
    }

    Ok(())
}

fn write_raw(mut out: impl Write, text: &str) -> HostResult<()> {
    out.write_all(text.as_bytes())
        .and_then(|_| out.flush())
        .map_err(|e| ScriptError::uv(status::from_io_error(&e), "write"))
}

/// Write raw text to standard output
pub fn stdout(_rt: &Runtime, text: &str) -> HostResult<()> {
    write_raw(std::io::stdout().lock(), text)
}

/// Write raw text to standard error
pub fn stderr(_rt: &Runtime, text: &str) -> HostResult<()> {
    write_raw(std::io::stderr().lock(), text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    #[test]
    fn test_log_levels() {
        assert_eq!(LogLevel::from(0), LogLevel::Debug);
        assert_eq!(LogLevel::from(1), LogLevel::Info);
        assert_eq!(LogLevel::from(2), LogLevel::Warn);
        assert_eq!(LogLevel::from(3), LogLevel::Error);
        assert_eq!(LogLevel::from(42), LogLevel::Error);
    }

    #[test]
    fn test_log_always_succeeds() {
        let rt = Runtime::new(RuntimeConfig::default()).unwrap();
        for level in 0..4 {
            assert!(log(&rt, level, "message").is_ok());
        }
        // logging keeps working during shutdown
        rt.begin_exit(0);
        assert!(log(&rt, 1, "bye").is_ok());
    }

    #[test]
    fn test_write_raw_into_buffer() {
        let mut out = Vec::new();
        write_raw(&mut out, "hello\n").unwrap();
        assert_eq!(out, b"hello\n");
    }
}
