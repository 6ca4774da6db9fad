//! # Nexus IoT Bridge
//!
//! Native binding core for an embedded script runtime. Script objects are
//! bound to OS handles and one-shot OS requests, and an event loop delivers
//! OS completions back to script callbacks.
//!
//! ## Architecture
//!
//! ```text
//! Script (JsObject / JsFunction)
//!     │
//!     │ host_functions
//!     ▼
//! HandleWrap / RequestWrap (arenas in Runtime)
//!     │
//!     │ OsHandleId / OsRequestId
//!     ▼
//! EventLoop (timers, sockets, worker pool)
//! ```
//!
//! ## Features
//!
//! - **Paired lifetimes**: a handle's script object stays alive until its
//!   close completes, and a request lives exactly until its callback ran
//! - **Callback protocol**: exceptions route to the uncaught handler and
//!   the next-tick queue drains after every top-level callback
//! - **Orderly shutdown**: exit closes every handle and waits for every
//!   in-flight request before the runtime terminates
//! - **Buffers**: byte buffers backed by native storage

#![deny(missing_docs)]

pub mod arena;
pub mod buffer;
pub mod callback;
pub mod config;
pub mod context;
pub mod engine;
pub mod env;
pub mod error;
pub mod handle;
pub mod host_functions;
pub mod logging;
pub mod metrics;
pub mod request;
pub mod value;

// Re-export commonly used types
pub use arena::WrapId;
pub use config::RuntimeConfig;
pub use context::Runtime;
pub use engine::{OsHandleId, OsRequestId, PollMode};
pub use env::ProcessState;
pub use error::{BridgeError, ErrorKind, Result, ScriptError};
pub use handle::{HandleEvent, HandleState};
pub use metrics::{BridgeMetrics, MetricsSnapshot};
pub use request::RequestKind;
pub use value::{JsFunction, JsObject, JsValue};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, "1.0.0");
    }

    #[test]
    fn test_empty_program_terminates() {
        let rt = Runtime::new(RuntimeConfig::default().with_thread_pool_size(1)).unwrap();
        let entry = JsFunction::new("main", |_, _, _| Ok(JsValue::Undefined));
        assert_eq!(rt.run(&entry), 0);
        assert_eq!(rt.state(), ProcessState::Terminated);
        assert_eq!(rt.metrics().snapshot().callbacks_invoked, 1);
    }
}
