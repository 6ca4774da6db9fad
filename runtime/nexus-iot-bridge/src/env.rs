//! Process environment.
//!
//! Holds the process lifecycle state, exit code, argv and configuration.
//! One instance lives inside each [`crate::Runtime`]; nothing here is global.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::RuntimeConfig;

/// Exit code used when a script exception goes unhandled
pub const UNCAUGHT_EXCEPTION_EXIT_CODE: i32 = 1;

/// Exit code used when an exit listener itself throws
pub const EXIT_LISTENER_FAILURE_EXIT_CODE: i32 = 2;

/// Process lifecycle state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcessState {
    /// Runtime built, nothing run yet
    Initializing,
    /// Running the entry function
    RunningMain,
    /// Driving the event loop
    RunningLoop,
    /// Shutting down; script callbacks are suppressed
    Exiting,
    /// Shutdown finished
    Terminated,
}

impl ProcessState {
    /// Whether script is allowed to run
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::RunningMain | ProcessState::RunningLoop)
    }
}

/// Process-wide state owned by a runtime
#[derive(Debug)]
pub struct ProcessEnvironment {
    state: ProcessState,
    exit_code: i32,
    argv: Vec<String>,
    config: RuntimeConfig,
}

impl ProcessEnvironment {
    /// Create an environment in the `Initializing` state
    pub fn new(config: RuntimeConfig, argv: Vec<String>) -> Self {
        Self {
            state: ProcessState::Initializing,
            exit_code: 0,
            argv,
            config,
        }
    }

    /// Current state
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Whether shutdown has begun
    pub fn is_exiting(&self) -> bool {
        self.state >= ProcessState::Exiting
    }

    /// Exit code reported at termination
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Overwrite the exit code
    pub fn set_exit_code(&mut self, code: i32) {
        self.exit_code = code;
    }

    /// Command-line arguments
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Configuration the runtime was built with
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Initializing -> RunningMain
    pub fn go_state_running_main(&mut self) {
        self.advance(ProcessState::RunningMain);
    }

    /// RunningMain -> RunningLoop
    pub fn go_state_running_loop(&mut self) {
        self.advance(ProcessState::RunningLoop);
    }

    /// Any state -> Exiting. Returns false if already exiting.
    pub fn go_state_exiting(&mut self) -> bool {
        if self.is_exiting() {
            return false;
        }
        info!(exit_code = self.exit_code, "process exiting");
        self.state = ProcessState::Exiting;
        true
    }

    /// Exiting -> Terminated
    pub fn go_state_terminated(&mut self) {
        self.advance(ProcessState::Terminated);
    }

    fn advance(&mut self, next: ProcessState) {
        if next <= self.state {
            debug!(from = ?self.state, to = ?next, "ignoring backward state transition");
            return;
        }
        debug!(from = ?self.state, to = ?next, "process state");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_env() -> ProcessEnvironment {
        ProcessEnvironment::new(RuntimeConfig::default(), vec!["iot".into(), "main.js".into()])
    }

    #[test]
    fn test_forward_transitions() {
        let mut env = create_env();
        assert_eq!(env.state(), ProcessState::Initializing);
        env.go_state_running_main();
        assert!(env.state().is_running());
        env.go_state_running_loop();
        assert_eq!(env.state(), ProcessState::RunningLoop);
        assert!(env.go_state_exiting());
        assert!(env.is_exiting());
        env.go_state_terminated();
        assert_eq!(env.state(), ProcessState::Terminated);
    }

    #[test]
    fn test_exiting_is_one_way() {
        let mut env = create_env();
        env.go_state_running_main();
        assert!(env.go_state_exiting());
        assert!(!env.go_state_exiting());

        env.go_state_running_loop();
        assert_eq!(env.state(), ProcessState::Exiting);
    }

    #[test]
    fn test_exit_code_and_argv() {
        let mut env = create_env();
        assert_eq!(env.exit_code(), 0);
        env.set_exit_code(UNCAUGHT_EXCEPTION_EXIT_CODE);
        assert_eq!(env.exit_code(), 1);
        assert_eq!(env.argv()[1], "main.js");
    }
}
