//! Error types for the bridge.
//!
//! This module defines the numeric status codes reported by OS-level
//! operations, the script-visible error value, and the main error type
//! used when constructing and configuring a runtime.

use serde::{Deserialize, Serialize};

/// Category of a script-visible error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Plain `Error`
    Error,
    /// Argument of the wrong type
    TypeError,
    /// Argument out of range
    RangeError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Error => write!(f, "Error"),
            ErrorKind::TypeError => write!(f, "TypeError"),
            ErrorKind::RangeError => write!(f, "RangeError"),
        }
    }
}

/// Error value handed to script callbacks and thrown by host functions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptError {
    /// Error category
    pub kind: ErrorKind,

    /// Human-readable message
    pub message: String,

    /// Symbolic status name, e.g. `ENOENT`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Negative status code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,

    /// Name of the failed system call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub syscall: Option<String>,
}

impl ScriptError {
    /// Create a new script error
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            errno: None,
            syscall: None,
        }
    }

    /// Create a plain error
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Error, message)
    }

    /// Create a type error
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TypeError, message)
    }

    /// Create a range error
    pub fn range_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RangeError, message)
    }

    /// Create an error describing a failed OS operation
    pub fn uv(errno: i32, syscall: impl Into<String>) -> Self {
        let syscall = syscall.into();
        let name = status::name(errno);
        Self::error(format!("{}, {}", name, syscall))
            .with_code(name)
            .with_errno(errno)
            .with_syscall(syscall)
    }

    /// Add a symbolic code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Add the status code
    pub fn with_errno(mut self, errno: i32) -> Self {
        self.errno = Some(errno);
        self
    }

    /// Add the system call name
    pub fn with_syscall(mut self, syscall: impl Into<String>) -> Self {
        self.syscall = Some(syscall.into());
        self
    }
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ScriptError {}

/// Main error type for the bridge
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Worker pool error
    #[error("Pool error: {0}")]
    Pool(String),

    /// Operation not valid in the current process state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Script value could not be bound to a native resource
    #[error("Binding error: {0}")]
    Binding(String),
}

impl BridgeError {
    /// Convert to a script-visible error
    pub fn to_script_error(&self) -> ScriptError {
        match self {
            BridgeError::Binding(msg) => ScriptError::type_error(msg.clone()),
            other => ScriptError::error(other.to_string()),
        }
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Status codes reported by OS-level operations.
///
/// Values follow the negative-errno convention of the event loop library:
/// zero is success and every failure is negative.
pub mod status {
    use std::io;

    /// Success
    pub const OK: i32 = 0;
    /// Operation not permitted
    pub const EPERM: i32 = -1;
    /// No such file or directory
    pub const ENOENT: i32 = -2;
    /// I/O error
    pub const EIO: i32 = -5;
    /// Bad file descriptor
    pub const EBADF: i32 = -9;
    /// Resource temporarily unavailable
    pub const EAGAIN: i32 = -11;
    /// Permission denied
    pub const EACCES: i32 = -13;
    /// File exists
    pub const EEXIST: i32 = -17;
    /// Not a directory
    pub const ENOTDIR: i32 = -20;
    /// Is a directory
    pub const EISDIR: i32 = -21;
    /// Invalid argument
    pub const EINVAL: i32 = -22;
    /// Broken pipe
    pub const EPIPE: i32 = -32;
    /// Directory not empty
    pub const ENOTEMPTY: i32 = -39;
    /// Address already in use
    pub const EADDRINUSE: i32 = -98;
    /// Address not available
    pub const EADDRNOTAVAIL: i32 = -99;
    /// Connection aborted
    pub const ECONNABORTED: i32 = -103;
    /// Connection reset by peer
    pub const ECONNRESET: i32 = -104;
    /// Socket is not connected
    pub const ENOTCONN: i32 = -107;
    /// Connection timed out
    pub const ETIMEDOUT: i32 = -110;
    /// Connection refused
    pub const ECONNREFUSED: i32 = -111;
    /// Operation canceled
    pub const ECANCELED: i32 = -125;
    /// Address family not supported
    pub const EAFNOSUPPORT: i32 = -97;
    /// Unknown node or service
    pub const EAI_NONAME: i32 = -3008;
    /// End of file
    pub const EOF: i32 = -4095;

    /// Map an I/O error to a status code
    pub fn from_io_error(err: &io::Error) -> i32 {
        if let Some(raw) = err.raw_os_error() {
            if raw > 0 {
                return -raw;
            }
        }
        match err.kind() {
            io::ErrorKind::NotFound => ENOENT,
            io::ErrorKind::PermissionDenied => EACCES,
            io::ErrorKind::ConnectionRefused => ECONNREFUSED,
            io::ErrorKind::ConnectionReset => ECONNRESET,
            io::ErrorKind::ConnectionAborted => ECONNABORTED,
            io::ErrorKind::NotConnected => ENOTCONN,
            io::ErrorKind::AddrInUse => EADDRINUSE,
            io::ErrorKind::AddrNotAvailable => EADDRNOTAVAIL,
            io::ErrorKind::BrokenPipe => EPIPE,
            io::ErrorKind::AlreadyExists => EEXIST,
            io::ErrorKind::WouldBlock => EAGAIN,
            io::ErrorKind::InvalidInput => EINVAL,
            io::ErrorKind::TimedOut => ETIMEDOUT,
            io::ErrorKind::UnexpectedEof => EOF,
            _ => EIO,
        }
    }

    /// Symbolic name of a status code
    pub fn name(code: i32) -> &'static str {
        match code {
            OK => "OK",
            EPERM => "EPERM",
            ENOENT => "ENOENT",
            EIO => "EIO",
            EBADF => "EBADF",
            EAGAIN => "EAGAIN",
            EACCES => "EACCES",
            EEXIST => "EEXIST",
            ENOTDIR => "ENOTDIR",
            EISDIR => "EISDIR",
            EINVAL => "EINVAL",
            EPIPE => "EPIPE",
            ENOTEMPTY => "ENOTEMPTY",
            EAFNOSUPPORT => "EAFNOSUPPORT",
            EADDRINUSE => "EADDRINUSE",
            EADDRNOTAVAIL => "EADDRNOTAVAIL",
            ECONNABORTED => "ECONNABORTED",
            ECONNRESET => "ECONNRESET",
            ENOTCONN => "ENOTCONN",
            ETIMEDOUT => "ETIMEDOUT",
            ECONNREFUSED => "ECONNREFUSED",
            ECANCELED => "ECANCELED",
            EAI_NONAME => "EAI_NONAME",
            EOF => "EOF",
            _ => "UNKNOWN",
        }
    }
}
