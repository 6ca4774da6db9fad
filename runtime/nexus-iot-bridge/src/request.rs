//! Request wraps.
//!
//! A [`RequestWrap`] pairs a one-shot OS request with the script callback
//! waiting for it. The callback fires exactly once and the wrap is freed
//! right after, whether the request completed on the loop or failed at
//! dispatch.
//!
//! Completion arguments are shaped by a fixed table keyed on
//! [`RequestKind`]:
//!
//! | Kind | Arguments |
//! |---|---|
//! | connect, write, shutdown | `(status)` |
//! | send | `(status, msg_size)` |
//! | fs operations | `(err)` or `(null, result)` |
//! | getaddrinfo | `(err, address, family)` |
//! | work | `(status, result)` |

use std::fmt;

use tracing::{debug, trace};

use crate::arena::{lifetime_violation, WrapId};
use crate::buffer;
use crate::callback::invoke_callback;
use crate::context::Runtime;
use crate::engine::{CompletionPayload, OsHandleId, OsRequestId};
use crate::error::{status, ScriptError};
use crate::value::{JsFunction, JsObject, JsValue};

/// Operation a request performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Stream connect
    Connect,
    /// Stream write
    Write,
    /// Stream write-side shutdown
    Shutdown,
    /// Datagram send
    Send,
    /// Open a file
    FsOpen,
    /// Close a file descriptor
    FsClose,
    /// Read from a file descriptor
    FsRead,
    /// Write to a file descriptor
    FsWrite,
    /// Stat a path
    FsStat,
    /// Stat a file descriptor
    FsFstat,
    /// List a directory
    FsReadDir,
    /// Create a directory
    FsMkdir,
    /// Remove a directory
    FsRmdir,
    /// Remove a file
    FsUnlink,
    /// Rename a path
    FsRename,
    /// Resolve a host name
    GetAddrInfo,
    /// Run a job on the worker pool
    Work,
}

impl RequestKind {
    /// Name of the underlying system call, used in error values
    pub fn syscall(&self) -> &'static str {
        match self {
            RequestKind::Connect => "connect",
            RequestKind::Write => "write",
            RequestKind::Shutdown => "shutdown",
            RequestKind::Send => "send",
            RequestKind::FsOpen => "open",
            RequestKind::FsClose => "close",
            RequestKind::FsRead => "read",
            RequestKind::FsWrite => "write",
            RequestKind::FsStat => "stat",
            RequestKind::FsFstat => "fstat",
            RequestKind::FsReadDir => "scandir",
            RequestKind::FsMkdir => "mkdir",
            RequestKind::FsRmdir => "rmdir",
            RequestKind::FsUnlink => "unlink",
            RequestKind::FsRename => "rename",
            RequestKind::GetAddrInfo => "getaddrinfo",
            RequestKind::Work => "work",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Write => write!(f, "write"),
            RequestKind::FsWrite => write!(f, "fs_write"),
            RequestKind::FsClose => write!(f, "fs_close"),
            other => write!(f, "{}", other.syscall()),
        }
    }
}

/// Data a request carries from dispatch to completion
#[derive(Debug, Default)]
pub enum RequestPayload {
    /// Nothing
    #[default]
    None,
    /// Size of the datagram being sent
    MessageSize(usize),
    /// Destination of a file read
    ReadInto {
        /// Buffer object receiving the bytes
        buffer: JsObject,
        /// Offset in the buffer
        offset: usize,
    },
}

/// Native side of an in-flight request
pub struct RequestWrap {
    kind: RequestKind,
    callback: Option<JsFunction>,
    payload: RequestPayload,
}

impl RequestWrap {
    /// Operation kind
    pub fn kind(&self) -> RequestKind {
        self.kind
    }
}

impl fmt::Debug for RequestWrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestWrap")
            .field("kind", &self.kind)
            .field("callback", &self.callback)
            .field("payload", &self.payload)
            .finish()
    }
}

/// Create a request and register it with the loop.
///
/// Returns the wrap and the OS request to dispatch with. The OS request's
/// user-data slot points back at the wrap.
pub fn create(
    rt: &Runtime,
    callback: Option<JsFunction>,
    kind: RequestKind,
    payload: RequestPayload,
) -> (WrapId, OsRequestId) {
    let id = {
        let mut requests = rt.requests().borrow_mut();
        let id = requests.attach(RequestWrap {
            kind,
            callback,
            payload,
        });
        requests.acquire(id);
        id
    };
    let req = rt.event_loop().register_request(id);
    rt.metrics().record_request_created(&kind.to_string());
    trace!(wrap = %id, %req, %kind, "request created");
    (id, req)
}

/// Record the status an OS call returned when dispatching `req`.
///
/// A negative status means the request never reached the OS. It is queued
/// as a completion so the callback still fires once, from the loop, after
/// the issuing call has returned. The status is passed through.
pub fn dispatch(rt: &Runtime, req: OsRequestId, code: i32) -> i32 {
    dispatch_on(rt, None, req, code)
}

/// [`dispatch`] for a request issued on `handle`. A failure completes
/// after the handle's earlier requests.
pub fn dispatch_on(rt: &Runtime, handle: Option<OsHandleId>, req: OsRequestId, code: i32) -> i32 {
    if code < 0 {
        fail_dispatch(rt, handle, req, code)
    } else {
        code
    }
}

/// Fail a request that could not be dispatched
pub fn fail_dispatch(rt: &Runtime, handle: Option<OsHandleId>, req: OsRequestId, code: i32) -> i32 {
    debug!(%req, status = code, error = status::name(code), "request failed at dispatch");
    rt.metrics().record_request_failed_sync();
    rt.event_loop().fail_request(handle, req, code);
    code
}

/// Completion of `req`: invoke the callback with the shaped arguments,
/// then free the wrap.
pub fn complete(rt: &Runtime, req: OsRequestId, code: i32, result: CompletionPayload) {
    let Some(id) = rt.event_loop().take_request(req) else {
        debug!(%req, "completion for unknown request dropped");
        return;
    };

    let taken = {
        let mut requests = rt.requests().borrow_mut();
        requests.get_mut(id).map(|wrap| {
            (
                wrap.kind,
                wrap.callback.take(),
                std::mem::take(&mut wrap.payload),
            )
        })
    };
    let Some((kind, callback, payload)) = taken else {
        lifetime_violation("completion for freed request wrap", id);
        return;
    };

    trace!(wrap = %id, %req, %kind, status = code, "request completed");
    rt.metrics().record_request_completed(code);

    let args = shape_args(kind, code, result, payload);
    if let Some(callback) = callback {
        invoke_callback(rt, &callback, &JsValue::Undefined, &args);
    }

    let freed = {
        let mut requests = rt.requests().borrow_mut();
        let released = requests.release(id);
        let completed = requests.complete(id);
        released.or(completed)
    };
    if freed.is_some() {
        rt.metrics().record_request_freed();
    }
    drop(freed);
}

/// Callback arguments for a finished request
pub fn shape_args(
    kind: RequestKind,
    code: i32,
    result: CompletionPayload,
    payload: RequestPayload,
) -> Vec<JsValue> {
    match kind {
        RequestKind::Connect | RequestKind::Write | RequestKind::Shutdown => {
            vec![JsValue::from(code)]
        }
        RequestKind::Send => {
            let size = match payload {
                RequestPayload::MessageSize(size) => size,
                _ => 0,
            };
            vec![JsValue::from(code), JsValue::from(size)]
        }
        RequestKind::Work => {
            let value = match result {
                CompletionPayload::Json(value) if code >= 0 => JsValue::from(value),
                _ => JsValue::Undefined,
            };
            vec![JsValue::from(code), value]
        }
        RequestKind::GetAddrInfo => match result {
            CompletionPayload::Address { address, family } if code >= 0 => vec![
                JsValue::Null,
                JsValue::from(address),
                JsValue::from(family as i32),
            ],
            _ => vec![
                uv_error(code, kind),
                JsValue::Undefined,
                JsValue::Undefined,
            ],
        },
        _ if code < 0 => vec![uv_error(code, kind)],
        _ => match fs_result(kind, result, payload) {
            Some(value) => vec![JsValue::Null, value],
            None => vec![JsValue::Null],
        },
    }
}

fn uv_error(code: i32, kind: RequestKind) -> JsValue {
    let code = if code < 0 { code } else { status::EIO };
    JsValue::from(ScriptError::uv(code, kind.syscall()))
}

fn fs_result(
    kind: RequestKind,
    result: CompletionPayload,
    payload: RequestPayload,
) -> Option<JsValue> {
    match (kind, result) {
        (RequestKind::FsOpen, CompletionPayload::Fd(fd)) => Some(JsValue::from(fd)),
        (RequestKind::FsRead, CompletionPayload::Data(data)) => {
            let copied = match payload {
                RequestPayload::ReadInto { buffer, offset } => {
                    buffer::copy_into(&buffer, &data, 0, data.len(), offset)
                }
                _ => 0,
            };
            Some(JsValue::from(copied))
        }
        (RequestKind::FsWrite, CompletionPayload::Count(n)) => Some(JsValue::from(n)),
        (RequestKind::FsStat | RequestKind::FsFstat, CompletionPayload::Stat(stat)) => Some(
            serde_json::to_value(&stat)
                .map(JsValue::from)
                .unwrap_or(JsValue::Null),
        ),
        (RequestKind::FsReadDir, CompletionPayload::Entries(names)) => Some(JsValue::from(
            names.into_iter().map(JsValue::from).collect::<Vec<_>>(),
        )),
        _ => None,
    }
}
