//! Host functions exposed to scripts.
//!
//! These are the native halves of the script modules built on the wrap
//! core: timers, TCP and UDP sockets, filesystem, DNS, the work queue,
//! process control and console output. Each module only uses the public
//! core API (`handle`, `request`, `callback`, `buffer`).
//!
//! Argument problems are reported as a thrown [`ScriptError`]; OS-level
//! outcomes are returned as a status code or delivered to the operation's
//! callback.

pub mod console;
pub mod dns;
pub mod fs;
pub mod process;
pub mod tcp;
pub mod timer;
pub mod udp;
pub mod work;

use std::net::{IpAddr, SocketAddr};

use tracing::debug;

use crate::arena::WrapId;
use crate::buffer;
use crate::callback::invoke_callback;
use crate::context::Runtime;
use crate::engine::OsHandleId;
use crate::error::ScriptError;
use crate::handle::{self, CloseCallback, EventCallback};
use crate::value::{JsFunction, JsObject, JsValue};

/// Result type for host functions; the error is thrown into script
pub type HostResult<T> = std::result::Result<T, ScriptError>;

/// Bind `object` to a freshly created OS handle, closing the OS handle
/// again if binding fails
pub(crate) fn create_handle(
    rt: &Runtime,
    object: &JsObject,
    os: OsHandleId,
    on_event: EventCallback,
) -> HostResult<WrapId> {
    match handle::create(rt, object, os, Some(on_event)) {
        Ok(id) => Ok(id),
        Err(e) => {
            rt.event_loop().close(os);
            Err(e.to_script_error())
        }
    }
}

/// Wrap and OS handle behind a handle object
pub(crate) fn handle_of(rt: &Runtime, object: &JsObject) -> HostResult<(WrapId, OsHandleId)> {
    let id = handle::from_script_object(rt, object)
        .ok_or_else(|| ScriptError::type_error("object is not an open handle"))?;
    let os = handle::expect_open(rt, id)
        .ok_or_else(|| ScriptError::error("handle is closed"))?;
    Ok((id, os))
}

/// Close any handle object.
///
/// `callback` runs with the object as `this` once the close completes.
/// Closing an object that is already closed is ignored.
pub fn close(rt: &Runtime, object: &JsObject, callback: Option<JsFunction>) -> HostResult<()> {
    let Some(id) = handle::from_script_object(rt, object) else {
        debug!("close on object without a live handle ignored");
        return Ok(());
    };
    let on_close = callback.map(|callback| -> CloseCallback {
        Box::new(move |rt: &Runtime, object: &JsObject| {
            invoke_callback(rt, &callback, &JsValue::from(object.clone()), &[]);
        })
    });
    handle::close(rt, id, on_close);
    Ok(())
}

/// Keep the loop alive while this handle is active (the default)
pub fn ref_handle(rt: &Runtime, object: &JsObject) -> HostResult<()> {
    let (_, os) = handle_of(rt, object)?;
    rt.event_loop().ref_handle(os);
    Ok(())
}

/// Let the loop exit even while this handle is active
pub fn unref_handle(rt: &Runtime, object: &JsObject) -> HostResult<()> {
    let (_, os) = handle_of(rt, object)?;
    rt.event_loop().unref_handle(os);
    Ok(())
}

/// Bytes of a buffer argument
pub(crate) fn buffer_bytes(object: &JsObject) -> HostResult<Vec<u8>> {
    buffer::to_vec(object).ok_or_else(|| ScriptError::type_error("argument must be a buffer"))
}

/// Socket address from a textual IP and a port
pub(crate) fn parse_addr(ip: &str, port: u16) -> Option<SocketAddr> {
    ip.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, port))
}

/// Script-facing family name of an address
pub(crate) fn family_name(addr: &SocketAddr) -> &'static str {
    if addr.is_ipv4() {
        "IPv4"
    } else {
        "IPv6"
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::engine::PollMode;
    use std::time::{Duration, Instant};

    pub fn create_runtime() -> Runtime {
        Runtime::new(RuntimeConfig::default().with_thread_pool_size(2)).unwrap()
    }

    /// Run iterations until `done` holds, failing after five seconds
    pub fn run_until(rt: &Runtime, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for the loop");
            rt.run_once(PollMode::NoWait);
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
