//! TCP host functions.
//!
//! Connect, write and shutdown are requests with a `(status)` callback.
//! Incoming data goes to the socket object's `onread(nread, is_eof, buffer)`.

use std::rc::Rc;

use tracing::debug;

use super::{buffer_bytes, create_handle, handle_of, parse_addr, HostResult};
use crate::buffer;
use crate::callback::invoke_callback;
use crate::context::Runtime;
use crate::engine::StreamEvent;
use crate::error::{status, ScriptError};
use crate::handle::{self, HandleEvent};
use crate::request::{self, RequestKind, RequestPayload};
use crate::value::{JsFunction, JsObject, JsValue};

/// Property receiving incoming data
pub const READ_METHOD: &str = "onread";

fn on_stream_event(rt: &Runtime, object: &JsObject, event: HandleEvent) {
    let HandleEvent::Stream(event) = event else {
        return;
    };

    let args = match event {
        StreamEvent::Data(data) => {
            let nread = data.len();
            vec![
                JsValue::from(nread),
                JsValue::from(false),
                JsValue::from(buffer::from_vec(data)),
            ]
        }
        StreamEvent::Eof => vec![
            JsValue::from(status::EOF),
            JsValue::from(true),
            JsValue::Undefined,
        ],
        StreamEvent::Error(code) => vec![
            JsValue::from(code),
            JsValue::from(false),
            JsValue::Undefined,
        ],
    };

    // nothing more will arrive after end of stream or an error
    if args[0].as_number().is_some_and(|n| n < 0.0) {
        let open = handle::from_script_object(rt, object)
            .and_then(|id| handle::expect_open(rt, id));
        if let Some(os) = open {
            rt.event_loop().read_stop(os);
        }
    }

    match object.get_function(READ_METHOD) {
        Some(onread) => invoke_callback(rt, &onread, &JsValue::from(object.clone()), &args),
        None => debug!("stream data without {}", READ_METHOD),
    }
}

/// Bind a new TCP handle to `object`
pub fn create(rt: &Runtime, object: &JsObject) -> HostResult<()> {
    let os = rt
        .event_loop()
        .tcp_init()
        .map_err(|code| ScriptError::uv(code, "socket"))?;
    create_handle(rt, object, os, Rc::new(on_stream_event))?;
    Ok(())
}

/// Connect to `ip:port`; `callback(status)` fires once done
pub fn connect(
    rt: &Runtime,
    object: &JsObject,
    ip: &str,
    port: u16,
    callback: JsFunction,
) -> HostResult<i32> {
    let (_, os) = handle_of(rt, object)?;
    let (_, req) = request::create(rt, Some(callback), RequestKind::Connect, RequestPayload::None);
    let code = match parse_addr(ip, port) {
        Some(addr) => rt.event_loop().tcp_connect(os, addr, req),
        None => status::EINVAL,
    };
    Ok(request::dispatch_on(rt, Some(os), req, code))
}

/// Write the contents of `data`; `callback(status)` fires once written
pub fn write(
    rt: &Runtime,
    object: &JsObject,
    data: &JsObject,
    callback: JsFunction,
) -> HostResult<i32> {
    let (_, os) = handle_of(rt, object)?;
    let bytes = buffer_bytes(data)?;
    let (_, req) = request::create(rt, Some(callback), RequestKind::Write, RequestPayload::None);
    let code = rt.event_loop().tcp_write(os, bytes, req);
    Ok(request::dispatch_on(rt, Some(os), req, code))
}

/// Shut down the write side after pending writes
pub fn shutdown(rt: &Runtime, object: &JsObject, callback: JsFunction) -> HostResult<i32> {
    let (_, os) = handle_of(rt, object)?;
    let (_, req) = request::create(
        rt,
        Some(callback),
        RequestKind::Shutdown,
        RequestPayload::None,
    );
    let code = rt.event_loop().tcp_shutdown(os, req);
    Ok(request::dispatch_on(rt, Some(os), req, code))
}

/// Start delivering incoming data to `onread`
pub fn read_start(rt: &Runtime, object: &JsObject) -> HostResult<i32> {
    let (_, os) = handle_of(rt, object)?;
    Ok(rt.event_loop().read_start(os))
}

/// Stop delivering incoming data
pub fn read_stop(rt: &Runtime, object: &JsObject) -> HostResult<i32> {
    let (_, os) = handle_of(rt, object)?;
    Ok(rt.event_loop().read_stop(os))
}

/// Close the socket; `callback` runs once closed
pub fn close(rt: &Runtime, object: &JsObject, callback: Option<JsFunction>) -> HostResult<()> {
    super::close(rt, object, callback)
}
