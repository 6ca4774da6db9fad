//! Handle wraps.
//!
//! A [`HandleWrap`] ties a long-lived OS handle (timer, socket) to the
//! script object that represents it. The wrap keeps the object alive from
//! creation until the loop confirms the handle is closed, and the OS
//! handle's user-data slot points back at the wrap, so events can be
//! routed from either side.
//!
//! States only move forward: `Open -> Closing -> Closed`.

use std::fmt;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::arena::{lifetime_violation, WrapId};
use crate::context::Runtime;
use crate::engine::{DatagramEvent, HandleKind, OsHandleId, StreamEvent};
use crate::error::{BridgeError, Result};
use crate::value::{JsObject, NativeBinding};

/// Runs once the OS confirms the close, before the wrap is released
pub type CloseCallback = Box<dyn FnOnce(&Runtime, &JsObject)>;

/// Receives the events of an open handle
pub type EventCallback = Rc<dyn Fn(&Runtime, &JsObject, HandleEvent)>;

/// Event delivered to an open handle
#[derive(Debug, Clone, PartialEq)]
pub enum HandleEvent {
    /// A timer expired
    Timeout,
    /// A stream produced data, end of stream or an error
    Stream(StreamEvent),
    /// A datagram socket received a message or an error
    Datagram(DatagramEvent),
}

/// Lifecycle state of a handle wrap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Usable
    Open,
    /// Close requested, waiting for the loop to confirm
    Closing,
    /// Close confirmed; the wrap is about to be freed
    Closed,
}

/// Native side of a script-visible handle object
pub struct HandleWrap {
    kind: HandleKind,
    object: Option<JsObject>,
    os: Option<OsHandleId>,
    state: HandleState,
    on_close: Option<CloseCallback>,
    on_event: Option<EventCallback>,
}

impl HandleWrap {
    /// Resource type
    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    /// Current state
    pub fn state(&self) -> HandleState {
        self.state
    }

    /// OS handle, `None` once closed
    pub fn os_handle(&self) -> Option<OsHandleId> {
        self.os
    }
}

impl fmt::Debug for HandleWrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleWrap")
            .field("kind", &self.kind)
            .field("os", &self.os)
            .field("state", &self.state)
            .field("has_close_callback", &self.on_close.is_some())
            .finish()
    }
}

/// Bind `object` to the OS handle `os`.
///
/// The object is kept alive until the close completes. If binding fails
/// the wrap is discarded and the caller still owns `os` and must close it.
pub fn create(
    rt: &Runtime,
    object: &JsObject,
    os: OsHandleId,
    on_event: Option<EventCallback>,
) -> Result<WrapId> {
    let kind = rt
        .event_loop()
        .handle_kind(os)
        .ok_or_else(|| BridgeError::InvalidState(format!("unknown OS handle {}", os)))?;

    let id = {
        let mut handles = rt.handles().borrow_mut();
        let id = handles.attach(HandleWrap {
            kind,
            object: Some(object.clone()),
            os: Some(os),
            state: HandleState::Open,
            on_close: None,
            on_event,
        });
        handles.acquire(id);
        id
    };

    if object.set_native(NativeBinding::Handle(id)).is_err() {
        let discarded = {
            let mut handles = rt.handles().borrow_mut();
            let _ = handles.release(id);
            handles.complete(id)
        };
        drop(discarded);
        return Err(BridgeError::Binding(
            "object already carries native data".to_string(),
        ));
    }

    rt.event_loop().set_data(os, Some(id));
    rt.metrics().record_handle_opened(&kind.to_string());
    debug!(wrap = %id, handle = %os, %kind, "handle wrap created");
    Ok(id)
}

/// Wrap bound to a script object, if it is a live handle
pub fn from_script_object(rt: &Runtime, object: &JsObject) -> Option<WrapId> {
    let id = object.handle_id()?;
    let os = {
        let handles = rt.handles().borrow();
        let wrap = handles.get(id)?;
        wrap.os
    };
    if let Some(os) = os {
        if rt.event_loop().data(os) != Some(id) {
            lifetime_violation("OS handle does not point back at its wrap", id);
            return None;
        }
    }
    Some(id)
}

/// Wrap stored in an OS handle's user-data slot
pub fn from_os_handle(rt: &Runtime, os: OsHandleId) -> Option<WrapId> {
    let id = rt.event_loop().data(os)?;
    let handles = rt.handles().borrow();
    match handles.get(id) {
        Some(wrap) if wrap.os == Some(os) => Some(id),
        Some(_) => {
            lifetime_violation("wrap does not point back at its OS handle", id);
            None
        }
        None => None,
    }
}

/// Current state, `None` once the wrap has been freed
pub fn state(rt: &Runtime, id: WrapId) -> Option<HandleState> {
    rt.handles().borrow().get(id).map(|w| w.state)
}

/// Script object of a live wrap
pub fn object(rt: &Runtime, id: WrapId) -> Option<JsObject> {
    rt.handles().borrow().get(id).and_then(|w| w.object.clone())
}

/// OS handle of a wrap that is about to be operated on.
///
/// Reaching a freed wrap or one whose OS handle is gone is a lifetime bug.
pub fn expect_open(rt: &Runtime, id: WrapId) -> Option<OsHandleId> {
    let handles = rt.handles().borrow();
    let Some(wrap) = handles.get(id) else {
        drop(handles);
        lifetime_violation("operation on freed handle wrap", id);
        return None;
    };
    match wrap.os {
        Some(os) => Some(os),
        None => {
            drop(handles);
            lifetime_violation("operation on closed handle", id);
            None
        }
    }
}

/// Request an asynchronous close.
///
/// Closing a handle that is already closing or closed only logs; the
/// second callback is dropped and the first one still runs exactly once.
pub fn close(rt: &Runtime, id: WrapId, on_close: Option<CloseCallback>) {
    let os = {
        let mut handles = rt.handles().borrow_mut();
        let Some(wrap) = handles.get_mut(id) else {
            debug!(wrap = %id, "close on freed handle wrap ignored");
            return;
        };
        if wrap.state != HandleState::Open {
            debug!(wrap = %id, state = ?wrap.state, "handle already closing");
            return;
        }
        let Some(os) = wrap.os else {
            debug!(wrap = %id, "close on handle without OS handle ignored");
            return;
        };
        if rt.event_loop().is_closing(os) {
            debug!(wrap = %id, handle = %os, "OS handle already closing");
            return;
        }
        wrap.on_close = on_close;
        wrap.state = HandleState::Closing;
        os
    };

    trace!(wrap = %id, handle = %os, "closing handle");
    rt.event_loop().close(os);
}

/// Close completion, run by the loop's close phase.
///
/// Invokes the close callback, detaches the OS handle, drops the keep-alive
/// reference and frees the wrap.
pub fn on_closed(rt: &Runtime, id: WrapId) {
    let (callback, object) = {
        let mut handles = rt.handles().borrow_mut();
        let Some(wrap) = handles.get_mut(id) else {
            drop(handles);
            lifetime_violation("close completion for freed handle wrap", id);
            return;
        };
        if wrap.state != HandleState::Closing {
            let state = wrap.state;
            drop(handles);
            debug!(wrap = %id, ?state, "close completion outside closing state");
            lifetime_violation("close completion without a close request", id);
            return;
        }
        (wrap.on_close.take(), wrap.object.clone())
    };

    if let (Some(callback), Some(object)) = (callback, object.as_ref()) {
        callback(rt, object);
    }

    let (keep_alive, freed) = {
        let mut handles = rt.handles().borrow_mut();
        let keep_alive = handles.get_mut(id).and_then(|wrap| {
            wrap.os = None;
            wrap.state = HandleState::Closed;
            wrap.on_event = None;
            wrap.object.take()
        });
        let released = handles.release(id);
        let completed = handles.complete(id);
        (keep_alive, released.or(completed))
    };

    if let Some(object) = keep_alive.as_ref() {
        if object.handle_id() == Some(id) {
            let _ = object.take_native();
        }
    }
    rt.metrics().record_handle_closed();
    if freed.is_some() {
        rt.metrics().record_handle_freed();
    }
    debug!(wrap = %id, "handle wrap closed");
    drop(freed);
    drop(keep_alive);
}

/// Route an OS event to the wrap owning `os`.
///
/// Events for unknown handles or handles no longer open are dropped.
pub fn dispatch_event(rt: &Runtime, os: OsHandleId, event: HandleEvent) {
    let Some(id) = from_os_handle(rt, os) else {
        debug!(handle = %os, ?event, "event for unknown handle dropped");
        return;
    };
    let target = {
        let handles = rt.handles().borrow();
        handles.get(id).and_then(|wrap| match wrap.state {
            HandleState::Open => wrap.object.clone().zip(wrap.on_event.clone()),
            _ => None,
        })
    };
    match target {
        Some((object, on_event)) => on_event(rt, &object, event),
        None => debug!(wrap = %id, ?event, "event for closing handle dropped"),
    }
}
