//! UDP host functions.
//!
//! Sends are requests whose callback receives `(status, msg_size)`.
//! Incoming datagrams go to `onmessage(nread, socket, buffer, rinfo)`.

use std::net::SocketAddr;
use std::rc::Rc;

use tracing::debug;

use super::{buffer_bytes, create_handle, family_name, handle_of, parse_addr, HostResult};
use crate::buffer;
use crate::callback::invoke_callback;
use crate::context::Runtime;
use crate::engine::DatagramEvent;
use crate::error::status;
use crate::handle::HandleEvent;
use crate::request::{self, RequestKind, RequestPayload};
use crate::value::{JsFunction, JsObject, JsValue};

/// Property receiving incoming datagrams
pub const MESSAGE_METHOD: &str = "onmessage";

fn remote_info(from: &SocketAddr) -> JsObject {
    let rinfo = JsObject::new();
    rinfo.set("address", from.ip().to_string());
    rinfo.set("port", from.port() as i32);
    rinfo.set("family", family_name(from));
    rinfo
}

fn on_datagram_event(rt: &Runtime, object: &JsObject, event: HandleEvent) {
    let HandleEvent::Datagram(event) = event else {
        return;
    };
    let this = JsValue::from(object.clone());
    let args = match event {
        DatagramEvent::Message { data, from } => vec![
            JsValue::from(data.len()),
            this.clone(),
            JsValue::from(buffer::from_vec(data)),
            JsValue::from(remote_info(&from)),
        ],
        DatagramEvent::Error(code) => vec![JsValue::from(code), this.clone()],
    };

    match object.get_function(MESSAGE_METHOD) {
        Some(onmessage) => invoke_callback(rt, &onmessage, &this, &args),
        None => debug!("datagram without {}", MESSAGE_METHOD),
    }
}

fn any_addr() -> SocketAddr {
    SocketAddr::from(([0u8; 4], 0))
}

/// Bind a new UDP handle to `object`
pub fn create(rt: &Runtime, object: &JsObject) -> HostResult<()> {
    let os = rt.event_loop().udp_init();
    create_handle(rt, object, os, Rc::new(on_datagram_event))?;
    Ok(())
}

/// Bind the socket to `ip:port` synchronously
pub fn bind(rt: &Runtime, object: &JsObject, ip: &str, port: u16) -> HostResult<i32> {
    let (_, os) = handle_of(rt, object)?;
    Ok(match parse_addr(ip, port) {
        Some(addr) => rt.event_loop().udp_bind(os, addr),
        None => status::EINVAL,
    })
}

/// Local port, once bound
pub fn local_port(rt: &Runtime, object: &JsObject) -> HostResult<Option<u16>> {
    let (_, os) = handle_of(rt, object)?;
    Ok(rt.event_loop().udp_local_addr(os).map(|addr| addr.port()))
}

/// Send `data` to `ip:port`; an unbound socket is bound to an ephemeral
/// port first
pub fn send(
    rt: &Runtime,
    object: &JsObject,
    data: &JsObject,
    port: u16,
    ip: &str,
    callback: Option<JsFunction>,
) -> HostResult<i32> {
    let (_, os) = handle_of(rt, object)?;
    let bytes = buffer_bytes(data)?;
    let (_, req) = request::create(
        rt,
        callback,
        RequestKind::Send,
        RequestPayload::MessageSize(bytes.len()),
    );
    let code = match parse_addr(ip, port) {
        Some(addr) => rt.event_loop().udp_send(os, bytes, addr, req),
        None => status::EINVAL,
    };
    Ok(request::dispatch_on(rt, Some(os), req, code))
}

/// Start delivering datagrams to `onmessage`
pub fn recv_start(rt: &Runtime, object: &JsObject) -> HostResult<i32> {
    let (_, os) = handle_of(rt, object)?;
    if !rt.event_loop().udp_is_bound(os) {
        let code = rt.event_loop().udp_bind(os, any_addr());
        if code != status::OK {
            return Ok(code);
        }
    }
    Ok(rt.event_loop().udp_recv_start(os))
}

/// Stop delivering datagrams
pub fn recv_stop(rt: &Runtime, object: &JsObject) -> HostResult<i32> {
    let (_, os) = handle_of(rt, object)?;
    Ok(rt.event_loop().udp_recv_stop(os))
}

/// Close the socket; `callback` runs once closed
pub fn close(rt: &Runtime, object: &JsObject, callback: Option<JsFunction>) -> HostResult<()> {
    super::close(rt, object, callback)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use std::cell::RefCell;
    use std::net::UdpSocket;

    #[test]
    fn test_send_reports_size() {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = peer.local_addr().unwrap().port();

        let rt = create_runtime();
        let object = JsObject::new();
        create(&rt, &object).unwrap();

        let result = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&result);
        let callback = JsFunction::new("sent", move |_, _, args| {
            *slot.borrow_mut() = Some(args.to_vec());
            Ok(JsValue::Undefined)
        });
        let data = buffer::from_bytes(b"ping!");
        let code = send(&rt, &object, &data, port, "127.0.0.1", Some(callback)).unwrap();
        assert_eq!(code, status::OK);

        run_until(&rt, || result.borrow().is_some());
        assert_eq!(
            result.borrow().clone().unwrap(),
            vec![JsValue::from(0), JsValue::from(5)]
        );

        let mut buf = [0u8; 16];
        let (n, _) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping!");
    }

    #[test]
    fn test_receive_message_with_rinfo() {
        let rt = create_runtime();
        let object = JsObject::new();
        let received = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&received);
        object.set(
            MESSAGE_METHOD,
            JsFunction::new(MESSAGE_METHOD, move |_, _, args| {
                log.borrow_mut().push(args.to_vec());
                Ok(JsValue::Undefined)
            }),
        );
        create(&rt, &object).unwrap();
        assert_eq!(bind(&rt, &object, "127.0.0.1", 0).unwrap(), status::OK);
        assert_eq!(recv_start(&rt, &object).unwrap(), status::OK);
        let port = local_port(&rt, &object).unwrap().unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.send_to(b"hi", ("127.0.0.1", port)).unwrap();

        run_until(&rt, || !received.borrow().is_empty());
        let args = received.borrow()[0].clone();
        assert_eq!(args[0], JsValue::from(2));
        assert_eq!(args[1], JsValue::from(object.clone()));
        assert_eq!(buffer::to_vec(args[2].as_object().unwrap()).unwrap(), b"hi".to_vec());
        let rinfo = args[3].as_object().unwrap();
        assert_eq!(rinfo.get("address"), JsValue::from("127.0.0.1"));
        assert_eq!(rinfo.get("family"), JsValue::from("IPv4"));
        assert_eq!(
            rinfo.get("port"),
            JsValue::from(peer.local_addr().unwrap().port() as i32)
        );

        close(&rt, &object, None).unwrap();
        rt.run_loop();
        assert_eq!(rt.live_handles(), 0);
    }

    #[test]
    fn test_bind_twice_fails() {
        let rt = create_runtime();
        let object = JsObject::new();
        create(&rt, &object).unwrap();
        assert_eq!(bind(&rt, &object, "127.0.0.1", 0).unwrap(), status::OK);
        assert_eq!(bind(&rt, &object, "127.0.0.1", 0).unwrap(), status::EINVAL);
        assert!(bind(&rt, &JsObject::new(), "127.0.0.1", 0).is_err());
    }

    #[test]
    fn test_unbound_close_is_immediate() {
        let rt = create_runtime();
        let object = JsObject::new();
        create(&rt, &object).unwrap();
        close(&rt, &object, None).unwrap();
        rt.run_once(crate::engine::PollMode::NoWait);
        assert_eq!(rt.live_handles(), 0);
    }
}
