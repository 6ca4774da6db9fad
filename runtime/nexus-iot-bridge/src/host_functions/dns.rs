//! DNS host functions.

use super::HostResult;
use crate::context::Runtime;
use crate::error::ScriptError;
use crate::request::{self, RequestKind, RequestPayload};
use crate::value::JsFunction;

/// Resolve `hostname` to its first address of `family` (0 for any, 4 or 6).
///
/// The callback receives `(err, address, family)`.
pub fn get_addr_info(
    rt: &Runtime,
    hostname: &str,
    family: i32,
    callback: JsFunction,
) -> HostResult<i32> {
    let family = match family {
        0 => 0u8,
        4 => 4,
        6 => 6,
        _ => return Err(ScriptError::type_error("bad address family")),
    };
    let (_, req) = request::create(
        rt,
        Some(callback),
        RequestKind::GetAddrInfo,
        RequestPayload::None,
    );
    let code = rt.event_loop().getaddrinfo(req, hostname.to_string(), family);
    Ok(request::dispatch(rt, req, code))
}
