//! Filesystem host functions.
//!
//! Every operation runs on the worker pool and reports through an
//! error-first callback: `(err)` on failure, `(null, result)` on success.
//! Descriptors are virtual; see [`crate::engine::fs::FileTable`].

use std::path::PathBuf;

use super::HostResult;
use crate::buffer;
use crate::context::Runtime;
use crate::engine::fs::{FsOp, OpenFlags};
use crate::error::ScriptError;
use crate::request::{self, RequestKind, RequestPayload};
use crate::value::{JsFunction, JsObject};

/// Permission bits used when none are given
pub const DEFAULT_FILE_MODE: u32 = 0o666;

/// Permission bits used for new directories when none are given
pub const DEFAULT_DIR_MODE: u32 = 0o777;

fn submit(
    rt: &Runtime,
    kind: RequestKind,
    payload: RequestPayload,
    op: FsOp,
    callback: JsFunction,
) -> HostResult<i32> {
    let (_, req) = request::create(rt, Some(callback), kind, payload);
    Ok(request::dispatch(rt, req, rt.event_loop().fs(req, op)))
}

/// Absolute position, or `None` for the descriptor's current offset
fn position(value: Option<f64>) -> Option<u64> {
    value.filter(|p| p.is_finite() && *p >= 0.0).map(|p| p as u64)
}

/// Validate `offset`/`length` against a buffer of `buffer_len` bytes
fn checked_range(buffer_len: usize, offset: f64, length: f64) -> HostResult<(usize, usize)> {
    let offset = buffer::to_index(offset)
        .filter(|o| *o <= buffer_len)
        .ok_or_else(|| ScriptError::range_error("offset out of bound"))?;
    let length = buffer::to_index(length)
        .filter(|l| *l <= buffer_len - offset)
        .ok_or_else(|| ScriptError::range_error("length out of bound"))?;
    Ok((offset, length))
}

fn buffer_len(object: &JsObject) -> HostResult<usize> {
    buffer::length(object).ok_or_else(|| ScriptError::type_error("buffer must be a Buffer"))
}

/// Open `path`; the callback receives the descriptor
pub fn open(
    rt: &Runtime,
    path: &str,
    flags: &str,
    mode: Option<u32>,
    callback: JsFunction,
) -> HostResult<i32> {
    let flags = OpenFlags::parse(flags)
        .ok_or_else(|| ScriptError::type_error(format!("Unknown file open flag: {}", flags)))?;
    let op = FsOp::Open {
        path: PathBuf::from(path),
        flags,
        mode: mode.unwrap_or(DEFAULT_FILE_MODE),
    };
    submit(rt, RequestKind::FsOpen, RequestPayload::None, op, callback)
}

/// Close a descriptor
pub fn close(rt: &Runtime, fd: i32, callback: JsFunction) -> HostResult<i32> {
    submit(rt, RequestKind::FsClose, RequestPayload::None, FsOp::Close { fd }, callback)
}

/// Read up to `length` bytes into `buffer` at `offset`; the callback
/// receives the number of bytes read
pub fn read(
    rt: &Runtime,
    fd: i32,
    buffer: &JsObject,
    offset: f64,
    length: f64,
    position_arg: Option<f64>,
    callback: JsFunction,
) -> HostResult<i32> {
    let (offset, length) = checked_range(buffer_len(buffer)?, offset, length)?;
    let op = FsOp::Read {
        fd,
        len: length,
        position: position(position_arg),
    };
    let payload = RequestPayload::ReadInto {
        buffer: buffer.clone(),
        offset,
    };
    submit(rt, RequestKind::FsRead, payload, op, callback)
}

/// Write `length` bytes of `buffer` from `offset`; the callback receives
/// the number of bytes written
pub fn write(
    rt: &Runtime,
    fd: i32,
    buffer: &JsObject,
    offset: f64,
    length: f64,
    position_arg: Option<f64>,
    callback: JsFunction,
) -> HostResult<i32> {
    let (offset, length) = checked_range(buffer_len(buffer)?, offset, length)?;
    let data = buffer::to_vec(buffer)
        .map(|bytes| bytes[offset..offset + length].to_vec())
        .unwrap_or_default();
    let op = FsOp::Write {
        fd,
        data,
        position: position(position_arg),
    };
    submit(rt, RequestKind::FsWrite, RequestPayload::None, op, callback)
}

/// Stat a path; the callback receives a stat object
pub fn stat(rt: &Runtime, path: &str, callback: JsFunction) -> HostResult<i32> {
    let op = FsOp::Stat {
        path: PathBuf::from(path),
    };
    submit(rt, RequestKind::FsStat, RequestPayload::None, op, callback)
}

/// Stat a descriptor
pub fn fstat(rt: &Runtime, fd: i32, callback: JsFunction) -> HostResult<i32> {
    submit(rt, RequestKind::FsFstat, RequestPayload::None, FsOp::Fstat { fd }, callback)
}

/// List a directory; the callback receives the entry names
pub fn read_dir(rt: &Runtime, path: &str, callback: JsFunction) -> HostResult<i32> {
    let op = FsOp::ReadDir {
        path: PathBuf::from(path),
    };
    submit(rt, RequestKind::FsReadDir, RequestPayload::None, op, callback)
}

/// Create a directory
pub fn mkdir(rt: &Runtime, path: &str, mode: Option<u32>, callback: JsFunction) -> HostResult<i32> {
    let op = FsOp::Mkdir {
        path: PathBuf::from(path),
        mode: mode.unwrap_or(DEFAULT_DIR_MODE),
    };
    submit(rt, RequestKind::FsMkdir, RequestPayload::None, op, callback)
}

/// Remove an empty directory
pub fn rmdir(rt: &Runtime, path: &str, callback: JsFunction) -> HostResult<i32> {
    let op = FsOp::Rmdir {
        path: PathBuf::from(path),
    };
    submit(rt, RequestKind::FsRmdir, RequestPayload::None, op, callback)
}

/// Remove a file
pub fn unlink(rt: &Runtime, path: &str, callback: JsFunction) -> HostResult<i32> {
    let op = FsOp::Unlink {
        path: PathBuf::from(path),
    };
    submit(rt, RequestKind::FsUnlink, RequestPayload::None, op, callback)
}

/// Rename `from` to `to`
pub fn rename(rt: &Runtime, from: &str, to: &str, callback: JsFunction) -> HostResult<i32> {
    let op = FsOp::Rename {
        from: PathBuf::from(from),
        to: PathBuf::from(to),
    };
    submit(rt, RequestKind::FsRename, RequestPayload::None, op, callback)
}
