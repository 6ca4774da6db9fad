//! Byte buffers shared between native code and script.
//!
//! A buffer is a script object carrying a [`NativeBinding::Buffer`]. Its
//! bytes are either owned by the wrap or lent by an external owner that
//! registered a free callback; in both cases the memory is released on
//! exactly one path, when the [`BufferWrap`] is dropped.
//!
//! Offsets coming from script are clamped, never rejected. Every
//! operation returns the number of bytes it actually touched.

use std::fmt;

use crate::value::{JsObject, NativeBinding};

type FreeCallback = Box<dyn FnOnce(Vec<u8>)>;

struct ExternalMemory {
    data: Vec<u8>,
    free: Option<FreeCallback>,
}

impl Drop for ExternalMemory {
    fn drop(&mut self) {
        if let Some(free) = self.free.take() {
            free(std::mem::take(&mut self.data));
        }
    }
}

enum Storage {
    Owned(Vec<u8>),
    External(ExternalMemory),
}

/// Native side of a buffer object
pub struct BufferWrap {
    storage: Storage,
}

impl BufferWrap {
    /// Zero-filled buffer of `len` bytes
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    /// Take ownership of `data`
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            storage: Storage::Owned(data),
        }
    }

    /// Borrow externally owned memory; `free` receives it back when the
    /// wrap is destroyed
    pub fn external(data: Vec<u8>, free: impl FnOnce(Vec<u8>) + 'static) -> Self {
        Self {
            storage: Storage::External(ExternalMemory {
                data,
                free: Some(Box::new(free)),
            }),
        }
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the memory belongs to an external owner
    pub fn is_external(&self) -> bool {
        matches!(self.storage, Storage::External(_))
    }

    /// Contents
    pub fn as_slice(&self) -> &[u8] {
        match &self.storage {
            Storage::Owned(data) => data,
            Storage::External(ext) => &ext.data,
        }
    }

    /// Mutable contents
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Storage::Owned(data) => data,
            Storage::External(ext) => &mut ext.data,
        }
    }

    /// Clamped copy of `src[src_from..src_to]` to offset `dst_from`
    pub fn copy_from(
        &mut self,
        src: &[u8],
        src_from: usize,
        src_to: usize,
        dst_from: usize,
    ) -> usize {
        copy(self.as_mut_slice(), src, src_from, src_to, dst_from)
    }
}

impl fmt::Debug for BufferWrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferWrap")
            .field("len", &self.len())
            .field("external", &self.is_external())
            .finish()
    }
}

/// Copy `src[src_from..src_to]` into `dst` starting at `dst_from`.
///
/// Never writes outside `dst` and never reads at or past `src_to` or the
/// end of `src`. Returns the number of bytes copied.
pub fn copy(dst: &mut [u8], src: &[u8], src_from: usize, src_to: usize, dst_from: usize) -> usize {
    let src_end = src_to.min(src.len());
    if src_from >= src_end || dst_from >= dst.len() {
        return 0;
    }
    let n = (src_end - src_from).min(dst.len() - dst_from);
    dst[dst_from..dst_from + n].copy_from_slice(&src[src_from..src_from + n]);
    n
}

/// Convert a script number to an index. Negative, NaN and infinite
/// values have no index.
pub fn to_index(value: f64) -> Option<usize> {
    if value.is_nan() || value.is_infinite() || value < 0.0 {
        None
    } else {
        Some(value as usize)
    }
}

/// Clamp a script index into `[low, upper]`; a missing index maps to `low`
pub fn bound_range(index: f64, low: usize, upper: usize) -> usize {
    match to_index(index) {
        None => low,
        Some(i) if i > upper => upper,
        Some(i) => i,
    }
}

fn wrap(buf: BufferWrap) -> JsObject {
    let object = JsObject::new();
    object.set("length", buf.len());
    // a fresh object has no binding yet
    let _ = object.set_native(NativeBinding::Buffer(buf));
    object
}

/// Create a zero-filled buffer object
pub fn create(len: usize) -> JsObject {
    wrap(BufferWrap::new(len))
}

/// Create a buffer object holding a copy of `bytes`
pub fn from_bytes(bytes: &[u8]) -> JsObject {
    wrap(BufferWrap::from_vec(bytes.to_vec()))
}

/// Create a buffer object owning `data`
pub fn from_vec(data: Vec<u8>) -> JsObject {
    wrap(BufferWrap::from_vec(data))
}

/// Create a buffer object over externally owned memory
pub fn create_external(data: Vec<u8>, free: impl FnOnce(Vec<u8>) + 'static) -> JsObject {
    wrap(BufferWrap::external(data, free))
}

/// Whether `object` is a buffer
pub fn is_buffer(object: &JsObject) -> bool {
    object.with_buffer(|_| ()).is_some()
}

/// Length of a buffer object, cross-checked against the script-visible
/// `length` in debug builds
pub fn length(object: &JsObject) -> Option<usize> {
    let len = object.with_buffer(|b| b.len())?;
    debug_assert_eq!(
        object.get("length").as_number(),
        Some(len as f64),
        "buffer length disagrees with its script object"
    );
    Some(len)
}

/// Copy of a buffer's contents
pub fn to_vec(object: &JsObject) -> Option<Vec<u8>> {
    object.with_buffer(|b| b.as_slice().to_vec())
}

/// Clamped copy of native bytes into a buffer object
pub fn copy_into(
    dst: &JsObject,
    src: &[u8],
    src_from: usize,
    src_to: usize,
    dst_from: usize,
) -> usize {
    dst.with_buffer_mut(|b| b.copy_from(src, src_from, src_to, dst_from))
        .unwrap_or(0)
}

/// Buffer-to-buffer copy with script index semantics.
///
/// Indices are clamped to their buffer; `src_end < src_start` copies
/// nothing. `dst` and `src` may be the same object.
pub fn copy_from_object(
    dst: &JsObject,
    src: &JsObject,
    dst_start: f64,
    src_start: f64,
    src_end: f64,
) -> usize {
    let Some(src_bytes) = to_vec(src) else {
        return 0;
    };
    let Some(dst_len) = length(dst) else {
        return 0;
    };
    let src_len = src_bytes.len();

    let dst_start = bound_range(dst_start, 0, dst_len);
    let src_start = bound_range(src_start, 0, src_len);
    let src_end = bound_range(src_end, 0, src_len).max(src_start);

    copy_into(dst, &src_bytes, src_start, src_end, dst_start)
}

/// Lexicographic comparison: -1, 0 or 1
pub fn compare(a: &JsObject, b: &JsObject) -> Option<i32> {
    let left = to_vec(a)?;
    let right = to_vec(b)?;
    Some(match left.cmp(&right) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    })
}

/// Write UTF-8 text at `offset`, at most `length` bytes
pub fn write_str(object: &JsObject, text: &str, offset: f64, length: f64) -> usize {
    let Some(len) = self::length(object) else {
        return 0;
    };
    let offset = bound_range(offset, 0, len);
    let max = bound_range(length, 0, len - offset);
    let bytes = text.as_bytes();
    copy_into(object, bytes, 0, max.min(bytes.len()), offset)
}

/// Decode hex text into the buffer at `offset`, at most `length` bytes.
/// Decoding stops at the first character that is not a hex digit.
pub fn hex_write(object: &JsObject, text: &str, offset: f64, length: f64) -> usize {
    let Some(len) = self::length(object) else {
        return 0;
    };
    let offset = bound_range(offset, 0, len);
    let max = bound_range(length, 0, len - offset);

    let valid = text.bytes().take_while(u8::is_ascii_hexdigit).count() & !1;
    let decoded = match hex::decode(&text[..valid]) {
        Ok(decoded) => decoded,
        Err(_) => return 0,
    };
    copy_into(object, &decoded, 0, max.min(decoded.len()), offset)
}

/// Hex encoding of `[start, end)`
pub fn to_hex(object: &JsObject, start: f64, end: f64) -> String {
    object
        .with_buffer(|b| {
            let (s, e) = clamp_span(b.len(), start, end);
            hex::encode(&b.as_slice()[s..e])
        })
        .unwrap_or_default()
}

/// UTF-8 decoding of `[start, end)`, replacing invalid sequences
pub fn to_string_lossy(object: &JsObject, start: f64, end: f64) -> String {
    object
        .with_buffer(|b| {
            let (s, e) = clamp_span(b.len(), start, end);
            String::from_utf8_lossy(&b.as_slice()[s..e]).into_owned()
        })
        .unwrap_or_default()
}

/// New buffer holding a copy of `[start, end)`
pub fn slice(object: &JsObject, start: f64, end: f64) -> Option<JsObject> {
    let bytes = object.with_buffer(|b| {
        let (s, e) = clamp_span(b.len(), start, end);
        b.as_slice()[s..e].to_vec()
    })?;
    Some(from_vec(bytes))
}

fn clamp_span(len: usize, start: f64, end: f64) -> (usize, usize) {
    let start = bound_range(start, 0, len);
    let end = bound_range(end, 0, len).max(start);
    (start, end)
}
