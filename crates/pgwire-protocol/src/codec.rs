//! Low-level field helpers shared by the frontend and backend message codecs.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Write a NUL-terminated string.
pub fn put_cstr(dst: &mut impl BufMut, s: &str) {
    dst.put_slice(s.as_bytes());
    dst.put_u8(0);
}

/// Read a NUL-terminated string, consuming the terminator.
pub fn get_cstr(src: &mut Bytes, field: &'static str) -> Result<String, ProtocolError> {
    let end = src
        .iter()
        .position(|&b| b == 0)
        .ok_or(ProtocolError::UnexpectedEof {
            expected: 1,
            actual: 0,
        })?;
    let raw = src.split_to(end);
    src.advance(1);
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(field))
}

/// Ensure at least `n` bytes remain in `src`.
pub fn ensure(src: &impl Buf, n: usize) -> Result<(), ProtocolError> {
    if src.remaining() < n {
        return Err(ProtocolError::UnexpectedEof {
            expected: n,
            actual: src.remaining(),
        });
    }
    Ok(())
}

/// Read a big-endian `i32`.
pub fn get_i32(src: &mut Bytes) -> Result<i32, ProtocolError> {
    ensure(src, 4)?;
    Ok(src.get_i32())
}

/// Read a big-endian `i16`.
pub fn get_i16(src: &mut Bytes) -> Result<i16, ProtocolError> {
    ensure(src, 2)?;
    Ok(src.get_i16())
}

/// Write a message with a tag byte, back-patching the length once the body is known.
///
/// The length covers itself and the body but not the tag.
pub fn write_message(dst: &mut BytesMut, tag: Option<u8>, body: impl FnOnce(&mut BytesMut)) {
    if let Some(tag) = tag {
        dst.put_u8(tag);
    }
    let len_pos = dst.len();
    dst.put_i32(0);
    body(dst);
    let len = (dst.len() - len_pos) as i32;
    dst[len_pos..len_pos + 4].copy_from_slice(&len.to_be_bytes());
}
