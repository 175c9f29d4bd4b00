//! PostgreSQL wire protocol encoding and decoding primitives.
//!
//! PostgreSQL uses big-endian (network byte order) for all integers.

use crate::error::{Error, Result};
use zerocopy::FromBytes;

use super::types::{I16BE, I32BE, U16BE, U32BE};

/// Upper bound on a single message length field. A frame claiming more
/// than this is treated as a framing desync, not a huge message.
pub const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

/// One decoded message frame: tag byte plus payload (length field excluded).
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    /// Message type byte
    pub type_byte: u8,
    /// Message payload (after the length field)
    pub payload: &'a [u8],
}

/// Try to decode a single message frame from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame
/// (the caller reads more bytes and retries) and `Ok(Some((frame, n)))`
/// when a frame is complete, where `n` is the total number of bytes it
/// occupies in `buf`. A length field inconsistent with the protocol or a
/// tag byte outside the printable ASCII range is a framing desync: the
/// owning connection must be terminated.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Frame<'_>, usize)>> {
    if buf.len() < 5 {
        return Ok(None);
    }

    let type_byte = buf[0];
    if !type_byte.is_ascii_alphanumeric() {
        return Err(Error::Protocol(format!(
            "invalid message tag: 0x{:02x}",
            type_byte
        )));
    }

    let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if len < 4 {
        return Err(Error::Protocol(format!("invalid message length: {}", len)));
    }
    let len = len as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(Error::Protocol(format!(
            "message length {} exceeds limit",
            len
        )));
    }

    let total = 1 + len;
    if buf.len() < total {
        return Ok(None);
    }

    Ok(Some((
        Frame {
            type_byte,
            payload: &buf[5..total],
        },
        total,
    )))
}

/// Read 1-byte unsigned integer.
#[inline]
pub fn read_u8(data: &[u8]) -> Result<(u8, &[u8])> {
    if data.is_empty() {
        return Err(Error::Protocol("read_u8: empty buffer".into()));
    }
    Ok((data[0], &data[1..]))
}

/// Read 2-byte big-endian signed integer.
#[inline]
pub fn read_i16(data: &[u8]) -> Result<(i16, &[u8])> {
    if data.len() < 2 {
        return Err(Error::Protocol(format!(
            "read_i16: buffer too short: {} < 2",
            data.len()
        )));
    }
    let value = I16BE::ref_from_bytes(&data[..2])
        .map_err(|e| Error::Protocol(format!("read_i16: {e:?}")))?
        .get();
    Ok((value, &data[2..]))
}

/// Read 2-byte big-endian unsigned integer.
#[inline]
pub fn read_u16(data: &[u8]) -> Result<(u16, &[u8])> {
    if data.len() < 2 {
        return Err(Error::Protocol(format!(
            "read_u16: buffer too short: {} < 2",
            data.len()
        )));
    }
    let value = U16BE::ref_from_bytes(&data[..2])
        .map_err(|e| Error::Protocol(format!("read_u16: {e:?}")))?
        .get();
    Ok((value, &data[2..]))
}

/// Read 4-byte big-endian signed integer.
#[inline]
pub fn read_i32(data: &[u8]) -> Result<(i32, &[u8])> {
    if data.len() < 4 {
        return Err(Error::Protocol(format!(
            "read_i32: buffer too short: {} < 4",
            data.len()
        )));
    }
    let value = I32BE::ref_from_bytes(&data[..4])
        .map_err(|e| Error::Protocol(format!("read_i32: {e:?}")))?
        .get();
    Ok((value, &data[4..]))
}

/// Read 4-byte big-endian unsigned integer.
#[inline]
pub fn read_u32(data: &[u8]) -> Result<(u32, &[u8])> {
    if data.len() < 4 {
        return Err(Error::Protocol(format!(
            "read_u32: buffer too short: {} < 4",
            data.len()
        )));
    }
    let value = U32BE::ref_from_bytes(&data[..4])
        .map_err(|e| Error::Protocol(format!("read_u32: {e:?}")))?
        .get();
    Ok((value, &data[4..]))
}

/// Read null-terminated string (PostgreSQL String type).
/// Returns the string bytes (without the null terminator) and remaining data.
#[inline]
pub fn read_cstring(data: &[u8]) -> Result<(&[u8], &[u8])> {
    match memchr::memchr(0, data) {
        Some(pos) => Ok((&data[..pos], &data[pos + 1..])),
        None => Err(Error::Protocol(
            "read_cstring: no null terminator found".into(),
        )),
    }
}

/// Read null-terminated string as &str.
#[inline]
pub fn read_cstr(data: &[u8]) -> Result<(&str, &[u8])> {
    let (bytes, rest) = read_cstring(data)?;
    let s = std::str::from_utf8(bytes)
        .map_err(|e| Error::Protocol(format!("read_cstr: invalid UTF-8: {e}")))?;
    Ok((s, rest))
}

/// Message builder helper that handles the length field.
///
/// PostgreSQL message format:
/// - Type byte (1 byte) - NOT included in length
/// - Length (4 bytes) - includes itself
/// - Payload (Length - 4 bytes)
pub struct MessageBuilder<'a> {
    buf: &'a mut Vec<u8>,
    start: usize,
}

impl<'a> MessageBuilder<'a> {
    /// Start building a message with a type byte.
    pub fn new(buf: &'a mut Vec<u8>, type_byte: u8) -> Self {
        buf.push(type_byte);
        let start = buf.len();
        buf.extend_from_slice(&[0, 0, 0, 0]); // Placeholder for length
        Self { buf, start }
    }

    /// Start building a startup-phase message (no type byte).
    pub fn new_startup(buf: &'a mut Vec<u8>) -> Self {
        let start = buf.len();
        buf.extend_from_slice(&[0, 0, 0, 0]); // Placeholder for length
        Self { buf, start }
    }

    /// Write a u8.
    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Write an i16.
    pub fn write_i16(&mut self, value: i16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Write an i32.
    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Write raw bytes.
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Write null-terminated string.
    pub fn write_cstr(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    /// Finish building the message and fill in the length field.
    pub fn finish(self) {
        let len = (self.buf.len() - self.start) as i32;
        self.buf[self.start..self.start + 4].copy_from_slice(&len.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_frame_needs_more_data() {
        // No complete header yet
        assert!(decode_frame(b"Z").unwrap().is_none());
        // Header present, payload truncated: 'Z' with length 5 (1 payload byte)
        let partial = [b'Z', 0, 0, 0, 5];
        assert!(decode_frame(&partial).unwrap().is_none());
    }

    #[test]
    fn decode_frame_complete() {
        let buf = [b'Z', 0, 0, 0, 5, b'I', b'X'];
        let (frame, consumed) = decode_frame(&buf).unwrap().unwrap();
        assert_eq!(frame.type_byte, b'Z');
        assert_eq!(frame.payload, b"I");
        assert_eq!(consumed, 6);
    }

    #[test]
    fn decode_frame_rejects_bad_length() {
        let buf = [b'Z', 0, 0, 0, 2, 0];
        assert!(decode_frame(&buf).is_err());
    }

    #[test]
    fn decode_frame_rejects_unknown_tag() {
        let buf = [0x00, 0, 0, 0, 4];
        assert!(decode_frame(&buf).is_err());
    }

    #[test]
    fn cstring_round_trip() {
        let (s, rest) = read_cstr(b"hello\0world\0").unwrap();
        assert_eq!(s, "hello");
        let (s2, rest2) = read_cstr(rest).unwrap();
        assert_eq!(s2, "world");
        assert!(rest2.is_empty());
    }
}
