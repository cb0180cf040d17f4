//! Byte-level helpers shared by wire messages and persisted records.
//!
//! Every encoded struct starts with a `(compat, version)` pair. A decoder
//! accepts any version in `[compat, current]` and ignores trailing bytes it
//! does not understand; a record whose compat exceeds what the decoder knows
//! is rejected outright.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use integer_encoding::VarInt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeError;

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed encoding")
    }
}

impl std::error::Error for DecodeError {}

pub fn put_varint(buf: &mut BytesMut, v: u64) {
    let mut tmp = [0u8; 10];
    let n = v.encode_var(&mut tmp);
    buf.put_slice(&tmp[..n]);
}

pub fn get_varint(buf: &mut Bytes) -> Result<u64, DecodeError> {
    let (v, n) = u64::decode_var(buf.chunk()).ok_or(DecodeError)?;
    buf.advance(n);
    Ok(v)
}

pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    put_varint(buf, data.len() as u64);
    buf.put_slice(data);
}

pub fn get_bytes(buf: &mut Bytes) -> Result<Bytes, DecodeError> {
    let len = get_varint(buf)? as usize;
    if buf.remaining() < len {
        return Err(DecodeError);
    }
    Ok(buf.split_to(len))
}

pub fn put_string(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

pub fn get_string(buf: &mut Bytes) -> Result<String, DecodeError> {
    let raw = get_bytes(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| DecodeError)
}

pub fn put_uuid(buf: &mut BytesMut, u: uuid::Uuid) {
    buf.put_slice(u.as_bytes());
}

pub fn get_uuid(buf: &mut Bytes) -> Result<uuid::Uuid, DecodeError> {
    if buf.remaining() < 16 {
        return Err(DecodeError);
    }
    let mut raw = [0u8; 16];
    buf.copy_to_slice(&mut raw);
    Ok(uuid::Uuid::from_bytes(raw))
}

pub fn get_u8(buf: &mut Bytes) -> Result<u8, DecodeError> {
    if buf.remaining() < 1 {
        return Err(DecodeError);
    }
    Ok(buf.get_u8())
}

pub fn get_u16(buf: &mut Bytes) -> Result<u16, DecodeError> {
    if buf.remaining() < 2 {
        return Err(DecodeError);
    }
    Ok(buf.get_u16_le())
}

pub fn get_u32(buf: &mut Bytes) -> Result<u32, DecodeError> {
    if buf.remaining() < 4 {
        return Err(DecodeError);
    }
    Ok(buf.get_u32_le())
}

pub fn get_u64(buf: &mut Bytes) -> Result<u64, DecodeError> {
    if buf.remaining() < 8 {
        return Err(DecodeError);
    }
    Ok(buf.get_u64_le())
}

/// Leading `(compat, version)` pair on an encoded struct.
pub fn put_header(buf: &mut BytesMut, compat: u8, version: u8) {
    buf.put_u8(compat);
    buf.put_u8(version);
}

/// Checks the struct header against the newest version this build encodes.
/// Returns the encoding version actually used by the writer.
pub fn get_header(buf: &mut Bytes, supported: u8) -> Result<u8, DecodeError> {
    let compat = get_u8(buf)?;
    let version = get_u8(buf)?;
    if compat > supported {
        return Err(DecodeError);
    }
    Ok(version)
}
