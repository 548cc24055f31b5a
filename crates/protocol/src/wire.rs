//! Primitive field encoders shared by the payload and handshake modules.
//!
//! Strings carry a `u16` big-endian length prefix, byte fields a `u32`
//! prefix. Every reader checks remaining length before touching the buffer
//! so truncated input surfaces as [`ProtocolError::Deserialize`] rather
//! than a panic.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, ProtocolResult};

pub(crate) fn put_string(dst: &mut BytesMut, value: &str) -> ProtocolResult<()> {
    let len = u16::try_from(value.len()).map_err(|_| {
        ProtocolError::Serialize(format!("string field of {} bytes exceeds u16", value.len()))
    })?;
    dst.put_u16(len);
    dst.put_slice(value.as_bytes());
    Ok(())
}

pub(crate) fn get_string(src: &mut Bytes) -> ProtocolResult<String> {
    if src.remaining() < 2 {
        return Err(ProtocolError::Deserialize("missing string length".into()));
    }
    let len = src.get_u16() as usize;
    if src.remaining() < len {
        return Err(ProtocolError::Deserialize(format!(
            "string field wants {len} bytes, {} remain",
            src.remaining()
        )));
    }
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|e| ProtocolError::Deserialize(format!("invalid utf8 in string field: {e}")))
}

pub(crate) fn put_bytes(dst: &mut BytesMut, value: &Bytes) -> ProtocolResult<()> {
    let len = u32::try_from(value.len()).map_err(|_| {
        ProtocolError::Serialize(format!("byte field of {} bytes exceeds u32", value.len()))
    })?;
    dst.put_u32(len);
    dst.put_slice(value);
    Ok(())
}

pub(crate) fn get_bytes(src: &mut Bytes) -> ProtocolResult<Bytes> {
    if src.remaining() < 4 {
        return Err(ProtocolError::Deserialize("missing bytes length".into()));
    }
    let len = src.get_u32() as usize;
    if src.remaining() < len {
        return Err(ProtocolError::Deserialize(format!(
            "byte field wants {len} bytes, {} remain",
            src.remaining()
        )));
    }
    Ok(src.split_to(len))
}
