//! MQTT Packet Codec
//!
//! Pure encoding and decoding of MQTT v3.1/v3.1.1 control packets. No I/O
//! happens here; the session feeds bytes in and writes bytes out.

mod decode;
mod encode;


pub use decode::Decoder;
pub use encode::Encoder;

use crate::protocol::{DecodeError, EncodeError};
use bytes::{BufMut, BytesMut};

/// Largest value a four byte remaining length can carry
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Default packet size limit for the client: a full-size message (256 byte
/// topic, 1 KiB payload) plus headers fits with room to spare
pub const DEFAULT_MAX_PACKET_SIZE: usize = 2048;

/// Remaining length uses at most this many bytes
const VARIABLE_INT_MAX_BYTES: usize = 4;

/// Decode a remaining length field, returning `(value, bytes_used)`
#[inline]
pub fn read_variable_int(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut value: u32 = 0;

    for (i, &byte) in buf.iter().take(VARIABLE_INT_MAX_BYTES).enumerate() {
        value |= u32::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }

    if buf.len() >= VARIABLE_INT_MAX_BYTES {
        // Continuation bit still set on the fourth byte
        Err(DecodeError::InvalidRemainingLength)
    } else {
        Err(DecodeError::InsufficientData)
    }
}

/// Append a remaining length field, returning how many bytes it took
#[inline]
pub fn write_variable_int(buf: &mut BytesMut, value: u32) -> Result<usize, EncodeError> {
    if value as usize > MAX_REMAINING_LENGTH {
        return Err(EncodeError::PacketTooLarge);
    }

    let mut rest = value;
    let mut written = 0;
    loop {
        let digit = (rest & 0x7F) as u8;
        rest >>= 7;
        written += 1;
        if rest == 0 {
            buf.put_u8(digit);
            return Ok(written);
        }
        buf.put_u8(digit | 0x80);
    }
}

#[inline]
pub fn read_u16(buf: &[u8]) -> Result<u16, DecodeError> {
    match buf {
        [hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(DecodeError::InsufficientData),
    }
}

/// Length-prefixed bytes, returning `(data, bytes_used)`
#[inline]
pub fn read_binary(buf: &[u8]) -> Result<(&[u8], usize), DecodeError> {
    let len = read_u16(buf)? as usize;
    buf.get(2..2 + len)
        .map(|data| (data, 2 + len))
        .ok_or(DecodeError::InsufficientData)
}

/// Length-prefixed UTF-8 text without NUL, returning `(text, bytes_used)`
#[inline]
pub fn read_string(buf: &[u8]) -> Result<(&str, usize), DecodeError> {
    let (raw, used) = read_binary(buf)?;
    let text = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?;
    if text.contains('\0') {
        return Err(DecodeError::MalformedPacket("string contains NUL"));
    }
    Ok((text, used))
}

#[inline]
pub fn write_binary(buf: &mut BytesMut, data: &[u8]) -> Result<(), EncodeError> {
    let len = u16::try_from(data.len()).map_err(|_| EncodeError::StringTooLong)?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

#[inline]
pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<(), EncodeError> {
    write_binary(buf, s.as_bytes())
}
