//! Primitive encoding and decoding for the wire protocol.
//!
//! Integers are big-endian. Decoders advance a `Buf` cursor and check the
//! remaining length before every read, so a short or lying buffer surfaces as
//! [`WireError::Incomplete`] instead of a panic. Encoders return the number of
//! bytes they produced.

use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Longest payload a short string can carry
pub const SHORT_STRING_MAX: usize = u8::MAX as usize;

#[inline]
fn ensure(buf: &impl Buf, needed: usize) -> Result<(), WireError> {
    if buf.remaining() < needed {
        Err(WireError::Incomplete)
    } else {
        Ok(())
    }
}

/// Read an unsigned octet
pub fn get_u8(buf: &mut impl Buf) -> Result<u8, WireError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

/// Read an unsigned 16-bit integer
pub fn get_u16(buf: &mut impl Buf) -> Result<u16, WireError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

/// Read an unsigned 32-bit integer
pub fn get_u32(buf: &mut impl Buf) -> Result<u32, WireError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

/// Read an unsigned 64-bit integer
pub fn get_u64(buf: &mut impl Buf) -> Result<u64, WireError> {
    ensure(buf, 8)?;
    Ok(buf.get_u64())
}

/// Read a signed octet
pub fn get_i8(buf: &mut impl Buf) -> Result<i8, WireError> {
    ensure(buf, 1)?;
    Ok(buf.get_i8())
}

/// Read a signed 16-bit integer
pub fn get_i16(buf: &mut impl Buf) -> Result<i16, WireError> {
    ensure(buf, 2)?;
    Ok(buf.get_i16())
}

/// Read a signed 32-bit integer
pub fn get_i32(buf: &mut impl Buf) -> Result<i32, WireError> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

/// Read a signed 64-bit integer
pub fn get_i64(buf: &mut impl Buf) -> Result<i64, WireError> {
    ensure(buf, 8)?;
    Ok(buf.get_i64())
}

/// Read an IEEE-754 single
pub fn get_f32(buf: &mut impl Buf) -> Result<f32, WireError> {
    ensure(buf, 4)?;
    Ok(buf.get_f32())
}

/// Read an IEEE-754 double
pub fn get_f64(buf: &mut impl Buf) -> Result<f64, WireError> {
    ensure(buf, 8)?;
    Ok(buf.get_f64())
}

/// Split `len` raw bytes off the cursor
pub fn get_bytes(buf: &mut impl Buf, len: usize) -> Result<Bytes, WireError> {
    ensure(buf, len)?;
    Ok(buf.copy_to_bytes(len))
}

/// Read a short string (1-byte length prefix).
///
/// Invalid UTF-8 is replaced rather than rejected; brokers treat these as
/// opaque octets and names are ASCII in practice.
pub fn get_short_string(buf: &mut impl Buf) -> Result<String, WireError> {
    let len = get_u8(buf)? as usize;
    let raw = get_bytes(buf, len)?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Read a long string (4-byte length prefix) as raw bytes
pub fn get_long_string(buf: &mut impl Buf) -> Result<Bytes, WireError> {
    let len = get_u32(buf)? as usize;
    get_bytes(buf, len)
}

/// Write a short string, failing if it does not fit a 1-byte length
pub fn put_short_string(buf: &mut impl BufMut, value: &str) -> Result<usize, WireError> {
    let raw = value.as_bytes();
    if raw.len() > SHORT_STRING_MAX {
        return Err(WireError::ShortStringTooLong(raw.len()));
    }
    buf.put_u8(raw.len() as u8);
    buf.put_slice(raw);
    Ok(1 + raw.len())
}

/// Write a long string
pub fn put_long_string(buf: &mut impl BufMut, value: &[u8]) -> Result<usize, WireError> {
    let len = u32::try_from(value.len()).map_err(|_| WireError::Size(value.len()))?;
    buf.put_u32(len);
    buf.put_slice(value);
    Ok(4 + value.len())
}

/// Pack consecutive bit fields into one octet, first flag in the lowest bit
pub fn pack_bits(flags: &[bool]) -> u8 {
    flags
        .iter()
        .enumerate()
        .take(8)
        .fold(0u8, |acc, (i, &set)| if set { acc | (1 << i) } else { acc })
}

/// Test bit `index` of a packed octet
pub fn bit(octet: u8, index: u8) -> bool {
    octet & (1 << index) != 0
}

/// Reserve a 4-byte length slot and return its offset for [`backpatch_u32`]
pub(crate) fn reserve_u32(buf: &mut BytesMut) -> usize {
    let at = buf.len();
    buf.put_u32(0);
    at
}

/// Fill a slot from [`reserve_u32`] with the number of bytes written after it
pub(crate) fn backpatch_u32(buf: &mut BytesMut, at: usize) -> Result<usize, WireError> {
    let written = buf.len() - at - 4;
    let len = u32::try_from(written).map_err(|_| WireError::Size(written))?;
    buf[at..at + 4].copy_from_slice(&len.to_be_bytes());
    Ok(written)
}
