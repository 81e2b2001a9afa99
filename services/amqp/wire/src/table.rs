//! Field tables and arrays.
//!
//! Tables are length-prefixed sequences of `short-string key, tagged value`
//! pairs. Value tags follow the RabbitMQ dialect of 0-9-1, which is what
//! every broker in practice speaks.

use crate::codec::{
    backpatch_u32, get_bytes, get_f32, get_f64, get_i16, get_i32, get_i64, get_i8,
    get_long_string, get_short_string, get_u16, get_u32, get_u64, get_u8, put_long_string,
    put_short_string, reserve_u32,
};
use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Maximum nesting of tables/arrays accepted when decoding
pub const MAX_NESTING_DEPTH: usize = 32;

/// Field table: short-string keys to typed values.
///
/// Keys are kept and encoded in sorted order, not insertion order. A key
/// repeated on the wire keeps its last value.
pub type FieldTable = BTreeMap<String, FieldValue>;

/// A typed value inside a field table or array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// `t`
    Bool(bool),
    /// `b`
    ShortShortInt(i8),
    /// `B`
    ShortShortUInt(u8),
    /// `s`
    ShortInt(i16),
    /// `u`
    ShortUInt(u16),
    /// `I`
    LongInt(i32),
    /// `i`
    LongUInt(u32),
    /// `l`
    LongLongInt(i64),
    /// `f`
    Float(f32),
    /// `d`
    Double(f64),
    /// `D`: value scaled down by 10^scale
    Decimal {
        /// Number of decimal digits
        scale: u8,
        /// Unscaled value
        value: u32,
    },
    /// `S`
    LongString(String),
    /// `A`
    Array(Vec<FieldValue>),
    /// `T`: seconds since the epoch
    Timestamp(u64),
    /// `F`
    Table(FieldTable),
    /// `V`
    Void,
    /// `x`
    ByteArray(Bytes),
}

impl FieldValue {
    /// Wire tag for this value
    pub fn tag(&self) -> u8 {
        match self {
            FieldValue::Bool(_) => b't',
            FieldValue::ShortShortInt(_) => b'b',
            FieldValue::ShortShortUInt(_) => b'B',
            FieldValue::ShortInt(_) => b's',
            FieldValue::ShortUInt(_) => b'u',
            FieldValue::LongInt(_) => b'I',
            FieldValue::LongUInt(_) => b'i',
            FieldValue::LongLongInt(_) => b'l',
            FieldValue::Float(_) => b'f',
            FieldValue::Double(_) => b'd',
            FieldValue::Decimal { .. } => b'D',
            FieldValue::LongString(_) => b'S',
            FieldValue::Array(_) => b'A',
            FieldValue::Timestamp(_) => b'T',
            FieldValue::Table(_) => b'F',
            FieldValue::Void => b'V',
            FieldValue::ByteArray(_) => b'x',
        }
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::LongString(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::LongString(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::LongInt(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::LongLongInt(value)
    }
}

impl From<FieldTable> for FieldValue {
    fn from(value: FieldTable) -> Self {
        FieldValue::Table(value)
    }
}

/// Encode a field table, backpatching its length prefix
pub fn put_table(buf: &mut BytesMut, table: &FieldTable) -> Result<usize, WireError> {
    let at = reserve_u32(buf);
    for (key, value) in table {
        put_short_string(buf, key)?;
        put_field_value(buf, value)?;
    }
    Ok(4 + backpatch_u32(buf, at)?)
}

/// Encode a field array, backpatching its length prefix
pub fn put_array(buf: &mut BytesMut, values: &[FieldValue]) -> Result<usize, WireError> {
    let at = reserve_u32(buf);
    for value in values {
        put_field_value(buf, value)?;
    }
    Ok(4 + backpatch_u32(buf, at)?)
}

fn put_field_value(buf: &mut BytesMut, value: &FieldValue) -> Result<(), WireError> {
    buf.put_u8(value.tag());
    match value {
        FieldValue::Bool(v) => buf.put_u8(u8::from(*v)),
        FieldValue::ShortShortInt(v) => buf.put_i8(*v),
        FieldValue::ShortShortUInt(v) => buf.put_u8(*v),
        FieldValue::ShortInt(v) => buf.put_i16(*v),
        FieldValue::ShortUInt(v) => buf.put_u16(*v),
        FieldValue::LongInt(v) => buf.put_i32(*v),
        FieldValue::LongUInt(v) => buf.put_u32(*v),
        FieldValue::LongLongInt(v) => buf.put_i64(*v),
        FieldValue::Float(v) => buf.put_f32(*v),
        FieldValue::Double(v) => buf.put_f64(*v),
        FieldValue::Decimal { scale, value } => {
            buf.put_u8(*scale);
            buf.put_u32(*value);
        }
        FieldValue::LongString(v) => {
            put_long_string(buf, v.as_bytes())?;
        }
        FieldValue::Array(values) => {
            put_array(buf, values)?;
        }
        FieldValue::Timestamp(v) => buf.put_u64(*v),
        FieldValue::Table(table) => {
            put_table(buf, table)?;
        }
        FieldValue::Void => {}
        FieldValue::ByteArray(v) => {
            put_long_string(buf, v)?;
        }
    }
    Ok(())
}

/// Decode a field table
pub fn get_table(buf: &mut impl Buf) -> Result<FieldTable, WireError> {
    get_table_nested(buf, 0)
}

/// Decode a field array
pub fn get_array(buf: &mut impl Buf) -> Result<Vec<FieldValue>, WireError> {
    get_array_nested(buf, 0)
}

fn get_table_nested(buf: &mut impl Buf, depth: usize) -> Result<FieldTable, WireError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(WireError::Malformed("field table nested too deeply"));
    }
    let len = get_u32(buf)? as usize;
    // decode from a bounded slice so entries can never run past the table
    let mut body = get_bytes(buf, len)?;
    let mut table = FieldTable::new();
    while body.has_remaining() {
        let key = get_short_string(&mut body)?;
        let value = get_field_value(&mut body, depth)?;
        if table.contains_key(&key) {
            debug!("Duplicate table key '{}', keeping the last value", key);
        }
        table.insert(key, value);
    }
    Ok(table)
}

fn get_array_nested(buf: &mut impl Buf, depth: usize) -> Result<Vec<FieldValue>, WireError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(WireError::Malformed("field array nested too deeply"));
    }
    let len = get_u32(buf)? as usize;
    let mut body = get_bytes(buf, len)?;
    let mut values = Vec::new();
    while body.has_remaining() {
        values.push(get_field_value(&mut body, depth)?);
    }
    Ok(values)
}

fn get_field_value(buf: &mut Bytes, depth: usize) -> Result<FieldValue, WireError> {
    let tag = get_u8(buf)?;
    let value = match tag {
        b't' => FieldValue::Bool(get_u8(buf)? != 0),
        b'b' => FieldValue::ShortShortInt(get_i8(buf)?),
        b'B' => FieldValue::ShortShortUInt(get_u8(buf)?),
        b's' => FieldValue::ShortInt(get_i16(buf)?),
        b'u' => FieldValue::ShortUInt(get_u16(buf)?),
        b'I' => FieldValue::LongInt(get_i32(buf)?),
        b'i' => FieldValue::LongUInt(get_u32(buf)?),
        b'l' => FieldValue::LongLongInt(get_i64(buf)?),
        b'f' => FieldValue::Float(get_f32(buf)?),
        b'd' => FieldValue::Double(get_f64(buf)?),
        b'D' => FieldValue::Decimal {
            scale: get_u8(buf)?,
            value: get_u32(buf)?,
        },
        b'S' => {
            let raw = get_long_string(buf)?;
            FieldValue::LongString(String::from_utf8_lossy(&raw).into_owned())
        }
        b'A' => FieldValue::Array(get_array_nested(buf, depth + 1)?),
        b'T' => FieldValue::Timestamp(get_u64(buf)?),
        b'F' => FieldValue::Table(get_table_nested(buf, depth + 1)?),
        b'V' => FieldValue::Void,
        b'x' => FieldValue::ByteArray(get_long_string(buf)?),
        other => return Err(WireError::FieldType(other)),
    };
    Ok(value)
}
