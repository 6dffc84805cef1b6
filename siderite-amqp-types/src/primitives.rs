//! Field-table primitives shared by method arguments and message headers
//!
//! The value kinds follow the RabbitMQ field-table errata rather than the
//! original AMQP 0-9-1 table, since that is what every broker in the wild
//! speaks.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use indexmap::IndexMap;

use crate::error::{DecodeError, EncodeError};

pub(crate) fn ensure(src: &impl Buf, len: usize) -> Result<(), DecodeError> {
    if src.remaining() < len {
        Err(DecodeError::Incomplete)
    } else {
        Ok(())
    }
}

/// Encode a short string (length-prefixed by one octet)
pub fn put_short_str(dst: &mut BytesMut, value: &str) -> Result<(), EncodeError> {
    if value.len() > u8::MAX as usize {
        return Err(EncodeError::ShortStringTooLong(value.len()));
    }
    dst.put_u8(value.len() as u8);
    dst.put_slice(value.as_bytes());
    Ok(())
}

/// Decode a short string
pub fn get_short_str(src: &mut Bytes) -> Result<String, DecodeError> {
    ensure(src, 1)?;
    let len = src.get_u8() as usize;
    ensure(src, len)?;
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(Into::into)
}

/// Encode a long string (length-prefixed by four octets)
pub fn put_long_str(dst: &mut BytesMut, value: &[u8]) {
    dst.put_u32(value.len() as u32);
    dst.put_slice(value);
}

/// Decode a long string as raw bytes
pub fn get_long_str(src: &mut Bytes) -> Result<Bytes, DecodeError> {
    ensure(src, 4)?;
    let len = src.get_u32() as usize;
    ensure(src, len)?;
    Ok(src.split_to(len))
}

/// A single value in a [`FieldTable`] or [`FieldArray`]
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// `t` boolean
    Bool(bool),
    /// `b` signed octet
    I8(i8),
    /// `B` unsigned octet
    U8(u8),
    /// `s` signed short
    I16(i16),
    /// `u` unsigned short
    U16(u16),
    /// `I` signed long
    I32(i32),
    /// `i` unsigned long
    U32(u32),
    /// `l` signed long-long
    I64(i64),
    /// `f` single-precision float
    F32(f32),
    /// `d` double-precision float
    F64(f64),
    /// `S` long string
    LongString(String),
    /// `x` opaque byte array
    Bytes(Bytes),
    /// `T` POSIX timestamp
    Timestamp(u64),
    /// `A` nested array
    Array(FieldArray),
    /// `F` nested table
    Table(FieldTable),
    /// `V` no value
    Void,
}

impl FieldValue {
    fn kind(&self) -> u8 {
        match self {
            FieldValue::Bool(_) => b't',
            FieldValue::I8(_) => b'b',
            FieldValue::U8(_) => b'B',
            FieldValue::I16(_) => b's',
            FieldValue::U16(_) => b'u',
            FieldValue::I32(_) => b'I',
            FieldValue::U32(_) => b'i',
            FieldValue::I64(_) => b'l',
            FieldValue::F32(_) => b'f',
            FieldValue::F64(_) => b'd',
            FieldValue::LongString(_) => b'S',
            FieldValue::Bytes(_) => b'x',
            FieldValue::Timestamp(_) => b'T',
            FieldValue::Array(_) => b'A',
            FieldValue::Table(_) => b'F',
            FieldValue::Void => b'V',
        }
    }

    /// Encode the kind octet followed by the value
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        dst.put_u8(self.kind());
        match self {
            FieldValue::Bool(v) => dst.put_u8(*v as u8),
            FieldValue::I8(v) => dst.put_i8(*v),
            FieldValue::U8(v) => dst.put_u8(*v),
            FieldValue::I16(v) => dst.put_i16(*v),
            FieldValue::U16(v) => dst.put_u16(*v),
            FieldValue::I32(v) => dst.put_i32(*v),
            FieldValue::U32(v) => dst.put_u32(*v),
            FieldValue::I64(v) => dst.put_i64(*v),
            FieldValue::F32(v) => dst.put_f32(*v),
            FieldValue::F64(v) => dst.put_f64(*v),
            FieldValue::LongString(v) => put_long_str(dst, v.as_bytes()),
            FieldValue::Bytes(v) => put_long_str(dst, v),
            FieldValue::Timestamp(v) => dst.put_u64(*v),
            FieldValue::Array(v) => v.encode(dst)?,
            FieldValue::Table(v) => v.encode(dst)?,
            FieldValue::Void => {}
        }
        Ok(())
    }

    /// Decode a kind octet followed by the value
    pub fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(src, 1)?;
        let kind = src.get_u8();
        let value = match kind {
            b't' => {
                ensure(src, 1)?;
                FieldValue::Bool(src.get_u8() != 0)
            }
            b'b' => {
                ensure(src, 1)?;
                FieldValue::I8(src.get_i8())
            }
            b'B' => {
                ensure(src, 1)?;
                FieldValue::U8(src.get_u8())
            }
            b's' => {
                ensure(src, 2)?;
                FieldValue::I16(src.get_i16())
            }
            b'u' => {
                ensure(src, 2)?;
                FieldValue::U16(src.get_u16())
            }
            b'I' => {
                ensure(src, 4)?;
                FieldValue::I32(src.get_i32())
            }
            b'i' => {
                ensure(src, 4)?;
                FieldValue::U32(src.get_u32())
            }
            b'l' => {
                ensure(src, 8)?;
                FieldValue::I64(src.get_i64())
            }
            b'f' => {
                ensure(src, 4)?;
                FieldValue::F32(src.get_f32())
            }
            b'd' => {
                ensure(src, 8)?;
                FieldValue::F64(src.get_f64())
            }
            b'S' => {
                let raw = get_long_str(src)?;
                FieldValue::LongString(String::from_utf8(raw.to_vec())?)
            }
            b'x' => FieldValue::Bytes(get_long_str(src)?),
            b'T' => {
                ensure(src, 8)?;
                FieldValue::Timestamp(src.get_u64())
            }
            b'A' => FieldValue::Array(FieldArray::decode(src)?),
            b'F' => FieldValue::Table(FieldTable::decode(src)?),
            b'V' => FieldValue::Void,
            other => return Err(DecodeError::UnknownFieldKind(other)),
        };
        Ok(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        Self::I32(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::I64(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::LongString(value.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::LongString(value)
    }
}

impl From<FieldTable> for FieldValue {
    fn from(value: FieldTable) -> Self {
        Self::Table(value)
    }
}

/// An ordered set of named field values
///
/// Iteration order is insertion order, which keeps encoded tables stable
/// across round trips.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldTable(IndexMap<String, FieldValue>);

impl FieldTable {
    /// Creates an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, replacing any previous value under the same key
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.0.insert(key.into(), value.into());
    }

    /// Looks up a value by key
    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.0.get(key)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the table has no entries
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }

    /// Encode as a four-octet byte length followed by the entries
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        let mut body = BytesMut::new();
        for (key, value) in &self.0 {
            put_short_str(&mut body, key)?;
            value.encode(&mut body)?;
        }
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }

    /// Decode a four-octet byte length followed by the entries
    pub fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let mut body = get_long_str(src)?;
        let mut table = IndexMap::new();
        while body.has_remaining() {
            let key = get_short_str(&mut body)?;
            let value = FieldValue::decode(&mut body)?;
            table.insert(key, value);
        }
        Ok(Self(table))
    }
}

impl FromIterator<(String, FieldValue)> for FieldTable {
    fn from_iter<T: IntoIterator<Item = (String, FieldValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// An ordered sequence of field values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldArray(pub Vec<FieldValue>);

impl FieldArray {
    fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        let mut body = BytesMut::new();
        for value in &self.0 {
            value.encode(&mut body)?;
        }
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }

    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let mut body = get_long_str(src)?;
        let mut values = Vec::new();
        while body.has_remaining() {
            values.push(FieldValue::decode(&mut body)?);
        }
        Ok(Self(values))
    }
}
