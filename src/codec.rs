//! AMQP 0-9-1 Binary Encoding and Decoding
//!
//! This module provides the binary codec for AMQP 0-9-1 primitives and field
//! values. Everything on the wire is big-endian.
//!
//! # Overview
//!
//! Two components:
//!
//! - **Encoder**: appends primitive values, strings, tables and arrays to a
//!   growable buffer.
//! - **Decoder**: a cursor over a byte slice that reads the same shapes back,
//!   with bounds checks on every read.
//!
//! Short strings carry a 1-byte length and must be valid UTF-8 no longer
//! than 255 bytes; long strings carry a 4-byte length and are binary-safe.
//! Tables and arrays carry a 4-byte *byte length* prefix (not an entry
//! count), so decoding consumes entries until the announced span is
//! exhausted. An unknown type tag is a codec error; silently skipping it
//! would desynchronize the cursor.
//!
//! # Examples
//!
//! ```rust
//! use warren_amqp::codec::{Decoder, Encoder};
//! use warren_amqp::types::{FieldTable, FieldValue};
//!
//! let mut table = FieldTable::new();
//! table.insert("durable", FieldValue::Boolean(true));
//!
//! let mut encoder = Encoder::new();
//! encoder.put_table(&table).unwrap();
//! let bytes = encoder.finish();
//!
//! let mut decoder = Decoder::new(&bytes);
//! assert_eq!(decoder.read_table().unwrap(), table);
//! ```

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::types::{Decimal, FieldArray, FieldTable, FieldValue, SHORT_STRING_MAX};

/// Encoder for AMQP 0-9-1 primitives and field values.
pub struct Encoder {
    buffer: BytesMut,
}

impl Encoder {
    /// Create a new encoder.
    pub fn new() -> Self {
        Encoder { buffer: BytesMut::new() }
    }

    /// Create a new encoder with initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Encoder { buffer: BytesMut::with_capacity(capacity) }
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Take the encoded bytes.
    pub fn finish(self) -> BytesMut {
        self.buffer
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buffer.put_u8(v);
    }

    pub fn put_i8(&mut self, v: i8) {
        self.buffer.put_i8(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buffer.put_u16(v);
    }

    pub fn put_i16(&mut self, v: i16) {
        self.buffer.put_i16(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buffer.put_u32(v);
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buffer.put_i32(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buffer.put_u64(v);
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buffer.put_i64(v);
    }

    pub fn put_f32(&mut self, v: f32) {
        self.buffer.put_f32(v);
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buffer.put_f64(v);
    }

    pub fn put_bytes(&mut self, v: &[u8]) {
        self.buffer.extend_from_slice(v);
    }

    /// Append a short string: 1-byte length + UTF-8 bytes.
    ///
    /// Fails with a usage error if the string exceeds 255 bytes; there is no
    /// representable wire form for it.
    pub fn put_short_string(&mut self, v: &str) -> Result<()> {
        if v.len() > SHORT_STRING_MAX {
            return Err(Error::usage(format!(
                "short string of {} bytes exceeds the 255-byte limit",
                v.len()
            )));
        }
        self.buffer.put_u8(v.len() as u8);
        self.buffer.extend_from_slice(v.as_bytes());
        Ok(())
    }

    /// Append a long string: 4-byte length + raw bytes.
    pub fn put_long_string(&mut self, v: &[u8]) {
        self.buffer.put_u32(v.len() as u32);
        self.buffer.extend_from_slice(v);
    }

    /// Append a field value: 1-byte type tag + payload.
    pub fn put_field_value(&mut self, value: &FieldValue) -> Result<()> {
        self.buffer.put_u8(value.type_tag());
        match value {
            FieldValue::Boolean(v) => self.put_u8(u8::from(*v)),
            FieldValue::ShortShortInt(v) => self.put_i8(*v),
            FieldValue::ShortShortUint(v) => self.put_u8(*v),
            FieldValue::ShortInt(v) => self.put_i16(*v),
            FieldValue::ShortUint(v) => self.put_u16(*v),
            FieldValue::LongInt(v) => self.put_i32(*v),
            FieldValue::LongUint(v) => self.put_u32(*v),
            FieldValue::LongLongInt(v) => self.put_i64(*v),
            FieldValue::LongLongUint(v) => self.put_u64(*v),
            FieldValue::Float(v) => self.put_f32(*v),
            FieldValue::Double(v) => self.put_f64(*v),
            FieldValue::Decimal(d) => {
                self.put_u8(d.scale);
                self.put_i32(d.value);
            }
            FieldValue::ShortString(s) => self.put_short_string(s)?,
            FieldValue::LongString(b) => self.put_long_string(b),
            FieldValue::Array(a) => self.put_array(a)?,
            FieldValue::Timestamp(t) => self.put_u64(*t),
            FieldValue::Table(t) => self.put_table(t)?,
            FieldValue::Void => {}
        }
        Ok(())
    }

    /// Append a field table: 4-byte byte-length prefix + entries.
    pub fn put_table(&mut self, table: &FieldTable) -> Result<()> {
        self.buffer.put_u32(table.wire_size() as u32);
        for (name, value) in table.iter() {
            self.put_short_string(name)?;
            self.put_field_value(value)?;
        }
        Ok(())
    }

    /// Append a field array: 4-byte byte-length prefix + tagged values.
    pub fn put_array(&mut self, array: &FieldArray) -> Result<()> {
        self.buffer.put_u32(array.wire_size() as u32);
        for value in array.iter() {
            self.put_field_value(value)?;
        }
        Ok(())
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoder cursor over a byte slice.
pub struct Decoder<'a> {
    data: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Decoder { data }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() < n {
            return Err(Error::codec(format!(
                "truncated field: need {} bytes, have {}",
                n,
                self.data.len()
            )));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.take(1)?[0] as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        Ok(i64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        Ok(self.take(n)?.to_vec())
    }

    /// Read everything left in the cursor.
    pub fn read_remaining(&mut self) -> Vec<u8> {
        let rest = self.data.to_vec();
        self.data = &self.data[self.data.len()..];
        rest
    }

    /// Read a short string: 1-byte length + UTF-8 bytes.
    pub fn read_short_string(&mut self) -> Result<String> {
        let len = self.read_u8()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::codec(format!("short string is not valid UTF-8: {}", e)))
    }

    /// Read a long string: 4-byte length + raw bytes.
    pub fn read_long_string(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Read a tagged field value.
    pub fn read_field_value(&mut self) -> Result<FieldValue> {
        let tag = self.read_u8()?;
        self.read_field_payload(tag)
    }

    fn read_field_payload(&mut self, tag: u8) -> Result<FieldValue> {
        match tag {
            b't' => Ok(FieldValue::Boolean(self.read_u8()? != 0)),
            b'b' => Ok(FieldValue::ShortShortInt(self.read_i8()?)),
            b'B' => Ok(FieldValue::ShortShortUint(self.read_u8()?)),
            b'U' => Ok(FieldValue::ShortInt(self.read_i16()?)),
            b'u' => Ok(FieldValue::ShortUint(self.read_u16()?)),
            b'I' => Ok(FieldValue::LongInt(self.read_i32()?)),
            b'i' => Ok(FieldValue::LongUint(self.read_u32()?)),
            b'L' => Ok(FieldValue::LongLongInt(self.read_i64()?)),
            b'l' => Ok(FieldValue::LongLongUint(self.read_u64()?)),
            b'f' => Ok(FieldValue::Float(self.read_f32()?)),
            b'd' => Ok(FieldValue::Double(self.read_f64()?)),
            b'D' => {
                let scale = self.read_u8()?;
                let value = self.read_i32()?;
                Ok(FieldValue::Decimal(Decimal::new(scale, value)))
            }
            b's' => Ok(FieldValue::ShortString(self.read_short_string()?)),
            b'S' => Ok(FieldValue::LongString(self.read_long_string()?)),
            b'A' => Ok(FieldValue::Array(self.read_array()?)),
            b'T' => Ok(FieldValue::Timestamp(self.read_u64()?)),
            b'F' => Ok(FieldValue::Table(self.read_table()?)),
            b'V' => Ok(FieldValue::Void),
            _ => Err(Error::codec(format!("unknown field type tag 0x{:02x}", tag))),
        }
    }

    /// Read a field table: 4-byte byte-length prefix + entries.
    pub fn read_table(&mut self) -> Result<FieldTable> {
        let span = self.read_u32()? as usize;
        if self.data.len() < span {
            return Err(Error::codec(format!(
                "truncated field table: announced {} bytes, have {}",
                span,
                self.data.len()
            )));
        }
        let mut table = FieldTable::new();
        let end = self.data.len() - span;
        while self.data.len() > end {
            let name = self.read_short_string()?;
            let value = self.read_field_value()?;
            if self.data.len() < end {
                return Err(Error::codec("field table entry overruns announced length"));
            }
            table.insert(name, value);
        }
        Ok(table)
    }

    /// Read a field array: 4-byte byte-length prefix + tagged values.
    pub fn read_array(&mut self) -> Result<FieldArray> {
        let span = self.read_u32()? as usize;
        if self.data.len() < span {
            return Err(Error::codec(format!(
                "truncated field array: announced {} bytes, have {}",
                span,
                self.data.len()
            )));
        }
        let mut array = FieldArray::new();
        let end = self.data.len() - span;
        while self.data.len() > end {
            let value = self.read_field_value()?;
            if self.data.len() < end {
                return Err(Error::codec("field array entry overruns announced length"));
            }
            array.push(value);
        }
        Ok(array)
    }
}
