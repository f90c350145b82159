//! Binary Encoding and Decoding
//!
//! This module provides binary encoding and decoding for the AMQP 1.0 types
//! that appear in performative bodies: primitive scalars, strings, symbols,
//! binary sections, lists and described values.
//!
//! # Overview
//!
//! The codec provides two components:
//!
//! - **Encoder**: converts [`Value`]s to the AMQP 1.0 binary format
//! - **Decoder**: converts binary data back into [`Value`]s
//!
//! The decoder is incremental-friendly: it reports insufficient input as a
//! [`AmqpError::Decoding`] error without consuming bytes beyond the value it
//! attempted to read, so frame boundaries can be enforced by the caller.
//!
//! # Examples
//!
//! ```rust
//! use dumq_amqp_io::codec::{Encoder, Decoder, Value};
//!
//! let value = Value::String("Hello, AMQP!".to_string());
//!
//! let mut encoder = Encoder::new();
//! encoder.encode_value(&value).unwrap();
//! let encoded = encoder.finish();
//!
//! let mut decoder = Decoder::new(encoded);
//! let decoded = decoder.decode_value().unwrap();
//! assert_eq!(value, decoded);
//! ```

use crate::error::{AmqpError, AmqpResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// AMQP 1.0 format codes for the types used in performatives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeCode {
    Described = 0x00,

    Null = 0x40,

    Boolean = 0x56,
    BooleanTrue = 0x41,
    BooleanFalse = 0x42,

    Ubyte = 0x50,
    Ushort = 0x60,
    Uint = 0x70,
    SmallUint = 0x52,
    Uint0 = 0x43,
    Ulong = 0x80,
    SmallUlong = 0x53,
    Ulong0 = 0x44,

    Binary8 = 0xa0,
    Binary32 = 0xb0,

    String8 = 0xa1,
    String32 = 0xb1,

    Symbol8 = 0xa3,
    Symbol32 = 0xb3,

    List0 = 0x45,
    List8 = 0xc0,
    List32 = 0xd0,
}

/// An AMQP value from the subset of types used in performative bodies
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Ubyte(u8),
    Ushort(u16),
    Uint(u32),
    Ulong(u64),
    String(String),
    Symbol(String),
    Binary(Bytes),
    List(Vec<Value>),
    /// A described value: numeric descriptor plus the described body
    Described(u64, Box<Value>),
}

impl Value {
    /// Interpret as a string, if the value is a string or symbol
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Symbol(s) => Some(s),
            _ => None,
        }
    }

    /// Interpret as an unsigned 32-bit integer
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::Ubyte(v) => Some(u32::from(*v)),
            Value::Ushort(v) => Some(u32::from(*v)),
            Value::Uint(v) => Some(*v),
            _ => None,
        }
    }

    /// Interpret as an unsigned 16-bit integer
    pub fn as_u16(&self) -> Option<u16> {
        match self {
            Value::Ubyte(v) => Some(u16::from(*v)),
            Value::Ushort(v) => Some(*v),
            _ => None,
        }
    }

    /// Interpret as a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    /// Interpret as binary data
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Interpret as a list of values
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// True for `Value::Null`
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// Encoder for AMQP 1.0 binary data
#[derive(Debug, Default)]
pub struct Encoder {
    buffer: BytesMut,
}

impl Encoder {
    /// Create a new encoder
    pub fn new() -> Self {
        Encoder {
            buffer: BytesMut::new(),
        }
    }

    /// Encode a value
    pub fn encode_value(&mut self, value: &Value) -> AmqpResult<()> {
        match value {
            Value::Null => self.encode_null(),
            Value::Boolean(v) => self.encode_boolean(*v),
            Value::Ubyte(v) => self.encode_ubyte(*v),
            Value::Ushort(v) => self.encode_ushort(*v),
            Value::Uint(v) => self.encode_uint(*v),
            Value::Ulong(v) => self.encode_ulong(*v),
            Value::String(v) => self.encode_string(v),
            Value::Symbol(v) => self.encode_symbol(v),
            Value::Binary(v) => self.encode_binary(v),
            Value::List(v) => self.encode_list(v),
            Value::Described(descriptor, body) => self.encode_described(*descriptor, body),
        }
    }

    /// Encode a null value
    pub fn encode_null(&mut self) -> AmqpResult<()> {
        self.buffer.put_u8(TypeCode::Null as u8);
        Ok(())
    }

    /// Encode a boolean value
    pub fn encode_boolean(&mut self, value: bool) -> AmqpResult<()> {
        let code = if value {
            TypeCode::BooleanTrue
        } else {
            TypeCode::BooleanFalse
        };
        self.buffer.put_u8(code as u8);
        Ok(())
    }

    /// Encode an unsigned byte
    pub fn encode_ubyte(&mut self, value: u8) -> AmqpResult<()> {
        self.buffer.put_u8(TypeCode::Ubyte as u8);
        self.buffer.put_u8(value);
        Ok(())
    }

    /// Encode an unsigned short
    pub fn encode_ushort(&mut self, value: u16) -> AmqpResult<()> {
        self.buffer.put_u8(TypeCode::Ushort as u8);
        self.buffer.put_u16(value);
        Ok(())
    }

    /// Encode an unsigned int, using the compact encodings where possible
    pub fn encode_uint(&mut self, value: u32) -> AmqpResult<()> {
        if value == 0 {
            self.buffer.put_u8(TypeCode::Uint0 as u8);
        } else if value <= 0xff {
            self.buffer.put_u8(TypeCode::SmallUint as u8);
            self.buffer.put_u8(value as u8);
        } else {
            self.buffer.put_u8(TypeCode::Uint as u8);
            self.buffer.put_u32(value);
        }
        Ok(())
    }

    /// Encode an unsigned long, using the compact encodings where possible
    pub fn encode_ulong(&mut self, value: u64) -> AmqpResult<()> {
        if value == 0 {
            self.buffer.put_u8(TypeCode::Ulong0 as u8);
        } else if value <= 0xff {
            self.buffer.put_u8(TypeCode::SmallUlong as u8);
            self.buffer.put_u8(value as u8);
        } else {
            self.buffer.put_u8(TypeCode::Ulong as u8);
            self.buffer.put_u64(value);
        }
        Ok(())
    }

    /// Encode a UTF-8 string
    pub fn encode_string(&mut self, value: &str) -> AmqpResult<()> {
        let data = value.as_bytes();
        if data.len() <= 0xff {
            self.buffer.put_u8(TypeCode::String8 as u8);
            self.buffer.put_u8(data.len() as u8);
        } else {
            self.buffer.put_u8(TypeCode::String32 as u8);
            self.buffer.put_u32(data.len() as u32);
        }
        self.buffer.put_slice(data);
        Ok(())
    }

    /// Encode a symbol
    pub fn encode_symbol(&mut self, value: &str) -> AmqpResult<()> {
        let data = value.as_bytes();
        if data.len() <= 0xff {
            self.buffer.put_u8(TypeCode::Symbol8 as u8);
            self.buffer.put_u8(data.len() as u8);
        } else {
            self.buffer.put_u8(TypeCode::Symbol32 as u8);
            self.buffer.put_u32(data.len() as u32);
        }
        self.buffer.put_slice(data);
        Ok(())
    }

    /// Encode binary data
    pub fn encode_binary(&mut self, data: &[u8]) -> AmqpResult<()> {
        if data.len() <= 0xff {
            self.buffer.put_u8(TypeCode::Binary8 as u8);
            self.buffer.put_u8(data.len() as u8);
        } else {
            self.buffer.put_u8(TypeCode::Binary32 as u8);
            self.buffer.put_u32(data.len() as u32);
        }
        self.buffer.put_slice(data);
        Ok(())
    }

    /// Encode a list of values
    pub fn encode_list(&mut self, items: &[Value]) -> AmqpResult<()> {
        if items.is_empty() {
            self.buffer.put_u8(TypeCode::List0 as u8);
            return Ok(());
        }

        let mut body = Encoder::new();
        for item in items {
            body.encode_value(item)?;
        }
        let payload = body.finish();

        // The size field covers the count field plus the payload.
        if payload.len() + 1 <= 0xff && items.len() <= 0xff {
            self.buffer.put_u8(TypeCode::List8 as u8);
            self.buffer.put_u8((payload.len() + 1) as u8);
            self.buffer.put_u8(items.len() as u8);
        } else {
            self.buffer.put_u8(TypeCode::List32 as u8);
            self.buffer.put_u32((payload.len() + 4) as u32);
            self.buffer.put_u32(items.len() as u32);
        }
        self.buffer.put_slice(&payload);
        Ok(())
    }

    /// Encode a described value with a numeric descriptor
    pub fn encode_described(&mut self, descriptor: u64, body: &Value) -> AmqpResult<()> {
        self.buffer.put_u8(TypeCode::Described as u8);
        self.encode_ulong(descriptor)?;
        self.encode_value(body)
    }

    /// Finish encoding and return the encoded bytes
    pub fn finish(self) -> Vec<u8> {
        self.buffer.to_vec()
    }
}

/// Decoder for AMQP 1.0 binary data
#[derive(Debug)]
pub struct Decoder {
    buffer: Bytes,
}

impl Decoder {
    /// Create a new decoder over the given bytes
    pub fn new(data: impl Into<Bytes>) -> Self {
        Decoder {
            buffer: data.into(),
        }
    }

    /// Number of undecoded bytes remaining
    pub fn remaining(&self) -> usize {
        self.buffer.remaining()
    }

    /// Take all undecoded bytes out of the decoder
    pub fn take_remaining(&mut self) -> Bytes {
        self.buffer.split_to(self.buffer.len())
    }

    /// Decode the next value
    pub fn decode_value(&mut self) -> AmqpResult<Value> {
        let code = self.take_u8("format code")?;
        match code {
            c if c == TypeCode::Null as u8 => Ok(Value::Null),
            c if c == TypeCode::BooleanTrue as u8 => Ok(Value::Boolean(true)),
            c if c == TypeCode::BooleanFalse as u8 => Ok(Value::Boolean(false)),
            c if c == TypeCode::Boolean as u8 => {
                Ok(Value::Boolean(self.take_u8("boolean body")? != 0))
            }
            c if c == TypeCode::Ubyte as u8 => Ok(Value::Ubyte(self.take_u8("ubyte")?)),
            c if c == TypeCode::Ushort as u8 => Ok(Value::Ushort(self.take_u16("ushort")?)),
            c if c == TypeCode::Uint0 as u8 => Ok(Value::Uint(0)),
            c if c == TypeCode::SmallUint as u8 => {
                Ok(Value::Uint(u32::from(self.take_u8("smalluint")?)))
            }
            c if c == TypeCode::Uint as u8 => Ok(Value::Uint(self.take_u32("uint")?)),
            c if c == TypeCode::Ulong0 as u8 => Ok(Value::Ulong(0)),
            c if c == TypeCode::SmallUlong as u8 => {
                Ok(Value::Ulong(u64::from(self.take_u8("smallulong")?)))
            }
            c if c == TypeCode::Ulong as u8 => Ok(Value::Ulong(self.take_u64("ulong")?)),
            c if c == TypeCode::String8 as u8 => {
                let len = self.take_u8("string8 length")? as usize;
                self.take_string(len)
            }
            c if c == TypeCode::String32 as u8 => {
                let len = self.take_u32("string32 length")? as usize;
                self.take_string(len)
            }
            c if c == TypeCode::Symbol8 as u8 => {
                let len = self.take_u8("symbol8 length")? as usize;
                self.take_symbol(len)
            }
            c if c == TypeCode::Symbol32 as u8 => {
                let len = self.take_u32("symbol32 length")? as usize;
                self.take_symbol(len)
            }
            c if c == TypeCode::Binary8 as u8 => {
                let len = self.take_u8("binary8 length")? as usize;
                Ok(Value::Binary(self.take_bytes(len, "binary body")?))
            }
            c if c == TypeCode::Binary32 as u8 => {
                let len = self.take_u32("binary32 length")? as usize;
                Ok(Value::Binary(self.take_bytes(len, "binary body")?))
            }
            c if c == TypeCode::List0 as u8 => Ok(Value::List(Vec::new())),
            c if c == TypeCode::List8 as u8 => {
                let size = self.take_u8("list8 size")? as usize;
                if size < 1 {
                    return Err(AmqpError::decoding("list8 size below count field"));
                }
                let count = self.take_u8("list8 count")? as usize;
                self.take_list(size - 1, count)
            }
            c if c == TypeCode::List32 as u8 => {
                let size = self.take_u32("list32 size")? as usize;
                if size < 4 {
                    return Err(AmqpError::decoding("list32 size below count field"));
                }
                let count = self.take_u32("list32 count")? as usize;
                self.take_list(size - 4, count)
            }
            c if c == TypeCode::Described as u8 => {
                let descriptor = match self.decode_value()? {
                    Value::Ulong(v) => v,
                    other => {
                        return Err(AmqpError::decoding(format!(
                            "unsupported descriptor type: {:?}",
                            other
                        )))
                    }
                };
                let body = self.decode_value()?;
                Ok(Value::Described(descriptor, Box::new(body)))
            }
            other => Err(AmqpError::decoding(format!(
                "unknown format code 0x{:02x}",
                other
            ))),
        }
    }

    fn take_list(&mut self, payload_len: usize, count: usize) -> AmqpResult<Value> {
        let payload = self.take_bytes(payload_len, "list payload")?;
        let mut inner = Decoder::new(payload);
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(inner.decode_value()?);
        }
        if inner.remaining() != 0 {
            return Err(AmqpError::decoding("trailing bytes in list payload"));
        }
        Ok(Value::List(items))
    }

    fn take_string(&mut self, len: usize) -> AmqpResult<Value> {
        let data = self.take_bytes(len, "string body")?;
        let text = String::from_utf8(data.to_vec())
            .map_err(|_| AmqpError::decoding("string is not valid UTF-8"))?;
        Ok(Value::String(text))
    }

    fn take_symbol(&mut self, len: usize) -> AmqpResult<Value> {
        let data = self.take_bytes(len, "symbol body")?;
        let text = String::from_utf8(data.to_vec())
            .map_err(|_| AmqpError::decoding("symbol is not valid UTF-8"))?;
        Ok(Value::Symbol(text))
    }

    fn take_bytes(&mut self, len: usize, what: &str) -> AmqpResult<Bytes> {
        if self.buffer.remaining() < len {
            return Err(AmqpError::decoding(format!("insufficient data for {}", what)));
        }
        Ok(self.buffer.split_to(len))
    }

    fn take_u8(&mut self, what: &str) -> AmqpResult<u8> {
        if self.buffer.remaining() < 1 {
            return Err(AmqpError::decoding(format!("insufficient data for {}", what)));
        }
        Ok(self.buffer.get_u8())
    }

    fn take_u16(&mut self, what: &str) -> AmqpResult<u16> {
        if self.buffer.remaining() < 2 {
            return Err(AmqpError::decoding(format!("insufficient data for {}", what)));
        }
        Ok(self.buffer.get_u16())
    }

    fn take_u32(&mut self, what: &str) -> AmqpResult<u32> {
        if self.buffer.remaining() < 4 {
            return Err(AmqpError::decoding(format!("insufficient data for {}", what)));
        }
        Ok(self.buffer.get_u32())
    }

    fn take_u64(&mut self, what: &str) -> AmqpResult<u64> {
        if self.buffer.remaining() < 8 {
            return Err(AmqpError::decoding(format!("insufficient data for {}", what)));
        }
        Ok(self.buffer.get_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: Value) -> Value {
        let mut encoder = Encoder::new();
        encoder.encode_value(&value).unwrap();
        let encoded = encoder.finish();
        let mut decoder = Decoder::new(encoded);
        let decoded = decoder.decode_value().unwrap();
        assert_eq!(decoder.remaining(), 0);
        decoded
    }

    #[test]
    fn test_scalar_round_trips() {
        assert_eq!(round_trip(Value::Null), Value::Null);
        assert_eq!(round_trip(Value::Boolean(true)), Value::Boolean(true));
        assert_eq!(round_trip(Value::Boolean(false)), Value::Boolean(false));
        assert_eq!(round_trip(Value::Ubyte(7)), Value::Ubyte(7));
        assert_eq!(round_trip(Value::Ushort(1024)), Value::Ushort(1024));
        assert_eq!(round_trip(Value::Ulong(0x18)), Value::Ulong(0x18));
    }

    #[test]
    fn test_uint_compact_encodings() {
        let mut encoder = Encoder::new();
        encoder.encode_uint(0).unwrap();
        encoder.encode_uint(200).unwrap();
        encoder.encode_uint(70000).unwrap();
        let encoded = encoder.finish();

        assert_eq!(encoded[0], TypeCode::Uint0 as u8);
        assert_eq!(encoded[1], TypeCode::SmallUint as u8);
        assert_eq!(encoded[3], TypeCode::Uint as u8);

        let mut decoder = Decoder::new(encoded);
        assert_eq!(decoder.decode_value().unwrap(), Value::Uint(0));
        assert_eq!(decoder.decode_value().unwrap(), Value::Uint(200));
        assert_eq!(decoder.decode_value().unwrap(), Value::Uint(70000));
    }

    #[test]
    fn test_string_and_symbol() {
        assert_eq!(
            round_trip(Value::String("hello".to_string())),
            Value::String("hello".to_string())
        );
        assert_eq!(
            round_trip(Value::Symbol("amqp:connection:forced".to_string())),
            Value::Symbol("amqp:connection:forced".to_string())
        );

        // Long strings use the 32-bit length form.
        let long = "x".repeat(300);
        let mut encoder = Encoder::new();
        encoder.encode_string(&long).unwrap();
        let encoded = encoder.finish();
        assert_eq!(encoded[0], TypeCode::String32 as u8);
        let mut decoder = Decoder::new(encoded);
        assert_eq!(decoder.decode_value().unwrap(), Value::String(long));
    }

    #[test]
    fn test_binary() {
        let data = Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(
            round_trip(Value::Binary(data.clone())),
            Value::Binary(data)
        );
    }

    #[test]
    fn test_list_round_trip() {
        let list = Value::List(vec![
            Value::String("container-1".to_string()),
            Value::Null,
            Value::Uint(65536),
            Value::Ushort(100),
        ]);
        assert_eq!(round_trip(list.clone()), list);
    }

    #[test]
    fn test_empty_list_uses_list0() {
        let mut encoder = Encoder::new();
        encoder.encode_list(&[]).unwrap();
        let encoded = encoder.finish();
        assert_eq!(encoded, vec![TypeCode::List0 as u8]);
    }

    #[test]
    fn test_described_round_trip() {
        let open = Value::Described(
            0x10,
            Box::new(Value::List(vec![Value::String("cid".to_string())])),
        );
        assert_eq!(round_trip(open.clone()), open);
    }

    #[test]
    fn test_decode_insufficient_data() {
        let mut decoder = Decoder::new(vec![TypeCode::Uint as u8, 0x00]);
        let result = decoder.decode_value();
        assert!(matches!(result, Err(AmqpError::Decoding(_))));
    }

    #[test]
    fn test_decode_unknown_format_code() {
        let mut decoder = Decoder::new(vec![0xff]);
        let result = decoder.decode_value();
        assert!(matches!(result, Err(AmqpError::Decoding(_))));
    }

    #[test]
    fn test_decode_truncated_string() {
        let mut decoder = Decoder::new(vec![TypeCode::String8 as u8, 10, b'h', b'i']);
        let result = decoder.decode_value();
        assert!(matches!(result, Err(AmqpError::Decoding(_))));
    }

    #[test]
    fn test_decode_invalid_utf8() {
        let mut decoder = Decoder::new(vec![TypeCode::String8 as u8, 2, 0xff, 0xfe]);
        let result = decoder.decode_value();
        assert!(matches!(result, Err(AmqpError::Decoding(_))));
    }
}
