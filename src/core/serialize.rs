//! Binary wire serialization
//!
//! Little-endian fixed-width codecs plus the Bitcoin-style variable-length
//! integer, shared by every wire message and the block header. All
//! multi-byte integers on the wire are little-endian; ports are the one
//! big-endian exception and are handled at the NetAddr layer.

use crate::core::hash256::Hash256;
use thiserror::Error;

/// Errors produced while decoding wire bytes
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of input: {0}")]
    UnexpectedEof(&'static str),
    #[error("invalid string: {0}")]
    InvalidString(&'static str),
    #[error("value out of range: {0}")]
    OutOfRange(&'static str),
}

/// Append-only byte sink for building wire payloads
#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u16_le(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32_le(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64_le(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_hash(&mut self, hash: &Hash256) {
        self.buf.extend_from_slice(hash.as_bytes());
    }

    /// Bitcoin variable-length integer: 1 byte below 0xfd, otherwise a
    /// marker byte followed by 2, 4 or 8 little-endian bytes
    pub fn write_varint(&mut self, value: u64) {
        match value {
            0..=0xfc => self.write_u8(value as u8),
            0xfd..=0xffff => {
                self.write_u8(0xfd);
                self.write_u16_le(value as u16);
            }
            0x10000..=0xffff_ffff => {
                self.write_u8(0xfe);
                self.write_u32_le(value as u32);
            }
            _ => {
                self.write_u8(0xff);
                self.write_u64_le(value);
            }
        }
    }

    /// Var-string: varint length followed by raw UTF-8 bytes
    pub fn write_var_str(&mut self, value: &str) {
        self.write_varint(value.len() as u64);
        self.write_bytes(value.as_bytes());
    }
}

/// Cursor over a received payload
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or(DecodeError::UnexpectedEof(what))?;
        let slice = self
            .data
            .get(self.pos..end)
            .ok_or(DecodeError::UnexpectedEof(what))?;
        self.pos = end;
        Ok(slice)
    }

    pub fn read_u8(&mut self, what: &'static str) -> Result<u8, DecodeError> {
        Ok(self.take(1, what)?[0])
    }

    pub fn read_u16_le(&mut self, what: &'static str) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take(2, what)?.try_into().unwrap()))
    }

    pub fn read_u32_le(&mut self, what: &'static str) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take(4, what)?.try_into().unwrap()))
    }

    pub fn read_u64_le(&mut self, what: &'static str) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.take(8, what)?.try_into().unwrap()))
    }

    pub fn read_i32_le(&mut self, what: &'static str) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.take(4, what)?.try_into().unwrap()))
    }

    pub fn read_i64_le(&mut self, what: &'static str) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.take(8, what)?.try_into().unwrap()))
    }

    pub fn read_bytes(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], DecodeError> {
        self.take(len, what)
    }

    pub fn read_fixed<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N], DecodeError> {
        Ok(self.take(N, what)?.try_into().unwrap())
    }

    pub fn read_hash(&mut self, what: &'static str) -> Result<Hash256, DecodeError> {
        Ok(Hash256::from_bytes(self.read_fixed::<32>(what)?))
    }

    pub fn read_varint(&mut self, what: &'static str) -> Result<u64, DecodeError> {
        let first = self.read_u8(what)?;
        match first {
            0xfd => Ok(self.read_u16_le(what)? as u64),
            0xfe => Ok(self.read_u32_le(what)? as u64),
            0xff => self.read_u64_le(what),
            n => Ok(n as u64),
        }
    }

    pub fn read_var_str(&mut self, what: &'static str) -> Result<String, DecodeError> {
        let len = self.read_varint(what)?;
        let len = usize::try_from(len).map_err(|_| DecodeError::OutOfRange(what))?;
        let bytes = self.take(len, what)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidString(what))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_round_trip() {
        let mut enc = Encoder::new();
        enc.write_u8(0xab);
        enc.write_u16_le(0x1234);
        enc.write_u32_le(0xdeadbeef);
        enc.write_u64_le(0x0102030405060708);
        enc.write_i32_le(-42);
        enc.write_i64_le(-1_000_000);
        let bytes = enc.into_inner();

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_u8("u8").unwrap(), 0xab);
        assert_eq!(dec.read_u16_le("u16").unwrap(), 0x1234);
        assert_eq!(dec.read_u32_le("u32").unwrap(), 0xdeadbeef);
        assert_eq!(dec.read_u64_le("u64").unwrap(), 0x0102030405060708);
        assert_eq!(dec.read_i32_le("i32").unwrap(), -42);
        assert_eq!(dec.read_i64_le("i64").unwrap(), -1_000_000);
        assert_eq!(dec.remaining(), 0);
    }

    #[test]
    fn test_varint_boundaries() {
        for value in [0u64, 0xfc, 0xfd, 0xffff, 0x10000, 0xffff_ffff, 0x1_0000_0000] {
            let mut enc = Encoder::new();
            enc.write_varint(value);
            let bytes = enc.into_inner();
            let mut dec = Decoder::new(&bytes);
            assert_eq!(dec.read_varint("v").unwrap(), value, "value {value:#x}");
        }
    }

    #[test]
    fn test_varint_encoded_widths() {
        let width = |value: u64| {
            let mut enc = Encoder::new();
            enc.write_varint(value);
            enc.len()
        };
        assert_eq!(width(0xfc), 1);
        assert_eq!(width(0xfd), 3);
        assert_eq!(width(0x10000), 5);
        assert_eq!(width(u64::MAX), 9);
    }

    #[test]
    fn test_var_str_round_trip() {
        let mut enc = Encoder::new();
        enc.write_var_str("/bitnode:0.1.0/");
        let bytes = enc.into_inner();
        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_var_str("ua").unwrap(), "/bitnode:0.1.0/");
    }

    #[test]
    fn test_truncated_input_errors() {
        let mut dec = Decoder::new(&[0x01, 0x02]);
        assert_eq!(
            dec.read_u32_le("field"),
            Err(DecodeError::UnexpectedEof("field"))
        );
    }

    #[test]
    fn test_invalid_utf8_var_str() {
        let mut dec = Decoder::new(&[0x02, 0xff, 0xfe]);
        assert!(matches!(
            dec.read_var_str("ua"),
            Err(DecodeError::InvalidString(_))
        ));
    }
}
