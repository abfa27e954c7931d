//! Little-endian binary serializer shared by events, status replies and log messages.
//!
//! Layout rules:
//! - integers are written little-endian at their natural width
//! - strings and byte blobs are a `u32` length followed by the raw bytes
//! - string maps are a `u32` entry count followed by key/value strings

use crate::error::{AppResult, DaqError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

/// Growable output buffer.
#[derive(Debug, Default)]
pub struct Serializer {
    buf: BytesMut,
}

impl Serializer {
    /// Creates an empty serializer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes one byte.
    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    /// Writes a `u32`.
    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }

    /// Writes a `u64`.
    pub fn put_u64(&mut self, value: u64) {
        self.buf.put_u64_le(value);
    }

    /// Writes a length-prefixed byte blob.
    pub fn put_bytes(&mut self, value: &[u8]) {
        self.buf.put_u32_le(value.len() as u32);
        self.buf.put_slice(value);
    }

    /// Writes a length-prefixed UTF-8 string.
    pub fn put_str(&mut self, value: &str) {
        self.put_bytes(value.as_bytes());
    }

    /// Writes a string map.
    pub fn put_map(&mut self, map: &BTreeMap<String, String>) {
        self.buf.put_u32_le(map.len() as u32);
        for (key, value) in map {
            self.put_str(key);
            self.put_str(value);
        }
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finishes serialization.
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Cursor over a received packet.
#[derive(Debug, Clone)]
pub struct Deserializer {
    buf: Bytes,
    depth: usize,
}

impl Deserializer {
    /// Wraps a packet.
    pub fn new(buf: impl Into<Bytes>) -> Self {
        Self {
            buf: buf.into(),
            depth: 0,
        }
    }

    fn need(&self, n: usize, what: &str) -> AppResult<()> {
        if self.buf.remaining() < n {
            return Err(DaqError::Serialization(format!(
                "truncated {what}: need {n} bytes, {} left",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    /// Reads one byte.
    pub fn get_u8(&mut self) -> AppResult<u8> {
        self.need(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    /// Reads a `u32`.
    pub fn get_u32(&mut self) -> AppResult<u32> {
        self.need(4, "u32")?;
        Ok(self.buf.get_u32_le())
    }

    /// Reads a `u64`.
    pub fn get_u64(&mut self) -> AppResult<u64> {
        self.need(8, "u64")?;
        Ok(self.buf.get_u64_le())
    }

    /// Reads the next `u32` without consuming it.
    pub fn peek_u32(&self) -> AppResult<u32> {
        self.need(4, "u32")?;
        let mut head = &self.buf[..4];
        Ok(head.get_u32_le())
    }

    /// Reads a length-prefixed byte blob without copying.
    pub fn get_bytes(&mut self) -> AppResult<Bytes> {
        let len = self.get_u32()? as usize;
        self.need(len, "byte blob")?;
        Ok(self.buf.split_to(len))
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn get_string(&mut self) -> AppResult<String> {
        let raw = self.get_bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| DaqError::Serialization(format!("invalid UTF-8 string: {e}")))
    }

    /// Reads a string map; duplicate keys keep the last value.
    pub fn get_map(&mut self) -> AppResult<BTreeMap<String, String>> {
        let count = self.get_u32()?;
        let mut map = BTreeMap::new();
        for _ in 0..count {
            let key = self.get_string()?;
            let value = self.get_string()?;
            map.insert(key, value);
        }
        Ok(map)
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Enters one level of nesting, failing beyond `limit` levels.
    pub fn enter_nested(&mut self, limit: usize) -> AppResult<()> {
        if self.depth >= limit {
            return Err(DaqError::Serialization(format!(
                "nesting deeper than {limit} levels"
            )));
        }
        self.depth += 1;
        Ok(())
    }

    /// Leaves a level entered with [`enter_nested`](Self::enter_nested).
    pub fn leave_nested(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_little_endian_layout() {
        let mut ser = Serializer::new();
        ser.put_u32(0x0403_0201);
        ser.put_str("ab");
        let bytes = ser.finish();
        assert_eq!(&bytes[..], &[1, 2, 3, 4, 2, 0, 0, 0, b'a', b'b']);
    }

    #[test]
    fn test_truncated_input_is_an_error() {
        let mut de = Deserializer::new(vec![10u8, 0, 0, 0, b'x']);
        let err = de.get_string().unwrap_err();
        assert!(matches!(err, DaqError::Serialization(_)));
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut de = Deserializer::new(vec![7u8, 0, 0, 0]);
        assert_eq!(de.peek_u32().unwrap(), 7);
        assert_eq!(de.get_u32().unwrap(), 7);
        assert_eq!(de.remaining(), 0);
    }

    #[test]
    fn test_duplicate_map_keys_last_wins() {
        let mut ser = Serializer::new();
        ser.put_u32(2);
        ser.put_str("k");
        ser.put_str("first");
        ser.put_str("k");
        ser.put_str("second");
        let mut de = Deserializer::new(ser.finish());
        let map = de.get_map().unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["k"], "second");
    }
}
