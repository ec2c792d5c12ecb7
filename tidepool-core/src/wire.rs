//! Binary payload codec.
//!
//! The control payloads of the remote-messaging protocol are bit-exact:
//! all integers big-endian, strings and byte blobs carry a `u32` length
//! prefix, lists carry a `u32` element count. This module provides the
//! reader/writer pair every protocol payload goes through.
//!
//! The reader never panics on malformed input; it reports
//! [`WireError::UnexpectedEof`] when the input runs short and validates
//! UTF-8 for strings.

use crate::{ExitReason, NodeId};

/// Errors produced while decoding wire payloads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Input ended before the announced data.
    #[error("unexpected end of input: need {needed} bytes, have {have}")]
    UnexpectedEof {
        /// Bytes required by the current field.
        needed: usize,
        /// Bytes actually available.
        have: usize,
    },

    /// A string field was not valid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    /// An enum discriminator had no known mapping.
    #[error("invalid discriminator {value} for {what}")]
    InvalidDiscriminator {
        /// The unknown value.
        value: u8,
        /// What was being decoded.
        what: &'static str,
    },

    /// A length prefix exceeds the remaining input.
    #[error("length prefix {length} exceeds remaining input {remaining}")]
    LengthOutOfBounds {
        /// Announced length.
        length: usize,
        /// Remaining bytes.
        remaining: usize,
    },
}

/// Appends big-endian primitives to a byte buffer.
#[derive(Debug)]
pub struct BinaryWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> BinaryWriter<'a> {
    /// Write into `buf`, appending after any existing content.
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        Self { buf }
    }

    /// Write a single byte.
    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Write a big-endian `u16`.
    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Write a big-endian `u32`.
    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Write a big-endian `u64`.
    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Write a length-prefixed byte blob.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    /// Write a counted list of strings.
    pub fn write_string_list(&mut self, values: &[String]) {
        self.write_u32(values.len() as u32);
        for value in values {
            self.write_string(value);
        }
    }

    /// Write a node id as 16 raw bytes.
    pub fn write_node_id(&mut self, node: &NodeId) {
        self.write_u64(node.first);
        self.write_u64(node.second);
    }

    /// Write an exit reason as code byte plus description string.
    pub fn write_exit_reason(&mut self, reason: &ExitReason) {
        self.write_u8(reason.code());
        match reason {
            ExitReason::Remote(text) => self.write_string(text),
            _ => self.write_string(""),
        }
    }
}

/// Reads big-endian primitives from a byte slice.
#[derive(Debug)]
pub struct BinaryReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BinaryReader<'a> {
    /// Read from the beginning of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Whether all input was consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::UnexpectedEof {
                needed: n,
                have: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    /// Read a big-endian `u16`.
    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Read a big-endian `u32`.
    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a big-endian `u64`.
    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(raw))
    }

    /// Read the length prefix of a blob or list and validate it against the
    /// remaining input.
    pub fn read_length(&mut self) -> Result<usize, WireError> {
        let length = self.read_u32()? as usize;
        if length > self.remaining() {
            return Err(WireError::LengthOutOfBounds {
                length,
                remaining: self.remaining(),
            });
        }
        Ok(length)
    }

    /// Read a length-prefixed byte blob.
    pub fn read_bytes(&mut self) -> Result<&'a [u8], WireError> {
        let length = self.read_length()?;
        self.take(length)
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, WireError> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }

    /// Read a counted list of strings.
    pub fn read_string_list(&mut self) -> Result<Vec<String>, WireError> {
        let count = self.read_u32()? as usize;
        let mut values = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            values.push(self.read_string()?);
        }
        Ok(values)
    }

    /// Read a node id (16 raw bytes).
    pub fn read_node_id(&mut self) -> Result<NodeId, WireError> {
        let first = self.read_u64()?;
        let second = self.read_u64()?;
        Ok(NodeId::new(first, second))
    }

    /// Read an exit reason.
    pub fn read_exit_reason(&mut self) -> Result<ExitReason, WireError> {
        let code = self.read_u8()?;
        let description = self.read_string()?;
        ExitReason::from_code(code, description).ok_or(WireError::InvalidDiscriminator {
            value: code,
            what: "exit reason",
        })
    }

    /// The unconsumed tail of the input.
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_roundtrip() {
        let mut buf = Vec::new();
        let mut writer = BinaryWriter::new(&mut buf);
        writer.write_u8(0xAB);
        writer.write_u16(0x1234);
        writer.write_u32(0xDEADBEEF);
        writer.write_u64(0x0123456789ABCDEF);

        let mut reader = BinaryReader::new(&buf);
        assert_eq!(reader.read_u8().expect("u8"), 0xAB);
        assert_eq!(reader.read_u16().expect("u16"), 0x1234);
        assert_eq!(reader.read_u32().expect("u32"), 0xDEADBEEF);
        assert_eq!(reader.read_u64().expect("u64"), 0x0123456789ABCDEF);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_big_endian_layout() {
        let mut buf = Vec::new();
        BinaryWriter::new(&mut buf).write_u32(0x01020304);
        assert_eq!(buf, vec![0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_string_roundtrip() {
        let mut buf = Vec::new();
        BinaryWriter::new(&mut buf).write_string("/name/dummy");

        let mut reader = BinaryReader::new(&buf);
        assert_eq!(reader.read_string().expect("string"), "/name/dummy");
        assert!(reader.is_empty());
    }

    #[test]
    fn test_string_list_roundtrip() {
        let values = vec!["alpha".to_string(), String::new(), "omega".to_string()];
        let mut buf = Vec::new();
        BinaryWriter::new(&mut buf).write_string_list(&values);

        let mut reader = BinaryReader::new(&buf);
        assert_eq!(reader.read_string_list().expect("list"), values);
    }

    #[test]
    fn test_node_id_roundtrip() {
        let node = NodeId::new(0x1111, 0x2222);
        let mut buf = Vec::new();
        BinaryWriter::new(&mut buf).write_node_id(&node);
        assert_eq!(buf.len(), 16);

        let mut reader = BinaryReader::new(&buf);
        assert_eq!(reader.read_node_id().expect("node id"), node);
    }

    #[test]
    fn test_exit_reason_roundtrip() {
        for reason in [
            ExitReason::Normal,
            ExitReason::Unknown,
            ExitReason::Remote("connection reset".to_string()),
        ] {
            let mut buf = Vec::new();
            BinaryWriter::new(&mut buf).write_exit_reason(&reason);
            let decoded = BinaryReader::new(&buf)
                .read_exit_reason()
                .expect("exit reason");
            assert_eq!(decoded, reason);
        }
    }

    #[test]
    fn test_short_input_reports_eof() {
        let mut reader = BinaryReader::new(&[0x00, 0x01]);
        let err = reader.read_u32().expect_err("short input");
        assert_eq!(err, WireError::UnexpectedEof { needed: 4, have: 2 });
    }

    #[test]
    fn test_length_prefix_bounds_checked() {
        // Announces 100 bytes but provides none.
        let buf = vec![0x00, 0x00, 0x00, 0x64];
        let mut reader = BinaryReader::new(&buf);
        let err = reader.read_bytes().expect_err("length out of bounds");
        assert!(matches!(err, WireError::LengthOutOfBounds { length: 100, .. }));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut buf = Vec::new();
        BinaryWriter::new(&mut buf).write_bytes(&[0xFF, 0xFE]);
        let err = BinaryReader::new(&buf).read_string().expect_err("bad utf8");
        assert_eq!(err, WireError::InvalidUtf8);
    }

    #[test]
    fn test_rest_consumes_tail() {
        let mut buf = Vec::new();
        let mut writer = BinaryWriter::new(&mut buf);
        writer.write_u8(1);
        writer.write_u8(2);
        writer.write_u8(3);

        let mut reader = BinaryReader::new(&buf);
        assert_eq!(reader.read_u8().expect("u8"), 1);
        assert_eq!(reader.rest(), &[2, 3]);
        assert!(reader.is_empty());
    }
}
