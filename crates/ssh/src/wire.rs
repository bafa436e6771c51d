//! SSH data type encoding (RFC 4251 Section 5).
//!
//! Writing goes through the [`SshBufMut`] extension trait on [`BytesMut`];
//! reading goes through [`Reader`], a bounds-checked cursor that reports
//! every short read as a protocol error.

use bytes::{BufMut, BytesMut};
use fynx_platform::{FynxError, FynxResult};

/// Longest string accepted by [`Reader`]; nothing in the transport or
/// authentication layers comes close to the packet size limit.
const MAX_STRING_LEN: usize = 256 * 1024;

/// Encoding helpers for SSH data types.
pub trait SshBufMut {
    /// `boolean`: one byte, 0 or 1.
    fn put_bool(&mut self, value: bool);

    /// `string`: uint32 length followed by raw bytes.
    fn put_string(&mut self, data: &[u8]);

    /// `name-list`: comma separated names encoded as a `string`.
    fn put_name_list<S: AsRef<str>>(&mut self, names: &[S]);

    /// `mpint`: two's complement big-endian, minimal length, positive only.
    fn put_mpint(&mut self, magnitude: &[u8]);
}

impl SshBufMut for BytesMut {
    fn put_bool(&mut self, value: bool) {
        self.put_u8(value as u8);
    }

    fn put_string(&mut self, data: &[u8]) {
        self.put_u32(data.len() as u32);
        self.put_slice(data);
    }

    fn put_name_list<S: AsRef<str>>(&mut self, names: &[S]) {
        let joined = names
            .iter()
            .map(|n| n.as_ref())
            .collect::<Vec<_>>()
            .join(",");
        self.put_string(joined.as_bytes());
    }

    fn put_mpint(&mut self, magnitude: &[u8]) {
        let encoded = encode_mpint(magnitude);
        self.put_slice(&encoded);
    }
}

/// Encodes an unsigned big-endian magnitude as an SSH `mpint`, including
/// its length prefix.
///
/// Leading zero bytes are stripped and a single zero byte is prepended when
/// the high bit of the first byte is set. Zero encodes as an empty string.
pub fn encode_mpint(magnitude: &[u8]) -> Vec<u8> {
    let start = magnitude
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(magnitude.len());
    let trimmed = &magnitude[start..];

    let needs_pad = trimmed.first().map_or(false, |&b| b & 0x80 != 0);
    let len = trimmed.len() + needs_pad as usize;

    let mut out = Vec::with_capacity(4 + len);
    out.extend_from_slice(&(len as u32).to_be_bytes());
    if needs_pad {
        out.push(0);
    }
    out.extend_from_slice(trimmed);
    out
}

/// Bounds-checked reader over an SSH payload.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    /// Creates a reader positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Number of bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Current position.
    pub fn position(&self) -> usize {
        self.offset
    }

    /// Whether all input has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Fails if unread bytes remain.
    pub fn finish(&self) -> FynxResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(FynxError::protocol(format!(
                "{} trailing bytes after message",
                self.remaining()
            )))
        }
    }

    /// Takes exactly `len` raw bytes.
    pub fn take(&mut self, len: usize) -> FynxResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(FynxError::protocol(format!(
                "truncated message: need {} bytes at offset {}, have {}",
                len,
                self.offset,
                self.remaining()
            )));
        }
        let out = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(out)
    }

    /// Takes all remaining bytes.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.offset..];
        self.offset = self.data.len();
        out
    }

    /// Reads a `byte`.
    pub fn read_u8(&mut self) -> FynxResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// Reads a `boolean`. Any non-zero value is true.
    pub fn read_bool(&mut self) -> FynxResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a `uint32`.
    pub fn read_u32(&mut self) -> FynxResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a `string` as raw bytes.
    pub fn read_string(&mut self) -> FynxResult<&'a [u8]> {
        let len = self.read_u32()? as usize;
        if len > MAX_STRING_LEN {
            return Err(FynxError::protocol(format!("string length {} too large", len)));
        }
        self.take(len)
    }

    /// Reads a `string` that must be valid UTF-8.
    pub fn read_utf8(&mut self) -> FynxResult<&'a str> {
        let raw = self.read_string()?;
        std::str::from_utf8(raw).map_err(|_| FynxError::protocol("invalid UTF-8 in string"))
    }

    /// Reads a `name-list`. An empty string yields an empty list.
    pub fn read_name_list(&mut self) -> FynxResult<Vec<String>> {
        let text = self.read_utf8()?;
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let names: Vec<String> = text.split(',').map(str::to_string).collect();
        if names.iter().any(|n| n.is_empty()) {
            return Err(FynxError::protocol("empty name in name-list"));
        }
        Ok(names)
    }

    /// Reads an `mpint` and returns its unsigned magnitude without leading
    /// zero bytes. Negative values are rejected.
    pub fn read_mpint(&mut self) -> FynxResult<&'a [u8]> {
        let raw = self.read_string()?;
        if raw.first().map_or(false, |&b| b & 0x80 != 0) {
            return Err(FynxError::protocol("negative mpint"));
        }
        let start = raw.iter().position(|&b| b != 0).unwrap_or(raw.len());
        Ok(&raw[start..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_and_name_list() {
        let mut buf = BytesMut::new();
        buf.put_string(b"ssh-userauth");
        buf.put_name_list(&["publickey", "password"]);
        buf.put_name_list::<&str>(&[]);
        buf.put_bool(true);

        let mut r = Reader::new(&buf);
        assert_eq!(r.read_utf8().unwrap(), "ssh-userauth");
        assert_eq!(r.read_name_list().unwrap(), vec!["publickey", "password"]);
        assert!(r.read_name_list().unwrap().is_empty());
        assert!(r.read_bool().unwrap());
        r.finish().unwrap();
    }

    #[test]
    fn test_mpint_encoding() {
        // RFC 4251 examples
        assert_eq!(encode_mpint(&[]), vec![0, 0, 0, 0]);
        assert_eq!(encode_mpint(&[0, 0]), vec![0, 0, 0, 0]);
        assert_eq!(encode_mpint(&[0x80]), vec![0, 0, 0, 2, 0x00, 0x80]);
        assert_eq!(
            encode_mpint(&[0x09, 0xa3, 0x78, 0xf9, 0xb2, 0xe3, 0x32, 0xa7]),
            vec![0, 0, 0, 8, 0x09, 0xa3, 0x78, 0xf9, 0xb2, 0xe3, 0x32, 0xa7]
        );
    }

    #[test]
    fn test_read_mpint_strips_sign_byte() {
        let encoded = encode_mpint(&[0xff, 0x01]);
        let mut r = Reader::new(&encoded);
        assert_eq!(r.read_mpint().unwrap(), &[0xff, 0x01]);
    }

    #[test]
    fn test_read_negative_mpint_fails() {
        let mut r = Reader::new(&[0, 0, 0, 1, 0x80]);
        assert!(matches!(r.read_mpint(), Err(FynxError::Protocol(_))));
    }

    #[test]
    fn test_truncated_input() {
        let mut r = Reader::new(&[0, 0, 0, 10, b'a']);
        assert!(matches!(r.read_string(), Err(FynxError::Protocol(_))));

        let mut r = Reader::new(&[0, 0]);
        assert!(r.read_u32().is_err());
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut buf = BytesMut::new();
        buf.put_string(b"a,,b");
        let mut r = Reader::new(&buf);
        assert!(r.read_name_list().is_err());
    }

    #[test]
    fn test_trailing_bytes() {
        let r = Reader::new(&[1]);
        assert!(r.finish().is_err());
    }
}
