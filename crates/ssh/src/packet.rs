//! SSH binary packet framing (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac or AEAD tag
//! ```
//!
//! # Constraints
//!
//! - `packet_length` does not include the MAC or the length field itself
//! - `padding_length` is between 4 and 255
//! - The framed length is a multiple of the cipher block size (8 when
//!   unencrypted). AEAD ciphers leave the length field out of the alignment.
//! - `packet_length` is at most 35000 bytes and the payload at most 32768
//! - The payload is never empty
//!
//! This module only deals with the plaintext frame. Encryption and MAC are
//! layered on top by [`crate::codec`].
//!
//! # Example
//!
//! ```rust
//! use fynx_ssh::packet::Packet;
//!
//! let packet = Packet::new(b"\x05payload".to_vec()).unwrap();
//! let bytes = packet.to_bytes();
//!
//! let parsed = Packet::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed.payload(), b"\x05payload");
//! assert_eq!(parsed.to_bytes(), bytes);
//! ```

use bytes::{BufMut, BytesMut};
use fynx_platform::{FynxError, FynxResult};
use rand::RngCore;

/// Maximum value of `packet_length` (RFC 4253 Section 6.1).
pub const MAX_PACKET_SIZE: usize = 35000;

/// Maximum uncompressed payload (RFC 4253 Section 6.1).
pub const MAX_PAYLOAD_SIZE: usize = 32768;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: usize = 4;

/// Maximum padding length in bytes (fits in u8).
pub const MAX_PADDING_LEN: usize = 255;

/// Block size used before any cipher is active.
pub const DEFAULT_BLOCK_SIZE: usize = 8;

/// How the framed packet must be aligned for the active cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alignment {
    /// Cipher block size (at least 8)
    pub block_size: usize,
    /// Whether the 4-byte length field counts toward alignment.
    /// False for AEAD modes where the length is handled separately.
    pub length_included: bool,
}

impl Alignment {
    /// Alignment for unencrypted packets.
    pub const PLAINTEXT: Alignment = Alignment {
        block_size: DEFAULT_BLOCK_SIZE,
        length_included: true,
    };

    fn aligned_part(&self, packet_length: usize) -> usize {
        if self.length_included {
            4 + packet_length
        } else {
            packet_length
        }
    }

    /// Padding length for a payload of `payload_len` bytes.
    pub fn padding_for(&self, payload_len: usize) -> usize {
        let unpadded = self.aligned_part(1 + payload_len);
        let mut padding = self.block_size - unpadded % self.block_size;
        if padding < MIN_PADDING_LEN {
            padding += self.block_size;
        }
        padding
    }

    /// Validates a received `packet_length` before the rest of the packet
    /// is read.
    pub fn check_length(&self, packet_length: usize) -> FynxResult<()> {
        if packet_length > MAX_PACKET_SIZE {
            return Err(FynxError::Protocol(format!(
                "Packet size {} exceeds maximum {}",
                packet_length, MAX_PACKET_SIZE
            )));
        }
        if packet_length < 1 + MIN_PADDING_LEN + 1 {
            return Err(FynxError::Protocol(format!(
                "Packet length {} too small",
                packet_length
            )));
        }
        if self.aligned_part(packet_length) % self.block_size != 0 {
            return Err(FynxError::Protocol(format!(
                "Packet length {} not aligned to block size {}",
                packet_length, self.block_size
            )));
        }
        Ok(())
    }
}

impl Default for Alignment {
    fn default() -> Self {
        Alignment::PLAINTEXT
    }
}

/// SSH binary packet: payload plus the padding that travels with it.
///
/// Decoding keeps the received padding so that re-encoding a decoded packet
/// under the same cipher state reproduces the original bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Vec<u8>,
    padding: Vec<u8>,
}

impl Packet {
    /// Creates an unencrypted packet with random padding.
    pub fn new(payload: Vec<u8>) -> FynxResult<Self> {
        Self::with_alignment(payload, Alignment::PLAINTEXT)
    }

    /// Creates a packet padded for the given cipher alignment.
    ///
    /// # Errors
    ///
    /// Returns [`FynxError::Protocol`] for an empty payload or one larger
    /// than [`MAX_PAYLOAD_SIZE`].
    pub fn with_alignment(payload: Vec<u8>, alignment: Alignment) -> FynxResult<Self> {
        check_payload_len(payload.len())?;

        let padding_len = alignment.padding_for(payload.len());
        let mut padding = vec![0u8; padding_len];
        rand::thread_rng().fill_bytes(&mut padding);

        Ok(Self { payload, padding })
    }

    /// Builds a packet from explicit parts, validating the padding length.
    pub fn from_parts(payload: Vec<u8>, padding: Vec<u8>) -> FynxResult<Self> {
        check_payload_len(payload.len())?;
        if padding.len() < MIN_PADDING_LEN || padding.len() > MAX_PADDING_LEN {
            return Err(FynxError::Protocol(format!(
                "Padding length {} out of range",
                padding.len()
            )));
        }
        Ok(Self { payload, padding })
    }

    /// Returns the payload of this packet.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the packet, returning the payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Returns the padding of this packet.
    pub fn padding(&self) -> &[u8] {
        &self.padding
    }

    /// Message number (first payload byte).
    pub fn message_type(&self) -> u8 {
        self.payload[0]
    }

    /// Value of the `packet_length` field.
    pub fn packet_length(&self) -> usize {
        1 + self.payload.len() + self.padding.len()
    }

    /// Serializes the plaintext frame: length, padding length, payload,
    /// padding. No MAC.
    pub fn to_bytes(&self) -> Vec<u8> {
        let packet_length = self.packet_length();
        let mut buf = BytesMut::with_capacity(4 + packet_length);

        buf.put_u32(packet_length as u32);
        buf.put_u8(self.padding.len() as u8);
        buf.put_slice(&self.payload);
        buf.put_slice(&self.padding);

        buf.to_vec()
    }

    /// Parses an unencrypted frame.
    ///
    /// # Errors
    ///
    /// Returns [`FynxError::Protocol`] if:
    /// - Data is shorter than the header or than `packet_length` says
    /// - `packet_length` exceeds [`MAX_PACKET_SIZE`] or is misaligned
    /// - Padding is shorter than 4 bytes or overruns the packet
    /// - The payload is empty or larger than [`MAX_PAYLOAD_SIZE`]
    pub fn from_bytes(data: &[u8]) -> FynxResult<Self> {
        if data.len() < 5 {
            return Err(FynxError::Protocol(format!(
                "Packet too short: {} bytes (minimum 5)",
                data.len()
            )));
        }

        let packet_length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        Alignment::PLAINTEXT.check_length(packet_length)?;

        if data.len() < 4 + packet_length {
            return Err(FynxError::Protocol(format!(
                "Incomplete packet: expected {} bytes, got {}",
                4 + packet_length,
                data.len()
            )));
        }

        Self::from_body(&data[4..4 + packet_length])
    }

    /// Parses the decrypted body (`padding_length || payload || padding`).
    pub fn from_body(body: &[u8]) -> FynxResult<Self> {
        let (&padding_len, rest) = body
            .split_first()
            .ok_or_else(|| FynxError::protocol("Empty packet body"))?;
        let padding_len = padding_len as usize;

        if padding_len < MIN_PADDING_LEN {
            return Err(FynxError::Protocol(format!(
                "Padding too short: {} bytes (minimum {})",
                padding_len, MIN_PADDING_LEN
            )));
        }
        if padding_len > rest.len() {
            return Err(FynxError::Protocol(format!(
                "Padding length {} exceeds packet body {}",
                padding_len,
                rest.len()
            )));
        }

        let (payload, padding) = rest.split_at(rest.len() - padding_len);
        check_payload_len(payload.len())?;

        Ok(Self {
            payload: payload.to_vec(),
            padding: padding.to_vec(),
        })
    }
}

fn check_payload_len(len: usize) -> FynxResult<()> {
    if len == 0 {
        return Err(FynxError::protocol("Zero-length payload"));
    }
    if len > MAX_PAYLOAD_SIZE {
        return Err(FynxError::Protocol(format!(
            "Payload size {} exceeds maximum {}",
            len, MAX_PAYLOAD_SIZE
        )));
    }
    Ok(())
}
