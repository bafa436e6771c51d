//! Packet codec: framing plus the active cipher state for each direction.
//!
//! [`PacketSealer`] turns payloads into wire bytes and [`PacketOpener`]
//! turns buffered wire bytes back into payloads. Both keep their own 32-bit
//! wrapping sequence counter; the counters are MAC/nonce input and are never
//! sent on the wire.
//!
//! [`PacketReader`] and [`PacketWriter`] drive the two halves over an async
//! byte stream. The reader owns the receive state and the writer owns the
//! send state, so each direction is mutated by a single task.

use bytes::BytesMut;
use fynx_platform::{FynxError, FynxResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::crypto::{OpeningKey, SealingKey};
use crate::packet::{Alignment, Packet, MAX_PACKET_SIZE};
use crate::version::MAX_VERSION_LENGTH;

/// Outgoing half of the codec.
#[derive(Debug, Default)]
pub struct PacketSealer {
    sequence: u32,
    key: Option<SealingKey>,
}

impl PacketSealer {
    /// Creates a sealer with no cipher active and sequence number 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number the next packet will use.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Whether a cipher is active.
    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }

    /// Activates new keys. The sequence number continues unchanged.
    pub fn install(&mut self, key: SealingKey) {
        self.key = Some(key);
    }

    /// Drops the active cipher state.
    pub fn clear(&mut self) {
        self.key = None;
    }

    /// Padding alignment for the active cipher.
    pub fn alignment(&self) -> Alignment {
        self.key
            .as_ref()
            .map_or(Alignment::PLAINTEXT, SealingKey::alignment)
    }

    /// Frames `payload` with fresh random padding and seals it.
    pub fn encode(&mut self, payload: &[u8]) -> FynxResult<Vec<u8>> {
        let packet = Packet::with_alignment(payload.to_vec(), self.alignment())?;
        self.seal(&packet)
    }

    /// Seals a packet with its existing padding.
    ///
    /// # Errors
    ///
    /// Returns [`FynxError::Protocol`] when the padding does not satisfy the
    /// active cipher's alignment.
    pub fn seal(&mut self, packet: &Packet) -> FynxResult<Vec<u8>> {
        self.alignment().check_length(packet.packet_length())?;

        let mut frame = packet.to_bytes();
        if let Some(key) = self.key.as_mut() {
            key.seal(self.sequence, &mut frame)?;
        }
        self.sequence = self.sequence.wrapping_add(1);
        Ok(frame)
    }
}

/// Incoming half of the codec.
#[derive(Debug, Default)]
pub struct PacketOpener {
    sequence: u32,
    key: Option<OpeningKey>,
    /// Length of a packet whose header has already been processed.
    pending_length: Option<usize>,
}

impl PacketOpener {
    /// Creates an opener with no cipher active and sequence number 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number the next packet will use.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Whether a cipher is active.
    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }

    /// Activates new keys. Must be called between packets.
    pub fn install(&mut self, key: OpeningKey) {
        self.key = Some(key);
        self.pending_length = None;
    }

    /// Drops the active cipher state.
    pub fn clear(&mut self) {
        self.key = None;
    }

    fn alignment(&self) -> Alignment {
        self.key
            .as_ref()
            .map_or(Alignment::PLAINTEXT, OpeningKey::alignment)
    }

    /// Decodes one packet from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Consumed bytes are
    /// removed from `buf` only once a complete packet is available. The
    /// sequence number advances only for packets that decode successfully.
    pub fn decode(&mut self, buf: &mut BytesMut) -> FynxResult<Option<Packet>> {
        let (header_len, trailer_len) = match &self.key {
            Some(key) => (key.header_len(), key.trailer_len()),
            None => (4, 0),
        };

        let packet_length = match self.pending_length {
            Some(len) => len,
            None => {
                if buf.len() < header_len {
                    return Ok(None);
                }
                let raw = match self.key.as_mut() {
                    Some(key) => key.decrypt_length(self.sequence, &mut buf[..header_len]),
                    None => u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
                };
                let len = raw as usize;
                self.alignment().check_length(len)?;
                self.pending_length = Some(len);
                len
            }
        };

        let total = 4 + packet_length + trailer_len;
        if buf.len() < total {
            return Ok(None);
        }

        let mut frame = buf.split_to(total);
        self.pending_length = None;

        if let Some(key) = self.key.as_mut() {
            key.open(self.sequence, &mut frame)?;
        }
        let packet = Packet::from_body(&frame[4..4 + packet_length])?;

        trace!(seq = self.sequence, len = packet_length, "packet decoded");
        self.sequence = self.sequence.wrapping_add(1);
        Ok(Some(packet))
    }
}

/// Both halves of the codec, for symmetric in-memory use.
#[derive(Debug, Default)]
pub struct PacketCodec {
    /// Outgoing half
    pub sealer: PacketSealer,
    /// Incoming half
    pub opener: PacketOpener,
}

impl PacketCodec {
    /// Creates an unencrypted codec.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes a payload.
    pub fn encode_packet(&mut self, payload: &[u8]) -> FynxResult<Vec<u8>> {
        self.sealer.encode(payload)
    }

    /// Decodes a single complete packet from `wire`.
    pub fn decode_packet(&mut self, wire: &[u8]) -> FynxResult<Vec<u8>> {
        let mut buf = BytesMut::from(wire);
        match self.opener.decode(&mut buf)? {
            Some(packet) if buf.is_empty() => Ok(packet.into_payload()),
            Some(_) => Err(FynxError::protocol("trailing bytes after packet")),
            None => Err(FynxError::protocol("incomplete packet")),
        }
    }
}

/// Reads packets from the receive half of a stream.
#[derive(Debug)]
pub struct PacketReader<R> {
    inner: R,
    opener: PacketOpener,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    /// Wraps the read half of a stream.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            opener: PacketOpener::new(),
            buf: BytesMut::with_capacity(MAX_PACKET_SIZE),
        }
    }

    /// Receive-side codec state.
    pub fn opener(&self) -> &PacketOpener {
        &self.opener
    }

    /// Activates new receive keys.
    pub fn install(&mut self, key: OpeningKey) {
        self.opener.install(key);
    }

    async fn fill(&mut self) -> FynxResult<()> {
        let n = self.inner.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Err(FynxError::ConnectionClosed);
        }
        Ok(())
    }

    /// Reads one CR LF (or LF) terminated line, without the terminator.
    ///
    /// Used only during version exchange, before any packet is read.
    pub async fn read_line(&mut self) -> FynxResult<String> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line = self.buf.split_to(pos + 1);
                let mut line = &line[..pos];
                if line.last() == Some(&b'\r') {
                    line = &line[..line.len() - 1];
                }
                return String::from_utf8(line.to_vec())
                    .map_err(|_| FynxError::protocol("version line is not UTF-8"));
            }
            if self.buf.len() > MAX_VERSION_LENGTH + 2 {
                return Err(FynxError::Protocol(format!(
                    "Version line exceeds {} bytes",
                    MAX_VERSION_LENGTH
                )));
            }
            self.fill().await?;
        }
    }

    /// Reads and decodes the next packet.
    pub async fn read_packet(&mut self) -> FynxResult<Packet> {
        loop {
            if let Some(packet) = self.opener.decode(&mut self.buf)? {
                return Ok(packet);
            }
            self.fill().await?;
        }
    }
}

/// Writes packets to the send half of a stream.
#[derive(Debug)]
pub struct PacketWriter<W> {
    inner: W,
    sealer: PacketSealer,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    /// Wraps the write half of a stream.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            sealer: PacketSealer::new(),
        }
    }

    /// Send-side codec state.
    pub fn sealer(&self) -> &PacketSealer {
        &self.sealer
    }

    /// Activates new send keys.
    pub fn install(&mut self, key: SealingKey) {
        self.sealer.install(key);
    }

    /// Writes raw bytes (the version line).
    pub async fn write_raw(&mut self, data: &[u8]) -> FynxResult<()> {
        self.inner.write_all(data).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Seals and writes one payload, returning the number of bytes sent.
    pub async fn write_payload(&mut self, payload: &[u8]) -> FynxResult<usize> {
        let wire = self.sealer.encode(payload)?;
        self.inner.write_all(&wire).await?;
        self.inner.flush().await?;
        Ok(wire.len())
    }

    /// Shuts down the write half and drops the cipher state.
    pub async fn shutdown(&mut self) -> FynxResult<()> {
        self.sealer.clear();
        self.inner.shutdown().await?;
        Ok(())
    }
}
