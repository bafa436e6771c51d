//! Packet encryption and MAC state.
//!
//! This module implements the cipher suites negotiated by the key exchange:
//! - `chacha20-poly1305@openssh.com` (AEAD, encrypted length field)
//! - `aes128-gcm@openssh.com`, `aes256-gcm@openssh.com` (RFC 5647 AEAD)
//! - `aes128-ctr`, `aes256-ctr` with `hmac-sha2-256` / `hmac-sha2-512`
//!   (encrypt-and-MAC)
//!
//! A [`SealingKey`] protects outgoing packets and an [`OpeningKey`] checks
//! and decrypts incoming ones. Each is owned by exactly one direction of the
//! connection.
//!
//! # Security
//!
//! - Every verification failure maps to the same generic error
//! - MACs are compared in constant time
//! - Key material is zeroized on drop

use aes::{Aes128, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use fynx_platform::{FynxError, FynxResult};
use hmac::{Hmac, Mac};
use ring::aead::chacha20_poly1305_openssh as openssh;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, AES_256_GCM};
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::packet::Alignment;

const AEAD_TAG_LEN: usize = 16;

fn verification_failed() -> FynxError {
    FynxError::crypto("message authentication failed")
}

/// Cipher algorithm for SSH encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherAlgorithm {
    /// ChaCha20-Poly1305 as specified by OpenSSH
    ChaCha20Poly1305,
    /// AES-256 in GCM mode (RFC 5647)
    Aes256Gcm,
    /// AES-128 in GCM mode (RFC 5647)
    Aes128Gcm,
    /// AES-256 in counter mode (RFC 4344)
    Aes256Ctr,
    /// AES-128 in counter mode (RFC 4344)
    Aes128Ctr,
}

impl CipherAlgorithm {
    /// Every supported cipher in default preference order.
    pub const ALL: [CipherAlgorithm; 5] = [
        CipherAlgorithm::ChaCha20Poly1305,
        CipherAlgorithm::Aes256Gcm,
        CipherAlgorithm::Aes128Gcm,
        CipherAlgorithm::Aes256Ctr,
        CipherAlgorithm::Aes128Ctr,
    ];

    /// Returns the SSH algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305@openssh.com",
            CipherAlgorithm::Aes256Gcm => "aes256-gcm@openssh.com",
            CipherAlgorithm::Aes128Gcm => "aes128-gcm@openssh.com",
            CipherAlgorithm::Aes256Ctr => "aes256-ctr",
            CipherAlgorithm::Aes128Ctr => "aes128-ctr",
        }
    }

    /// Parses an SSH algorithm name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.name() == name)
    }

    /// Key size in bytes. ChaCha20-Poly1305 takes two 256-bit keys.
    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => openssh::KEY_LEN,
            CipherAlgorithm::Aes256Gcm | CipherAlgorithm::Aes256Ctr => 32,
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes128Ctr => 16,
        }
    }

    /// IV size in bytes.
    pub fn iv_size(&self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => 0,
            CipherAlgorithm::Aes256Gcm | CipherAlgorithm::Aes128Gcm => 12,
            CipherAlgorithm::Aes256Ctr | CipherAlgorithm::Aes128Ctr => 16,
        }
    }

    /// Cipher block size used for padding.
    pub fn block_size(&self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => 8,
            _ => 16,
        }
    }

    /// Authentication tag size for AEAD ciphers, 0 otherwise.
    pub fn tag_size(&self) -> usize {
        if self.is_aead() {
            AEAD_TAG_LEN
        } else {
            0
        }
    }

    /// Whether the cipher authenticates on its own (no separate MAC).
    pub fn is_aead(&self) -> bool {
        matches!(
            self,
            CipherAlgorithm::ChaCha20Poly1305
                | CipherAlgorithm::Aes256Gcm
                | CipherAlgorithm::Aes128Gcm
        )
    }

    /// Packet alignment required by this cipher.
    pub fn alignment(&self) -> Alignment {
        Alignment {
            block_size: self.block_size(),
            length_included: !self.is_aead(),
        }
    }
}

/// MAC algorithm for SSH integrity protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MacAlgorithm {
    /// HMAC-SHA-256
    HmacSha256,
    /// HMAC-SHA-512
    HmacSha512,
}

impl MacAlgorithm {
    /// Every supported MAC in default preference order.
    pub const ALL: [MacAlgorithm; 2] = [MacAlgorithm::HmacSha256, MacAlgorithm::HmacSha512];

    /// Returns the SSH algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
            MacAlgorithm::HmacSha512 => "hmac-sha2-512",
        }
    }

    /// Parses an SSH algorithm name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.name() == name)
    }

    /// Key size in bytes.
    pub fn key_size(&self) -> usize {
        self.mac_size()
    }

    /// Output size in bytes.
    pub fn mac_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
        }
    }
}

/// Derived key material for one direction of the connection.
pub struct DirectionKeys {
    /// Negotiated cipher
    pub cipher: CipherAlgorithm,
    /// Negotiated MAC; `None` for AEAD ciphers
    pub mac: Option<MacAlgorithm>,
    /// Initial IV
    pub iv: Zeroizing<Vec<u8>>,
    /// Encryption key
    pub key: Zeroizing<Vec<u8>>,
    /// Integrity key
    pub mac_key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for DirectionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectionKeys")
            .field("cipher", &self.cipher)
            .field("mac", &self.mac)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// HMAC over `uint32 sequence_number || packet`.
pub struct MacKey {
    algorithm: MacAlgorithm,
    key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl MacKey {
    /// Creates a MAC key, truncating the derived material to the key size.
    pub fn new(algorithm: MacAlgorithm, key_material: &[u8]) -> FynxResult<Self> {
        if key_material.len() < algorithm.key_size() {
            return Err(FynxError::Security(format!(
                "MAC key too short: {} bytes (need {})",
                key_material.len(),
                algorithm.key_size()
            )));
        }
        Ok(Self {
            algorithm,
            key: Zeroizing::new(key_material[..algorithm.key_size()].to_vec()),
        })
    }

    /// Computes the MAC of `packet` at `sequence`.
    pub fn compute(&self, sequence: u32, packet: &[u8]) -> FynxResult<Vec<u8>> {
        let seq = sequence.to_be_bytes();
        let out = match self.algorithm {
            MacAlgorithm::HmacSha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(&self.key)
                    .map_err(|_| FynxError::Security("invalid HMAC key".to_string()))?;
                mac.update(&seq);
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::HmacSha512 => {
                let mut mac = Hmac::<Sha512>::new_from_slice(&self.key)
                    .map_err(|_| FynxError::Security("invalid HMAC key".to_string()))?;
                mac.update(&seq);
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
        };
        Ok(out)
    }

    /// Verifies a received MAC in constant time.
    pub fn verify(&self, sequence: u32, packet: &[u8], received: &[u8]) -> FynxResult<()> {
        let computed = self.compute(sequence, packet)?;
        if computed.len() == received.len() && bool::from(computed.ct_eq(received)) {
            Ok(())
        } else {
            Err(verification_failed())
        }
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> MacAlgorithm {
        self.algorithm
    }
}

enum CtrCipher {
    Aes128(Box<Ctr128BE<Aes128>>),
    Aes256(Box<Ctr128BE<Aes256>>),
}

impl CtrCipher {
    fn new(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> FynxResult<Self> {
        let bad = |_| FynxError::Security("invalid AES-CTR key or IV length".to_string());
        match algorithm {
            CipherAlgorithm::Aes128Ctr => Ok(CtrCipher::Aes128(Box::new(
                Ctr128BE::<Aes128>::new_from_slices(&key[..16], &iv[..16]).map_err(bad)?,
            ))),
            CipherAlgorithm::Aes256Ctr => Ok(CtrCipher::Aes256(Box::new(
                Ctr128BE::<Aes256>::new_from_slices(&key[..32], &iv[..16]).map_err(bad)?,
            ))),
            other => Err(FynxError::Security(format!(
                "{} is not a counter mode cipher",
                other.name()
            ))),
        }
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            CtrCipher::Aes128(c) => c.apply_keystream(data),
            CtrCipher::Aes256(c) => c.apply_keystream(data),
        }
    }
}

/// RFC 5647 nonce: 4-byte fixed field followed by a 64-bit invocation
/// counter that increments once per packet.
struct GcmNonce {
    fixed: [u8; 4],
    invocation: u64,
}

impl GcmNonce {
    fn new(iv: &[u8]) -> Self {
        let mut fixed = [0u8; 4];
        fixed.copy_from_slice(&iv[..4]);
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&iv[4..12]);
        Self {
            fixed,
            invocation: u64::from_be_bytes(counter),
        }
    }

    fn advance(&mut self) -> Nonce {
        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&self.fixed);
        bytes[4..].copy_from_slice(&self.invocation.to_be_bytes());
        self.invocation = self.invocation.wrapping_add(1);
        Nonce::assume_unique_for_key(bytes)
    }
}

fn gcm_key(algorithm: CipherAlgorithm, key: &[u8]) -> FynxResult<LessSafeKey> {
    let (alg, len) = match algorithm {
        CipherAlgorithm::Aes128Gcm => (&AES_128_GCM, 16),
        CipherAlgorithm::Aes256Gcm => (&AES_256_GCM, 32),
        other => {
            return Err(FynxError::Security(format!(
                "{} is not a GCM cipher",
                other.name()
            )))
        }
    };
    let unbound = UnboundKey::new(alg, &key[..len])
        .map_err(|_| FynxError::Security("invalid AES-GCM key".to_string()))?;
    Ok(LessSafeKey::new(unbound))
}

fn chacha_material(key: &[u8]) -> FynxResult<&[u8; openssh::KEY_LEN]> {
    key.get(..openssh::KEY_LEN)
        .and_then(|k| k.try_into().ok())
        .ok_or_else(|| FynxError::Security("ChaCha20-Poly1305 key too short".to_string()))
}

fn check_material(keys: &DirectionKeys) -> FynxResult<()> {
    let cipher = keys.cipher;
    if keys.key.len() < cipher.key_size() || keys.iv.len() < cipher.iv_size() {
        return Err(FynxError::Security(format!(
            "insufficient key material for {}",
            cipher.name()
        )));
    }
    if !cipher.is_aead() && keys.mac.is_none() {
        return Err(FynxError::Security(format!(
            "{} requires a MAC algorithm",
            cipher.name()
        )));
    }
    Ok(())
}

enum Sealer {
    ChaCha(openssh::SealingKey),
    Gcm { key: LessSafeKey, nonce: GcmNonce },
    Ctr { cipher: CtrCipher, mac: MacKey },
}

/// Outgoing packet protection for one direction.
pub struct SealingKey {
    algorithm: CipherAlgorithm,
    inner: Sealer,
}

impl std::fmt::Debug for SealingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealingKey")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl SealingKey {
    /// Builds the sealing state from derived key material.
    pub fn new(keys: &DirectionKeys) -> FynxResult<Self> {
        check_material(keys)?;
        let inner = match keys.cipher {
            CipherAlgorithm::ChaCha20Poly1305 => {
                Sealer::ChaCha(openssh::SealingKey::new(chacha_material(&keys.key)?))
            }
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => Sealer::Gcm {
                key: gcm_key(keys.cipher, &keys.key)?,
                nonce: GcmNonce::new(&keys.iv),
            },
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes256Ctr => {
                let mac = keys
                    .mac
                    .ok_or_else(|| FynxError::Security("missing MAC".to_string()))?;
                Sealer::Ctr {
                    cipher: CtrCipher::new(keys.cipher, &keys.key, &keys.iv)?,
                    mac: MacKey::new(mac, &keys.mac_key)?,
                }
            }
        };
        Ok(Self {
            algorithm: keys.cipher,
            inner,
        })
    }

    /// Negotiated cipher.
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    /// Alignment that packets must satisfy before sealing.
    pub fn alignment(&self) -> Alignment {
        self.algorithm.alignment()
    }

    /// Encrypts the plaintext frame in place and appends the tag or MAC.
    pub fn seal(&mut self, sequence: u32, frame: &mut Vec<u8>) -> FynxResult<()> {
        match &mut self.inner {
            Sealer::ChaCha(key) => {
                let mut tag = [0u8; openssh::TAG_LEN];
                key.seal_in_place(sequence, frame, &mut tag);
                frame.extend_from_slice(&tag);
            }
            Sealer::Gcm { key, nonce } => {
                let (head, body) = frame.split_at_mut(4);
                let aad = [head[0], head[1], head[2], head[3]];
                let tag = key
                    .seal_in_place_separate_tag(nonce.advance(), Aad::from(aad), body)
                    .map_err(|_| FynxError::Security("AES-GCM seal failed".to_string()))?;
                frame.extend_from_slice(tag.as_ref());
            }
            Sealer::Ctr { cipher, mac } => {
                let tag = mac.compute(sequence, frame)?;
                cipher.apply(frame);
                frame.extend_from_slice(&tag);
            }
        }
        Ok(())
    }
}

enum Opener {
    ChaCha(openssh::OpeningKey),
    Gcm { key: LessSafeKey, nonce: GcmNonce },
    Ctr { cipher: CtrCipher, mac: MacKey },
}

/// Incoming packet verification and decryption for one direction.
pub struct OpeningKey {
    algorithm: CipherAlgorithm,
    inner: Opener,
}

impl std::fmt::Debug for OpeningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpeningKey")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl OpeningKey {
    /// Builds the opening state from derived key material.
    pub fn new(keys: &DirectionKeys) -> FynxResult<Self> {
        check_material(keys)?;
        let inner = match keys.cipher {
            CipherAlgorithm::ChaCha20Poly1305 => {
                Opener::ChaCha(openssh::OpeningKey::new(chacha_material(&keys.key)?))
            }
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => Opener::Gcm {
                key: gcm_key(keys.cipher, &keys.key)?,
                nonce: GcmNonce::new(&keys.iv),
            },
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes256Ctr => {
                let mac = keys
                    .mac
                    .ok_or_else(|| FynxError::Security("missing MAC".to_string()))?;
                Opener::Ctr {
                    cipher: CtrCipher::new(keys.cipher, &keys.key, &keys.iv)?,
                    mac: MacKey::new(mac, &keys.mac_key)?,
                }
            }
        };
        Ok(Self {
            algorithm: keys.cipher,
            inner,
        })
    }

    /// Negotiated cipher.
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    /// Alignment that received packets must satisfy.
    pub fn alignment(&self) -> Alignment {
        self.algorithm.alignment()
    }

    /// Bytes that must be buffered before the packet length is known.
    pub fn header_len(&self) -> usize {
        match self.inner {
            Opener::Ctr { .. } => self.algorithm.block_size(),
            _ => 4,
        }
    }

    /// Bytes of tag or MAC following the packet.
    pub fn trailer_len(&self) -> usize {
        match &self.inner {
            Opener::Ctr { mac, .. } => mac.algorithm().mac_size(),
            _ => AEAD_TAG_LEN,
        }
    }

    /// Recovers `packet_length` from the first [`header_len`](Self::header_len)
    /// bytes.
    ///
    /// Counter mode decrypts `head` in place, so this must be called exactly
    /// once per packet before [`open`](Self::open).
    pub fn decrypt_length(&mut self, sequence: u32, head: &mut [u8]) -> u32 {
        match &mut self.inner {
            Opener::ChaCha(key) => {
                let clear = key.decrypt_packet_length(sequence, [head[0], head[1], head[2], head[3]]);
                u32::from_be_bytes(clear)
            }
            Opener::Gcm { .. } => u32::from_be_bytes([head[0], head[1], head[2], head[3]]),
            Opener::Ctr { cipher, .. } => {
                cipher.apply(head);
                u32::from_be_bytes([head[0], head[1], head[2], head[3]])
            }
        }
    }

    /// Verifies and decrypts a complete frame (`length || body || trailer`).
    ///
    /// On success `frame[4..frame.len() - trailer_len()]` holds the
    /// plaintext body.
    pub fn open(&mut self, sequence: u32, frame: &mut [u8]) -> FynxResult<()> {
        let trailer = self.trailer_len();
        if frame.len() < 4 + trailer {
            return Err(verification_failed());
        }
        let data_len = frame.len() - trailer;

        match &mut self.inner {
            Opener::ChaCha(key) => {
                let (data, tag) = frame.split_at_mut(data_len);
                let tag: &[u8; openssh::TAG_LEN] =
                    (&*tag).try_into().map_err(|_| verification_failed())?;
                key.open_in_place(sequence, data, tag)
                    .map_err(|_| verification_failed())?;
            }
            Opener::Gcm { key, nonce } => {
                let (head, rest) = frame.split_at_mut(4);
                let aad = [head[0], head[1], head[2], head[3]];
                key.open_in_place(nonce.advance(), Aad::from(aad), rest)
                    .map_err(|_| verification_failed())?;
            }
            Opener::Ctr { cipher, mac } => {
                let header = self.algorithm.block_size();
                let (data, received) = frame.split_at_mut(data_len);
                if data.len() > header {
                    cipher.apply(&mut data[header..]);
                }
                mac.verify(sequence, data, received)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(cipher: CipherAlgorithm) -> DirectionKeys {
        DirectionKeys {
            cipher,
            mac: if cipher.is_aead() {
                None
            } else {
                Some(MacAlgorithm::HmacSha256)
            },
            iv: Zeroizing::new((0..cipher.iv_size() as u8).collect()),
            key: Zeroizing::new(vec![0x42; cipher.key_size()]),
            mac_key: Zeroizing::new(vec![0x24; 32]),
        }
    }

    fn frame(cipher: CipherAlgorithm) -> Vec<u8> {
        crate::packet::Packet::with_alignment(b"\x5ehello channel".to_vec(), cipher.alignment())
            .unwrap()
            .to_bytes()
    }

    #[test]
    fn test_cipher_algorithm_properties() {
        let chacha = CipherAlgorithm::ChaCha20Poly1305;
        assert_eq!(chacha.name(), "chacha20-poly1305@openssh.com");
        assert_eq!(chacha.key_size(), 64);
        assert_eq!(chacha.block_size(), 8);
        assert!(chacha.is_aead());
        assert!(!chacha.alignment().length_included);

        let ctr = CipherAlgorithm::Aes128Ctr;
        assert_eq!(ctr.iv_size(), 16);
        assert_eq!(ctr.tag_size(), 0);
        assert!(ctr.alignment().length_included);

        assert_eq!(
            CipherAlgorithm::from_name("aes256-gcm@openssh.com"),
            Some(CipherAlgorithm::Aes256Gcm)
        );
        assert_eq!(CipherAlgorithm::from_name("3des-cbc"), None);
    }

    #[test]
    fn test_mac_algorithm_properties() {
        assert_eq!(MacAlgorithm::HmacSha512.mac_size(), 64);
        assert_eq!(
            MacAlgorithm::from_name("hmac-sha2-256"),
            Some(MacAlgorithm::HmacSha256)
        );
        assert_eq!(MacAlgorithm::from_name("hmac-md5"), None);
    }

    #[test]
    fn test_mac_depends_on_sequence() {
        let mac = MacKey::new(MacAlgorithm::HmacSha256, &[7u8; 32]).unwrap();
        let a = mac.compute(0, b"packet").unwrap();
        let b = mac.compute(1, b"packet").unwrap();
        assert_ne!(a, b);
        assert!(mac.verify(0, b"packet", &a).is_ok());
        assert!(matches!(
            mac.verify(1, b"packet", &a),
            Err(FynxError::Crypto(_))
        ));
    }

    #[test]
    fn test_mac_key_too_short() {
        assert!(MacKey::new(MacAlgorithm::HmacSha512, &[0u8; 32]).is_err());
    }

    #[test]
    fn test_seal_open_each_cipher() {
        for cipher in CipherAlgorithm::ALL {
            let mut sealer = SealingKey::new(&keys(cipher)).unwrap();
            let mut opener = OpeningKey::new(&keys(cipher)).unwrap();

            let packet = crate::packet::Packet::with_alignment(
                b"\x5epayload bytes".to_vec(),
                sealer.alignment(),
            )
            .unwrap();
            let plain = packet.to_bytes();
            let mut wire = plain.clone();
            sealer.seal(3, &mut wire).unwrap();
            assert_ne!(&wire[4..plain.len()], &plain[4..], "{}", cipher.name());

            let header = opener.header_len();
            let len = opener.decrypt_length(3, &mut wire[..header]);
            assert_eq!(len as usize, packet.packet_length(), "{}", cipher.name());

            opener.open(3, &mut wire).unwrap();
            let body_end = wire.len() - opener.trailer_len();
            assert_eq!(&wire[4..body_end], &plain[4..], "{}", cipher.name());
        }
    }

    #[test]
    fn test_tampered_frame_rejected() {
        for cipher in CipherAlgorithm::ALL {
            let mut sealer = SealingKey::new(&keys(cipher)).unwrap();
            let mut opener = OpeningKey::new(&keys(cipher)).unwrap();

            let mut wire = frame(cipher);
            sealer.seal(0, &mut wire).unwrap();
            let last = wire.len() - 1;
            wire[last] ^= 0x01;

            let header = opener.header_len();
            opener.decrypt_length(0, &mut wire[..header]);
            let err = opener.open(0, &mut wire).unwrap_err();
            assert!(matches!(err, FynxError::Crypto(_)), "{}", cipher.name());
            assert_eq!(err.to_string(), verification_failed().to_string());
        }
    }

    #[test]
    fn test_wrong_sequence_rejected() {
        let cipher = CipherAlgorithm::ChaCha20Poly1305;
        let mut sealer = SealingKey::new(&keys(cipher)).unwrap();
        let mut opener = OpeningKey::new(&keys(cipher)).unwrap();
        let mut wire = frame(cipher);
        sealer.seal(5, &mut wire).unwrap();
        assert!(opener.open(6, &mut wire).is_err());
    }

    #[test]
    fn test_ctr_without_mac_rejected() {
        let mut k = keys(CipherAlgorithm::Aes256Ctr);
        k.mac = None;
        assert!(SealingKey::new(&k).is_err());
    }

    #[test]
    fn test_debug_redacts() {
        let k = keys(CipherAlgorithm::Aes128Gcm);
        assert!(format!("{:?}", k).contains("REDACTED"));
    }
}
