//! Elliptic curve Diffie-Hellman key exchange (RFC 5656, RFC 8731).
//!
//! Implements:
//! - `curve25519-sha256` and `curve25519-sha256@libssh.org`
//! - `ecdh-sha2-nistp256`
//!
//! Both methods use SHA-256 for the exchange hash and key derivation.
//!
//! # Example
//!
//! ```rust
//! use fynx_ssh::kex_ecdh::{EcdhExchange, KexAlgorithm};
//!
//! let client = EcdhExchange::new(KexAlgorithm::Curve25519Sha256).unwrap();
//! let server = EcdhExchange::new(KexAlgorithm::Curve25519Sha256).unwrap();
//!
//! let client_public = client.public_key().to_vec();
//! let server_public = server.public_key().to_vec();
//!
//! let k1 = client.agree(&server_public).unwrap();
//! let k2 = server.agree(&client_public).unwrap();
//! assert_eq!(&*k1, &*k2);
//! ```

use bytes::{BufMut, BytesMut};
use fynx_platform::{FynxError, FynxResult};
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, ECDH_P256, X25519};
use ring::rand::SystemRandom;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::message::{expect_type, MessageType};
use crate::wire::{encode_mpint, Reader, SshBufMut};

/// Key exchange methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KexAlgorithm {
    /// curve25519-sha256 (RFC 8731)
    Curve25519Sha256,
    /// curve25519-sha256@libssh.org (pre-standard name, same algorithm)
    Curve25519Sha256LibSsh,
    /// ecdh-sha2-nistp256 (RFC 5656)
    EcdhSha2Nistp256,
}

impl KexAlgorithm {
    /// Every supported method in default preference order.
    pub const ALL: [KexAlgorithm; 3] = [
        KexAlgorithm::Curve25519Sha256,
        KexAlgorithm::Curve25519Sha256LibSsh,
        KexAlgorithm::EcdhSha2Nistp256,
    ];

    /// Returns the SSH algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            KexAlgorithm::Curve25519Sha256 => "curve25519-sha256",
            KexAlgorithm::Curve25519Sha256LibSsh => "curve25519-sha256@libssh.org",
            KexAlgorithm::EcdhSha2Nistp256 => "ecdh-sha2-nistp256",
        }
    }

    /// Parses an SSH algorithm name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|a| a.name() == name)
    }

    fn curve(&self) -> &'static ring::agreement::Algorithm {
        match self {
            KexAlgorithm::Curve25519Sha256 | KexAlgorithm::Curve25519Sha256LibSsh => &X25519,
            KexAlgorithm::EcdhSha2Nistp256 => &ECDH_P256,
        }
    }

    fn public_key_len(&self) -> usize {
        match self {
            KexAlgorithm::Curve25519Sha256 | KexAlgorithm::Curve25519Sha256LibSsh => 32,
            KexAlgorithm::EcdhSha2Nistp256 => 65,
        }
    }
}

/// One side's ephemeral key pair.
pub struct EcdhExchange {
    algorithm: KexAlgorithm,
    private_key: EphemeralPrivateKey,
    public_key: Vec<u8>,
}

impl std::fmt::Debug for EcdhExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcdhExchange")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl EcdhExchange {
    /// Generates a fresh ephemeral key pair.
    pub fn new(algorithm: KexAlgorithm) -> FynxResult<Self> {
        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(algorithm.curve(), &rng)
            .map_err(|_| FynxError::Security("Failed to generate ephemeral key".to_string()))?;
        let public_key = private_key
            .compute_public_key()
            .map_err(|_| FynxError::Security("Failed to compute ephemeral public key".to_string()))?
            .as_ref()
            .to_vec();

        Ok(Self {
            algorithm,
            private_key,
            public_key,
        })
    }

    /// The key exchange method.
    pub fn algorithm(&self) -> KexAlgorithm {
        self.algorithm
    }

    /// Our ephemeral public value (Q_C or Q_S).
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Computes the shared secret K from the peer's public value.
    ///
    /// The result is the unsigned big-endian magnitude of K; it is encoded
    /// as an `mpint` wherever it enters a hash.
    pub fn agree(self, peer_public: &[u8]) -> FynxResult<Zeroizing<Vec<u8>>> {
        if peer_public.len() != self.algorithm.public_key_len() {
            return Err(FynxError::Protocol(format!(
                "{} public value must be {} bytes, got {}",
                self.algorithm.name(),
                self.algorithm.public_key_len(),
                peer_public.len()
            )));
        }

        let peer = UnparsedPublicKey::new(self.algorithm.curve(), peer_public);
        let shared = agree_ephemeral(self.private_key, &peer, |material| {
            Zeroizing::new(material.to_vec())
        })
        .map_err(|_| FynxError::crypto("key agreement failed"))?;

        if shared.iter().all(|&b| b == 0) {
            return Err(FynxError::crypto("key agreement produced a zero secret"));
        }
        Ok(shared)
    }
}

/// Inputs to the exchange hash H (RFC 5656 Section 4).
///
/// ```text
/// string   V_C, client identification string (without CR LF)
/// string   V_S, server identification string (without CR LF)
/// string   I_C, payload of the client's KEXINIT
/// string   I_S, payload of the server's KEXINIT
/// string   K_S, server host key blob
/// string   Q_C, client ephemeral public value
/// string   Q_S, server ephemeral public value
/// mpint    K,   shared secret
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ExchangeHashInput<'a> {
    /// V_C
    pub client_version: &'a str,
    /// V_S
    pub server_version: &'a str,
    /// I_C
    pub client_kexinit: &'a [u8],
    /// I_S
    pub server_kexinit: &'a [u8],
    /// K_S
    pub host_key: &'a [u8],
    /// Q_C
    pub client_public: &'a [u8],
    /// Q_S
    pub server_public: &'a [u8],
    /// K
    pub shared_secret: &'a [u8],
}

impl ExchangeHashInput<'_> {
    /// Computes H.
    pub fn compute(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_string(self.client_version.as_bytes());
        buf.put_string(self.server_version.as_bytes());
        buf.put_string(self.client_kexinit);
        buf.put_string(self.server_kexinit);
        buf.put_string(self.host_key);
        buf.put_string(self.client_public);
        buf.put_string(self.server_public);
        buf.put_mpint(self.shared_secret);

        let hash = Sha256::digest(&buf).to_vec();
        zeroize::Zeroize::zeroize(&mut buf[..]);
        hash
    }
}

/// Derives one session key (RFC 4253 Section 7.2).
///
/// ```text
/// K1 = HASH(K || H || letter || session_id)
/// K2 = HASH(K || H || K1)
/// K3 = HASH(K || H || K1 || K2)
/// key = K1 || K2 || ... truncated to `length`
/// ```
///
/// `letter` is one of `b'A'` through `b'F'`.
pub fn derive_key(
    shared_secret: &[u8],
    exchange_hash: &[u8],
    letter: u8,
    session_id: &[u8],
    length: usize,
) -> Zeroizing<Vec<u8>> {
    let k = Zeroizing::new(encode_mpint(shared_secret));
    let mut key = Zeroizing::new(Vec::with_capacity(length + 32));

    if length == 0 {
        return key;
    }

    let mut hasher = Sha256::new();
    hasher.update(&*k);
    hasher.update(exchange_hash);
    hasher.update([letter]);
    hasher.update(session_id);
    key.extend_from_slice(&hasher.finalize());

    while key.len() < length {
        let mut hasher = Sha256::new();
        hasher.update(&*k);
        hasher.update(exchange_hash);
        hasher.update(&key[..]);
        key.extend_from_slice(&hasher.finalize());
    }

    key.truncate(length);
    key
}

/// SSH_MSG_KEX_ECDH_INIT: the client's ephemeral public value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexEcdhInit {
    /// Q_C
    pub client_public: Vec<u8>,
}

impl KexEcdhInit {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexEcdhInit as u8);
        buf.put_string(&self.client_public);
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> FynxResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::KexEcdhInit)?;
        let client_public = r.read_string()?.to_vec();
        r.finish()?;
        Ok(Self { client_public })
    }
}

/// SSH_MSG_KEX_ECDH_REPLY: host key, server public value and signature over H.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexEcdhReply {
    /// K_S
    pub host_key: Vec<u8>,
    /// Q_S
    pub server_public: Vec<u8>,
    /// Signature over H, as an SSH signature blob
    pub signature: Vec<u8>,
}

impl KexEcdhReply {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexEcdhReply as u8);
        buf.put_string(&self.host_key);
        buf.put_string(&self.server_public);
        buf.put_string(&self.signature);
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> FynxResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::KexEcdhReply)?;
        let host_key = r.read_string()?.to_vec();
        let server_public = r.read_string()?.to_vec();
        let signature = r.read_string()?.to_vec();
        r.finish()?;
        Ok(Self {
            host_key,
            server_public,
            signature,
        })
    }
}
