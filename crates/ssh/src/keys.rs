//! Public key identities and signing keys.
//!
//! A [`PublicKey`] is the SSH public key blob (RFC 4253 Section 6.6) tagged
//! with its algorithm name. Two keys are equal exactly when their blobs are
//! byte-for-byte equal, so keys parsed from separate messages compare and
//! hash identically.
//!
//! [`Signer`] is implemented by the key pairs this crate can sign with:
//! [`Ed25519Key`] (`ssh-ed25519`) and [`EcdsaP256Key`]
//! (`ecdsa-sha2-nistp256`). The same trait serves host keys on the server
//! and user keys on the client.
//!
//! # Example
//!
//! ```rust
//! use fynx_ssh::keys::{Ed25519Key, PublicKey, Signer};
//!
//! let key = Ed25519Key::generate().unwrap();
//! let signature = key.sign(b"exchange hash").unwrap();
//!
//! let public = PublicKey::from_blob(key.public_key().marshal()).unwrap();
//! assert_eq!(public, key.public_key());
//! public.verify(b"exchange hash", &signature).unwrap();
//! ```

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use bytes::BytesMut;
use ed25519_dalek::{Signer as _, Verifier as _};
use fynx_platform::{FynxError, FynxResult};
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};
use zeroize::Zeroizing;

use crate::wire::{Reader, SshBufMut};

/// Public key algorithms this crate can verify and sign with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAlgorithm {
    /// Ed25519 (RFC 8709)
    Ed25519,
    /// ECDSA over NIST P-256 with SHA-256 (RFC 5656)
    EcdsaP256,
}

impl KeyAlgorithm {
    /// Every supported algorithm in default preference order.
    pub const ALL: [KeyAlgorithm; 2] = [KeyAlgorithm::Ed25519, KeyAlgorithm::EcdsaP256];

    /// Returns the SSH algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            KeyAlgorithm::Ed25519 => "ssh-ed25519",
            KeyAlgorithm::EcdsaP256 => "ecdsa-sha2-nistp256",
        }
    }

    /// Parses an SSH algorithm name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|a| a.name() == name)
    }
}

/// An SSH public key identity.
///
/// Equality and hashing use the marshalled blob only.
#[derive(Clone)]
pub struct PublicKey {
    algorithm: String,
    blob: Vec<u8>,
}

impl PublicKey {
    /// Parses a public key blob.
    ///
    /// Keys of known algorithms are checked for well-formedness. Unknown
    /// algorithms are kept as opaque identities and cannot verify
    /// signatures.
    pub fn from_blob(blob: &[u8]) -> FynxResult<Self> {
        let mut r = Reader::new(blob);
        let algorithm = r.read_utf8()?.to_string();

        match KeyAlgorithm::from_name(&algorithm) {
            Some(KeyAlgorithm::Ed25519) => {
                let key = r.read_string()?;
                if key.len() != 32 {
                    return Err(FynxError::protocol("Ed25519 public key must be 32 bytes"));
                }
                r.finish()?;
            }
            Some(KeyAlgorithm::EcdsaP256) => {
                let curve = r.read_utf8()?;
                if curve != "nistp256" {
                    return Err(FynxError::Protocol(format!(
                        "curve {} does not match ecdsa-sha2-nistp256",
                        curve
                    )));
                }
                let point = r.read_string()?;
                p256::ecdsa::VerifyingKey::from_sec1_bytes(point)
                    .map_err(|_| FynxError::protocol("invalid nistp256 public point"))?;
                r.finish()?;
            }
            None => {}
        }

        Ok(Self {
            algorithm,
            blob: blob.to_vec(),
        })
    }

    /// Algorithm name carried in the blob.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// The SSH wire encoding of the key.
    pub fn marshal(&self) -> &[u8] {
        &self.blob
    }

    /// OpenSSH style fingerprint: `SHA256:` followed by unpadded base64.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.blob);
        format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
    }

    /// Verifies an SSH signature blob over `data`.
    ///
    /// # Errors
    ///
    /// Returns [`FynxError::Crypto`] if the signature is malformed, uses a
    /// different algorithm, or does not verify.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> FynxResult<()> {
        let bad = || FynxError::crypto("signature verification failed");

        let mut sig = Reader::new(signature);
        let sig_alg = sig.read_utf8().map_err(|_| bad())?;
        if sig_alg != self.algorithm {
            return Err(bad());
        }
        let sig_body = sig.read_string().map_err(|_| bad())?;

        let mut key = Reader::new(&self.blob);
        key.read_string()?;

        match KeyAlgorithm::from_name(&self.algorithm) {
            Some(KeyAlgorithm::Ed25519) => {
                let pk: [u8; 32] = key.read_string()?.try_into().map_err(|_| bad())?;
                let sig_bytes: [u8; 64] = sig_body.try_into().map_err(|_| bad())?;
                let verifying = ed25519_dalek::VerifyingKey::from_bytes(&pk).map_err(|_| bad())?;
                let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
                verifying.verify(data, &signature).map_err(|_| bad())
            }
            Some(KeyAlgorithm::EcdsaP256) => {
                use p256::ecdsa::signature::Verifier;

                key.read_string()?;
                let point = key.read_string()?;
                let verifying =
                    p256::ecdsa::VerifyingKey::from_sec1_bytes(point).map_err(|_| bad())?;

                let mut rs = Reader::new(sig_body);
                let mut raw = [0u8; 64];
                for half in raw.chunks_mut(32) {
                    let scalar = rs.read_mpint().map_err(|_| bad())?;
                    if scalar.len() > 32 {
                        return Err(bad());
                    }
                    half[32 - scalar.len()..].copy_from_slice(scalar);
                }
                let signature = p256::ecdsa::Signature::from_slice(&raw).map_err(|_| bad())?;
                verifying.verify(data, &signature).map_err(|_| bad())
            }
            None => Err(FynxError::crypto(format!(
                "unsupported public key algorithm {}",
                self.algorithm
            ))),
        }
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.blob == other.blob
    }
}

impl Eq for PublicKey {}

impl Hash for PublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.blob.hash(state);
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({} {})", self.algorithm, self.fingerprint())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.algorithm, self.fingerprint())
    }
}

/// A private key that can produce SSH signatures.
pub trait Signer: Send + Sync {
    /// The matching public key.
    fn public_key(&self) -> PublicKey;

    /// Signs `data`, returning an SSH signature blob
    /// (`string algorithm || string signature`).
    fn sign(&self, data: &[u8]) -> FynxResult<Vec<u8>>;

    /// Algorithm name, as offered in negotiation and auth requests.
    fn algorithm(&self) -> KeyAlgorithm;
}

fn signature_blob(algorithm: KeyAlgorithm, body: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_string(algorithm.name().as_bytes());
    buf.put_string(body);
    buf.to_vec()
}

/// Ed25519 key pair (`ssh-ed25519`).
#[derive(Clone)]
pub struct Ed25519Key {
    signing_key: ed25519_dalek::SigningKey,
}

impl Ed25519Key {
    /// Generates a new random key pair.
    pub fn generate() -> FynxResult<Self> {
        let seed = Zeroizing::new(rand::random::<[u8; 32]>());
        Ok(Self::from_seed(&seed))
    }

    /// Creates a key pair from a 32-byte secret seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: ed25519_dalek::SigningKey::from_bytes(seed),
        }
    }

    /// Creates a key pair from raw secret bytes.
    pub fn from_bytes(secret: &[u8]) -> FynxResult<Self> {
        let seed: [u8; 32] = secret
            .try_into()
            .map_err(|_| FynxError::Security("Ed25519 secret key must be 32 bytes".to_string()))?;
        let seed = Zeroizing::new(seed);
        Ok(Self::from_seed(&seed))
    }
}

impl fmt::Debug for Ed25519Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519Key")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

impl Signer for Ed25519Key {
    fn public_key(&self) -> PublicKey {
        let mut buf = BytesMut::new();
        buf.put_string(KeyAlgorithm::Ed25519.name().as_bytes());
        buf.put_string(self.signing_key.verifying_key().as_bytes());
        PublicKey {
            algorithm: KeyAlgorithm::Ed25519.name().to_string(),
            blob: buf.to_vec(),
        }
    }

    fn sign(&self, data: &[u8]) -> FynxResult<Vec<u8>> {
        let signature = self.signing_key.sign(data);
        Ok(signature_blob(KeyAlgorithm::Ed25519, &signature.to_bytes()))
    }

    fn algorithm(&self) -> KeyAlgorithm {
        KeyAlgorithm::Ed25519
    }
}

/// ECDSA NIST P-256 key pair (`ecdsa-sha2-nistp256`).
#[derive(Clone)]
pub struct EcdsaP256Key {
    signing_key: p256::ecdsa::SigningKey,
}

impl EcdsaP256Key {
    /// Generates a new random key pair.
    pub fn generate() -> FynxResult<Self> {
        Ok(Self {
            signing_key: p256::ecdsa::SigningKey::random(&mut rand::thread_rng()),
        })
    }

    /// Creates a key pair from a 32-byte big-endian secret scalar.
    pub fn from_bytes(secret: &[u8]) -> FynxResult<Self> {
        let signing_key = p256::ecdsa::SigningKey::from_slice(secret)
            .map_err(|_| FynxError::Security("invalid P-256 secret key".to_string()))?;
        Ok(Self { signing_key })
    }
}

impl fmt::Debug for EcdsaP256Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcdsaP256Key")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

impl Signer for EcdsaP256Key {
    fn public_key(&self) -> PublicKey {
        let point = self.signing_key.verifying_key().to_encoded_point(false);
        let mut buf = BytesMut::new();
        buf.put_string(KeyAlgorithm::EcdsaP256.name().as_bytes());
        buf.put_string(b"nistp256");
        buf.put_string(point.as_bytes());
        PublicKey {
            algorithm: KeyAlgorithm::EcdsaP256.name().to_string(),
            blob: buf.to_vec(),
        }
    }

    fn sign(&self, data: &[u8]) -> FynxResult<Vec<u8>> {
        use p256::ecdsa::signature::Signer as _;

        let signature: p256::ecdsa::Signature = self.signing_key.sign(data);
        let raw = signature.to_bytes();
        let mut body = BytesMut::new();
        body.put_mpint(&raw[..32]);
        body.put_mpint(&raw[32..]);
        Ok(signature_blob(KeyAlgorithm::EcdsaP256, &body))
    }

    fn algorithm(&self) -> KeyAlgorithm {
        KeyAlgorithm::EcdsaP256
    }
}
