//! SSH key exchange (RFC 4253 Section 7).
//!
//! This module implements:
//! - SSH_MSG_KEXINIT and SSH_MSG_NEWKEYS
//! - Algorithm negotiation (client preference wins)
//! - [`KeyExchange`], a sans-IO engine that consumes the peer's key exchange
//!   messages and produces the messages to send plus the derived keys
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation (first client preference the server supports)
//! 3. ECDH exchange: KEX_ECDH_INIT from the client, KEX_ECDH_REPLY from the
//!    server carrying the host key and its signature over H
//! 4. Both sides send SSH_MSG_NEWKEYS and switch to the derived keys
//!
//! The engine never touches the network; the transport driver owns the
//! stream and feeds packets in.
//!
//! # Example
//!
//! ```rust
//! use fynx_ssh::kex::{negotiate_algorithm, KexInit, AlgorithmPreferences};
//!
//! let kexinit = AlgorithmPreferences::default().to_kexinit();
//! assert_eq!(kexinit.kex_algorithms[0], "curve25519-sha256");
//!
//! let client = vec!["aes256-ctr".to_string(), "aes128-ctr".to_string()];
//! let server = vec!["aes128-ctr".to_string(), "aes256-ctr".to_string()];
//! assert_eq!(negotiate_algorithm("cipher", &client, &server).unwrap(), "aes256-ctr");
//! ```

use bytes::{BufMut, BytesMut};
use fynx_platform::{FynxError, FynxResult};
use rand::RngCore;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::crypto::{CipherAlgorithm, DirectionKeys, MacAlgorithm, OpeningKey, SealingKey};
use crate::kex_ecdh::{
    derive_key, EcdhExchange, ExchangeHashInput, KexAlgorithm, KexEcdhInit, KexEcdhReply,
};
use crate::keys::{KeyAlgorithm, PublicKey, Signer};
use crate::message::{expect_type, MessageType};
use crate::wire::{Reader, SshBufMut};

/// Which end of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Initiated the connection
    Client,
    /// Accepted the connection
    Server,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
///
/// ```text
/// byte         SSH_MSG_KEXINIT (20)
/// byte[16]     cookie (random bytes)
/// name-list    kex_algorithms
/// name-list    server_host_key_algorithms
/// name-list    encryption_algorithms_client_to_server
/// name-list    encryption_algorithms_server_to_client
/// name-list    mac_algorithms_client_to_server
/// name-list    mac_algorithms_server_to_client
/// name-list    compression_algorithms_client_to_server
/// name-list    compression_algorithms_server_to_client
/// name-list    languages_client_to_server
/// name-list    languages_server_to_client
/// boolean      first_kex_packet_follows
/// uint32       0 (reserved for future extension)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    /// Random cookie
    pub cookie: [u8; 16],
    /// Key exchange algorithms
    pub kex_algorithms: Vec<String>,
    /// Server host key algorithms
    pub server_host_key_algorithms: Vec<String>,
    /// Encryption algorithms client to server
    pub encryption_client_to_server: Vec<String>,
    /// Encryption algorithms server to client
    pub encryption_server_to_client: Vec<String>,
    /// MAC algorithms client to server
    pub mac_client_to_server: Vec<String>,
    /// MAC algorithms server to client
    pub mac_server_to_client: Vec<String>,
    /// Compression algorithms client to server
    pub compression_client_to_server: Vec<String>,
    /// Compression algorithms server to client
    pub compression_server_to_client: Vec<String>,
    /// Languages client to server (usually empty)
    pub languages_client_to_server: Vec<String>,
    /// Languages server to client (usually empty)
    pub languages_server_to_client: Vec<String>,
    /// A guessed key exchange packet follows
    pub first_kex_packet_follows: bool,
}

impl KexInit {
    /// Serializes the message (without packet framing).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);
        buf.put_name_list(&self.kex_algorithms);
        buf.put_name_list(&self.server_host_key_algorithms);
        buf.put_name_list(&self.encryption_client_to_server);
        buf.put_name_list(&self.encryption_server_to_client);
        buf.put_name_list(&self.mac_client_to_server);
        buf.put_name_list(&self.mac_server_to_client);
        buf.put_name_list(&self.compression_client_to_server);
        buf.put_name_list(&self.compression_server_to_client);
        buf.put_name_list(&self.languages_client_to_server);
        buf.put_name_list(&self.languages_server_to_client);
        buf.put_bool(self.first_kex_packet_follows);
        buf.put_u32(0);
        buf.to_vec()
    }

    /// Parses a KEXINIT payload.
    ///
    /// # Errors
    ///
    /// Returns [`FynxError::Protocol`] if the message is truncated or is not
    /// a KEXINIT.
    pub fn from_bytes(data: &[u8]) -> FynxResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::KexInit)?;

        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(r.take(16)?);

        let kex = Self {
            cookie,
            kex_algorithms: r.read_name_list()?,
            server_host_key_algorithms: r.read_name_list()?,
            encryption_client_to_server: r.read_name_list()?,
            encryption_server_to_client: r.read_name_list()?,
            mac_client_to_server: r.read_name_list()?,
            mac_server_to_client: r.read_name_list()?,
            compression_client_to_server: r.read_name_list()?,
            compression_server_to_client: r.read_name_list()?,
            languages_client_to_server: r.read_name_list()?,
            languages_server_to_client: r.read_name_list()?,
            first_kex_packet_follows: r.read_bool()?,
        };
        // Reserved; extension data after it is tolerated.
        r.read_u32()?;
        Ok(kex)
    }
}

/// SSH_MSG_NEWKEYS payload.
pub const NEWKEYS: [u8; 1] = [MessageType::NewKeys as u8];

/// Ordered local algorithm preferences.
///
/// The same lists are offered for both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmPreferences {
    /// Key exchange methods
    pub kex: Vec<KexAlgorithm>,
    /// Host key algorithms
    pub host_key: Vec<KeyAlgorithm>,
    /// Ciphers
    pub ciphers: Vec<CipherAlgorithm>,
    /// MACs, used only with non-AEAD ciphers
    pub macs: Vec<MacAlgorithm>,
}

impl Default for AlgorithmPreferences {
    fn default() -> Self {
        Self {
            kex: KexAlgorithm::ALL.to_vec(),
            host_key: KeyAlgorithm::ALL.to_vec(),
            ciphers: CipherAlgorithm::ALL.to_vec(),
            macs: MacAlgorithm::ALL.to_vec(),
        }
    }
}

impl AlgorithmPreferences {
    /// Checks that every category offers at least one algorithm.
    pub fn validate(&self) -> FynxResult<()> {
        if self.kex.is_empty() {
            return Err(FynxError::Config("no key exchange algorithms".to_string()));
        }
        if self.host_key.is_empty() {
            return Err(FynxError::Config("no host key algorithms".to_string()));
        }
        if self.ciphers.is_empty() {
            return Err(FynxError::Config("no ciphers".to_string()));
        }
        if self.macs.is_empty() && self.ciphers.iter().any(|c| !c.is_aead()) {
            return Err(FynxError::Config(
                "non-AEAD ciphers offered without a MAC".to_string(),
            ));
        }
        Ok(())
    }

    /// Keeps only the host key algorithms we hold a key for.
    pub fn restrict_host_keys(&self, available: &[KeyAlgorithm]) -> Self {
        let mut prefs = self.clone();
        prefs.host_key.retain(|alg| available.contains(alg));
        prefs
    }

    /// Builds a KEXINIT with a fresh random cookie.
    pub fn to_kexinit(&self) -> KexInit {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        let names = |v: Vec<&'static str>| v.into_iter().map(String::from).collect::<Vec<_>>();
        let ciphers = names(self.ciphers.iter().map(|c| c.name()).collect());
        let macs = names(self.macs.iter().map(|m| m.name()).collect());

        KexInit {
            cookie,
            kex_algorithms: names(self.kex.iter().map(|k| k.name()).collect()),
            server_host_key_algorithms: names(self.host_key.iter().map(|k| k.name()).collect()),
            encryption_client_to_server: ciphers.clone(),
            encryption_server_to_client: ciphers,
            mac_client_to_server: macs.clone(),
            mac_server_to_client: macs,
            compression_client_to_server: vec!["none".to_string()],
            compression_server_to_client: vec!["none".to_string()],
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: false,
        }
    }
}

/// Picks the first algorithm in `client_list` that `server_list` also offers
/// (RFC 4253 Section 7.1).
///
/// # Errors
///
/// Returns [`FynxError::Protocol`] naming `category` if nothing matches.
pub fn negotiate_algorithm(
    category: &str,
    client_list: &[String],
    server_list: &[String],
) -> FynxResult<String> {
    client_list
        .iter()
        .find(|alg| server_list.contains(alg))
        .cloned()
        .ok_or_else(|| FynxError::Protocol(format!("no common {} algorithm", category)))
}

/// Result of algorithm negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// Key exchange method
    pub kex: KexAlgorithm,
    /// Host key algorithm
    pub host_key: KeyAlgorithm,
    /// Cipher client to server
    pub cipher_client_to_server: CipherAlgorithm,
    /// Cipher server to client
    pub cipher_server_to_client: CipherAlgorithm,
    /// MAC client to server, `None` with an AEAD cipher
    pub mac_client_to_server: Option<MacAlgorithm>,
    /// MAC server to client, `None` with an AEAD cipher
    pub mac_server_to_client: Option<MacAlgorithm>,
    /// Compression (always `none`)
    pub compression: String,
}

impl Negotiated {
    /// Negotiates every category from the two KEXINIT messages.
    pub fn from_kexinits(client: &KexInit, server: &KexInit) -> FynxResult<Self> {
        let kex = negotiate_algorithm("kex", &client.kex_algorithms, &server.kex_algorithms)?;
        let host_key = negotiate_algorithm(
            "host key",
            &client.server_host_key_algorithms,
            &server.server_host_key_algorithms,
        )?;
        let cipher_c2s = negotiate_algorithm(
            "cipher",
            &client.encryption_client_to_server,
            &server.encryption_client_to_server,
        )?;
        let cipher_s2c = negotiate_algorithm(
            "cipher",
            &client.encryption_server_to_client,
            &server.encryption_server_to_client,
        )?;
        let compression = negotiate_algorithm(
            "compression",
            &client.compression_client_to_server,
            &server.compression_client_to_server,
        )?;
        negotiate_algorithm(
            "compression",
            &client.compression_server_to_client,
            &server.compression_server_to_client,
        )?;

        let unsupported = |name: &str| FynxError::Protocol(format!("unsupported algorithm {}", name));
        let cipher_client_to_server =
            CipherAlgorithm::from_name(&cipher_c2s).ok_or_else(|| unsupported(&cipher_c2s))?;
        let cipher_server_to_client =
            CipherAlgorithm::from_name(&cipher_s2c).ok_or_else(|| unsupported(&cipher_s2c))?;

        let mac_for = |cipher: CipherAlgorithm, c: &[String], s: &[String]| {
            if cipher.is_aead() {
                return Ok(None);
            }
            let name = negotiate_algorithm("mac", c, s)?;
            MacAlgorithm::from_name(&name)
                .map(Some)
                .ok_or_else(|| unsupported(&name))
        };

        Ok(Self {
            kex: KexAlgorithm::from_name(&kex).ok_or_else(|| unsupported(&kex))?,
            host_key: KeyAlgorithm::from_name(&host_key).ok_or_else(|| unsupported(&host_key))?,
            cipher_client_to_server,
            cipher_server_to_client,
            mac_client_to_server: mac_for(
                cipher_client_to_server,
                &client.mac_client_to_server,
                &server.mac_client_to_server,
            )?,
            mac_server_to_client: mac_for(
                cipher_server_to_client,
                &client.mac_server_to_client,
                &server.mac_server_to_client,
            )?,
            compression,
        })
    }
}

/// Key exchange engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexState {
    /// Waiting for the peer's KEXINIT
    NegotiatingAlgorithms,
    /// Waiting for the ECDH init or reply
    ExchangingKeys,
    /// Computing the shared secret and exchange hash
    DerivingSecrets,
    /// Keys derived; waiting for NEWKEYS in both directions
    Activating,
}

/// Output of a completed exchange.
pub struct KexOutput {
    /// Negotiated algorithms
    pub negotiated: Negotiated,
    /// Exchange hash H of this exchange
    pub exchange_hash: Vec<u8>,
    /// Session identifier (H of the first exchange on the connection)
    pub session_id: Arc<[u8]>,
    /// Server host key
    pub host_key: PublicKey,
    /// Client to server key material
    pub client_to_server: DirectionKeys,
    /// Server to client key material
    pub server_to_client: DirectionKeys,
}

impl std::fmt::Debug for KexOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KexOutput")
            .field("negotiated", &self.negotiated)
            .field("host_key", &self.host_key)
            .finish_non_exhaustive()
    }
}

impl KexOutput {
    /// Keys for packets we send.
    pub fn sealing_key(&self, role: Role) -> FynxResult<SealingKey> {
        match role {
            Role::Client => SealingKey::new(&self.client_to_server),
            Role::Server => SealingKey::new(&self.server_to_client),
        }
    }

    /// Keys for packets we receive.
    pub fn opening_key(&self, role: Role) -> FynxResult<OpeningKey> {
        match role {
            Role::Client => OpeningKey::new(&self.server_to_client),
            Role::Server => OpeningKey::new(&self.client_to_server),
        }
    }
}

/// Sans-IO key exchange engine for one exchange.
///
/// A new engine is created for every exchange on a connection; the session
/// identifier of the first exchange is passed into every later one.
#[derive(Debug)]
pub struct KeyExchange {
    role: Role,
    client_version: String,
    server_version: String,
    session_id: Option<Arc<[u8]>>,
    state: KexState,
    local_kexinit: Vec<u8>,
    peer_kexinit: Option<Vec<u8>>,
    negotiated: Option<Negotiated>,
    ephemeral: Option<EcdhExchange>,
    ignore_guess: bool,
}

impl KeyExchange {
    /// Starts an exchange and builds our KEXINIT.
    pub fn new(
        role: Role,
        preferences: &AlgorithmPreferences,
        client_version: &str,
        server_version: &str,
        session_id: Option<Arc<[u8]>>,
    ) -> Self {
        Self {
            role,
            client_version: client_version.to_string(),
            server_version: server_version.to_string(),
            session_id,
            state: KexState::NegotiatingAlgorithms,
            local_kexinit: preferences.to_kexinit().to_bytes(),
            peer_kexinit: None,
            negotiated: None,
            ephemeral: None,
            ignore_guess: false,
        }
    }

    /// Our KEXINIT payload, to be sent before anything else in this exchange.
    pub fn local_kexinit(&self) -> &[u8] {
        &self.local_kexinit
    }

    /// Current state.
    pub fn state(&self) -> KexState {
        self.state
    }

    /// Negotiated algorithms, once both KEXINITs are known.
    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    /// Processes the peer's KEXINIT.
    ///
    /// On the client this returns the KEX_ECDH_INIT payload to send.
    pub fn handle_kexinit(&mut self, payload: &[u8]) -> FynxResult<Option<Vec<u8>>> {
        if self.state != KexState::NegotiatingAlgorithms {
            return Err(FynxError::protocol("unexpected KEXINIT during key exchange"));
        }

        let peer = KexInit::from_bytes(payload)?;
        let local = KexInit::from_bytes(&self.local_kexinit)?;
        let (client, server) = match self.role {
            Role::Client => (&local, &peer),
            Role::Server => (&peer, &local),
        };

        let negotiated = Negotiated::from_kexinits(client, server)?;
        debug!(
            kex = negotiated.kex.name(),
            host_key = negotiated.host_key.name(),
            cipher_c2s = negotiated.cipher_client_to_server.name(),
            cipher_s2c = negotiated.cipher_server_to_client.name(),
            "Algorithms negotiated"
        );

        // RFC 4253 Section 7: a guessed packet is discarded when the first
        // kex or host key entries of the two lists differ.
        if peer.first_kex_packet_follows
            && (client.kex_algorithms.first() != server.kex_algorithms.first()
                || client.server_host_key_algorithms.first()
                    != server.server_host_key_algorithms.first())
        {
            debug!("Peer guessed key exchange wrong, discarding its next kex packet");
            self.ignore_guess = true;
        }

        self.peer_kexinit = Some(payload.to_vec());
        self.state = KexState::ExchangingKeys;

        let reply = match self.role {
            Role::Client => {
                let ephemeral = EcdhExchange::new(negotiated.kex)?;
                let init = KexEcdhInit {
                    client_public: ephemeral.public_key().to_vec(),
                };
                self.ephemeral = Some(ephemeral);
                Some(init.to_bytes())
            }
            Role::Server => None,
        };
        self.negotiated = Some(negotiated);
        Ok(reply)
    }

    /// Whether a method-specific packet (30..=49) must be dropped because
    /// the peer's optimistic guess was wrong. Consumes the pending discard.
    pub fn discard_guess(&mut self) -> bool {
        std::mem::take(&mut self.ignore_guess)
    }

    /// Server: processes KEX_ECDH_INIT, returning KEX_ECDH_REPLY and the keys.
    pub fn handle_ecdh_init(
        &mut self,
        payload: &[u8],
        host_keys: &[Arc<dyn Signer>],
    ) -> FynxResult<(Vec<u8>, KexOutput)> {
        if self.role != Role::Server || self.state != KexState::ExchangingKeys {
            return Err(FynxError::protocol("unexpected KEX_ECDH_INIT"));
        }
        let negotiated = self.require_negotiated()?.clone();
        let init = KexEcdhInit::from_bytes(payload)?;

        let signer = host_keys
            .iter()
            .find(|k| k.algorithm() == negotiated.host_key)
            .ok_or_else(|| {
                FynxError::Protocol(format!("no host key for {}", negotiated.host_key.name()))
            })?;
        let host_key = signer.public_key();

        self.state = KexState::DerivingSecrets;
        let ephemeral = EcdhExchange::new(negotiated.kex)?;
        let server_public = ephemeral.public_key().to_vec();
        let shared = ephemeral.agree(&init.client_public)?;

        let peer_kexinit = self.peer_kexinit()?;
        let h = ExchangeHashInput {
            client_version: &self.client_version,
            server_version: &self.server_version,
            client_kexinit: peer_kexinit,
            server_kexinit: &self.local_kexinit,
            host_key: host_key.marshal(),
            client_public: &init.client_public,
            server_public: &server_public,
            shared_secret: &shared,
        }
        .compute();

        let reply = KexEcdhReply {
            host_key: host_key.marshal().to_vec(),
            server_public,
            signature: signer.sign(&h)?,
        };

        let output = self.finish(negotiated, &shared, h, host_key);
        Ok((reply.to_bytes(), output))
    }

    /// Client: processes KEX_ECDH_REPLY and verifies the host signature.
    ///
    /// Trust in the returned host key is decided by the caller.
    pub fn handle_ecdh_reply(&mut self, payload: &[u8]) -> FynxResult<KexOutput> {
        if self.role != Role::Client || self.state != KexState::ExchangingKeys {
            return Err(FynxError::protocol("unexpected KEX_ECDH_REPLY"));
        }
        let negotiated = self.require_negotiated()?.clone();
        let reply = KexEcdhReply::from_bytes(payload)?;

        let host_key = PublicKey::from_blob(&reply.host_key)?;
        if host_key.algorithm() != negotiated.host_key.name() {
            return Err(FynxError::Protocol(format!(
                "host key is {}, negotiated {}",
                host_key.algorithm(),
                negotiated.host_key.name()
            )));
        }

        self.state = KexState::DerivingSecrets;
        let ephemeral = self
            .ephemeral
            .take()
            .ok_or_else(|| FynxError::protocol("KEX_ECDH_REPLY before KEX_ECDH_INIT"))?;
        let client_public = ephemeral.public_key().to_vec();
        let shared = ephemeral.agree(&reply.server_public)?;

        let peer_kexinit = self.peer_kexinit()?;
        let h = ExchangeHashInput {
            client_version: &self.client_version,
            server_version: &self.server_version,
            client_kexinit: &self.local_kexinit,
            server_kexinit: peer_kexinit,
            host_key: &reply.host_key,
            client_public: &client_public,
            server_public: &reply.server_public,
            shared_secret: &shared,
        }
        .compute();

        host_key.verify(&h, &reply.signature)?;
        trace!(fingerprint = %host_key.fingerprint(), "Host signature verified");

        Ok(self.finish(negotiated, &shared, h, host_key))
    }

    fn require_negotiated(&self) -> FynxResult<&Negotiated> {
        self.negotiated
            .as_ref()
            .ok_or_else(|| FynxError::protocol("key exchange before KEXINIT"))
    }

    fn peer_kexinit(&self) -> FynxResult<&[u8]> {
        self.peer_kexinit
            .as_deref()
            .ok_or_else(|| FynxError::protocol("key exchange before KEXINIT"))
    }

    fn finish(
        &mut self,
        negotiated: Negotiated,
        shared: &[u8],
        exchange_hash: Vec<u8>,
        host_key: PublicKey,
    ) -> KexOutput {
        let session_id = self
            .session_id
            .get_or_insert_with(|| Arc::from(exchange_hash.as_slice()))
            .clone();

        let direction = |cipher: CipherAlgorithm, mac: Option<MacAlgorithm>, letters: [u8; 3]| {
            let derive = |letter, len| derive_key(shared, &exchange_hash, letter, &session_id, len);
            DirectionKeys {
                cipher,
                mac,
                iv: derive(letters[0], cipher.iv_size()),
                key: derive(letters[1], cipher.key_size()),
                mac_key: derive(letters[2], mac.map_or(0, |m| m.key_size())),
            }
        };

        let client_to_server = direction(
            negotiated.cipher_client_to_server,
            negotiated.mac_client_to_server,
            [b'A', b'C', b'E'],
        );
        let server_to_client = direction(
            negotiated.cipher_server_to_client,
            negotiated.mac_server_to_client,
            [b'B', b'D', b'F'],
        );

        self.state = KexState::Activating;
        KexOutput {
            negotiated,
            exchange_hash,
            session_id,
            host_key,
            client_to_server,
            server_to_client,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{EcdsaP256Key, Ed25519Key};

    const V_C: &str = "SSH-2.0-client";
    const V_S: &str = "SSH-2.0-server";

    fn host_keys() -> Vec<Arc<dyn Signer>> {
        vec![
            Arc::new(Ed25519Key::generate().unwrap()),
            Arc::new(EcdsaP256Key::generate().unwrap()),
        ]
    }

    fn run(
        client_prefs: &AlgorithmPreferences,
        server_prefs: &AlgorithmPreferences,
        session_id: Option<Arc<[u8]>>,
    ) -> (KexOutput, KexOutput) {
        let keys = host_keys();
        let mut client =
            KeyExchange::new(Role::Client, client_prefs, V_C, V_S, session_id.clone());
        let mut server = KeyExchange::new(Role::Server, server_prefs, V_C, V_S, session_id);

        let init = client
            .handle_kexinit(&server.local_kexinit().to_vec())
            .unwrap()
            .unwrap();
        assert!(server
            .handle_kexinit(&client.local_kexinit().to_vec())
            .unwrap()
            .is_none());
        assert_eq!(client.negotiated(), server.negotiated());

        let (reply, server_out) = server.handle_ecdh_init(&init, &keys).unwrap();
        let client_out = client.handle_ecdh_reply(&reply).unwrap();
        assert_eq!(client.state(), KexState::Activating);
        assert_eq!(server.state(), KexState::Activating);
        (client_out, server_out)
    }

    #[test]
    fn test_kexinit_roundtrip() {
        let kexinit = AlgorithmPreferences::default().to_kexinit();
        let bytes = kexinit.to_bytes();
        assert_eq!(bytes[0], 20);
        assert_eq!(KexInit::from_bytes(&bytes).unwrap(), kexinit);
        assert!(KexInit::from_bytes(&bytes[..20]).is_err());
    }

    #[test]
    fn test_negotiate_client_preference_wins() {
        let client = vec!["b".to_string(), "a".to_string()];
        let server = vec!["a".to_string(), "b".to_string()];
        assert_eq!(negotiate_algorithm("kex", &client, &server).unwrap(), "b");

        let err = negotiate_algorithm("mac", &client, &["c".to_string()]).unwrap_err();
        assert!(err.to_string().contains("no common mac algorithm"));
    }

    #[test]
    fn test_unknown_algorithms_are_skipped() {
        let mut client = AlgorithmPreferences::default().to_kexinit();
        client.kex_algorithms.insert(0, "sntrup761x25519-sha512@openssh.com".to_string());
        let server = AlgorithmPreferences::default().to_kexinit();
        let negotiated = Negotiated::from_kexinits(&client, &server).unwrap();
        assert_eq!(negotiated.kex, KexAlgorithm::Curve25519Sha256);
    }

    #[test]
    fn test_mac_ignored_for_aead() {
        let client = AlgorithmPreferences::default().to_kexinit();
        let mut server = AlgorithmPreferences::default().to_kexinit();
        server.mac_client_to_server.clear();
        server.mac_server_to_client.clear();
        let negotiated = Negotiated::from_kexinits(&client, &server).unwrap();
        assert_eq!(negotiated.mac_client_to_server, None);

        server.encryption_client_to_server = vec!["aes128-ctr".to_string()];
        assert!(Negotiated::from_kexinits(&client, &server).is_err());
    }

    #[test]
    fn test_full_exchange_every_method() {
        for kex in KexAlgorithm::ALL {
            for host_key in KeyAlgorithm::ALL {
                let prefs = AlgorithmPreferences {
                    kex: vec![kex],
                    host_key: vec![host_key],
                    ..AlgorithmPreferences::default()
                };
                let (client, server) = run(&prefs, &AlgorithmPreferences::default(), None);
                assert_eq!(client.exchange_hash, server.exchange_hash);
                assert_eq!(&*client.session_id, client.exchange_hash.as_slice());
                assert_eq!(client.host_key, server.host_key);
                assert_eq!(client.host_key.algorithm(), host_key.name());
                assert_eq!(
                    &*client.client_to_server.key,
                    &*server.client_to_server.key
                );
                assert_ne!(
                    &*client.client_to_server.key,
                    &*client.server_to_client.key
                );
            }
        }
    }

    #[test]
    fn test_derived_keys_interoperate() {
        let prefs = AlgorithmPreferences {
            ciphers: vec![CipherAlgorithm::Aes128Ctr],
            ..AlgorithmPreferences::default()
        };
        let (client, server) = run(&prefs, &prefs, None);
        assert_eq!(client.client_to_server.iv.len(), 16);
        assert_eq!(client.client_to_server.mac_key.len(), 32);

        let mut sealer = crate::codec::PacketSealer::new();
        sealer.install(client.sealing_key(Role::Client).unwrap());
        let mut opener = crate::codec::PacketOpener::new();
        opener.install(server.opening_key(Role::Server).unwrap());

        let wire = sealer.encode(b"\x05hello").unwrap();
        let mut buf = BytesMut::from(&wire[..]);
        let packet = opener.decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.payload(), b"\x05hello");
    }

    #[test]
    fn test_session_id_survives_rekey() {
        let prefs = AlgorithmPreferences::default();
        let (first, _) = run(&prefs, &prefs, None);
        let (second, _) = run(&prefs, &prefs, Some(first.session_id.clone()));
        assert_eq!(second.session_id, first.session_id);
        assert_ne!(second.exchange_hash, first.exchange_hash);
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let prefs = AlgorithmPreferences::default();
        let keys = host_keys();
        let mut client = KeyExchange::new(Role::Client, &prefs, V_C, V_S, None);
        let mut server = KeyExchange::new(Role::Server, &prefs, V_C, V_S, None);
        let init = client
            .handle_kexinit(&server.local_kexinit().to_vec())
            .unwrap()
            .unwrap();
        server
            .handle_kexinit(&client.local_kexinit().to_vec())
            .unwrap();
        let (reply, _) = server.handle_ecdh_init(&init, &keys).unwrap();

        let mut reply = KexEcdhReply::from_bytes(&reply).unwrap();
        let last = reply.signature.len() - 1;
        reply.signature[last] ^= 1;
        assert!(matches!(
            client.handle_ecdh_reply(&reply.to_bytes()),
            Err(FynxError::Crypto(_))
        ));
    }

    #[test]
    fn test_wrong_guess_discards_next_packet() {
        let prefs = AlgorithmPreferences::default();
        let mut server = KeyExchange::new(Role::Server, &prefs, V_C, V_S, None);

        let mut guessing = AlgorithmPreferences {
            kex: vec![KexAlgorithm::EcdhSha2Nistp256, KexAlgorithm::Curve25519Sha256],
            ..prefs.clone()
        }
        .to_kexinit();
        guessing.first_kex_packet_follows = true;
        server.handle_kexinit(&guessing.to_bytes()).unwrap();
        assert!(server.discard_guess());
        assert!(!server.discard_guess());

        let mut server = KeyExchange::new(Role::Server, &prefs, V_C, V_S, None);
        let mut right = prefs.to_kexinit();
        right.first_kex_packet_follows = true;
        server.handle_kexinit(&right.to_bytes()).unwrap();
        assert!(!server.discard_guess());
    }

    #[test]
    fn test_out_of_order_messages_rejected() {
        let prefs = AlgorithmPreferences::default();
        let mut server = KeyExchange::new(Role::Server, &prefs, V_C, V_S, None);
        let init = KexEcdhInit {
            client_public: vec![9; 32],
        };
        assert!(server.handle_ecdh_init(&init.to_bytes(), &host_keys()).is_err());

        let mut client = KeyExchange::new(Role::Client, &prefs, V_C, V_S, None);
        let kexinit = prefs.to_kexinit().to_bytes();
        client.handle_kexinit(&kexinit).unwrap();
        assert!(client.handle_kexinit(&kexinit).is_err());
    }

    #[test]
    fn test_missing_host_key_for_negotiated_algorithm() {
        let prefs = AlgorithmPreferences::default();
        let mut client = KeyExchange::new(Role::Client, &prefs, V_C, V_S, None);
        let mut server = KeyExchange::new(Role::Server, &prefs, V_C, V_S, None);
        let init = client
            .handle_kexinit(&server.local_kexinit().to_vec())
            .unwrap()
            .unwrap();
        server
            .handle_kexinit(&client.local_kexinit().to_vec())
            .unwrap();
        let only_ecdsa: Vec<Arc<dyn Signer>> = vec![Arc::new(EcdsaP256Key::generate().unwrap())];
        assert!(server.handle_ecdh_init(&init, &only_ecdsa).is_err());
    }
}
