//! SSH transport and authentication core for the Fynx security ecosystem.
//!
//! This crate implements the parts of SSH below the channel layer:
//!
//! - **Packet codec** - RFC 4253 binary packet framing with
//!   `chacha20-poly1305@openssh.com`, AES-GCM and AES-CTR + HMAC-SHA2
//! - **Key exchange** - `curve25519-sha256` and `ecdh-sha2-nistp256` with
//!   `ssh-ed25519` and `ecdsa-sha2-nistp256` host keys, including rekeying
//! - **Transport** - version exchange, phase tracking, rekey scheduling
//! - **Authentication** - RFC 4252 `none`, `password` and `publickey`, and
//!   RFC 4256 `keyboard-interactive`, on both sides
//! - **Connection handle** - relays connection protocol messages (80 and
//!   above) to the channel layer
//!
//! # Example
//!
//! ```rust,no_run
//! use fynx_ssh::client::{self, AcceptAnyHostKey};
//! use fynx_ssh::config::ClientConfig;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::builder("alice")
//!     .with_password("secret")
//!     .with_host_key_verifier(Arc::new(AcceptAnyHostKey))
//!     .build()?;
//!
//! let mut connection = client::connect_tcp("127.0.0.1:2222", &config).await?;
//! connection.send(vec![90, 0, 0, 0, 7]).await?;
//! while let Some(message) = connection.recv().await? {
//!     println!("received message {}", message[0]);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - All cryptographic operations use vetted libraries (`ring`, `dalek`,
//!   RustCrypto)
//! - MACs and tags are compared in constant time
//! - Session keys and passwords are held in `zeroize` wrappers
//! - The packet decoder is fuzz tested
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4256](https://datatracker.ietf.org/doc/html/rfc4256) - Keyboard-Interactive Authentication
//! - [RFC 5656](https://datatracker.ietf.org/doc/html/rfc5656) - Elliptic Curve Algorithm Integration
//! - [RFC 5647](https://datatracker.ietf.org/doc/html/rfc5647) - AES-GCM for SSH
//! - [RFC 8731](https://datatracker.ietf.org/doc/html/rfc8731) - Curve25519 Key Exchange

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod auth;
pub mod client;
pub mod client_auth;
pub mod codec;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod kex;
pub mod kex_ecdh;
pub mod keys;
pub mod logging;
pub mod message;
pub mod packet;
pub mod server;
pub mod server_auth;
pub mod transport;
pub mod version;
pub mod wire;

pub use auth::{ConnectionMetadata, MethodPolicy, Permissions};
pub use client::{connect, connect_tcp, AcceptAnyHostKey, FixedHostKey, HostKeyVerifier};
pub use client_auth::{BannerHandler, ClientAuthMethod, KeyboardInteractiveResponder};
pub use codec::{PacketCodec, PacketOpener, PacketSealer};
pub use config::{ClientConfig, ServerConfig, TransportConfig};
pub use connection::ConnectionHandle;
pub use kex::{AlgorithmPreferences, Negotiated, Role};
pub use keys::{EcdsaP256Key, Ed25519Key, KeyAlgorithm, PublicKey, Signer};
pub use packet::Packet;
pub use server::{accept, SshServer};
pub use server_auth::{
    AuthOutcome, Challenger, KeyboardInteractiveCallback, PasswordCallback, PublicKeyCallback,
};
pub use transport::{Transport, TransportState};

pub use fynx_platform::{FynxError, FynxResult};
