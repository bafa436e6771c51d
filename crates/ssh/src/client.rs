//! SSH client entry points.
//!
//! # Example
//!
//! ```rust,no_run
//! use fynx_ssh::client::{self, FixedHostKey};
//! use fynx_ssh::config::ClientConfig;
//! use fynx_ssh::keys::PublicKey;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let known: PublicKey = unimplemented!();
//! let config = ClientConfig::builder("alice")
//!     .with_password("secret")
//!     .with_host_key_verifier(Arc::new(FixedHostKey::new(known)))
//!     .build()?;
//!
//! let connection = client::connect_tcp("127.0.0.1:2222", &config).await?;
//! println!("session {}", hex::encode(connection.session_id()));
//! connection.close().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use fynx_platform::{FynxError, FynxResult};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

use crate::auth::{ConnectionMetadata, Permissions};
use crate::client_auth;
use crate::config::ClientConfig;
use crate::connection::ConnectionHandle;
use crate::keys::PublicKey;
use crate::transport::{KexIdentity, Transport, TransportSetup, TransportState};

/// Decides whether to trust the server host key.
///
/// Called once per connection, during the first key exchange. Returning
/// `Ok(false)` aborts the connection with [`FynxError::Crypto`]; any error
/// aborts it with [`FynxError::Callback`].
#[async_trait]
pub trait HostKeyVerifier: Send + Sync {
    /// Returns whether `host_key` is trusted for this connection.
    async fn verify(&self, host_key: &PublicKey, metadata: &ConnectionMetadata)
        -> FynxResult<bool>;
}

/// Trusts every host key.
///
/// Offers no protection against an active attacker.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAnyHostKey;

#[async_trait]
impl HostKeyVerifier for AcceptAnyHostKey {
    async fn verify(&self, host_key: &PublicKey, _: &ConnectionMetadata) -> FynxResult<bool> {
        debug!(host_key = %host_key.fingerprint(), "Accepting host key without verification");
        Ok(true)
    }
}

/// Trusts exactly one host key.
#[derive(Debug, Clone)]
pub struct FixedHostKey {
    key: PublicKey,
}

impl FixedHostKey {
    /// Trusts `key` only.
    pub fn new(key: PublicKey) -> Self {
        Self { key }
    }
}

#[async_trait]
impl HostKeyVerifier for FixedHostKey {
    async fn verify(&self, host_key: &PublicKey, _: &ConnectionMetadata) -> FynxResult<bool> {
        Ok(*host_key == self.key)
    }
}

/// Runs the client handshake over `stream`: version exchange, key exchange
/// and authentication, all bounded by the handshake timeout.
pub async fn connect<S>(stream: S, config: &ClientConfig) -> FynxResult<ConnectionHandle>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let deadline = Instant::now() + config.transport.handshake_timeout;
    handshake(stream, config, deadline, None, None).await
}

/// Opens a TCP connection to `addr` and runs [`connect`] over it.
///
/// The TCP connect counts against the handshake timeout.
pub async fn connect_tcp<A>(addr: A, config: &ClientConfig) -> FynxResult<ConnectionHandle>
where
    A: ToSocketAddrs,
{
    let deadline = Instant::now() + config.transport.handshake_timeout;
    let stream = timeout_at(deadline, TcpStream::connect(addr))
        .await
        .map_err(|_| FynxError::Timeout("TCP connect".into()))??;
    stream.set_nodelay(true)?;

    let peer_addr = stream.peer_addr().ok();
    let local_addr = stream.local_addr().ok();
    handshake(stream, config, deadline, peer_addr, local_addr).await
}

async fn handshake<S>(
    stream: S,
    config: &ClientConfig,
    deadline: Instant,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
) -> FynxResult<ConnectionHandle>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    config.validate()?;

    let setup = TransportSetup {
        identity: KexIdentity::Client {
            verifier: config.host_key_verifier.clone(),
            user: config.user.clone(),
        },
        config: config.transport.clone(),
        peer_addr,
        local_addr,
    };
    let mut transport = timeout_at(deadline, Transport::start(stream, setup))
        .await
        .map_err(|_| FynxError::Timeout("version exchange".into()))??;

    let result = match timeout_at(deadline, establish(&mut transport, config)).await {
        Ok(result) => result,
        Err(_) => Err(FynxError::Timeout("handshake".into())),
    };
    let methods = match result {
        Ok(methods) => methods,
        Err(e) => {
            transport.abort(&e).await;
            return Err(e);
        }
    };

    transport.advance(TransportState::Authenticated)?;
    info!(
        user = %config.user,
        methods = ?methods,
        peer = ?peer_addr,
        "Client authenticated"
    );
    ConnectionHandle::new(transport, config.user.clone(), Permissions::default(), methods)
}

async fn establish(transport: &mut Transport, config: &ClientConfig) -> FynxResult<Vec<String>> {
    transport.wait_established().await?;
    client_auth::request_service(transport).await?;
    client_auth::authenticate(transport, config).await
}
