//! SSH server entry points.
//!
//! [`accept`] runs the server handshake over any byte stream. [`SshServer`]
//! wraps a TCP listener.
//!
//! # Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use fynx_platform::{FynxError, FynxResult};
//! use fynx_ssh::auth::{ConnectionMetadata, Permissions};
//! use fynx_ssh::config::ServerConfig;
//! use fynx_ssh::keys::Ed25519Key;
//! use fynx_ssh::server::SshServer;
//! use fynx_ssh::server_auth::PasswordCallback;
//! use std::sync::Arc;
//!
//! struct Passwords;
//!
//! #[async_trait]
//! impl PasswordCallback for Passwords {
//!     async fn check(&self, meta: &ConnectionMetadata, password: &str) -> FynxResult<Permissions> {
//!         if meta.user == "admin" && password == "secret" {
//!             Ok(Permissions::default())
//!         } else {
//!             Err(FynxError::AuthRejected("bad password".into()))
//!         }
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig::builder()
//!     .with_host_key(Arc::new(Ed25519Key::generate()?))
//!     .with_password_callback(Arc::new(Passwords))
//!     .build()?;
//!
//! let server = SshServer::bind("127.0.0.1:2222", config).await?;
//! loop {
//!     let connection = server.accept().await?;
//!     tokio::spawn(async move {
//!         // hand `connection` to the channel layer
//!         let _ = connection.close().await;
//!     });
//! }
//! # }
//! ```

use fynx_platform::{FynxError, FynxResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::connection::ConnectionHandle;
use crate::server_auth::{self, AuthOutcome};
use crate::transport::{KexIdentity, Transport, TransportSetup, TransportState};

/// Runs the server handshake over `stream`.
///
/// Version and key exchange are bounded by the handshake timeout,
/// authentication by the auth timeout.
pub async fn accept<S>(stream: S, config: &ServerConfig) -> FynxResult<ConnectionHandle>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    handshake(stream, config, None, None).await
}

/// TCP listener that runs the server handshake for each client.
#[derive(Debug)]
pub struct SshServer {
    listener: TcpListener,
    config: Arc<ServerConfig>,
}

impl SshServer {
    /// Binds to an address.
    ///
    /// # Errors
    ///
    /// Returns [`FynxError::Config`] for an invalid configuration and
    /// [`FynxError::Io`] if the address cannot be bound.
    pub async fn bind<A>(addr: A, config: ServerConfig) -> FynxResult<Self>
    where
        A: ToSocketAddrs,
    {
        config.validate()?;
        let listener = TcpListener::bind(addr).await?;
        info!(addr = ?listener.local_addr().ok(), "SSH server listening");
        Ok(Self {
            listener,
            config: Arc::new(config),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> FynxResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Accepts the next client and runs the handshake.
    ///
    /// Handshakes run one at a time; spawn [`accept`] on the raw stream from
    /// [`accept_stream`](Self::accept_stream) to overlap them.
    pub async fn accept(&self) -> FynxResult<ConnectionHandle> {
        let (stream, peer_addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr().ok();
        handshake(stream, &self.config, Some(peer_addr), local_addr).await
    }

    /// Accepts the next TCP client without running the handshake.
    pub async fn accept_stream(&self) -> FynxResult<(tokio::net::TcpStream, SocketAddr)> {
        let (stream, peer_addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        debug!(peer = %peer_addr, "TCP client accepted");
        Ok((stream, peer_addr))
    }
}

async fn handshake<S>(
    stream: S,
    config: &ServerConfig,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
) -> FynxResult<ConnectionHandle>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    config.validate()?;

    let deadline = Instant::now() + config.transport.handshake_timeout;
    let setup = TransportSetup {
        identity: KexIdentity::Server {
            host_keys: config.host_keys.clone(),
        },
        config: config.transport.clone(),
        peer_addr,
        local_addr,
    };
    let mut transport = timeout_at(deadline, Transport::start(stream, setup))
        .await
        .map_err(|_| FynxError::Timeout("version exchange".into()))??;

    let result = match timeout_at(deadline, transport.wait_established()).await {
        Ok(Ok(())) => match timeout(config.auth_timeout, authenticate(&mut transport, config)).await
        {
            Ok(result) => result,
            Err(_) => Err(FynxError::Timeout("authentication".into())),
        },
        Ok(Err(e)) => Err(e),
        Err(_) => Err(FynxError::Timeout("key exchange".into())),
    };

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(peer = ?peer_addr, error = %e, "Server handshake failed");
            transport.abort(&e).await;
            return Err(e);
        }
    };

    transport.advance(TransportState::Authenticated)?;
    info!(
        user = %outcome.user,
        methods = ?outcome.methods,
        peer = ?peer_addr,
        "Client authenticated"
    );
    ConnectionHandle::new(transport, outcome.user, outcome.permissions, outcome.methods)
}

async fn authenticate(transport: &mut Transport, config: &ServerConfig) -> FynxResult<AuthOutcome> {
    server_auth::accept_service(transport).await?;
    server_auth::authenticate(transport, config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Ed25519Key;

    #[tokio::test]
    async fn test_bind_and_local_addr() {
        let config = ServerConfig::builder()
            .with_host_key(Arc::new(Ed25519Key::generate().unwrap()))
            .with_no_client_auth(true)
            .build()
            .unwrap();
        let server = SshServer::bind("127.0.0.1:0", config).await.unwrap();
        let addr = server.local_addr().unwrap();
        assert!(addr.port() > 0);
        assert!(server.config().no_client_auth);
    }
}
