//! Authenticated connection handed to the channel layer.
//!
//! A [`ConnectionHandle`] relays connection protocol messages (numbers 80 and
//! above) in both directions. Key re-exchanges run underneath it without
//! interrupting the relay.

use fynx_platform::{FynxError, FynxResult};
use std::sync::Arc;
use tracing::trace;

use crate::auth::{ConnectionMetadata, Permissions};
use crate::kex::{Negotiated, Role};
use crate::keys::PublicKey;
use crate::message::MessageClass;
use crate::transport::Transport;

/// Lowest connection protocol message number.
pub const FIRST_CONNECTION_MESSAGE: u8 = 80;

/// An authenticated SSH connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    transport: Transport,
    user: String,
    permissions: Permissions,
    methods: Vec<String>,
    metadata: ConnectionMetadata,
}

impl ConnectionHandle {
    pub(crate) fn new(
        transport: Transport,
        user: String,
        permissions: Permissions,
        methods: Vec<String>,
    ) -> FynxResult<Self> {
        let metadata = transport.metadata(&user)?;
        Ok(Self {
            transport,
            user,
            permissions,
            methods,
            metadata,
        })
    }

    /// Sends a connection protocol message.
    ///
    /// # Errors
    ///
    /// - [`FynxError::Protocol`] if the message number is below 80 or the
    ///   payload is too large
    /// - [`FynxError::ConnectionClosed`] after [`close`](Self::close)
    pub async fn send(&self, payload: Vec<u8>) -> FynxResult<()> {
        match payload.first() {
            Some(&msg) if msg >= FIRST_CONNECTION_MESSAGE => self.transport.send(payload).await,
            Some(&msg) => Err(FynxError::Protocol(format!(
                "message {} is not a connection protocol message",
                msg
            ))),
            None => Err(FynxError::protocol("empty payload")),
        }
    }

    /// Receives the next connection protocol message.
    ///
    /// Returns `Ok(None)` once the connection is closed.
    pub async fn recv(&mut self) -> FynxResult<Option<Vec<u8>>> {
        loop {
            match self.transport.recv().await? {
                Some(payload) if MessageClass::of_payload(&payload) == MessageClass::UserAuth => {
                    trace!(msg = payload[0], "Ignoring authentication message after success");
                }
                other => return Ok(other),
            }
        }
    }

    /// Starts a key re-exchange and waits for it to complete.
    pub async fn rekey(&self) -> FynxResult<()> {
        self.transport.rekey().await
    }

    /// Closes the connection. Safe to call more than once.
    pub async fn close(&self) -> FynxResult<()> {
        self.transport.close().await
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// Session identifier from the first key exchange.
    pub fn session_id(&self) -> Arc<[u8]> {
        Arc::clone(&self.metadata.session_id)
    }

    /// Authenticated user.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Permissions granted by the server's callbacks. Empty on the client.
    pub fn permissions(&self) -> &Permissions {
        &self.permissions
    }

    /// Methods that succeeded during authentication, in order.
    pub fn auth_methods(&self) -> &[String] {
        &self.methods
    }

    /// Connection facts.
    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.metadata
    }

    /// Algorithms in effect for the latest key exchange.
    pub fn negotiated(&self) -> Option<Negotiated> {
        self.transport.negotiated()
    }

    /// Server host key.
    pub fn host_key(&self) -> Option<&PublicKey> {
        self.transport.host_key()
    }

    /// Local role.
    pub fn role(&self) -> Role {
        self.transport.role()
    }
}
