//! SSH Transport Layer (RFC 4253).
//!
//! This module drives a connection from version exchange through key
//! exchange to the authenticated message relay.
//!
//! # Transport States
//!
//! 1. **VersionExchange** - Exchange SSH-2.0 identification strings
//! 2. **KexInit** - SSH_MSG_KEXINIT sent, waiting for the peer's
//! 3. **KeyExchange** - ECDH exchange in progress
//! 4. **NewKeys** - Our NEWKEYS sent, waiting for the peer's
//! 5. **Encrypted** - First exchange complete
//! 6. **ServiceRequested** - `ssh-userauth` requested
//! 7. **Authenticating** - User authentication in progress
//! 8. **Authenticated** - Opaque message relay
//!
//! Rekeying does not change the phase; it is tracked by the key exchange
//! engine.
//!
//! # Tasks
//!
//! Each connection runs two tasks:
//!
//! - the **reader** owns the read half and the receive cipher. After it
//!   decodes NEWKEYS it waits for the new opening key before decoding
//!   anything else.
//! - the **driver** owns the write half, the send cipher and the key
//!   exchange engine. It consumes transport and key exchange messages,
//!   forwards everything else to the [`Transport`] handle, and queues
//!   outbound payloads while a key exchange has not yet produced our NEWKEYS.
//!
//! The handle talks to the driver over channels; no lock is held across an
//! await point.

use fynx_platform::{FynxError, FynxResult};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::auth::ConnectionMetadata;
use crate::client::HostKeyVerifier;
use crate::codec::{PacketReader, PacketWriter};
use crate::config::TransportConfig;
use crate::crypto::OpeningKey;
use crate::kex::{AlgorithmPreferences, KexOutput, KeyExchange, Negotiated, Role, NEWKEYS};
use crate::keys::{PublicKey, Signer};
use crate::logging;
use crate::message::{self, disconnect_for, disconnect_reason, Disconnect, MessageType};
use crate::packet::MAX_PAYLOAD_SIZE;
use crate::version::{Version, MAX_PRE_VERSION_LINES};

/// Bound on packets buffered between the reader and the driver.
const READER_QUEUE: usize = 64;

/// Bound on outbound payloads waiting for the driver.
const COMMAND_QUEUE: usize = 64;

/// Connection phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportState {
    /// Identification strings are being exchanged
    VersionExchange,
    /// KEXINIT sent for the first exchange
    KexInit,
    /// Both KEXINITs known, ECDH in progress
    KeyExchange,
    /// Our NEWKEYS sent
    NewKeys,
    /// First exchange complete in both directions
    Encrypted,
    /// `ssh-userauth` requested
    ServiceRequested,
    /// Authentication in progress
    Authenticating,
    /// Authentication succeeded
    Authenticated,
}

impl TransportState {
    /// Whether `next` directly follows this phase.
    pub fn can_transition_to(self, next: TransportState) -> bool {
        use TransportState::*;
        matches!(
            (self, next),
            (VersionExchange, KexInit)
                | (KexInit, KeyExchange)
                | (KeyExchange, NewKeys)
                | (NewKeys, Encrypted)
                | (Encrypted, ServiceRequested)
                | (ServiceRequested, Authenticating)
                | (Authenticating, Authenticated)
        )
    }

    /// Moves to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`FynxError::Protocol`] if the transition skips or reverses
    /// a phase.
    pub fn transition(&mut self, next: TransportState) -> FynxResult<()> {
        if !self.can_transition_to(next) {
            return Err(FynxError::Protocol(format!(
                "Invalid state transition: {:?} -> {:?}",
                self, next
            )));
        }
        *self = next;
        Ok(())
    }

    /// Whether the first key exchange has completed.
    pub fn is_encrypted(self) -> bool {
        self >= TransportState::Encrypted
    }
}

/// Decides when to start a re-exchange.
#[derive(Debug, Clone)]
pub struct RekeyTracker {
    bytes_sent: u64,
    bytes_received: u64,
    last_kex: Instant,
    bytes_limit: u64,
    time_limit: Duration,
}

impl RekeyTracker {
    /// Creates a tracker with the given limits.
    pub fn new(bytes_limit: u64, time_limit: Duration) -> Self {
        Self {
            bytes_sent: 0,
            bytes_received: 0,
            last_kex: Instant::now(),
            bytes_limit,
            time_limit,
        }
    }

    /// Records payload bytes written. Padding and MAC are not counted, so
    /// both directions use the same unit.
    pub fn record_sent(&mut self, bytes: usize) {
        self.bytes_sent = self.bytes_sent.saturating_add(bytes as u64);
    }

    /// Records payload bytes read.
    pub fn record_received(&mut self, bytes: usize) {
        self.bytes_received = self.bytes_received.saturating_add(bytes as u64);
    }

    /// Whether either direction has passed the byte limit.
    pub fn bytes_exceeded(&self) -> bool {
        self.bytes_sent >= self.bytes_limit || self.bytes_received >= self.bytes_limit
    }

    /// When the time limit expires.
    pub fn deadline(&self) -> Instant {
        self.last_kex + self.time_limit
    }

    /// Restarts both counters after an exchange.
    pub fn reset(&mut self) {
        self.bytes_sent = 0;
        self.bytes_received = 0;
        self.last_kex = Instant::now();
    }
}

/// Host key material or trust decision for the key exchange.
#[derive(Clone)]
pub(crate) enum KexIdentity {
    Client {
        verifier: Arc<dyn HostKeyVerifier>,
        user: String,
    },
    Server {
        host_keys: Vec<Arc<dyn Signer>>,
    },
}

impl KexIdentity {
    fn role(&self) -> Role {
        match self {
            KexIdentity::Client { .. } => Role::Client,
            KexIdentity::Server { .. } => Role::Server,
        }
    }
}

/// Everything needed to start a transport.
pub(crate) struct TransportSetup {
    pub identity: KexIdentity,
    pub config: TransportConfig,
    pub peer_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
}

/// State shared by the handle and the driver.
struct Shared {
    role: Role,
    client_version: String,
    server_version: String,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    state: watch::Sender<TransportState>,
    negotiated: watch::Sender<Option<Negotiated>>,
    session_id: OnceLock<Arc<[u8]>>,
    host_key: OnceLock<PublicKey>,
    exchanges: AtomicU64,
}

impl Shared {
    fn advance(&self, next: TransportState) -> FynxResult<()> {
        let mut result = Ok(());
        let mut from = None;
        self.state.send_if_modified(|state| {
            from = Some(*state);
            match state.transition(next) {
                Ok(()) => true,
                Err(e) => {
                    result = Err(e);
                    false
                }
            }
        });
        if let (Ok(()), Some(from)) = (&result, from) {
            logging::log_state_transition(self.role, from, next);
        }
        result
    }

    fn metadata(&self, user: &str, session_id: Arc<[u8]>) -> ConnectionMetadata {
        ConnectionMetadata {
            user: user.to_string(),
            session_id,
            client_version: self.client_version.clone(),
            server_version: self.server_version.clone(),
            role: self.role,
            peer_addr: self.peer_addr,
            local_addr: self.local_addr,
        }
    }
}

enum Command {
    Send(Vec<u8>),
    Rekey(oneshot::Sender<()>),
}

/// Handle to a running transport.
///
/// Delivers every message that is not part of the transport or key exchange
/// protocols: service requests, authentication, and connection protocol
/// messages.
pub struct Transport {
    shared: Arc<Shared>,
    commands: mpsc::Sender<Command>,
    inbound: mpsc::UnboundedReceiver<FynxResult<Vec<u8>>>,
    close_tx: watch::Sender<Option<Disconnect>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("role", &self.shared.role)
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Exchanges versions, then spawns the reader and driver tasks.
    ///
    /// The first key exchange starts immediately; use
    /// [`wait_established`](Self::wait_established) to wait for it.
    pub(crate) async fn start<S>(stream: S, setup: TransportSetup) -> FynxResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let role = setup.identity.role();
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = PacketReader::new(read_half);
        let mut writer = PacketWriter::new(write_half);

        let local = setup.config.version.clone();
        writer.write_raw(&local.to_wire()).await?;
        let peer = read_peer_version(&mut reader, role).await?;
        debug!(role = %role, peer = peer.as_str(), "Version exchange complete");

        let (client_version, server_version) = match role {
            Role::Client => (local.as_str().to_string(), peer.as_str().to_string()),
            Role::Server => (peer.as_str().to_string(), local.as_str().to_string()),
        };

        let (state, _) = watch::channel(TransportState::VersionExchange);
        let (negotiated, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            role,
            client_version,
            server_version,
            peer_addr: setup.peer_addr,
            local_addr: setup.local_addr,
            state,
            negotiated,
            session_id: OnceLock::new(),
            host_key: OnceLock::new(),
            exchanges: AtomicU64::new(0),
        });

        let (packets_tx, packets_rx) = mpsc::channel(READER_QUEUE);
        let (keys_tx, keys_rx) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(read_loop(reader, packets_tx, keys_rx));

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(None);

        let preferences = match &setup.identity {
            KexIdentity::Server { host_keys } => {
                let available: Vec<_> = host_keys.iter().map(|k| k.algorithm()).collect();
                setup.config.algorithms.restrict_host_keys(&available)
            }
            KexIdentity::Client { .. } => setup.config.algorithms.clone(),
        };

        let driver = Driver {
            role,
            preferences,
            max_pending: setup.config.max_pending_packets,
            close_grace: setup.config.handshake_timeout,
            tracker: RekeyTracker::new(
                setup.config.rekey_bytes_limit,
                setup.config.rekey_time_limit,
            ),
            identity: setup.identity,
            shared: Arc::clone(&shared),
            writer,
            from_reader: packets_rx,
            opening_keys: keys_tx,
            commands: commands_rx,
            to_handle: inbound_tx,
            close_rx,
            kex: None,
            sent_newkeys: false,
            pending_opening: None,
            pending: VecDeque::new(),
            rekey_waiters: Vec::new(),
            established: false,
            peer_in_kex: false,
        };
        let driver_task = tokio::spawn(driver.run(reader_task));

        Ok(Self {
            shared,
            commands: commands_tx,
            inbound: inbound_rx,
            close_tx,
            driver: Mutex::new(Some(driver_task)),
            closed: AtomicBool::new(false),
        })
    }

    /// Local role.
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Current phase.
    pub fn state(&self) -> TransportState {
        *self.shared.state.borrow()
    }

    /// Records a service or authentication phase change.
    pub(crate) fn advance(&self, next: TransportState) -> FynxResult<()> {
        self.shared.advance(next)
    }

    /// Session identifier, available once the first exchange completes.
    pub fn session_id(&self) -> FynxResult<Arc<[u8]>> {
        self.shared
            .session_id
            .get()
            .cloned()
            .ok_or_else(|| FynxError::protocol("key exchange has not completed"))
    }

    /// Algorithms in effect for the latest exchange.
    pub fn negotiated(&self) -> Option<Negotiated> {
        self.shared.negotiated.borrow().clone()
    }

    /// Number of key exchanges completed in both directions, the initial
    /// one included.
    pub fn key_exchanges(&self) -> u64 {
        self.shared.exchanges.load(Ordering::SeqCst)
    }

    /// Server host key accepted during the first exchange.
    pub fn host_key(&self) -> Option<&PublicKey> {
        self.shared.host_key.get()
    }

    /// Client identification string.
    pub fn client_version(&self) -> &str {
        &self.shared.client_version
    }

    /// Server identification string.
    pub fn server_version(&self) -> &str {
        &self.shared.server_version
    }

    /// Callback metadata for `user`.
    pub fn metadata(&self, user: &str) -> FynxResult<ConnectionMetadata> {
        Ok(self.shared.metadata(user, self.session_id()?))
    }

    /// Waits for the first key exchange to complete.
    pub async fn wait_established(&mut self) -> FynxResult<()> {
        let mut state = self.shared.state.subscribe();
        loop {
            if state.borrow_and_update().is_encrypted() {
                return Ok(());
            }
            tokio::select! {
                biased;
                changed = state.changed() => {
                    changed.map_err(|_| FynxError::ConnectionClosed)?;
                }
                inbound = self.inbound.recv() => {
                    return match inbound {
                        Some(Err(e)) => Err(e),
                        Some(Ok(_)) => Err(FynxError::protocol(
                            "message delivered before key exchange completed",
                        )),
                        None => Err(FynxError::ConnectionClosed),
                    };
                }
            }
        }
    }

    /// Queues a payload for sending.
    ///
    /// Payloads submitted while a key exchange is in progress are held and
    /// sent in order once the new keys are active.
    pub async fn send(&self, payload: Vec<u8>) -> FynxResult<()> {
        if self.is_closed() {
            return Err(FynxError::ConnectionClosed);
        }
        if payload.is_empty() || payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FynxError::Protocol(format!(
                "payload length {} outside 1..={}",
                payload.len(),
                MAX_PAYLOAD_SIZE
            )));
        }
        self.commands
            .send(Command::Send(payload))
            .await
            .map_err(|_| FynxError::ConnectionClosed)
    }

    /// Receives the next message for the layer above.
    ///
    /// Returns `Ok(None)` once the connection is closed. A fatal error is
    /// returned once; later calls return `Ok(None)`.
    pub async fn recv(&mut self) -> FynxResult<Option<Vec<u8>>> {
        if self.is_closed() {
            return Ok(None);
        }
        match self.inbound.recv().await {
            Some(Ok(payload)) => Ok(Some(payload)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// Starts a key re-exchange and waits for it to complete.
    pub async fn rekey(&self) -> FynxResult<()> {
        if self.is_closed() {
            return Err(FynxError::ConnectionClosed);
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(Command::Rekey(done_tx))
            .await
            .map_err(|_| FynxError::ConnectionClosed)?;
        done_rx.await.map_err(|_| FynxError::ConnectionClosed)
    }

    /// Closes the connection. Safe to call more than once.
    ///
    /// Payloads already passed to [`send`](Self::send) are written first,
    /// then DISCONNECT. A key exchange in progress is completed before
    /// those payloads go out; if it does not finish within the handshake
    /// timeout they are discarded and [`recv`](Self::recv) reports
    /// [`FynxError::Timeout`]. Both tasks stop and the cipher state is
    /// dropped.
    pub async fn close(&self) -> FynxResult<()> {
        self.shutdown(Disconnect::new(disconnect_reason::BY_APPLICATION, "closed"))
            .await
    }

    /// Closes the connection because of `err`, telling the peer why when the
    /// peer did not cause it.
    pub(crate) async fn abort(&self, err: &FynxError) {
        if notifies_peer(err) {
            let (reason, description) = disconnect_for(err);
            logging::log_disconnect(self.shared.role, reason, description, true);
            let _ = self.shutdown(Disconnect::new(reason, description)).await;
        } else {
            let _ = self.close().await;
        }
    }

    async fn shutdown(&self, disconnect: Disconnect) -> FynxResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.close_tx.send_replace(Some(disconnect));
        if let Some(driver) = self.driver.lock().await.take() {
            let _ = driver.await;
        }
        Ok(())
    }

    /// Like [`recv`](Self::recv), treating end of stream as an error.
    pub(crate) async fn recv_required(&mut self) -> FynxResult<Vec<u8>> {
        self.recv().await?.ok_or(FynxError::ConnectionClosed)
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Reads the peer identification string.
///
/// A client tolerates up to [`MAX_PRE_VERSION_LINES`] lines of banner text
/// before the server's identification string.
async fn read_peer_version<R>(reader: &mut PacketReader<R>, role: Role) -> FynxResult<Version>
where
    R: AsyncRead + Unpin,
{
    let mut skipped = 0usize;
    loop {
        let line = reader.read_line().await?;
        if Version::is_identification(&line) {
            return Version::parse(&line);
        }
        if role == Role::Server {
            return Err(FynxError::Protocol(format!(
                "expected identification string, got '{}'",
                line.escape_debug()
            )));
        }
        skipped += 1;
        if skipped > MAX_PRE_VERSION_LINES {
            return Err(FynxError::Protocol(format!(
                "more than {} lines before identification string",
                MAX_PRE_VERSION_LINES
            )));
        }
        trace!(line = %line.escape_debug(), "Skipping pre-version line");
    }
}

/// Inbound packet with its receive sequence number.
type Inbound = (u32, Vec<u8>);

async fn read_loop<R>(
    mut reader: PacketReader<ReadHalf<R>>,
    packets: mpsc::Sender<FynxResult<Inbound>>,
    mut keys: mpsc::UnboundedReceiver<OpeningKey>,
) where
    R: AsyncRead,
{
    loop {
        let sequence = reader.opener().sequence();
        let payload = match reader.read_packet().await {
            Ok(packet) => packet.into_payload(),
            Err(e) => {
                let _ = packets.send(Err(e)).await;
                return;
            }
        };

        let newkeys = payload[0] == MessageType::NewKeys as u8;
        if packets.send(Ok((sequence, payload))).await.is_err() {
            return;
        }
        if newkeys {
            match keys.recv().await {
                Some(key) => reader.install(key),
                None => return,
            }
        }
    }
}

struct Driver<W> {
    role: Role,
    preferences: AlgorithmPreferences,
    max_pending: usize,
    close_grace: Duration,
    tracker: RekeyTracker,
    identity: KexIdentity,
    shared: Arc<Shared>,
    writer: PacketWriter<WriteHalf<W>>,
    from_reader: mpsc::Receiver<FynxResult<Inbound>>,
    opening_keys: mpsc::UnboundedSender<OpeningKey>,
    commands: mpsc::Receiver<Command>,
    to_handle: mpsc::UnboundedSender<FynxResult<Vec<u8>>>,
    close_rx: watch::Receiver<Option<Disconnect>>,
    kex: Option<KeyExchange>,
    sent_newkeys: bool,
    pending_opening: Option<OpeningKey>,
    pending: VecDeque<Vec<u8>>,
    rekey_waiters: Vec<oneshot::Sender<()>>,
    established: bool,
    peer_in_kex: bool,
}

impl<W> Driver<W>
where
    W: AsyncWrite + Send,
{
    async fn run(mut self, reader_task: JoinHandle<()>) {
        let result = self.drive().await;
        reader_task.abort();

        match result {
            Ok(disconnect) => {
                let _ = self.writer.write_payload(&disconnect.to_bytes()).await;
                debug!(
                    role = %self.role,
                    reason = disconnect.reason,
                    "Connection closed locally"
                );
            }
            Err(e) => {
                if notifies_peer(&e) {
                    let (reason, description) = disconnect_for(&e);
                    let disconnect = Disconnect::new(reason, description);
                    let _ = self.writer.write_payload(&disconnect.to_bytes()).await;
                    logging::log_disconnect(self.role, reason, description, true);
                }
                logging::log_connection_failed(self.role, &e);
                let _ = self.to_handle.send(Err(e));
            }
        }

        self.pending.clear();
        self.pending_opening = None;
        self.kex = None;
        let _ = self.writer.shutdown().await;
    }

    /// Writes what the handle submitted before closing.
    async fn flush_commands(&mut self) -> FynxResult<()> {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Send(payload) => self.send_payload(payload).await?,
                Command::Rekey(done) if self.kex.is_some() => self.rekey_waiters.push(done),
                Command::Rekey(_) => {}
            }
        }
        if !self.outbound_blocked() {
            return Ok(());
        }

        debug!(queued = self.pending.len(), "Finishing key exchange before close");
        match tokio::time::timeout(self.close_grace, self.finish_kex()).await {
            Ok(result) => result,
            Err(_) => Err(FynxError::Timeout(format!(
                "key exchange unfinished at close, {} payloads not sent",
                self.pending.len()
            ))),
        }
    }

    /// Processes inbound packets until NEWKEYS is sent, which releases
    /// the held payloads.
    async fn finish_kex(&mut self) -> FynxResult<()> {
        while self.outbound_blocked() {
            match self.from_reader.recv().await {
                Some(Ok((sequence, payload))) => self.handle_inbound(sequence, payload).await?,
                Some(Err(e)) => return Err(e),
                None => return Err(FynxError::ConnectionClosed),
            }
        }
        Ok(())
    }

    async fn drive(&mut self) -> FynxResult<Disconnect> {
        self.start_kex("initial").await?;

        loop {
            let rekey_at = self.tracker.deadline();
            let accepting = !self.outbound_blocked() || self.pending.len() < self.max_pending;
            let timed_rekey = self.established && self.kex.is_none();

            tokio::select! {
                biased;
                changed = self.close_rx.changed() => {
                    let requested = self.close_rx.borrow().clone();
                    match (changed, requested) {
                        (Ok(()), Some(disconnect)) => {
                            self.flush_commands().await?;
                            return Ok(disconnect);
                        }
                        (Ok(()), None) => {}
                        (Err(_), _) => return Ok(dropped()),
                    }
                }
                packet = self.from_reader.recv() => match packet {
                    Some(Ok((sequence, payload))) => self.handle_inbound(sequence, payload).await?,
                    Some(Err(e)) => return Err(e),
                    None => return Err(FynxError::ConnectionClosed),
                },
                command = self.commands.recv(), if accepting => match command {
                    Some(Command::Send(payload)) => self.send_payload(payload).await?,
                    Some(Command::Rekey(done)) => {
                        self.rekey_waiters.push(done);
                        self.start_kex("requested").await?;
                    }
                    None => return Ok(dropped()),
                },
                _ = tokio::time::sleep_until(rekey_at), if timed_rekey => {
                    self.start_kex("time").await?;
                }
            }

            if self.established && self.kex.is_none() && self.tracker.bytes_exceeded() {
                self.start_kex("bytes").await?;
            }
        }
    }

    fn outbound_blocked(&self) -> bool {
        self.kex.is_some() && !self.sent_newkeys
    }

    async fn write(&mut self, payload: &[u8]) -> FynxResult<()> {
        self.writer.write_payload(payload).await?;
        self.tracker.record_sent(payload.len());
        Ok(())
    }

    async fn send_payload(&mut self, payload: Vec<u8>) -> FynxResult<()> {
        if self.outbound_blocked() {
            trace!(queued = self.pending.len() + 1, "Holding payload during key exchange");
            self.pending.push_back(payload);
            return Ok(());
        }
        self.write(&payload).await
    }

    async fn start_kex(&mut self, reason: &str) -> FynxResult<()> {
        if self.kex.is_some() {
            return Ok(());
        }
        if self.established {
            logging::log_rekey_start(self.role, reason);
        } else {
            self.shared.advance(TransportState::KexInit)?;
        }

        let kex = KeyExchange::new(
            self.role,
            &self.preferences,
            &self.shared.client_version,
            &self.shared.server_version,
            self.shared.session_id.get().cloned(),
        );
        let kexinit = kex.local_kexinit().to_vec();
        self.kex = Some(kex);
        self.sent_newkeys = false;
        self.write(&kexinit).await
    }

    async fn handle_inbound(&mut self, sequence: u32, payload: Vec<u8>) -> FynxResult<()> {
        self.tracker.record_received(payload.len());
        let msg = payload[0];

        match MessageType::from_u8(msg) {
            Some(MessageType::Disconnect) => {
                let disconnect = Disconnect::from_bytes(&payload)?;
                logging::log_disconnect(
                    self.role,
                    disconnect.reason,
                    &disconnect.description,
                    false,
                );
                Err(disconnect.into_error())
            }
            Some(MessageType::Ignore) => {
                trace!("Ignoring SSH_MSG_IGNORE");
                Ok(())
            }
            Some(MessageType::Debug) => {
                let debug_msg = message::DebugMessage::from_bytes(&payload)?;
                debug!(message = %debug_msg.message.escape_debug(), "Peer debug message");
                Ok(())
            }
            Some(MessageType::Unimplemented) => {
                debug!("Peer reported an unimplemented message");
                Ok(())
            }
            Some(MessageType::KexInit) => self.on_kexinit(&payload).await,
            Some(MessageType::NewKeys) => self.on_newkeys(),
            _ if (30..=49).contains(&msg) => self.on_kex_method(&payload).await,
            _ if msg < 50 && msg != MessageType::ServiceRequest as u8
                && msg != MessageType::ServiceAccept as u8 =>
            {
                debug!(msg, "Unrecognized transport message");
                self.write(&message::unimplemented(sequence)).await
            }
            _ => {
                if !self.established {
                    return Err(FynxError::Protocol(format!(
                        "message {} received before key exchange completed",
                        msg
                    )));
                }
                if self.peer_in_kex {
                    return Err(FynxError::Protocol(format!(
                        "message {} received during key exchange",
                        msg
                    )));
                }
                self.to_handle
                    .send(Ok(payload))
                    .map_err(|_| FynxError::ConnectionClosed)
            }
        }
    }

    async fn on_kexinit(&mut self, payload: &[u8]) -> FynxResult<()> {
        if self.peer_in_kex {
            return Err(FynxError::protocol("duplicate KEXINIT"));
        }
        self.peer_in_kex = true;
        self.start_kex("peer").await?;
        if !self.established {
            self.shared.advance(TransportState::KeyExchange)?;
        }

        let init = match self.kex.as_mut() {
            Some(kex) => kex.handle_kexinit(payload)?,
            None => return Err(FynxError::protocol("KEXINIT outside key exchange")),
        };
        if let Some(init) = init {
            self.write(&init).await?;
        }
        Ok(())
    }

    async fn on_kex_method(&mut self, payload: &[u8]) -> FynxResult<()> {
        let kex = self.kex.as_mut().ok_or_else(|| {
            FynxError::Protocol(format!("message {} outside key exchange", payload[0]))
        })?;
        if kex.discard_guess() {
            debug!(msg = payload[0], "Discarding wrongly guessed kex packet");
            return Ok(());
        }

        let msg = MessageType::from_u8(payload[0]);
        match (&self.identity, msg) {
            (KexIdentity::Server { host_keys }, Some(MessageType::KexEcdhInit)) => {
                let (reply, output) = kex.handle_ecdh_init(payload, host_keys)?;
                self.write(&reply).await?;
                self.activate(output).await
            }
            (KexIdentity::Client { verifier, user }, Some(MessageType::KexEcdhReply)) => {
                let output = kex.handle_ecdh_reply(payload)?;
                let verifier = Arc::clone(verifier);
                let user = user.clone();
                check_host_key(&self.shared, &output, verifier.as_ref(), &user).await?;
                self.activate(output).await
            }
            _ => Err(FynxError::Protocol(format!(
                "unexpected message {} during key exchange",
                payload[0]
            ))),
        }
    }

    async fn activate(&mut self, output: KexOutput) -> FynxResult<()> {
        let sealing = output.sealing_key(self.role)?;
        let opening = output.opening_key(self.role)?;

        self.write(&NEWKEYS).await?;
        self.writer.install(sealing);
        self.sent_newkeys = true;
        self.pending_opening = Some(opening);

        let rekey = self.established;
        let session_id = self
            .shared
            .session_id
            .get_or_init(|| Arc::clone(&output.session_id));
        let fingerprint = output.host_key.fingerprint();
        logging::log_kex_complete(
            self.role,
            session_id,
            &output.negotiated,
            &fingerprint,
            rekey,
        );
        let _ = self.shared.host_key.set(output.host_key);
        self.shared.negotiated.send_replace(Some(output.negotiated));

        if !rekey {
            self.shared.advance(TransportState::NewKeys)?;
        }

        while let Some(payload) = self.pending.pop_front() {
            self.write(&payload).await?;
        }
        Ok(())
    }

    fn on_newkeys(&mut self) -> FynxResult<()> {
        let opening = self
            .pending_opening
            .take()
            .ok_or_else(|| FynxError::protocol("unexpected NEWKEYS"))?;
        self.opening_keys
            .send(opening)
            .map_err(|_| FynxError::ConnectionClosed)?;

        self.peer_in_kex = false;
        self.kex = None;
        self.tracker.reset();
        self.shared.exchanges.fetch_add(1, Ordering::SeqCst);
        if !self.established {
            self.established = true;
            self.shared.advance(TransportState::Encrypted)?;
        }
        for waiter in self.rekey_waiters.drain(..) {
            let _ = waiter.send(());
        }
        Ok(())
    }
}

/// Whether a local failure is reported to the peer with DISCONNECT.
fn notifies_peer(err: &FynxError) -> bool {
    !matches!(
        err,
        FynxError::Disconnected { .. } | FynxError::ConnectionClosed | FynxError::Io(_)
    )
}

fn dropped() -> Disconnect {
    Disconnect::new(disconnect_reason::BY_APPLICATION, "handle dropped")
}

/// Checks the server host key: the trust callback on the first exchange,
/// identity with the first key on every re-exchange.
async fn check_host_key(
    shared: &Shared,
    output: &KexOutput,
    verifier: &dyn HostKeyVerifier,
    user: &str,
) -> FynxResult<()> {
    if let Some(known) = shared.host_key.get() {
        if *known != output.host_key {
            return Err(FynxError::crypto("host key changed during rekey"));
        }
        return Ok(());
    }

    let metadata = shared.metadata(user, Arc::clone(&output.session_id));
    match verifier.verify(&output.host_key, &metadata).await {
        Ok(true) => Ok(()),
        Ok(false) => {
            warn!(host_key = %output.host_key.fingerprint(), "Host key rejected");
            Err(FynxError::crypto("host key rejected"))
        }
        Err(e) => Err(FynxError::callback(e)),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::client::AcceptAnyHostKey;
    use crate::keys::Ed25519Key;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn client_setup(config: TransportConfig) -> TransportSetup {
        TransportSetup {
            identity: KexIdentity::Client {
                verifier: Arc::new(AcceptAnyHostKey),
                user: "test".to_string(),
            },
            config,
            peer_addr: None,
            local_addr: None,
        }
    }

    fn server_setup(config: TransportConfig) -> TransportSetup {
        TransportSetup {
            identity: KexIdentity::Server {
                host_keys: vec![Arc::new(Ed25519Key::generate().unwrap())],
            },
            config,
            peer_addr: None,
            local_addr: None,
        }
    }

    pub(crate) async fn pair(config: TransportConfig) -> (Transport, Transport) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (client, server) = tokio::join!(
            Transport::start(a, client_setup(config.clone())),
            Transport::start(b, server_setup(config))
        );
        let (mut client, mut server) = (client.unwrap(), server.unwrap());
        let (c, s) = tokio::join!(client.wait_established(), server.wait_established());
        c.unwrap();
        s.unwrap();
        (client, server)
    }

    #[test]
    fn test_state_transitions() {
        let mut state = TransportState::VersionExchange;
        for next in [
            TransportState::KexInit,
            TransportState::KeyExchange,
            TransportState::NewKeys,
            TransportState::Encrypted,
            TransportState::ServiceRequested,
            TransportState::Authenticating,
            TransportState::Authenticated,
        ] {
            state.transition(next).unwrap();
        }
        assert!(state.is_encrypted());

        let mut state = TransportState::VersionExchange;
        assert!(matches!(
            state.transition(TransportState::Encrypted),
            Err(FynxError::Protocol(_))
        ));
        assert_eq!(state, TransportState::VersionExchange);
        assert!(!TransportState::Authenticated.can_transition_to(TransportState::KexInit));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rekey_tracker() {
        let mut tracker = RekeyTracker::new(100, Duration::from_secs(60));
        tracker.record_sent(60);
        assert!(!tracker.bytes_exceeded());
        tracker.record_received(100);
        assert!(tracker.bytes_exceeded());
        tracker.reset();
        assert!(!tracker.bytes_exceeded());

        let deadline = tracker.deadline();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(Instant::now() > deadline);
    }

    #[tokio::test]
    async fn test_establish_and_relay() {
        let (mut client, mut server) = pair(TransportConfig::default()).await;
        assert_eq!(client.session_id().unwrap(), server.session_id().unwrap());
        assert_eq!(client.negotiated(), server.negotiated());
        assert_eq!(client.state(), TransportState::Encrypted);
        assert!(client.host_key().is_some());

        client.send(vec![94, 1, 2, 3]).await.unwrap();
        assert_eq!(server.recv().await.unwrap(), Some(vec![94, 1, 2, 3]));
        server.send(vec![5, 0, 0, 0, 0]).await.unwrap();
        assert_eq!(client.recv().await.unwrap(), Some(vec![5, 0, 0, 0, 0]));
    }

    #[tokio::test]
    async fn test_rekey_keeps_session_and_order() {
        let (client, mut server) = pair(TransportConfig::default()).await;
        let session_id = client.session_id().unwrap();

        for i in 0..10u8 {
            client.send(vec![94, i]).await.unwrap();
        }
        let (rekeyed, (), received) = tokio::join!(
            client.rekey(),
            async {
                for i in 10..20u8 {
                    client.send(vec![94, i]).await.unwrap();
                }
            },
            async {
                let mut got = Vec::new();
                for _ in 0..20 {
                    got.push(server.recv().await.unwrap().unwrap()[1]);
                }
                got
            }
        );
        rekeyed.unwrap();
        assert_eq!(received, (0..20).collect::<Vec<u8>>());
        assert_eq!(client.session_id().unwrap(), session_id);
        assert_eq!(server.session_id().unwrap(), session_id);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut client, mut server) = pair(TransportConfig::default()).await;
        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(client.is_closed());
        assert!(matches!(
            client.send(vec![94]).await,
            Err(FynxError::ConnectionClosed)
        ));
        assert_eq!(client.recv().await.unwrap(), None);

        match server.recv().await {
            Err(FynxError::Disconnected { reason, .. }) => {
                assert_eq!(reason, disconnect_reason::BY_APPLICATION)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(server.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_close_during_rekey_delivers_queued_payload() {
        let (client, mut server) = pair(TransportConfig::default()).await;

        let (rekeyed, sent) = tokio::join!(client.rekey(), async {
            tokio::task::yield_now().await;
            client.send(vec![94, 7]).await?;
            client.close().await
        });
        sent.unwrap();
        assert!(matches!(rekeyed, Ok(()) | Err(FynxError::ConnectionClosed)));

        assert_eq!(server.recv().await.unwrap(), Some(vec![94, 7]));
        match server.recv().await {
            Err(FynxError::Disconnected { reason, .. }) => {
                assert_eq!(reason, disconnect_reason::BY_APPLICATION)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rekey_volume_counts_payload_bytes() {
        let config = TransportConfig {
            rekey_bytes_limit: 4096,
            ..TransportConfig::default()
        };
        let (client, mut server) = pair(config).await;
        assert_eq!(server.key_exchanges(), 1);

        // Below the limit as payload, above it once padding and MAC are added.
        let mut payload = vec![0xAB; 4090];
        payload[0] = 94;
        client.send(payload).await.unwrap();
        client.send(vec![94, 1]).await.unwrap();

        assert_eq!(server.recv().await.unwrap().map(|p| p.len()), Some(4090));
        assert_eq!(server.recv().await.unwrap(), Some(vec![94, 1]));
        assert_eq!(server.key_exchanges(), 1);
        assert_eq!(client.key_exchanges(), 1);
    }

    #[tokio::test]
    async fn test_client_skips_banner_lines() {
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        let client = tokio::spawn(Transport::start(a, client_setup(TransportConfig::default())));

        b.write_all(b"Welcome\r\nto the host\r\nSSH-2.0-Peer_1.0\r\n")
            .await
            .unwrap();
        let mut line = vec![0u8; 8];
        b.read_exact(&mut line).await.unwrap();
        assert_eq!(&line, b"SSH-2.0-");

        let transport = client.await.unwrap().unwrap();
        assert_eq!(transport.server_version(), "SSH-2.0-Peer_1.0");
    }

    #[tokio::test]
    async fn test_server_rejects_garbage_version() {
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(Transport::start(a, server_setup(TransportConfig::default())));
        b.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        assert!(matches!(
            server.await.unwrap(),
            Err(FynxError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_payload_limits_checked_before_queueing() {
        let (client, _server) = pair(TransportConfig::default()).await;
        assert!(client.send(Vec::new()).await.is_err());
        assert!(client.send(vec![94; MAX_PAYLOAD_SIZE + 1]).await.is_err());
        client.send(vec![94; MAX_PAYLOAD_SIZE]).await.unwrap();
    }
}
