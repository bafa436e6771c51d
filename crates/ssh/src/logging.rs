//! Structured logging for SSH connections
//!
//! Provides structured, contextual logging using the `tracing` framework.
//! Session identifiers are logged as a short hex prefix and keys only by
//! fingerprint; key material and passwords never reach a log event.
//!
//! # Log Levels
//!
//! - **TRACE**: Packet sequence numbers and lengths
//! - **DEBUG**: Phase transitions, negotiated algorithms, ignored messages
//! - **INFO**: Key exchange completion, authentication results
//! - **WARN**: Disconnects and failed handshakes
//!
//! # Example
//!
//! ```no_run
//! use fynx_ssh::logging;
//!
//! // Initialize tracing subscriber (in tests or applications)
//! tracing_subscriber::fmt()
//!     .with_env_filter("fynx_ssh=debug")
//!     .init();
//!
//! logging::log_auth_attempt("alice", "publickey", Some("SHA256:abc"));
//! ```

use fynx_platform::FynxError;
use tracing::{debug, info, warn};

use crate::kex::{Negotiated, Role};
use crate::transport::TransportState;

/// Prefix of the session identifier used to correlate log events.
pub fn session_tag(session_id: &[u8]) -> String {
    hex::encode(&session_id[..session_id.len().min(8)])
}

/// Log a transport phase change
pub fn log_state_transition(role: Role, from: TransportState, to: TransportState) {
    debug!(
        role = %role,
        state_from = ?from,
        state_to = ?to,
        "Transport state transition"
    );
}

/// Log key exchange completion
///
/// # Arguments
///
/// * `role` - Local role
/// * `session_id` - Session identifier
/// * `negotiated` - Algorithms in effect after this exchange
/// * `host_key` - Fingerprint of the server host key
/// * `rekey` - Whether this was a re-exchange
pub fn log_kex_complete(
    role: Role,
    session_id: &[u8],
    negotiated: &Negotiated,
    host_key: &str,
    rekey: bool,
) {
    info!(
        role = %role,
        session = %session_tag(session_id),
        kex = negotiated.kex.name(),
        host_key_alg = negotiated.host_key.name(),
        host_key = host_key,
        cipher_c2s = negotiated.cipher_client_to_server.name(),
        cipher_s2c = negotiated.cipher_server_to_client.name(),
        mac_c2s = negotiated.mac_client_to_server.map(|m| m.name()),
        mac_s2c = negotiated.mac_server_to_client.map(|m| m.name()),
        rekey = rekey,
        "Key exchange completed"
    );
}

/// Log the start of a re-exchange
///
/// # Arguments
///
/// * `role` - Local role
/// * `reason` - What triggered it: "bytes", "time", "requested" or "peer"
pub fn log_rekey_start(role: Role, reason: &str) {
    info!(role = %role, reason = reason, "Rekey started");
}

/// Log an authentication attempt
pub fn log_auth_attempt(user: &str, method: &str, key_fingerprint: Option<&str>) {
    debug!(
        user = user,
        method = method,
        key = key_fingerprint,
        "Authentication attempt"
    );
}

/// Log an authentication decision
///
/// # Arguments
///
/// * `user` - User name from the request
/// * `method` - Method name
/// * `outcome` - "success", "partial", "failure" or "pk_ok"
/// * `failures` - Failures counted so far on this connection
pub fn log_auth_result(user: &str, method: &str, outcome: &str, failures: u32) {
    info!(
        user = user,
        method = method,
        outcome = outcome,
        failures = failures,
        "Authentication result"
    );
}

/// Log a disconnect, sent or received
pub fn log_disconnect(role: Role, reason: u32, description: &str, sent: bool) {
    warn!(
        role = %role,
        reason = reason,
        description = description,
        direction = if sent { "sent" } else { "received" },
        "Disconnect"
    );
}

/// Log a connection that ended with an error
pub fn log_connection_failed(role: Role, error: &FynxError) {
    warn!(role = %role, error = %error, "Connection failed");
}
