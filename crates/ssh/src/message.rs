//! SSH message numbers and generic transport messages (RFC 4253).
//!
//! # Message Categories
//!
//! - **Transport Layer Generic** (1-19): Disconnect, ignore, debug, service
//! - **Algorithm Negotiation** (20-29): Key exchange initialization
//! - **Key Exchange Method** (30-49): Method-specific messages
//! - **User Authentication** (50-79): Authentication protocol
//! - **Connection Protocol** (80-127): Opaque to this crate, relayed to the channel layer
//!
//! # Example
//!
//! ```rust
//! use fynx_ssh::message::{MessageClass, MessageType};
//!
//! assert_eq!(MessageType::KexInit as u8, 20);
//! assert_eq!(MessageClass::of(94), MessageClass::Connection);
//! ```

use bytes::{BufMut, BytesMut};
use fynx_platform::{FynxError, FynxResult};
use std::fmt;

use crate::wire::{Reader, SshBufMut};

/// SSH message types handled by the transport and authentication layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Disconnect message - terminates the connection.
    Disconnect = 1,
    /// Ignore message - can be used for padding or keep-alive.
    Ignore = 2,
    /// Unimplemented message - response to unknown message type.
    Unimplemented = 3,
    /// Debug message - debugging information.
    Debug = 4,
    /// Service request - request a service (e.g., "ssh-userauth").
    ServiceRequest = 5,
    /// Service accept - service request accepted.
    ServiceAccept = 6,

    /// Key exchange init - algorithm negotiation.
    KexInit = 20,
    /// New keys - signals transition to new keys.
    NewKeys = 21,

    /// ECDH key exchange init (client ephemeral key).
    KexEcdhInit = 30,
    /// ECDH key exchange reply (server host key, ephemeral key, signature).
    KexEcdhReply = 31,

    /// User authentication request.
    UserauthRequest = 50,
    /// User authentication failure.
    UserauthFailure = 51,
    /// User authentication success.
    UserauthSuccess = 52,
    /// User authentication banner.
    UserauthBanner = 53,
    /// Public key OK. Shares its number with `SSH_MSG_USERAUTH_INFO_REQUEST`.
    UserauthPkOk = 60,
    /// Keyboard-interactive response.
    UserauthInfoResponse = 61,
}

impl MessageType {
    /// Keyboard-interactive information request (RFC 4256), number 60.
    pub const USERAUTH_INFO_REQUEST: MessageType = MessageType::UserauthPkOk;

    /// Converts a byte to a message type.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageType::Disconnect),
            2 => Some(MessageType::Ignore),
            3 => Some(MessageType::Unimplemented),
            4 => Some(MessageType::Debug),
            5 => Some(MessageType::ServiceRequest),
            6 => Some(MessageType::ServiceAccept),
            20 => Some(MessageType::KexInit),
            21 => Some(MessageType::NewKeys),
            30 => Some(MessageType::KexEcdhInit),
            31 => Some(MessageType::KexEcdhReply),
            50 => Some(MessageType::UserauthRequest),
            51 => Some(MessageType::UserauthFailure),
            52 => Some(MessageType::UserauthSuccess),
            53 => Some(MessageType::UserauthBanner),
            60 => Some(MessageType::UserauthPkOk),
            61 => Some(MessageType::UserauthInfoResponse),
            _ => None,
        }
    }

    /// Returns the RFC name of the message type.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Disconnect => "SSH_MSG_DISCONNECT",
            MessageType::Ignore => "SSH_MSG_IGNORE",
            MessageType::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            MessageType::Debug => "SSH_MSG_DEBUG",
            MessageType::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            MessageType::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            MessageType::KexInit => "SSH_MSG_KEXINIT",
            MessageType::NewKeys => "SSH_MSG_NEWKEYS",
            MessageType::KexEcdhInit => "SSH_MSG_KEX_ECDH_INIT",
            MessageType::KexEcdhReply => "SSH_MSG_KEX_ECDH_REPLY",
            MessageType::UserauthRequest => "SSH_MSG_USERAUTH_REQUEST",
            MessageType::UserauthFailure => "SSH_MSG_USERAUTH_FAILURE",
            MessageType::UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            MessageType::UserauthBanner => "SSH_MSG_USERAUTH_BANNER",
            MessageType::UserauthPkOk => "SSH_MSG_USERAUTH_PK_OK",
            MessageType::UserauthInfoResponse => "SSH_MSG_USERAUTH_INFO_RESPONSE",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Coarse message ranges from RFC 4250 Section 4.1.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// 1-19: disconnect, ignore, debug, service request
    TransportGeneric,
    /// 20-49: algorithm negotiation and key exchange method messages
    KeyExchange,
    /// 50-79: user authentication
    UserAuth,
    /// 80-127: connection protocol
    Connection,
    /// 128-255 and 0: reserved or client protocols
    Reserved,
}

impl MessageClass {
    /// Classifies a message number.
    pub fn of(msg: u8) -> Self {
        match msg {
            1..=19 => MessageClass::TransportGeneric,
            20..=49 => MessageClass::KeyExchange,
            50..=79 => MessageClass::UserAuth,
            80..=127 => MessageClass::Connection,
            _ => MessageClass::Reserved,
        }
    }

    /// Classifies the first byte of a payload.
    pub fn of_payload(payload: &[u8]) -> Self {
        payload.first().map_or(MessageClass::Reserved, |&b| Self::of(b))
    }
}

/// Disconnect reason codes (RFC 4253 Section 11.1).
#[allow(missing_docs)]
pub mod disconnect_reason {
    pub const HOST_NOT_ALLOWED_TO_CONNECT: u32 = 1;
    pub const PROTOCOL_ERROR: u32 = 2;
    pub const KEY_EXCHANGE_FAILED: u32 = 3;
    pub const MAC_ERROR: u32 = 5;
    pub const SERVICE_NOT_AVAILABLE: u32 = 7;
    pub const PROTOCOL_VERSION_NOT_SUPPORTED: u32 = 8;
    pub const HOST_KEY_NOT_VERIFIABLE: u32 = 9;
    pub const CONNECTION_LOST: u32 = 10;
    pub const BY_APPLICATION: u32 = 11;
    pub const AUTH_CANCELLED_BY_USER: u32 = 13;
    pub const NO_MORE_AUTH_METHODS_AVAILABLE: u32 = 14;
}

/// Maps a local error to the reason code sent in a disconnect message.
///
/// The description stays generic for verification failures.
pub fn disconnect_for(err: &FynxError) -> (u32, &'static str) {
    match err {
        FynxError::Crypto(_) => (disconnect_reason::MAC_ERROR, "verification failed"),
        FynxError::AuthExhausted { .. } => (
            disconnect_reason::NO_MORE_AUTH_METHODS_AVAILABLE,
            "too many authentication failures",
        ),
        FynxError::Timeout(_) => (disconnect_reason::CONNECTION_LOST, "timeout"),
        FynxError::Callback(_) | FynxError::Other(_) => {
            (disconnect_reason::BY_APPLICATION, "internal error")
        }
        _ => (disconnect_reason::PROTOCOL_ERROR, "protocol error"),
    }
}

/// Consumes the message number and checks it.
pub(crate) fn expect_type(r: &mut Reader<'_>, expected: MessageType) -> FynxResult<()> {
    let got = r.read_u8()?;
    if got != expected as u8 {
        return Err(FynxError::protocol(format!(
            "expected {}, got message {}",
            expected, got
        )));
    }
    Ok(())
}

/// SSH_MSG_DISCONNECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Reason code
    pub reason: u32,
    /// Human readable description
    pub description: String,
}

impl Disconnect {
    /// Creates a disconnect message.
    pub fn new(reason: u32, description: impl Into<String>) -> Self {
        Self {
            reason,
            description: description.into(),
        }
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::Disconnect as u8);
        buf.put_u32(self.reason);
        buf.put_string(self.description.as_bytes());
        buf.put_string(b"");
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> FynxResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::Disconnect)?;
        let reason = r.read_u32()?;
        let description = String::from_utf8_lossy(r.read_string()?).into_owned();
        // language tag is optional in practice
        if !r.is_empty() {
            r.read_string()?;
        }
        Ok(Self {
            reason,
            description,
        })
    }

    /// Converts the message into the error surfaced to callers.
    pub fn into_error(self) -> FynxError {
        FynxError::Disconnected {
            reason: self.reason,
            description: self.description,
        }
    }
}

/// SSH_MSG_SERVICE_REQUEST / SSH_MSG_SERVICE_ACCEPT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    /// Which of the two messages this is
    pub kind: MessageType,
    /// Service name, e.g. "ssh-userauth"
    pub name: String,
}

impl Service {
    /// Builds SSH_MSG_SERVICE_REQUEST.
    pub fn request(name: &str) -> Self {
        Self {
            kind: MessageType::ServiceRequest,
            name: name.to_string(),
        }
    }

    /// Builds SSH_MSG_SERVICE_ACCEPT.
    pub fn accept(name: &str) -> Self {
        Self {
            kind: MessageType::ServiceAccept,
            name: name.to_string(),
        }
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(self.kind as u8);
        buf.put_string(self.name.as_bytes());
        buf.to_vec()
    }

    /// Parses a message of the given kind.
    pub fn from_bytes(kind: MessageType, data: &[u8]) -> FynxResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, kind)?;
        let name = r.read_utf8()?.to_string();
        r.finish()?;
        Ok(Self { kind, name })
    }
}

/// SSH_MSG_DEBUG
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugMessage {
    /// Whether the peer asked for the message to be displayed
    pub always_display: bool,
    /// Message text
    pub message: String,
}

impl DebugMessage {
    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> FynxResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::Debug)?;
        let always_display = r.read_bool()?;
        let message = String::from_utf8_lossy(r.read_string()?).into_owned();
        Ok(Self {
            always_display,
            message,
        })
    }
}

/// Builds SSH_MSG_UNIMPLEMENTED for the rejected packet's sequence number.
pub fn unimplemented(sequence: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(MessageType::Unimplemented as u8);
    buf.put_u32(sequence);
    buf.to_vec()
}

/// Builds SSH_MSG_IGNORE carrying `data`.
pub fn ignore(data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(MessageType::Ignore as u8);
    buf.put_string(data);
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
        assert_eq!(MessageType::from_u8(21), Some(MessageType::NewKeys));
        assert_eq!(MessageType::from_u8(60), Some(MessageType::USERAUTH_INFO_REQUEST));
        assert_eq!(MessageType::from_u8(255), None);
    }

    #[test]
    fn test_message_type_display() {
        let msg = MessageType::KexInit;
        assert_eq!(format!("{}", msg), "SSH_MSG_KEXINIT(20)");
    }

    #[test]
    fn test_message_class() {
        assert_eq!(MessageClass::of(2), MessageClass::TransportGeneric);
        assert_eq!(MessageClass::of(21), MessageClass::KeyExchange);
        assert_eq!(MessageClass::of(31), MessageClass::KeyExchange);
        assert_eq!(MessageClass::of(52), MessageClass::UserAuth);
        assert_eq!(MessageClass::of(98), MessageClass::Connection);
        assert_eq!(MessageClass::of(200), MessageClass::Reserved);
        assert_eq!(MessageClass::of_payload(&[]), MessageClass::Reserved);
    }

    #[test]
    fn test_disconnect_parse() {
        let msg = Disconnect::new(disconnect_reason::BY_APPLICATION, "bye");
        let parsed = Disconnect::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(parsed, msg);
        assert!(matches!(
            parsed.into_error(),
            FynxError::Disconnected { reason: 11, .. }
        ));
    }

    #[test]
    fn test_service_wrong_type() {
        let req = Service::request("ssh-userauth").to_bytes();
        assert!(Service::from_bytes(MessageType::ServiceAccept, &req).is_err());
        let parsed = Service::from_bytes(MessageType::ServiceRequest, &req).unwrap();
        assert_eq!(parsed.name, "ssh-userauth");
    }

    #[test]
    fn test_crypto_failures_stay_generic() {
        let (code, text) = disconnect_for(&FynxError::crypto("hmac mismatch at byte 3"));
        assert_eq!(code, disconnect_reason::MAC_ERROR);
        assert!(!text.contains("hmac"));
    }
}
