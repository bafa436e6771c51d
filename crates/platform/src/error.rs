//! Error types for Fynx

use std::fmt;

/// Unified error type for all Fynx operations
#[derive(Debug)]
pub enum FynxError {
    /// I/O error on the underlying byte stream
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Protocol violation: malformed framing, out-of-state message, decode failure
    Protocol(String),

    /// Cryptographic verification failure: MAC mismatch, bad signature,
    /// rejected host key
    Crypto(String),

    /// Security error raised outside of packet verification (key handling)
    Security(String),

    /// A credential was evaluated and not accepted
    AuthRejected(String),

    /// Authentication cannot continue
    AuthExhausted {
        /// Methods that were attempted before giving up
        attempted: Vec<String>,
    },

    /// An external callback failed with something other than a rejection
    Callback(Box<dyn std::error::Error + Send + Sync>),

    /// The peer sent a disconnect message
    Disconnected {
        /// Disconnect reason code
        reason: u32,
        /// Human readable description sent by the peer
        description: String,
    },

    /// The connection was closed locally or the stream reached end of file
    ConnectionClosed,

    /// Operation timed out
    Timeout(String),

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl FynxError {
    /// Shorthand for [`FynxError::Protocol`]
    pub fn protocol(msg: impl Into<String>) -> Self {
        FynxError::Protocol(msg.into())
    }

    /// Shorthand for [`FynxError::Crypto`]
    pub fn crypto(msg: impl Into<String>) -> Self {
        FynxError::Crypto(msg.into())
    }

    /// Wraps an arbitrary callback failure
    pub fn callback<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        FynxError::Callback(err.into())
    }

    /// Whether the error must terminate the connection.
    ///
    /// Only [`FynxError::AuthRejected`] is recoverable: the client may try
    /// another credential.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FynxError::AuthRejected(_))
    }
}

impl fmt::Display for FynxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FynxError::Io(e) => write!(f, "IO error: {}", e),
            FynxError::Config(msg) => write!(f, "Configuration error: {}", msg),
            FynxError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            FynxError::Crypto(msg) => write!(f, "Crypto verification failed: {}", msg),
            FynxError::Security(msg) => write!(f, "Security error: {}", msg),
            FynxError::AuthRejected(msg) => write!(f, "Authentication rejected: {}", msg),
            FynxError::AuthExhausted { attempted } => write!(
                f,
                "Unable to authenticate, attempted methods [{}], no supported methods remain",
                attempted.join(", ")
            ),
            FynxError::Callback(e) => write!(f, "Callback error: {}", e),
            FynxError::Disconnected {
                reason,
                description,
            } => write!(f, "Disconnected by peer (reason {}): {}", reason, description),
            FynxError::ConnectionClosed => write!(f, "Connection closed"),
            FynxError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            FynxError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for FynxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FynxError::Io(e) => Some(e),
            FynxError::Callback(e) => Some(e.as_ref()),
            FynxError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FynxError {
    fn from(err: std::io::Error) -> Self {
        FynxError::Io(err)
    }
}

/// Result type for Fynx operations
pub type FynxResult<T> = Result<T, FynxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FynxError::Config("Invalid configuration".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid configuration"
        );
    }

    #[test]
    fn test_exhausted_display_names_methods() {
        let err = FynxError::AuthExhausted {
            attempted: vec!["publickey".to_string(), "password".to_string()],
        };
        let text = err.to_string();
        assert!(text.contains("publickey, password"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let fynx_err: FynxError = io_err.into();
        assert!(matches!(fynx_err, FynxError::Io(_)));
    }

    #[test]
    fn test_fatality() {
        assert!(!FynxError::AuthRejected("nope".into()).is_fatal());
        assert!(FynxError::protocol("bad").is_fatal());
        assert!(FynxError::crypto("bad mac").is_fatal());
        assert!(FynxError::AuthExhausted { attempted: vec![] }.is_fatal());
        assert!(FynxError::callback("boom").is_fatal());
    }

    #[test]
    fn test_callback_source() {
        use std::error::Error;
        let err = FynxError::callback("revocation list unavailable");
        assert!(err.source().is_some());
    }

    #[test]
    fn test_result_type() {
        fn example() -> FynxResult<i32> {
            Ok(42)
        }

        assert_eq!(example().unwrap(), 42);
    }
}
