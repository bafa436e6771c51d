//! SSH user authentication protocol (RFC 4252, RFC 4256).
//!
//! This module holds the messages and types shared by the server engine
//! ([`crate::server_auth`]) and the client engine ([`crate::client_auth`]):
//!
//! - SSH_MSG_USERAUTH_REQUEST with the `none`, `password`, `publickey` and
//!   `keyboard-interactive` methods
//! - SSH_MSG_USERAUTH_FAILURE / SUCCESS / BANNER / PK_OK
//! - SSH_MSG_USERAUTH_INFO_REQUEST / INFO_RESPONSE
//! - Public key signature data, [`Permissions`], [`ConnectionMetadata`] and
//!   [`MethodPolicy`]
//!
//! # Example
//!
//! ```rust
//! use fynx_ssh::auth::{AuthMethod, UserAuthRequest};
//!
//! let request = UserAuthRequest::new("alice", AuthMethod::password("secret"));
//! let bytes = request.to_bytes();
//! assert_eq!(bytes[0], 50);
//!
//! let parsed = UserAuthRequest::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed.user, "alice");
//! assert_eq!(parsed.method.name(), "password");
//! ```

use bytes::{BufMut, BytesMut};
use fynx_platform::{FynxError, FynxResult};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::kex::Role;
use crate::message::{expect_type, MessageType};
use crate::wire::{Reader, SshBufMut};

/// Service requested before authentication.
pub const SERVICE_USERAUTH: &str = "ssh-userauth";

/// Service requested in every USERAUTH_REQUEST.
pub const SERVICE_CONNECTION: &str = "ssh-connection";

/// Method names in the order the server advertises them.
pub const METHOD_NONE: &str = "none";
/// `password`
pub const METHOD_PASSWORD: &str = "password";
/// `publickey`
pub const METHOD_PUBLICKEY: &str = "publickey";
/// `keyboard-interactive`
pub const METHOD_KEYBOARD_INTERACTIVE: &str = "keyboard-interactive";

/// Method-specific part of a USERAUTH_REQUEST.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// `none`: asks which methods can continue
    None,
    /// `password`
    Password {
        /// Password
        password: Zeroizing<String>,
        /// Requested new password; changes are not supported and fail
        new_password: Option<Zeroizing<String>>,
    },
    /// `publickey`, either a query (no signature) or a signed request
    PublicKey {
        /// Public key algorithm name
        algorithm: String,
        /// Public key blob
        blob: Vec<u8>,
        /// Signature blob; `None` for a query
        signature: Option<Vec<u8>>,
    },
    /// `keyboard-interactive`
    KeyboardInteractive {
        /// Language tag (deprecated, usually empty)
        language: String,
        /// Submethod hints
        submethods: String,
    },
    /// Any other method name; the body is not parsed
    Other(String),
}

impl AuthMethod {
    /// Password request without a change.
    pub fn password(password: &str) -> Self {
        AuthMethod::Password {
            password: Zeroizing::new(password.to_string()),
            new_password: None,
        }
    }

    /// Method name on the wire.
    pub fn name(&self) -> &str {
        match self {
            AuthMethod::None => METHOD_NONE,
            AuthMethod::Password { .. } => METHOD_PASSWORD,
            AuthMethod::PublicKey { .. } => METHOD_PUBLICKEY,
            AuthMethod::KeyboardInteractive { .. } => METHOD_KEYBOARD_INTERACTIVE,
            AuthMethod::Other(name) => name,
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::None => f.write_str("None"),
            AuthMethod::Password { new_password, .. } => f
                .debug_struct("Password")
                .field("password", &"[REDACTED]")
                .field("change", &new_password.is_some())
                .finish(),
            AuthMethod::PublicKey {
                algorithm,
                signature,
                ..
            } => f
                .debug_struct("PublicKey")
                .field("algorithm", algorithm)
                .field("signed", &signature.is_some())
                .finish_non_exhaustive(),
            AuthMethod::KeyboardInteractive { submethods, .. } => f
                .debug_struct("KeyboardInteractive")
                .field("submethods", submethods)
                .finish_non_exhaustive(),
            AuthMethod::Other(name) => f.debug_tuple("Other").field(name).finish(),
        }
    }
}

/// SSH_MSG_USERAUTH_REQUEST (RFC 4252 Section 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAuthRequest {
    /// User name
    pub user: String,
    /// Service to start after authentication
    pub service: String,
    /// Method and credential
    pub method: AuthMethod,
}

impl UserAuthRequest {
    /// Request for the `ssh-connection` service.
    pub fn new(user: &str, method: AuthMethod) -> Self {
        Self {
            user: user.to_string(),
            service: SERVICE_CONNECTION.to_string(),
            method,
        }
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthRequest as u8);
        buf.put_string(self.user.as_bytes());
        buf.put_string(self.service.as_bytes());
        buf.put_string(self.method.name().as_bytes());

        match &self.method {
            AuthMethod::None | AuthMethod::Other(_) => {}
            AuthMethod::Password {
                password,
                new_password,
            } => {
                buf.put_bool(new_password.is_some());
                buf.put_string(password.as_bytes());
                if let Some(new) = new_password {
                    buf.put_string(new.as_bytes());
                }
            }
            AuthMethod::PublicKey {
                algorithm,
                blob,
                signature,
            } => {
                buf.put_bool(signature.is_some());
                buf.put_string(algorithm.as_bytes());
                buf.put_string(blob);
                if let Some(sig) = signature {
                    buf.put_string(sig);
                }
            }
            AuthMethod::KeyboardInteractive {
                language,
                submethods,
            } => {
                buf.put_string(language.as_bytes());
                buf.put_string(submethods.as_bytes());
            }
        }

        let bytes = buf.to_vec();
        zeroize::Zeroize::zeroize(&mut buf[..]);
        bytes
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> FynxResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::UserauthRequest)?;
        let user = r.read_utf8()?.to_string();
        let service = r.read_utf8()?.to_string();
        let method_name = r.read_utf8()?;

        let method = match method_name {
            METHOD_NONE => AuthMethod::None,
            METHOD_PASSWORD => {
                let change = r.read_bool()?;
                let password = Zeroizing::new(r.read_utf8()?.to_string());
                let new_password = if change {
                    Some(Zeroizing::new(r.read_utf8()?.to_string()))
                } else {
                    None
                };
                AuthMethod::Password {
                    password,
                    new_password,
                }
            }
            METHOD_PUBLICKEY => {
                let signed = r.read_bool()?;
                let algorithm = r.read_utf8()?.to_string();
                let blob = r.read_string()?.to_vec();
                let signature = if signed {
                    Some(r.read_string()?.to_vec())
                } else {
                    None
                };
                AuthMethod::PublicKey {
                    algorithm,
                    blob,
                    signature,
                }
            }
            METHOD_KEYBOARD_INTERACTIVE => AuthMethod::KeyboardInteractive {
                language: r.read_utf8()?.to_string(),
                submethods: r.read_utf8()?.to_string(),
            },
            other => {
                let name = other.to_string();
                r.rest();
                AuthMethod::Other(name)
            }
        };
        r.finish()?;

        Ok(Self {
            user,
            service,
            method,
        })
    }
}

/// SSH_MSG_USERAUTH_FAILURE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAuthFailure {
    /// Methods that can continue
    pub methods: Vec<String>,
    /// The request succeeded but more methods are required
    pub partial_success: bool,
}

impl UserAuthFailure {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthFailure as u8);
        buf.put_name_list(&self.methods);
        buf.put_bool(self.partial_success);
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> FynxResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::UserauthFailure)?;
        let methods = r.read_name_list()?;
        let partial_success = r.read_bool()?;
        r.finish()?;
        Ok(Self {
            methods,
            partial_success,
        })
    }
}

/// SSH_MSG_USERAUTH_SUCCESS payload.
pub const USERAUTH_SUCCESS: [u8; 1] = [MessageType::UserauthSuccess as u8];

/// SSH_MSG_USERAUTH_BANNER.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAuthBanner {
    /// Text to display
    pub message: String,
    /// Language tag
    pub language: String,
}

impl UserAuthBanner {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthBanner as u8);
        buf.put_string(self.message.as_bytes());
        buf.put_string(self.language.as_bytes());
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> FynxResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::UserauthBanner)?;
        let message = r.read_utf8()?.to_string();
        let language = r.read_utf8()?.to_string();
        r.finish()?;
        Ok(Self { message, language })
    }
}

/// SSH_MSG_USERAUTH_PK_OK: the queried key would be accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAuthPkOk {
    /// Algorithm from the query
    pub algorithm: String,
    /// Key blob from the query
    pub blob: Vec<u8>,
}

impl UserAuthPkOk {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthPkOk as u8);
        buf.put_string(self.algorithm.as_bytes());
        buf.put_string(&self.blob);
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> FynxResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::UserauthPkOk)?;
        let algorithm = r.read_utf8()?.to_string();
        let blob = r.read_string()?.to_vec();
        r.finish()?;
        Ok(Self { algorithm, blob })
    }
}

/// One keyboard-interactive prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// Prompt text
    pub prompt: String,
    /// Whether the answer may be echoed
    pub echo: bool,
}

impl Prompt {
    /// Creates a prompt.
    pub fn new(prompt: impl Into<String>, echo: bool) -> Self {
        Self {
            prompt: prompt.into(),
            echo,
        }
    }
}

/// SSH_MSG_USERAUTH_INFO_REQUEST (RFC 4256 Section 3.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoRequest {
    /// Title
    pub name: String,
    /// Instruction text
    pub instruction: String,
    /// Language tag
    pub language: String,
    /// Questions
    pub prompts: Vec<Prompt>,
}

impl InfoRequest {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::USERAUTH_INFO_REQUEST as u8);
        buf.put_string(self.name.as_bytes());
        buf.put_string(self.instruction.as_bytes());
        buf.put_string(self.language.as_bytes());
        buf.put_u32(self.prompts.len() as u32);
        for prompt in &self.prompts {
            buf.put_string(prompt.prompt.as_bytes());
            buf.put_bool(prompt.echo);
        }
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> FynxResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::USERAUTH_INFO_REQUEST)?;
        let name = r.read_utf8()?.to_string();
        let instruction = r.read_utf8()?.to_string();
        let language = r.read_utf8()?.to_string();
        let count = r.read_u32()? as usize;
        // Each prompt takes at least five bytes.
        if count > r.remaining() / 5 {
            return Err(FynxError::protocol("too many keyboard-interactive prompts"));
        }
        let mut prompts = Vec::with_capacity(count);
        for _ in 0..count {
            let prompt = r.read_utf8()?.to_string();
            let echo = r.read_bool()?;
            prompts.push(Prompt { prompt, echo });
        }
        r.finish()?;
        Ok(Self {
            name,
            instruction,
            language,
            prompts,
        })
    }
}

/// SSH_MSG_USERAUTH_INFO_RESPONSE.
#[derive(Clone, PartialEq, Eq)]
pub struct InfoResponse {
    /// One answer per prompt
    pub responses: Vec<Zeroizing<String>>,
}

impl fmt::Debug for InfoResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfoResponse")
            .field("responses", &self.responses.len())
            .finish()
    }
}

impl InfoResponse {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthInfoResponse as u8);
        buf.put_u32(self.responses.len() as u32);
        for response in &self.responses {
            buf.put_string(response.as_bytes());
        }
        let bytes = buf.to_vec();
        zeroize::Zeroize::zeroize(&mut buf[..]);
        bytes
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> FynxResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::UserauthInfoResponse)?;
        let count = r.read_u32()? as usize;
        if count > r.remaining() / 4 {
            return Err(FynxError::protocol("too many keyboard-interactive responses"));
        }
        let mut responses = Vec::with_capacity(count);
        for _ in 0..count {
            responses.push(Zeroizing::new(r.read_utf8()?.to_string()));
        }
        r.finish()?;
        Ok(Self { responses })
    }
}

/// Data signed by the client for `publickey` (RFC 4252 Section 7).
///
/// ```text
/// string    session identifier
/// byte      SSH_MSG_USERAUTH_REQUEST
/// string    user name
/// string    service name
/// string    "publickey"
/// boolean   TRUE
/// string    public key algorithm name
/// string    public key blob
/// ```
pub fn construct_signature_data(
    session_id: &[u8],
    user: &str,
    service: &str,
    algorithm: &str,
    blob: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_string(session_id);
    buf.put_u8(MessageType::UserauthRequest as u8);
    buf.put_string(user.as_bytes());
    buf.put_string(service.as_bytes());
    buf.put_string(METHOD_PUBLICKEY.as_bytes());
    buf.put_bool(true);
    buf.put_string(algorithm.as_bytes());
    buf.put_string(blob);
    buf.to_vec()
}

/// Attributes attached to a successful authentication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Permissions {
    /// Options the channel layer must understand or refuse the session
    pub critical_options: HashMap<String, String>,
    /// Informational extensions
    pub extensions: HashMap<String, String>,
}

impl Permissions {
    /// Adds a critical option.
    pub fn with_critical_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.critical_options.insert(key.into(), value.into());
        self
    }

    /// Adds an extension.
    pub fn with_extension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extensions.insert(key.into(), value.into());
        self
    }

    /// Accumulates permissions across partial successes.
    pub(crate) fn merge(&mut self, other: Permissions) {
        self.critical_options.extend(other.critical_options);
        self.extensions.extend(other.extensions);
    }
}

/// Connection facts passed to every callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionMetadata {
    /// User name from the request (empty before authentication starts)
    pub user: String,
    /// Session identifier
    pub session_id: Arc<[u8]>,
    /// Client identification string
    pub client_version: String,
    /// Server identification string
    pub server_version: String,
    /// Local role
    pub role: Role,
    /// Remote socket address, if known
    pub peer_addr: Option<SocketAddr>,
    /// Local socket address, if known
    pub local_addr: Option<SocketAddr>,
}

impl ConnectionMetadata {
    /// Copy with the user name replaced.
    pub fn with_user(&self, user: &str) -> Self {
        let mut metadata = self.clone();
        metadata.user = user.to_string();
        metadata
    }
}

/// Which method combinations grant access.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MethodPolicy {
    /// Any single successful method grants access
    #[default]
    AnySingle,
    /// Access requires every method of at least one combination
    Combinations(Vec<Vec<String>>),
}

impl MethodPolicy {
    /// One combination that requires all of `methods`.
    pub fn require_all<S: AsRef<str>>(methods: &[S]) -> Self {
        MethodPolicy::Combinations(vec![methods
            .iter()
            .map(|m| m.as_ref().to_string())
            .collect()])
    }

    /// Checks every combination names only enabled methods.
    pub fn validate(&self, enabled: &[&str]) -> FynxResult<()> {
        if let MethodPolicy::Combinations(combinations) = self {
            if combinations.is_empty() || combinations.iter().any(|c| c.is_empty()) {
                return Err(FynxError::Config(
                    "method policy has an empty combination".to_string(),
                ));
            }
            for method in combinations.iter().flatten() {
                if !enabled.contains(&method.as_str()) {
                    return Err(FynxError::Config(format!(
                        "method policy names {} but no callback is registered for it",
                        method
                    )));
                }
            }
        }
        Ok(())
    }

    /// Whether the succeeded methods complete some combination.
    pub fn is_satisfied(&self, succeeded: &BTreeSet<String>) -> bool {
        match self {
            MethodPolicy::AnySingle => !succeeded.is_empty(),
            MethodPolicy::Combinations(combinations) => combinations
                .iter()
                .any(|c| c.iter().all(|m| succeeded.contains(m))),
        }
    }

    /// Enabled methods that can still contribute to access, in `enabled`
    /// order.
    pub fn remaining(&self, succeeded: &BTreeSet<String>, enabled: &[&str]) -> Vec<String> {
        enabled
            .iter()
            .filter(|m| !succeeded.contains(**m))
            .filter(|m| match self {
                MethodPolicy::AnySingle => true,
                MethodPolicy::Combinations(combinations) => {
                    combinations.iter().flatten().any(|c| c == **m)
                }
            })
            .map(|m| m.to_string())
            .collect()
    }
}
