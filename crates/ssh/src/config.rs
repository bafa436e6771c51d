//! SSH Client and Server Configuration
//!
//! Provides configuration structures and builder patterns for
//! [`client::connect`](crate::client::connect) and
//! [`server::accept`](crate::server::accept).
//!
//! # Example
//!
//! ```rust
//! use fynx_ssh::config::{ClientConfig, ServerConfig};
//! use fynx_ssh::client::AcceptAnyHostKey;
//! use fynx_ssh::keys::Ed25519Key;
//! use std::sync::Arc;
//!
//! let client = ClientConfig::builder("alice")
//!     .with_password("hunter2")
//!     .with_host_key_verifier(Arc::new(AcceptAnyHostKey))
//!     .build()
//!     .unwrap();
//! assert_eq!(client.user, "alice");
//!
//! let server = ServerConfig::builder()
//!     .with_host_key(Arc::new(Ed25519Key::generate().unwrap()))
//!     .with_no_client_auth(true)
//!     .build()
//!     .unwrap();
//! assert_eq!(server.max_auth_attempts, 6);
//! ```

use fynx_platform::{FynxError, FynxResult};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

use crate::auth::{MethodPolicy, METHOD_KEYBOARD_INTERACTIVE, METHOD_PASSWORD, METHOD_PUBLICKEY};
use crate::client::HostKeyVerifier;
use crate::client_auth::{BannerHandler, ClientAuthMethod, KeyboardInteractiveResponder};
use crate::kex::AlgorithmPreferences;
use crate::keys::Signer;
use crate::server_auth::{KeyboardInteractiveCallback, PasswordCallback, PublicKeyCallback};
use crate::version::Version;

/// Default volume after which keys are renegotiated (1 GiB).
pub const DEFAULT_REKEY_BYTES: u64 = 1 << 30;

/// Default interval after which keys are renegotiated.
pub const DEFAULT_REKEY_TIME: Duration = Duration::from_secs(3600);

/// Default bound on version exchange plus the first key exchange.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on the authentication phase.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(120);

/// Default number of failed authentication attempts per connection.
pub const DEFAULT_MAX_AUTH_ATTEMPTS: u32 = 6;

/// Default bound on payloads held during a key exchange.
pub const DEFAULT_MAX_PENDING_PACKETS: usize = 1024;

/// Settings shared by both roles.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Local identification string
    pub version: Version,

    /// Offered algorithms, most preferred first
    pub algorithms: AlgorithmPreferences,

    /// Bytes in either direction before a re-exchange
    pub rekey_bytes_limit: u64,

    /// Time between re-exchanges
    pub rekey_time_limit: Duration,

    /// Bound on connecting: version exchange, key exchange and, on the
    /// client, authentication
    pub handshake_timeout: Duration,

    /// Payloads that may wait for a key exchange to finish
    pub max_pending_packets: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            version: Version::default_fynx(),
            algorithms: AlgorithmPreferences::default(),
            rekey_bytes_limit: DEFAULT_REKEY_BYTES,
            rekey_time_limit: DEFAULT_REKEY_TIME,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_pending_packets: DEFAULT_MAX_PENDING_PACKETS,
        }
    }
}

impl TransportConfig {
    /// Validate configuration
    pub fn validate(&self) -> FynxResult<()> {
        self.algorithms.validate()?;
        if self.rekey_bytes_limit == 0 {
            return Err(FynxError::Config(
                "rekey_bytes_limit must be positive".into(),
            ));
        }
        if self.rekey_time_limit.is_zero() {
            return Err(FynxError::Config(
                "rekey_time_limit must be positive".into(),
            ));
        }
        if self.handshake_timeout.is_zero() {
            return Err(FynxError::Config(
                "handshake_timeout must be positive".into(),
            ));
        }
        if self.max_pending_packets == 0 {
            return Err(FynxError::Config(
                "max_pending_packets must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Client configuration
#[derive(Clone)]
pub struct ClientConfig {
    /// User to authenticate as
    pub user: String,

    /// Methods to try, in order
    pub methods: Vec<ClientAuthMethod>,

    /// Server host key trust decision
    pub host_key_verifier: Arc<dyn HostKeyVerifier>,

    /// Receives USERAUTH_BANNER text
    pub banner_handler: Option<Arc<dyn BannerHandler>>,

    /// Transport settings
    pub transport: TransportConfig,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("user", &self.user)
            .field("methods", &self.methods)
            .field("banner_handler", &self.banner_handler.is_some())
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl ClientConfig {
    /// Create builder for client configuration
    pub fn builder(user: impl Into<String>) -> ClientConfigBuilder {
        ClientConfigBuilder::new(user)
    }

    /// Validate configuration
    pub fn validate(&self) -> FynxResult<()> {
        if self.user.is_empty() {
            return Err(FynxError::Config("user cannot be empty".into()));
        }
        for method in &self.methods {
            if let ClientAuthMethod::PublicKeys(keys) = method {
                if keys.is_empty() {
                    return Err(FynxError::Config(
                        "publickey method needs at least one key".into(),
                    ));
                }
            }
        }
        self.transport.validate()
    }
}

/// Builder for [`ClientConfig`]
pub struct ClientConfigBuilder {
    user: String,
    methods: Vec<ClientAuthMethod>,
    host_key_verifier: Option<Arc<dyn HostKeyVerifier>>,
    banner_handler: Option<Arc<dyn BannerHandler>>,
    transport: Option<TransportConfig>,
}

impl ClientConfigBuilder {
    /// Create new client builder
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            methods: Vec::new(),
            host_key_verifier: None,
            banner_handler: None,
            transport: None,
        }
    }

    /// Add password authentication
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.methods
            .push(ClientAuthMethod::Password(Zeroizing::new(password.into())));
        self
    }

    /// Add public key authentication with the given keys, tried in order
    pub fn with_public_keys(mut self, keys: Vec<Arc<dyn Signer>>) -> Self {
        self.methods.push(ClientAuthMethod::PublicKeys(keys));
        self
    }

    /// Add keyboard-interactive authentication
    pub fn with_keyboard_interactive(
        mut self,
        responder: Arc<dyn KeyboardInteractiveResponder>,
    ) -> Self {
        self.methods
            .push(ClientAuthMethod::KeyboardInteractive(responder));
        self
    }

    /// Set host key trust decision (required)
    pub fn with_host_key_verifier(mut self, verifier: Arc<dyn HostKeyVerifier>) -> Self {
        self.host_key_verifier = Some(verifier);
        self
    }

    /// Set banner handler
    pub fn with_banner_handler(mut self, handler: Arc<dyn BannerHandler>) -> Self {
        self.banner_handler = Some(handler);
        self
    }

    /// Set transport settings
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build client configuration
    pub fn build(self) -> FynxResult<ClientConfig> {
        let config = ClientConfig {
            user: self.user,
            methods: self.methods,
            host_key_verifier: self
                .host_key_verifier
                .ok_or_else(|| FynxError::Config("host_key_verifier is required".into()))?,
            banner_handler: self.banner_handler,
            transport: self.transport.unwrap_or_default(),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Server configuration
#[derive(Clone)]
pub struct ServerConfig {
    /// Host keys, at most one per algorithm
    pub host_keys: Vec<Arc<dyn Signer>>,

    /// Decides publickey requests
    pub public_key_callback: Option<Arc<dyn PublicKeyCallback>>,

    /// Decides password requests
    pub password_callback: Option<Arc<dyn PasswordCallback>>,

    /// Drives keyboard-interactive exchanges
    pub keyboard_interactive_callback: Option<Arc<dyn KeyboardInteractiveCallback>>,

    /// Failed attempts before the connection is dropped
    pub max_auth_attempts: u32,

    /// Method combinations that grant access
    pub method_policy: MethodPolicy,

    /// Sent once before the first authentication response
    pub banner: Option<String>,

    /// Accept the `none` method
    pub no_client_auth: bool,

    /// Bound on the authentication phase
    pub auth_timeout: Duration,

    /// Transport settings
    pub transport: TransportConfig,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host_keys: Vec<_> = self.host_keys.iter().map(|k| k.public_key()).collect();
        f.debug_struct("ServerConfig")
            .field("host_keys", &host_keys)
            .field("methods", &self.enabled_methods())
            .field("max_auth_attempts", &self.max_auth_attempts)
            .field("method_policy", &self.method_policy)
            .field("no_client_auth", &self.no_client_auth)
            .field("auth_timeout", &self.auth_timeout)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl ServerConfig {
    /// Create builder for server configuration
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    /// Methods with a registered callback, in advertisement order.
    pub fn enabled_methods(&self) -> Vec<&'static str> {
        let mut methods = Vec::new();
        if self.public_key_callback.is_some() {
            methods.push(METHOD_PUBLICKEY);
        }
        if self.password_callback.is_some() {
            methods.push(METHOD_PASSWORD);
        }
        if self.keyboard_interactive_callback.is_some() {
            methods.push(METHOD_KEYBOARD_INTERACTIVE);
        }
        methods
    }

    /// Validate configuration
    pub fn validate(&self) -> FynxResult<()> {
        if self.host_keys.is_empty() {
            return Err(FynxError::Config("At least one host key required".into()));
        }
        let mut seen = Vec::new();
        for key in &self.host_keys {
            let algorithm = key.algorithm();
            if seen.contains(&algorithm) {
                return Err(FynxError::Config(format!(
                    "duplicate {} host key",
                    algorithm.name()
                )));
            }
            seen.push(algorithm);
        }
        if self.max_auth_attempts == 0 {
            return Err(FynxError::Config(
                "max_auth_attempts must be positive".into(),
            ));
        }
        if self.auth_timeout.is_zero() {
            return Err(FynxError::Config("auth_timeout must be positive".into()));
        }

        let enabled = self.enabled_methods();
        if enabled.is_empty() && !self.no_client_auth {
            return Err(FynxError::Config(
                "no authentication callback registered and no_client_auth is off".into(),
            ));
        }
        self.method_policy.validate(&enabled)?;
        self.transport.validate()
    }
}

/// Builder for [`ServerConfig`]
#[derive(Default)]
pub struct ServerConfigBuilder {
    host_keys: Vec<Arc<dyn Signer>>,
    public_key_callback: Option<Arc<dyn PublicKeyCallback>>,
    password_callback: Option<Arc<dyn PasswordCallback>>,
    keyboard_interactive_callback: Option<Arc<dyn KeyboardInteractiveCallback>>,
    max_auth_attempts: Option<u32>,
    method_policy: Option<MethodPolicy>,
    banner: Option<String>,
    no_client_auth: bool,
    auth_timeout: Option<Duration>,
    transport: Option<TransportConfig>,
}

impl ServerConfigBuilder {
    /// Create new server builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a host key
    pub fn with_host_key(mut self, key: Arc<dyn Signer>) -> Self {
        self.host_keys.push(key);
        self
    }

    /// Enable publickey authentication
    pub fn with_public_key_callback(mut self, callback: Arc<dyn PublicKeyCallback>) -> Self {
        self.public_key_callback = Some(callback);
        self
    }

    /// Enable password authentication
    pub fn with_password_callback(mut self, callback: Arc<dyn PasswordCallback>) -> Self {
        self.password_callback = Some(callback);
        self
    }

    /// Enable keyboard-interactive authentication
    pub fn with_keyboard_interactive_callback(
        mut self,
        callback: Arc<dyn KeyboardInteractiveCallback>,
    ) -> Self {
        self.keyboard_interactive_callback = Some(callback);
        self
    }

    /// Set failed attempt cap
    pub fn with_max_auth_attempts(mut self, attempts: u32) -> Self {
        self.max_auth_attempts = Some(attempts);
        self
    }

    /// Set method policy
    pub fn with_method_policy(mut self, policy: MethodPolicy) -> Self {
        self.method_policy = Some(policy);
        self
    }

    /// Set banner text
    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.banner = Some(banner.into());
        self
    }

    /// Accept the `none` method
    pub fn with_no_client_auth(mut self, enabled: bool) -> Self {
        self.no_client_auth = enabled;
        self
    }

    /// Set authentication phase timeout
    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = Some(timeout);
        self
    }

    /// Set transport settings
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build server configuration
    pub fn build(self) -> FynxResult<ServerConfig> {
        let config = ServerConfig {
            host_keys: self.host_keys,
            public_key_callback: self.public_key_callback,
            password_callback: self.password_callback,
            keyboard_interactive_callback: self.keyboard_interactive_callback,
            max_auth_attempts: self.max_auth_attempts.unwrap_or(DEFAULT_MAX_AUTH_ATTEMPTS),
            method_policy: self.method_policy.unwrap_or_default(),
            banner: self.banner,
            no_client_auth: self.no_client_auth,
            auth_timeout: self.auth_timeout.unwrap_or(DEFAULT_AUTH_TIMEOUT),
            transport: self.transport.unwrap_or_default(),
        };

        config.validate()?;
        Ok(config)
    }
}
