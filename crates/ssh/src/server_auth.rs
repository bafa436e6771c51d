//! Server side of SSH user authentication (RFC 4252, RFC 4256).
//!
//! The engine answers authentication requests by asking the callback
//! registered for each method. A method without a callback is neither
//! advertised nor accepted.
//!
//! # Public Key Authentication
//!
//! A client may query a key without signing (the "try" phase); the server
//! answers SSH_MSG_USERAUTH_PK_OK when the key would be accepted. The
//! callback decision for each (user, key) pair is cached for the rest of the
//! connection, so a query followed by a signed request reaches the callback
//! once. Signatures are verified before the callback is consulted.
//!
//! # Attempt Cap
//!
//! Every failure reply except the one to `none` counts as an attempt. On
//! reaching `max_auth_attempts` the server disconnects with
//! `NO_MORE_AUTH_METHODS_AVAILABLE` instead of replying.

use async_trait::async_trait;
use fynx_platform::{FynxError, FynxResult};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::auth::{
    construct_signature_data, AuthMethod, ConnectionMetadata, InfoRequest, InfoResponse,
    Permissions, Prompt, UserAuthBanner, UserAuthFailure, UserAuthPkOk, UserAuthRequest,
    METHOD_NONE, METHOD_PUBLICKEY, SERVICE_CONNECTION, SERVICE_USERAUTH, USERAUTH_SUCCESS,
};
use crate::config::ServerConfig;
use crate::keys::PublicKey;
use crate::logging;
use crate::message::{MessageType, Service};
use crate::transport::{Transport, TransportState};

/// Decides publickey requests.
///
/// Called at most once per distinct key and user on a connection; keys
/// compare by their encoded form.
///
/// Decisions are cached per (user, key) pair, not per key. A client that
/// offers the same key under a different user name reaches the callback
/// again, since the metadata it sees names the new user.
#[async_trait]
pub trait PublicKeyCallback: Send + Sync {
    /// Returns permissions for an acceptable key, or
    /// [`FynxError::AuthRejected`].
    async fn check(
        &self,
        metadata: &ConnectionMetadata,
        key: &PublicKey,
    ) -> FynxResult<Permissions>;
}

/// Decides password requests.
#[async_trait]
pub trait PasswordCallback: Send + Sync {
    /// Returns permissions for a correct password, or
    /// [`FynxError::AuthRejected`].
    async fn check(&self, metadata: &ConnectionMetadata, password: &str)
        -> FynxResult<Permissions>;
}

/// Asks the client questions during keyboard-interactive authentication.
#[async_trait]
pub trait Challenger: Send {
    /// Sends one round of prompts and returns the answers in prompt order.
    async fn ask(
        &mut self,
        name: &str,
        instruction: &str,
        prompts: &[Prompt],
    ) -> FynxResult<Vec<Zeroizing<String>>>;
}

/// Drives keyboard-interactive authentication.
#[async_trait]
pub trait KeyboardInteractiveCallback: Send + Sync {
    /// Runs any number of question rounds through `challenger`.
    async fn challenge(
        &self,
        metadata: &ConnectionMetadata,
        challenger: &mut dyn Challenger,
    ) -> FynxResult<Permissions>;
}

/// Result of a completed authentication phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    /// Authenticated user
    pub user: String,
    /// Permissions merged from every method that succeeded
    pub permissions: Permissions,
    /// Methods that succeeded, in order
    pub methods: Vec<String>,
}

/// Receives SSH_MSG_SERVICE_REQUEST for `ssh-userauth` and accepts it.
pub(crate) async fn accept_service(transport: &mut Transport) -> FynxResult<()> {
    let payload = transport.recv_required().await?;
    let request = Service::from_bytes(MessageType::ServiceRequest, &payload)?;
    if request.name != SERVICE_USERAUTH {
        return Err(FynxError::Protocol(format!(
            "service {} not available",
            request.name
        )));
    }
    transport.advance(TransportState::ServiceRequested)?;
    transport
        .send(Service::accept(SERVICE_USERAUTH).to_bytes())
        .await?;
    transport.advance(TransportState::Authenticating)
}

/// Runs the authentication phase to completion.
///
/// # Errors
///
/// - [`FynxError::AuthExhausted`] when the attempt cap is reached
/// - [`FynxError::Callback`] when a callback fails with its own error
/// - [`FynxError::Protocol`] for unexpected messages or a
///   keyboard-interactive answer count that does not match the prompts
pub(crate) async fn authenticate(
    transport: &mut Transport,
    config: &ServerConfig,
) -> FynxResult<AuthOutcome> {
    let session_id = transport.session_id()?;
    let mut engine = ServerAuth {
        config,
        enabled: config.enabled_methods(),
        session_id,
        failures: 0,
        banner_sent: false,
        user: None,
        succeeded: BTreeSet::new(),
        succeeded_order: Vec::new(),
        permissions: Permissions::default(),
        key_cache: HashMap::new(),
        attempted: Vec::new(),
        interrupted: None,
    };
    engine.run(transport).await
}

enum Verdict {
    Accept(Permissions),
    Reject,
    PkOk { algorithm: String, blob: Vec<u8> },
}

/// Maps a callback result onto the verdict, separating rejections from
/// failures.
///
/// Transport and protocol errors keep their kind, since a
/// keyboard-interactive callback sees them through its [`Challenger`].
/// Anything else the callback returns is wrapped as
/// [`FynxError::Callback`].
fn verdict(result: FynxResult<Permissions>) -> FynxResult<Verdict> {
    match result {
        Ok(permissions) => Ok(Verdict::Accept(permissions)),
        Err(FynxError::AuthRejected(reason)) => {
            debug!(reason = %reason, "Callback rejected credential");
            Ok(Verdict::Reject)
        }
        Err(
            e @ (FynxError::Callback(_)
            | FynxError::Protocol(_)
            | FynxError::Crypto(_)
            | FynxError::Disconnected { .. }
            | FynxError::ConnectionClosed
            | FynxError::Io(_)
            | FynxError::Timeout(_)),
        ) => Err(e),
        Err(e) => Err(FynxError::callback(e)),
    }
}

struct ServerAuth<'a> {
    config: &'a ServerConfig,
    enabled: Vec<&'static str>,
    session_id: Arc<[u8]>,
    failures: u32,
    banner_sent: bool,
    user: Option<String>,
    succeeded: BTreeSet<String>,
    succeeded_order: Vec<String>,
    permissions: Permissions,
    key_cache: HashMap<(String, PublicKey), Result<Permissions, String>>,
    attempted: Vec<String>,
    interrupted: Option<Vec<u8>>,
}

impl ServerAuth<'_> {
    async fn run(&mut self, transport: &mut Transport) -> FynxResult<AuthOutcome> {
        loop {
            let payload = match self.interrupted.take() {
                Some(payload) => payload,
                None => transport.recv_required().await?,
            };
            if payload[0] != MessageType::UserauthRequest as u8 {
                return Err(FynxError::Protocol(format!(
                    "unexpected message {} during authentication",
                    payload[0]
                )));
            }
            let request = UserAuthRequest::from_bytes(&payload)?;
            if request.service != SERVICE_CONNECTION {
                return Err(FynxError::Protocol(format!(
                    "service {} not available",
                    request.service
                )));
            }

            self.send_banner(transport).await?;
            self.switch_user(&request.user);

            let method = request.method.name().to_string();
            let metadata = transport.metadata(&request.user)?;
            let result = self.evaluate(transport, &metadata, request).await?;

            match result {
                Verdict::PkOk { algorithm, blob } => {
                    logging::log_auth_result(&metadata.user, &method, "pk_ok", self.failures);
                    transport
                        .send(UserAuthPkOk { algorithm, blob }.to_bytes())
                        .await?;
                }
                Verdict::Accept(permissions) => {
                    self.permissions.merge(permissions);
                    if self.succeeded.insert(method.clone()) {
                        self.succeeded_order.push(method.clone());
                    }

                    if self.config.method_policy.is_satisfied(&self.succeeded) || method == METHOD_NONE
                    {
                        logging::log_auth_result(
                            &metadata.user,
                            &method,
                            "success",
                            self.failures,
                        );
                        transport.send(USERAUTH_SUCCESS.to_vec()).await?;
                        return Ok(AuthOutcome {
                            user: metadata.user,
                            permissions: std::mem::take(&mut self.permissions),
                            methods: std::mem::take(&mut self.succeeded_order),
                        });
                    }

                    logging::log_auth_result(&metadata.user, &method, "partial", self.failures);
                    let failure = UserAuthFailure {
                        methods: self.remaining(),
                        partial_success: true,
                    };
                    transport.send(failure.to_bytes()).await?;
                }
                Verdict::Reject => {
                    if method != METHOD_NONE {
                        self.failures += 1;
                        if !self.attempted.contains(&method) {
                            self.attempted.push(method.clone());
                        }
                    }
                    logging::log_auth_result(&metadata.user, &method, "failure", self.failures);

                    if self.failures >= self.config.max_auth_attempts {
                        warn!(
                            user = %metadata.user,
                            failures = self.failures,
                            "Too many authentication failures"
                        );
                        return Err(FynxError::AuthExhausted {
                            attempted: std::mem::take(&mut self.attempted),
                        });
                    }

                    let failure = UserAuthFailure {
                        methods: self.remaining(),
                        partial_success: false,
                    };
                    transport.send(failure.to_bytes()).await?;
                }
            }
        }
    }

    fn remaining(&self) -> Vec<String> {
        self.config
            .method_policy
            .remaining(&self.succeeded, &self.enabled)
    }

    async fn send_banner(&mut self, transport: &Transport) -> FynxResult<()> {
        if self.banner_sent {
            return Ok(());
        }
        self.banner_sent = true;
        if let Some(message) = &self.config.banner {
            let banner = UserAuthBanner {
                message: message.clone(),
                language: String::new(),
            };
            transport.send(banner.to_bytes()).await?;
        }
        Ok(())
    }

    /// Partial successes only count for the user they were earned by.
    fn switch_user(&mut self, user: &str) {
        if self.user.as_deref() == Some(user) {
            return;
        }
        if self.user.is_some() {
            debug!(user = user, "User changed, resetting partial successes");
        }
        self.user = Some(user.to_string());
        self.succeeded.clear();
        self.succeeded_order.clear();
        self.permissions = Permissions::default();
    }

    async fn evaluate(
        &mut self,
        transport: &mut Transport,
        metadata: &ConnectionMetadata,
        request: UserAuthRequest,
    ) -> FynxResult<Verdict> {
        let method = request.method.name().to_string();
        if method != METHOD_NONE && !self.enabled.contains(&method.as_str()) {
            logging::log_auth_attempt(&metadata.user, &method, None);
            return Ok(Verdict::Reject);
        }

        match request.method {
            AuthMethod::None => {
                logging::log_auth_attempt(&metadata.user, METHOD_NONE, None);
                if self.config.no_client_auth {
                    Ok(Verdict::Accept(Permissions::default()))
                } else {
                    Ok(Verdict::Reject)
                }
            }
            AuthMethod::Password {
                password,
                new_password,
            } => {
                logging::log_auth_attempt(&metadata.user, &method, None);
                if new_password.is_some() {
                    debug!("Password change requests are not supported");
                    return Ok(Verdict::Reject);
                }
                match &self.config.password_callback {
                    Some(callback) => verdict(callback.check(metadata, &password).await),
                    None => Ok(Verdict::Reject),
                }
            }
            AuthMethod::PublicKey {
                algorithm,
                blob,
                signature,
            } => {
                self.public_key(metadata, &request.service, algorithm, blob, signature)
                    .await
            }
            AuthMethod::KeyboardInteractive { .. } => {
                logging::log_auth_attempt(&metadata.user, &method, None);
                let callback = match &self.config.keyboard_interactive_callback {
                    Some(callback) => Arc::clone(callback),
                    None => return Ok(Verdict::Reject),
                };
                let mut challenger = TransportChallenger {
                    transport,
                    interrupted: None,
                };
                let result = callback.challenge(metadata, &mut challenger).await;
                if let Some(payload) = challenger.interrupted.take() {
                    self.interrupted = Some(payload);
                    return Ok(Verdict::Reject);
                }
                verdict(result)
            }
            AuthMethod::Other(_) => Ok(Verdict::Reject),
        }
    }

    async fn public_key(
        &mut self,
        metadata: &ConnectionMetadata,
        service: &str,
        algorithm: String,
        blob: Vec<u8>,
        signature: Option<Vec<u8>>,
    ) -> FynxResult<Verdict> {
        let key = match PublicKey::from_blob(&blob) {
            Ok(key) if key.algorithm() == algorithm => key,
            Ok(_) | Err(_) => {
                debug!(algorithm = %algorithm, "Unusable public key in request");
                return Ok(Verdict::Reject);
            }
        };
        let fingerprint = key.fingerprint();
        logging::log_auth_attempt(&metadata.user, METHOD_PUBLICKEY, Some(&fingerprint));

        let callback = match &self.config.public_key_callback {
            Some(callback) => Arc::clone(callback),
            None => return Ok(Verdict::Reject),
        };

        if let Some(signature) = &signature {
            let data = construct_signature_data(
                &self.session_id,
                &metadata.user,
                service,
                &algorithm,
                &blob,
            );
            if let Err(e) = key.verify(&data, signature) {
                debug!(key = %fingerprint, error = %e, "Public key signature rejected");
                return Ok(Verdict::Reject);
            }
        }

        let cache_key = (metadata.user.clone(), key);
        let decision = match self.key_cache.get(&cache_key) {
            Some(decision) => decision.clone(),
            None => {
                let decision = match verdict(callback.check(metadata, &cache_key.1).await)? {
                    Verdict::Accept(permissions) => Ok(permissions),
                    _ => Err(format!("{} not accepted", fingerprint)),
                };
                self.key_cache.insert(cache_key, decision.clone());
                decision
            }
        };

        Ok(match (decision, signature) {
            (Ok(permissions), Some(_)) => Verdict::Accept(permissions),
            (Ok(_), None) => Verdict::PkOk { algorithm, blob },
            (Err(_), _) => Verdict::Reject,
        })
    }
}

/// Runs keyboard-interactive rounds over the transport.
struct TransportChallenger<'a> {
    transport: &'a mut Transport,
    interrupted: Option<Vec<u8>>,
}

#[async_trait]
impl Challenger for TransportChallenger<'_> {
    async fn ask(
        &mut self,
        name: &str,
        instruction: &str,
        prompts: &[Prompt],
    ) -> FynxResult<Vec<Zeroizing<String>>> {
        if self.interrupted.is_some() {
            return Err(FynxError::AuthRejected(
                "keyboard-interactive abandoned by client".to_string(),
            ));
        }

        let request = InfoRequest {
            name: name.to_string(),
            instruction: instruction.to_string(),
            language: String::new(),
            prompts: prompts.to_vec(),
        };
        self.transport.send(request.to_bytes()).await?;

        let payload = self.transport.recv_required().await?;
        if payload[0] == MessageType::UserauthRequest as u8 {
            // client gave up on this method and started another request
            self.interrupted = Some(payload);
            return Err(FynxError::AuthRejected(
                "keyboard-interactive abandoned by client".to_string(),
            ));
        }

        let response = InfoResponse::from_bytes(&payload)?;
        if response.responses.len() != prompts.len() {
            return Err(FynxError::Protocol(format!(
                "{} responses for {} prompts",
                response.responses.len(),
                prompts.len()
            )));
        }
        Ok(response.responses)
    }
}
