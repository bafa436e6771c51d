//! Client side of SSH user authentication (RFC 4252, RFC 4256).
//!
//! The client first sends a `none` request to learn which methods the server
//! offers, then tries each configured method the server still offers, in
//! configuration order. A method is never tried twice. Public keys are
//! queried before they are used to sign.

use async_trait::async_trait;
use fynx_platform::{FynxError, FynxResult};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::auth::{
    construct_signature_data, AuthMethod, InfoRequest, InfoResponse, UserAuthBanner,
    UserAuthFailure, UserAuthPkOk, UserAuthRequest, METHOD_KEYBOARD_INTERACTIVE, METHOD_NONE,
    METHOD_PASSWORD, METHOD_PUBLICKEY, SERVICE_USERAUTH,
};
use crate::config::ClientConfig;
use crate::keys::Signer;
use crate::logging;
use crate::message::{disconnect_reason, MessageType, Service};
use crate::transport::{Transport, TransportState};

/// Answers keyboard-interactive prompts.
#[async_trait]
pub trait KeyboardInteractiveResponder: Send + Sync {
    /// Returns one answer per prompt in `request`, in order.
    async fn respond(&self, user: &str, request: &InfoRequest)
        -> FynxResult<Vec<Zeroizing<String>>>;
}

/// Receives server banners.
pub trait BannerHandler: Send + Sync {
    /// Called once per USERAUTH_BANNER.
    fn on_banner(&self, message: &str);
}

/// A credential the client can offer.
#[derive(Clone)]
pub enum ClientAuthMethod {
    /// Password
    Password(Zeroizing<String>),
    /// Keys tried in order, each queried before signing
    PublicKeys(Vec<Arc<dyn Signer>>),
    /// Prompts answered by a responder
    KeyboardInteractive(Arc<dyn KeyboardInteractiveResponder>),
}

impl ClientAuthMethod {
    /// Method name on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            ClientAuthMethod::Password(_) => METHOD_PASSWORD,
            ClientAuthMethod::PublicKeys(_) => METHOD_PUBLICKEY,
            ClientAuthMethod::KeyboardInteractive(_) => METHOD_KEYBOARD_INTERACTIVE,
        }
    }
}

impl fmt::Debug for ClientAuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientAuthMethod::Password(_) => f.write_str("Password(<redacted>)"),
            ClientAuthMethod::PublicKeys(keys) => {
                let keys: Vec<_> = keys.iter().map(|k| k.public_key()).collect();
                f.debug_tuple("PublicKeys").field(&keys).finish()
            }
            ClientAuthMethod::KeyboardInteractive(_) => f.write_str("KeyboardInteractive"),
        }
    }
}

/// Sends SSH_MSG_SERVICE_REQUEST for `ssh-userauth` and waits for the accept.
pub(crate) async fn request_service(transport: &mut Transport) -> FynxResult<()> {
    transport
        .send(Service::request(SERVICE_USERAUTH).to_bytes())
        .await?;
    transport.advance(TransportState::ServiceRequested)?;

    let payload = transport.recv_required().await?;
    let accept = Service::from_bytes(MessageType::ServiceAccept, &payload)?;
    if accept.name != SERVICE_USERAUTH {
        return Err(FynxError::Protocol(format!(
            "server accepted service {} instead of {}",
            accept.name, SERVICE_USERAUTH
        )));
    }
    transport.advance(TransportState::Authenticating)
}

/// Authenticates with the configured methods.
///
/// Returns the methods that succeeded, in order.
///
/// # Errors
///
/// Returns [`FynxError::AuthExhausted`] naming every attempted method when
/// nothing is left to try or the server gives up.
pub(crate) async fn authenticate(
    transport: &mut Transport,
    config: &ClientConfig,
) -> FynxResult<Vec<String>> {
    let mut engine = ClientAuth {
        config,
        attempted: Vec::new(),
        succeeded: Vec::new(),
    };
    match engine.run(transport).await {
        Err(FynxError::Disconnected { reason, .. })
            if reason == disconnect_reason::NO_MORE_AUTH_METHODS_AVAILABLE =>
        {
            Err(FynxError::AuthExhausted {
                attempted: engine.attempted,
            })
        }
        other => other,
    }
}

enum Reply {
    Success,
    Failure(UserAuthFailure),
    PkOk(UserAuthPkOk),
    InfoRequest(InfoRequest),
}

/// What message 60 means in the current exchange.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Expecting {
    Plain,
    PkOk,
    InfoRequest,
}

enum Outcome {
    Success,
    Failure(UserAuthFailure),
}

struct ClientAuth<'a> {
    config: &'a ClientConfig,
    attempted: Vec<String>,
    succeeded: Vec<String>,
}

impl ClientAuth<'_> {
    async fn run(&mut self, transport: &mut Transport) -> FynxResult<Vec<String>> {
        let mut offered = match self
            .send_and_wait(transport, AuthMethod::None)
            .await?
        {
            Outcome::Success => {
                info!(user = %self.config.user, "Server accepted none");
                return Ok(vec![METHOD_NONE.to_string()]);
            }
            Outcome::Failure(failure) => failure.methods,
        };

        let config = self.config;
        let mut tried = vec![false; config.methods.len()];
        loop {
            let next = config
                .methods
                .iter()
                .enumerate()
                .find(|(i, m)| !tried[*i] && offered.iter().any(|o| o == m.name()));
            let (index, method) = match next {
                Some(next) => next,
                None => {
                    debug!(offered = ?offered, "No configured method left to try");
                    return Err(FynxError::AuthExhausted {
                        attempted: std::mem::take(&mut self.attempted),
                    });
                }
            };
            tried[index] = true;
            if !self.attempted.iter().any(|a| a == method.name()) {
                self.attempted.push(method.name().to_string());
            }

            match self.try_method(transport, method).await? {
                Outcome::Success => {
                    self.succeeded.push(method.name().to_string());
                    logging::log_auth_result(
                        &self.config.user,
                        method.name(),
                        "success",
                        0,
                    );
                    return Ok(std::mem::take(&mut self.succeeded));
                }
                Outcome::Failure(failure) => {
                    let outcome = if failure.partial_success {
                        self.succeeded.push(method.name().to_string());
                        "partial"
                    } else {
                        "failure"
                    };
                    logging::log_auth_result(&self.config.user, method.name(), outcome, 0);
                    offered = failure.methods;
                }
            }
        }
    }

    async fn try_method(
        &mut self,
        transport: &mut Transport,
        method: &ClientAuthMethod,
    ) -> FynxResult<Outcome> {
        match method {
            ClientAuthMethod::Password(password) => {
                logging::log_auth_attempt(&self.config.user, METHOD_PASSWORD, None);
                let method = AuthMethod::Password {
                    password: password.clone(),
                    new_password: None,
                };
                self.send_and_wait(transport, method).await
            }
            ClientAuthMethod::PublicKeys(keys) => self.public_keys(transport, keys).await,
            ClientAuthMethod::KeyboardInteractive(responder) => {
                self.keyboard_interactive(transport, responder.as_ref())
                    .await
            }
        }
    }

    async fn public_keys(
        &mut self,
        transport: &mut Transport,
        keys: &[Arc<dyn Signer>],
    ) -> FynxResult<Outcome> {
        let mut last = None;
        for signer in keys {
            let public = signer.public_key();
            let algorithm = public.algorithm().to_string();
            let blob = public.marshal().to_vec();
            let fingerprint = public.fingerprint();
            logging::log_auth_attempt(&self.config.user, METHOD_PUBLICKEY, Some(&fingerprint));

            let query = AuthMethod::PublicKey {
                algorithm: algorithm.clone(),
                blob: blob.clone(),
                signature: None,
            };
            self.send(transport, query).await?;
            match self.reply(transport, Expecting::PkOk).await? {
                Reply::PkOk(ok) if ok.blob == blob => {}
                Reply::PkOk(_) => {
                    return Err(FynxError::protocol("PK_OK for a key that was not offered"))
                }
                Reply::Failure(failure) => {
                    debug!(key = %fingerprint, "Server declined key");
                    let stop = !failure.methods.iter().any(|m| m == METHOD_PUBLICKEY);
                    last = Some(failure);
                    if stop {
                        break;
                    }
                    continue;
                }
                Reply::Success => return Ok(Outcome::Success),
                Reply::InfoRequest(_) => unreachable_reply()?,
            }

            let session_id = transport.session_id()?;
            let data = construct_signature_data(
                &session_id,
                &self.config.user,
                crate::auth::SERVICE_CONNECTION,
                &algorithm,
                &blob,
            );
            let signature = signer.sign(&data)?;
            let signed = AuthMethod::PublicKey {
                algorithm,
                blob,
                signature: Some(signature),
            };
            match self.send_and_wait(transport, signed).await? {
                Outcome::Success => return Ok(Outcome::Success),
                Outcome::Failure(failure) => {
                    let stop = failure.partial_success
                        || !failure.methods.iter().any(|m| m == METHOD_PUBLICKEY);
                    last = Some(failure);
                    if stop {
                        break;
                    }
                }
            }
        }

        last.map(Outcome::Failure)
            .ok_or_else(|| FynxError::protocol("no public key was offered"))
    }

    async fn keyboard_interactive(
        &mut self,
        transport: &mut Transport,
        responder: &dyn KeyboardInteractiveResponder,
    ) -> FynxResult<Outcome> {
        logging::log_auth_attempt(&self.config.user, METHOD_KEYBOARD_INTERACTIVE, None);
        let method = AuthMethod::KeyboardInteractive {
            language: String::new(),
            submethods: String::new(),
        };
        self.send(transport, method).await?;

        loop {
            match self.reply(transport, Expecting::InfoRequest).await? {
                Reply::Success => return Ok(Outcome::Success),
                Reply::Failure(failure) => return Ok(Outcome::Failure(failure)),
                Reply::InfoRequest(request) => {
                    let responses = responder
                        .respond(&self.config.user, &request)
                        .await
                        .map_err(|e| match e {
                            FynxError::Callback(e) => FynxError::Callback(e),
                            e => FynxError::callback(e),
                        })?;
                    if responses.len() != request.prompts.len() {
                        return Err(FynxError::callback(format!(
                            "responder gave {} answers for {} prompts",
                            responses.len(),
                            request.prompts.len()
                        )));
                    }
                    transport
                        .send(InfoResponse { responses }.to_bytes())
                        .await?;
                }
                Reply::PkOk(_) => unreachable_reply()?,
            }
        }
    }

    async fn send(&self, transport: &Transport, method: AuthMethod) -> FynxResult<()> {
        let request = UserAuthRequest::new(&self.config.user, method);
        transport.send(request.to_bytes()).await
    }

    async fn send_and_wait(
        &self,
        transport: &mut Transport,
        method: AuthMethod,
    ) -> FynxResult<Outcome> {
        self.send(transport, method).await?;
        match self.reply(transport, Expecting::Plain).await? {
            Reply::Success => Ok(Outcome::Success),
            Reply::Failure(failure) => Ok(Outcome::Failure(failure)),
            Reply::PkOk(_) | Reply::InfoRequest(_) => unreachable_reply(),
        }
    }

    /// Waits for the server's answer, passing banners to the handler.
    async fn reply(&self, transport: &mut Transport, expecting: Expecting) -> FynxResult<Reply> {
        loop {
            let payload = transport.recv_required().await?;
            match MessageType::from_u8(payload[0]) {
                Some(MessageType::UserauthSuccess) => return Ok(Reply::Success),
                Some(MessageType::UserauthFailure) => {
                    return Ok(Reply::Failure(UserAuthFailure::from_bytes(&payload)?))
                }
                Some(MessageType::UserauthBanner) => {
                    let banner = UserAuthBanner::from_bytes(&payload)?;
                    info!(banner = %banner.message.escape_debug(), "Server banner");
                    if let Some(handler) = &self.config.banner_handler {
                        handler.on_banner(&banner.message);
                    }
                }
                Some(MessageType::UserauthPkOk) if expecting == Expecting::PkOk => {
                    return Ok(Reply::PkOk(UserAuthPkOk::from_bytes(&payload)?))
                }
                Some(MessageType::UserauthPkOk) if expecting == Expecting::InfoRequest => {
                    return Ok(Reply::InfoRequest(InfoRequest::from_bytes(&payload)?))
                }
                _ => {
                    return Err(FynxError::Protocol(format!(
                        "unexpected message {} during authentication",
                        payload[0]
                    )))
                }
            }
        }
    }
}

fn unreachable_reply<T>() -> FynxResult<T> {
    Err(FynxError::protocol("reply does not match the request"))
}
