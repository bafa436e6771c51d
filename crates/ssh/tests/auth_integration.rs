//! Integration tests for SSH user authentication.
//!
//! Every test runs a real client and server over an in-memory duplex pipe:
//! version exchange, key exchange, service request and authentication.

use async_trait::async_trait;
use fynx_platform::{FynxError, FynxResult};
use fynx_ssh::auth::{ConnectionMetadata, InfoRequest, MethodPolicy, Permissions, Prompt};
use fynx_ssh::client::{self, AcceptAnyHostKey};
use fynx_ssh::client_auth::{BannerHandler, KeyboardInteractiveResponder};
use fynx_ssh::config::{ClientConfig, ServerConfig};
use fynx_ssh::connection::ConnectionHandle;
use fynx_ssh::keys::{EcdsaP256Key, Ed25519Key, PublicKey, Signer};
use fynx_ssh::server;
use fynx_ssh::server_auth::{
    Challenger, KeyboardInteractiveCallback, PasswordCallback, PublicKeyCallback,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{timeout, Duration};
use zeroize::Zeroizing;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

type Outcome = (FynxResult<ConnectionHandle>, FynxResult<ConnectionHandle>);

/// Runs both handshakes to completion and returns (client, server) results.
async fn handshake(client_config: ClientConfig, server_config: ServerConfig) -> Outcome {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(async move { server::accept(server_io, &server_config).await });
    let client = client::connect(client_io, &client_config).await;
    let server = server.await.expect("server task panicked");
    (client, server)
}

fn host_key() -> Arc<dyn Signer> {
    Arc::new(Ed25519Key::generate().unwrap())
}

fn user_key() -> Arc<dyn Signer> {
    Arc::new(Ed25519Key::generate().unwrap())
}

/// Accepts exactly one key and records every key it is asked about.
struct SingleKey {
    accepted: PublicKey,
    seen: Mutex<Vec<PublicKey>>,
}

impl SingleKey {
    fn new(accepted: PublicKey) -> Arc<Self> {
        Arc::new(Self {
            accepted,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<PublicKey> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl PublicKeyCallback for SingleKey {
    async fn check(&self, _: &ConnectionMetadata, key: &PublicKey) -> FynxResult<Permissions> {
        self.seen.lock().unwrap().push(key.clone());
        if *key == self.accepted {
            Ok(Permissions::default().with_extension("permit-pty", ""))
        } else {
            Err(FynxError::AuthRejected("key not authorized".into()))
        }
    }
}

struct Password {
    expected: &'static str,
    calls: AtomicU32,
}

impl Password {
    fn new(expected: &'static str) -> Arc<Self> {
        Arc::new(Self {
            expected,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl PasswordCallback for Password {
    async fn check(&self, _: &ConnectionMetadata, password: &str) -> FynxResult<Permissions> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if password == self.expected {
            Ok(Permissions::default())
        } else {
            Err(FynxError::AuthRejected("wrong password".into()))
        }
    }
}

struct RejectAll {
    calls: AtomicU32,
}

#[async_trait]
impl PasswordCallback for RejectAll {
    async fn check(&self, _: &ConnectionMetadata, _: &str) -> FynxResult<Permissions> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(FynxError::AuthRejected("no".into()))
    }
}

#[async_trait]
impl PublicKeyCallback for RejectAll {
    async fn check(&self, _: &ConnectionMetadata, _: &PublicKey) -> FynxResult<Permissions> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(FynxError::AuthRejected("no".into()))
    }
}

#[async_trait]
impl KeyboardInteractiveCallback for RejectAll {
    async fn challenge(
        &self,
        _: &ConnectionMetadata,
        _: &mut dyn Challenger,
    ) -> FynxResult<Permissions> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(FynxError::AuthRejected("no".into()))
    }
}

/// Asks for a one-time code and a PIN.
struct TwoQuestions;

#[async_trait]
impl KeyboardInteractiveCallback for TwoQuestions {
    async fn challenge(
        &self,
        metadata: &ConnectionMetadata,
        challenger: &mut dyn Challenger,
    ) -> FynxResult<Permissions> {
        let prompts = [Prompt::new("Code: ", true), Prompt::new("PIN: ", false)];
        let answers = challenger
            .ask(&format!("Login for {}", metadata.user), "", &prompts)
            .await?;
        if answers[0].as_str() == "123456" && answers[1].as_str() == "0000" {
            Ok(Permissions::default().with_critical_option("force-command", "true"))
        } else {
            Err(FynxError::AuthRejected("wrong answers".into()))
        }
    }
}

struct Answers;

#[async_trait]
impl KeyboardInteractiveResponder for Answers {
    async fn respond(
        &self,
        _: &str,
        request: &InfoRequest,
    ) -> FynxResult<Vec<Zeroizing<String>>> {
        Ok(request
            .prompts
            .iter()
            .map(|p| {
                let answer = if p.prompt.starts_with("Code") { "123456" } else { "0000" };
                Zeroizing::new(answer.to_string())
            })
            .collect())
    }
}

#[derive(Default)]
struct Banners(Mutex<Vec<String>>);

impl BannerHandler for Banners {
    fn on_banner(&self, message: &str) {
        self.0.lock().unwrap().push(message.to_string());
    }
}

/// Server accepts only X; the client holds A, B and X.
#[tokio::test]
async fn test_public_key_callback_once_per_key() -> Result<(), Box<dyn std::error::Error>> {
    let a: Arc<dyn Signer> = Arc::new(Ed25519Key::generate()?);
    let b: Arc<dyn Signer> = Arc::new(EcdsaP256Key::generate()?);
    let x: Arc<dyn Signer> = Arc::new(Ed25519Key::generate()?);

    for order in [
        vec![a.clone(), b.clone(), x.clone()],
        vec![x.clone(), a.clone(), b.clone()],
        vec![b.clone(), x.clone(), a.clone()],
    ] {
        let callback = SingleKey::new(x.public_key());
        let server_config = ServerConfig::builder()
            .with_host_key(host_key())
            .with_public_key_callback(callback.clone())
            .build()?;
        let client_config = ClientConfig::builder("alice")
            .with_public_keys(order.clone())
            .with_host_key_verifier(Arc::new(AcceptAnyHostKey))
            .build()?;

        let (client, server) = timeout(TEST_TIMEOUT, handshake(client_config, server_config)).await?;
        let client = client?;
        let server = server?;

        let seen = callback.seen();
        for (i, key) in seen.iter().enumerate() {
            assert!(
                !seen[i + 1..].contains(key),
                "callback invoked twice for {}",
                key
            );
        }
        let position = order
            .iter()
            .position(|k| k.public_key() == x.public_key())
            .unwrap();
        assert_eq!(seen.len(), position + 1);
        assert_eq!(seen.last().unwrap().marshal(), x.public_key().marshal());

        assert_eq!(server.user(), "alice");
        assert_eq!(server.auth_methods(), ["publickey"]);
        assert!(server.permissions().extensions.contains_key("permit-pty"));
        assert_eq!(client.session_id(), server.session_id());
    }
    Ok(())
}

/// Client holds keyA and keyB; the server accepts only keyB.
#[tokio::test]
async fn test_second_key_accepted() -> Result<(), Box<dyn std::error::Error>> {
    let key_a: Arc<dyn Signer> = Arc::new(Ed25519Key::generate()?);
    let key_b: Arc<dyn Signer> = Arc::new(Ed25519Key::generate()?);
    let callback = SingleKey::new(key_b.public_key());

    let server_config = ServerConfig::builder()
        .with_host_key(host_key())
        .with_public_key_callback(callback.clone())
        .build()?;
    let client_config = ClientConfig::builder("bob")
        .with_public_keys(vec![key_a.clone(), key_b.clone()])
        .with_host_key_verifier(Arc::new(AcceptAnyHostKey))
        .build()?;

    let (client, server) = timeout(TEST_TIMEOUT, handshake(client_config, server_config)).await?;
    client?;
    server?;

    let seen = callback.seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].marshal(), key_a.public_key().marshal());
    assert_eq!(seen[1].marshal(), key_b.public_key().marshal());
    Ok(())
}

/// A client whose every method is rejected gives up after one attempt each.
#[tokio::test]
async fn test_all_methods_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let reject = Arc::new(RejectAll {
        calls: AtomicU32::new(0),
    });
    let server_config = ServerConfig::builder()
        .with_host_key(host_key())
        .with_password_callback(reject.clone())
        .with_public_key_callback(reject.clone())
        .with_keyboard_interactive_callback(reject.clone())
        .build()?;
    let client_config = ClientConfig::builder("carol")
        .with_password("guess")
        .with_keyboard_interactive(Arc::new(Answers))
        .with_public_keys(vec![user_key()])
        .with_host_key_verifier(Arc::new(AcceptAnyHostKey))
        .build()?;

    let (client, server) = timeout(TEST_TIMEOUT, handshake(client_config, server_config)).await?;
    match client {
        Err(FynxError::AuthExhausted { attempted }) => {
            assert_eq!(attempted, ["password", "keyboard-interactive", "publickey"]);
        }
        other => panic!("expected AuthExhausted, got {:?}", other.map(|_| ())),
    }
    assert!(server.is_err());
    assert_eq!(reject.calls.load(Ordering::SeqCst), 3);
    Ok(())
}

/// The server cap ends authentication before the client runs out of methods.
#[tokio::test]
async fn test_server_attempt_cap() -> Result<(), Box<dyn std::error::Error>> {
    let reject = Arc::new(RejectAll {
        calls: AtomicU32::new(0),
    });
    let server_config = ServerConfig::builder()
        .with_host_key(host_key())
        .with_password_callback(reject.clone())
        .with_public_key_callback(reject.clone())
        .with_keyboard_interactive_callback(reject.clone())
        .with_max_auth_attempts(2)
        .build()?;
    let client_config = ClientConfig::builder("dave")
        .with_password("guess")
        .with_keyboard_interactive(Arc::new(Answers))
        .with_public_keys(vec![user_key()])
        .with_host_key_verifier(Arc::new(AcceptAnyHostKey))
        .build()?;

    let (client, server) = timeout(TEST_TIMEOUT, handshake(client_config, server_config)).await?;
    match client {
        Err(FynxError::AuthExhausted { attempted }) => {
            assert_eq!(attempted, ["password", "keyboard-interactive"]);
        }
        other => panic!("expected AuthExhausted, got {:?}", other.map(|_| ())),
    }
    match server {
        Err(FynxError::AuthExhausted { attempted }) => {
            assert_eq!(attempted, ["password", "keyboard-interactive"]);
        }
        other => panic!("expected AuthExhausted, got {:?}", other.map(|_| ())),
    }
    assert_eq!(reject.calls.load(Ordering::SeqCst), 2);
    Ok(())
}

/// Access needs both a key and a password.
#[tokio::test]
async fn test_partial_success() -> Result<(), Box<dyn std::error::Error>> {
    let key: Arc<dyn Signer> = Arc::new(Ed25519Key::generate()?);
    let password = Password::new("s3cret");
    let server_config = ServerConfig::builder()
        .with_host_key(host_key())
        .with_public_key_callback(SingleKey::new(key.public_key()))
        .with_password_callback(password.clone())
        .with_method_policy(MethodPolicy::require_all(&["publickey", "password"]))
        .build()?;
    let client_config = ClientConfig::builder("erin")
        .with_public_keys(vec![key])
        .with_password("s3cret")
        .with_host_key_verifier(Arc::new(AcceptAnyHostKey))
        .build()?;

    let (client, server) = timeout(TEST_TIMEOUT, handshake(client_config, server_config)).await?;
    let client = client?;
    let server = server?;

    assert_eq!(server.auth_methods(), ["publickey", "password"]);
    assert_eq!(client.auth_methods(), ["publickey", "password"]);
    assert!(server.permissions().extensions.contains_key("permit-pty"));
    assert_eq!(password.calls.load(Ordering::SeqCst), 1);
    Ok(())
}

/// A password client with a banner-sending server.
#[tokio::test]
async fn test_password_with_banner() -> Result<(), Box<dyn std::error::Error>> {
    let banners = Arc::new(Banners::default());
    let server_config = ServerConfig::builder()
        .with_host_key(Arc::new(EcdsaP256Key::generate()?))
        .with_password_callback(Password::new("correct horse"))
        .with_banner("Authorized use only\r\n")
        .build()?;
    let client_config = ClientConfig::builder("frank")
        .with_password("correct horse")
        .with_banner_handler(banners.clone())
        .with_host_key_verifier(Arc::new(AcceptAnyHostKey))
        .build()?;

    let (client, server) = timeout(TEST_TIMEOUT, handshake(client_config, server_config)).await?;
    let client = client?;
    let server = server?;

    assert_eq!(*banners.0.lock().unwrap(), ["Authorized use only\r\n"]);
    assert_eq!(client.user(), "frank");
    assert_eq!(server.auth_methods(), ["password"]);
    assert_eq!(
        server.negotiated().map(|n| n.host_key.name()),
        Some("ecdsa-sha2-nistp256")
    );
    Ok(())
}

#[tokio::test]
async fn test_keyboard_interactive() -> Result<(), Box<dyn std::error::Error>> {
    let server_config = ServerConfig::builder()
        .with_host_key(host_key())
        .with_keyboard_interactive_callback(Arc::new(TwoQuestions))
        .build()?;
    let client_config = ClientConfig::builder("grace")
        .with_keyboard_interactive(Arc::new(Answers))
        .with_host_key_verifier(Arc::new(AcceptAnyHostKey))
        .build()?;

    let (client, server) = timeout(TEST_TIMEOUT, handshake(client_config, server_config)).await?;
    client?;
    let server = server?;
    assert_eq!(server.auth_methods(), ["keyboard-interactive"]);
    assert_eq!(
        server.permissions().critical_options.get("force-command"),
        Some(&"true".to_string())
    );
    Ok(())
}

/// A failing callback is fatal and not treated as a rejection.
#[tokio::test]
async fn test_callback_failure_is_fatal() -> Result<(), Box<dyn std::error::Error>> {
    struct Broken;

    #[async_trait]
    impl PasswordCallback for Broken {
        async fn check(&self, _: &ConnectionMetadata, _: &str) -> FynxResult<Permissions> {
            Err(FynxError::callback("directory unavailable"))
        }
    }

    let server_config = ServerConfig::builder()
        .with_host_key(host_key())
        .with_password_callback(Arc::new(Broken))
        .build()?;
    let client_config = ClientConfig::builder("heidi")
        .with_password("pw")
        .with_host_key_verifier(Arc::new(AcceptAnyHostKey))
        .build()?;

    let (client, server) = timeout(TEST_TIMEOUT, handshake(client_config, server_config)).await?;
    assert!(matches!(server, Err(FynxError::Callback(_))));
    assert!(matches!(client, Err(FynxError::Disconnected { .. })));
    Ok(())
}

#[tokio::test]
async fn test_none_accepted_without_client_auth() -> Result<(), Box<dyn std::error::Error>> {
    let server_config = ServerConfig::builder()
        .with_host_key(host_key())
        .with_no_client_auth(true)
        .build()?;
    let client_config = ClientConfig::builder("ivan")
        .with_host_key_verifier(Arc::new(AcceptAnyHostKey))
        .build()?;

    let (client, server) = timeout(TEST_TIMEOUT, handshake(client_config, server_config)).await?;
    assert_eq!(client?.auth_methods(), ["none"]);
    assert_eq!(server?.auth_methods(), ["none"]);
    Ok(())
}

/// A client without a method the server offers fails without attempting
/// anything.
#[tokio::test]
async fn test_no_common_method() -> Result<(), Box<dyn std::error::Error>> {
    let server_config = ServerConfig::builder()
        .with_host_key(host_key())
        .with_password_callback(Password::new("pw"))
        .build()?;
    let client_config = ClientConfig::builder("judy")
        .with_public_keys(vec![user_key()])
        .with_host_key_verifier(Arc::new(AcceptAnyHostKey))
        .build()?;

    let (client, _server) = timeout(TEST_TIMEOUT, handshake(client_config, server_config)).await?;
    match client {
        Err(FynxError::AuthExhausted { attempted }) => assert!(attempted.is_empty()),
        other => panic!("expected AuthExhausted, got {:?}", other.map(|_| ())),
    }
    Ok(())
}
