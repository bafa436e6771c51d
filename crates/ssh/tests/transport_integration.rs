//! Integration tests for the SSH transport.
//!
//! Covers algorithm negotiation, rekeying under load, orderly close, host key
//! rejection, timeouts and the TCP entry points.

use fynx_platform::FynxError;
use fynx_ssh::client::{self, AcceptAnyHostKey, FixedHostKey};
use fynx_ssh::config::{ClientConfig, ServerConfig, TransportConfig};
use fynx_ssh::connection::ConnectionHandle;
use fynx_ssh::crypto::CipherAlgorithm;
use fynx_ssh::kex_ecdh::KexAlgorithm;
use fynx_ssh::keys::{EcdsaP256Key, Ed25519Key, KeyAlgorithm, Signer};
use fynx_ssh::message::disconnect_reason;
use fynx_ssh::server::{self, SshServer};
use std::sync::Arc;
use tokio::time::{timeout, Duration};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// CHANNEL_DATA-shaped payload carrying `n`.
fn data(n: u32) -> Vec<u8> {
    let mut payload = vec![94];
    payload.extend_from_slice(&n.to_be_bytes());
    payload
}

fn server_config(host_key: Arc<dyn Signer>, transport: TransportConfig) -> ServerConfig {
    ServerConfig::builder()
        .with_host_key(host_key)
        .with_no_client_auth(true)
        .with_transport(transport)
        .build()
        .unwrap()
}

fn client_config(transport: TransportConfig) -> ClientConfig {
    ClientConfig::builder("tester")
        .with_host_key_verifier(Arc::new(AcceptAnyHostKey))
        .with_transport(transport)
        .build()
        .unwrap()
}

async fn pair(
    client_config: ClientConfig,
    server_config: ServerConfig,
) -> Result<(ConnectionHandle, ConnectionHandle), Box<dyn std::error::Error>> {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(async move { server::accept(server_io, &server_config).await });
    let client = timeout(TEST_TIMEOUT, client::connect(client_io, &client_config)).await??;
    let server = timeout(TEST_TIMEOUT, server).await???;
    Ok((client, server))
}

fn ed25519() -> Arc<dyn Signer> {
    Arc::new(Ed25519Key::generate().unwrap())
}

#[tokio::test]
async fn test_every_cipher() -> Result<(), Box<dyn std::error::Error>> {
    for cipher in CipherAlgorithm::ALL {
        let mut transport = TransportConfig::default();
        transport.algorithms.ciphers = vec![cipher];

        let (client, mut server) = pair(
            client_config(transport.clone()),
            server_config(ed25519(), transport),
        )
        .await?;

        let negotiated = client.negotiated().ok_or("no negotiated algorithms")?;
        assert_eq!(negotiated.cipher_client_to_server, cipher);
        assert_eq!(negotiated.cipher_server_to_client, cipher);
        assert_eq!(
            negotiated.mac_client_to_server.is_none(),
            cipher.is_aead(),
            "{}",
            cipher.name()
        );

        client.send(data(7)).await?;
        assert_eq!(server.recv().await?, Some(data(7)));
        client.close().await?;
    }
    Ok(())
}

#[tokio::test]
async fn test_every_kex_and_host_key() -> Result<(), Box<dyn std::error::Error>> {
    for kex in KexAlgorithm::ALL {
        for host_key in KeyAlgorithm::ALL {
            let signer: Arc<dyn Signer> = match host_key {
                KeyAlgorithm::Ed25519 => Arc::new(Ed25519Key::generate()?),
                KeyAlgorithm::EcdsaP256 => Arc::new(EcdsaP256Key::generate()?),
            };
            let mut transport = TransportConfig::default();
            transport.algorithms.kex = vec![kex];

            let expected = signer.public_key();
            let (client, server) = pair(
                client_config(transport.clone()),
                server_config(signer, transport),
            )
            .await?;

            let negotiated = server.negotiated().ok_or("no negotiated algorithms")?;
            assert_eq!(negotiated.kex, kex);
            assert_eq!(negotiated.host_key, host_key);
            assert_eq!(client.host_key(), Some(&expected));
            assert_eq!(client.session_id(), server.session_id());
            assert_eq!(client.session_id().len(), 32);
        }
    }
    Ok(())
}

/// Messages sent around an explicit rekey arrive once each, in order, and
/// the session identifier survives.
#[tokio::test]
async fn test_rekey_preserves_order() -> Result<(), Box<dyn std::error::Error>> {
    let (client, mut server) = pair(
        client_config(TransportConfig::default()),
        server_config(ed25519(), TransportConfig::default()),
    )
    .await?;
    let session_id = client.session_id();

    let send = async {
        for n in 0..200 {
            client.send(data(n)).await?;
        }
        Ok::<_, FynxError>(())
    };
    let receive = async {
        for n in 0..200 {
            assert_eq!(server.recv().await?, Some(data(n)));
        }
        Ok::<_, FynxError>(())
    };
    let (rekeyed, sent, received) = timeout(
        TEST_TIMEOUT,
        async { tokio::join!(client.rekey(), send, receive) },
    )
    .await?;
    rekeyed?;
    sent?;
    received?;

    server.rekey().await?;
    assert_eq!(server.session_id(), session_id);
    assert_eq!(client.session_id(), session_id);
    Ok(())
}

/// A tiny byte limit forces repeated automatic re-exchanges mid-stream.
#[tokio::test]
async fn test_automatic_rekey_by_volume() -> Result<(), Box<dyn std::error::Error>> {
    let mut transport = TransportConfig::default();
    transport.rekey_bytes_limit = 4096;

    let (client, mut server) = pair(
        client_config(transport.clone()),
        server_config(ed25519(), transport),
    )
    .await?;

    let send = async {
        for n in 0..500 {
            let mut payload = data(n);
            payload.resize(128, 0xAB);
            client.send(payload).await?;
        }
        Ok::<_, FynxError>(())
    };
    let receive = async {
        for n in 0u32..500 {
            let payload = server.recv().await?.ok_or(FynxError::ConnectionClosed)?;
            assert_eq!(payload.len(), 128);
            assert_eq!(&payload[1..5], &n.to_be_bytes());
        }
        Ok::<_, FynxError>(())
    };
    let (sent, received) = timeout(TEST_TIMEOUT, async { tokio::join!(send, receive) }).await?;
    sent?;
    received?;
    assert_eq!(client.session_id(), server.session_id());
    Ok(())
}

#[tokio::test]
async fn test_close_is_orderly_and_idempotent() -> Result<(), Box<dyn std::error::Error>> {
    let (mut client, mut server) = pair(
        client_config(TransportConfig::default()),
        server_config(ed25519(), TransportConfig::default()),
    )
    .await?;

    client.send(data(1)).await?;
    client.close().await?;
    client.close().await?;
    assert!(client.is_closed());
    assert!(matches!(
        client.send(data(2)).await,
        Err(FynxError::ConnectionClosed)
    ));
    assert_eq!(client.recv().await?, None);

    // queued data is delivered before the disconnect
    assert_eq!(server.recv().await?, Some(data(1)));
    match timeout(TEST_TIMEOUT, server.recv()).await? {
        Err(FynxError::Disconnected { reason, .. }) => {
            assert_eq!(reason, disconnect_reason::BY_APPLICATION)
        }
        other => panic!("expected disconnect, got {:?}", other),
    }
    assert_eq!(server.recv().await?, None);
    Ok(())
}

#[tokio::test]
async fn test_untrusted_host_key() -> Result<(), Box<dyn std::error::Error>> {
    let trusted = Ed25519Key::generate()?.public_key();
    let client_config = ClientConfig::builder("tester")
        .with_host_key_verifier(Arc::new(FixedHostKey::new(trusted)))
        .build()?;
    let server_config = server_config(ed25519(), TransportConfig::default());

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(async move { server::accept(server_io, &server_config).await });
    let client = timeout(TEST_TIMEOUT, client::connect(client_io, &client_config)).await?;
    assert!(matches!(client, Err(FynxError::Crypto(_))));
    assert!(timeout(TEST_TIMEOUT, server).await??.is_err());
    Ok(())
}

#[tokio::test]
async fn test_handle_rejects_lower_layer_messages() -> Result<(), Box<dyn std::error::Error>> {
    let (client, _server) = pair(
        client_config(TransportConfig::default()),
        server_config(ed25519(), TransportConfig::default()),
    )
    .await?;

    for msg in [2u8, 20, 50, 79] {
        assert!(matches!(
            client.send(vec![msg, 0]).await,
            Err(FynxError::Protocol(_))
        ));
    }
    assert!(matches!(client.send(Vec::new()).await, Err(FynxError::Protocol(_))));
    assert!(client.send(vec![80, 0]).await.is_ok());
    Ok(())
}

#[tokio::test]
async fn test_handshake_timeout() -> Result<(), Box<dyn std::error::Error>> {
    let mut transport = TransportConfig::default();
    transport.handshake_timeout = Duration::from_millis(200);

    // the peer end stays open but never speaks
    let (client_io, _silent) = tokio::io::duplex(1024);
    let result = timeout(TEST_TIMEOUT, client::connect(client_io, &client_config(transport.clone())))
        .await?;
    assert!(matches!(result, Err(FynxError::Timeout(_))));

    let (server_io, _silent) = tokio::io::duplex(1024);
    let config = server_config(ed25519(), transport);
    let result = timeout(TEST_TIMEOUT, server::accept(server_io, &config)).await?;
    assert!(matches!(result, Err(FynxError::Timeout(_))));
    Ok(())
}

#[tokio::test]
async fn test_tcp_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let server = SshServer::bind(
        "127.0.0.1:0",
        server_config(ed25519(), TransportConfig::default()),
    )
    .await?;
    let addr = server.local_addr()?;
    let accepted = tokio::spawn(async move { server.accept().await });

    let mut client = timeout(
        TEST_TIMEOUT,
        client::connect_tcp(addr, &client_config(TransportConfig::default())),
    )
    .await??;
    let mut server = timeout(TEST_TIMEOUT, accepted).await???;

    assert_eq!(client.metadata().peer_addr, Some(addr));
    assert_eq!(server.metadata().peer_addr, client.metadata().local_addr);
    assert_eq!(server.user(), "tester");

    server.send(data(42)).await?;
    assert_eq!(client.recv().await?, Some(data(42)));
    client.send(data(43)).await?;
    assert_eq!(server.recv().await?, Some(data(43)));

    server.close().await?;
    assert!(matches!(
        client.recv().await,
        Err(FynxError::Disconnected { .. })
    ));
    Ok(())
}
