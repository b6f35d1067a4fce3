#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

mod common;

use chrono::Utc;
use common::*;
use rustls::{ClientConfig, HandshakeKind, crypto::ring::cipher_suite::TLS13_AES_128_GCM_SHA256};
use std::{fs, sync::Arc};
use tlslisten::{
    identity::{ServerIdentity, generate_self_signed},
    tls::{
        ClientAuth, ClientCertMode, ServerOptions, TlsConnection, TlsVersion,
        ensure_crypto_provider, probe_server,
    },
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{Duration, timeout},
};

const QUIET: Duration = Duration::from_millis(500);

/// Read exactly `len` bytes from an accepted connection
async fn read_exact(connection: &TlsConnection, len: usize) -> Vec<u8> {
    let mut received = Vec::with_capacity(len);
    let mut buf = [0u8; 1024];
    while received.len() < len {
        let n = timeout(WAIT, connection.read(&mut buf))
            .await
            .expect("read timed out")
            .expect("read failed");
        assert_ne!(n, 0, "client closed early");
        received.extend_from_slice(&buf[..n]);
    }
    received
}

#[tokio::test]
async fn test_handshake_notifies_consumer_once() {
    let mut server = start_server(ServerOptions::default()).await;

    let config = client_config_with_suite(TLS13_AES_128_GCM_SHA256);
    let _client = connect(server.addr(), config).await.unwrap();

    let connection = server.next_connection(WAIT).await.expect("no connection");
    let status = connection.status();
    assert!(status.is_populated(), "{status:?}");
    assert_eq!(status.tls_version, TlsVersion::Tls1_3);
    assert_eq!(status.cipher_name, "TLS_AES_128_GCM_SHA256");
    assert_eq!(status.key_length, 128);
    assert_eq!(status.mac_length, 128);
    assert!(status.peer_cert.is_none());

    assert!(server.next_connection(QUIET).await.is_none());

    server.listening.close().await;
}

#[tokio::test]
async fn test_echo_after_handshake() {
    let mut server = start_server(ServerOptions::default()).await;

    let mut client = connect(server.addr(), client_config(None)).await.unwrap();
    let connection = server.next_connection(WAIT).await.expect("no connection");

    client.write_all(b"HELLO").await.unwrap();
    client.flush().await.unwrap();
    assert_eq!(read_exact(&connection, 5).await, b"HELLO");

    connection.write_all(b"WORLD").await.unwrap();
    let mut reply = [0u8; 5];
    timeout(WAIT, client.read_exact(&mut reply))
        .await
        .expect("client read timed out")
        .unwrap();
    assert_eq!(&reply, b"WORLD");

    connection.shutdown().await.unwrap();
    let n = timeout(WAIT, client.read(&mut reply)).await.unwrap().unwrap();
    assert_eq!(n, 0);

    server.listening.close().await;
}

#[tokio::test]
async fn test_client_certificate_is_reported() {
    let mut server = start_server(ServerOptions {
        client_cert: ClientCertMode::RequireAlways,
        ..ServerOptions::default()
    })
    .await;

    let (cert, key) = generate_self_signed("client", Utc::now()).unwrap();
    let _client = connect(server.addr(), client_config(Some((&cert, &key))))
        .await
        .unwrap();

    let connection = server.next_connection(WAIT).await.expect("no connection");
    let peer = connection.status().peer_cert.as_ref().expect("no peer cert");
    assert_eq!(peer, &cert);
    assert_eq!(peer.common_name(), Some("client"));

    server.listening.close().await;
}

#[tokio::test]
async fn test_optional_client_certificate() {
    let mut server = start_server(ServerOptions {
        client_cert: ClientCertMode::Always,
        ..ServerOptions::default()
    })
    .await;

    let _anonymous = connect(server.addr(), client_config(None)).await.unwrap();
    let connection = server.next_connection(WAIT).await.expect("no connection");
    assert!(connection.status().peer_cert.is_none());

    let (cert, key) = generate_self_signed("client", Utc::now()).unwrap();
    let _authenticated = connect(server.addr(), client_config(Some((&cert, &key))))
        .await
        .unwrap();
    let connection = server.next_connection(WAIT).await.expect("no connection");
    assert_eq!(connection.status().peer_cert.as_ref(), Some(&cert));

    server.listening.close().await;
}

#[tokio::test]
async fn test_missing_mandatory_certificate_is_silent() {
    let mut server = start_server(ServerOptions {
        client_cert: ClientCertMode::RequireFirstHandshake,
        ..ServerOptions::default()
    })
    .await;

    // TLS 1.3 clients finish before the server rejects them; the failure
    // shows up on the first read.
    if let Ok(mut client) = connect(server.addr(), client_config(None)).await {
        let mut buf = [0u8; 1];
        let result = timeout(WAIT, client.read(&mut buf)).await.unwrap();
        assert!(matches!(result, Err(_) | Ok(0)), "{result:?}");
    }

    assert!(server.next_connection(QUIET).await.is_none());

    server.listening.close().await;
}

#[tokio::test]
async fn test_garbage_client_does_not_stop_listening() {
    let mut server = start_server(ServerOptions::default()).await;

    let mut raw = TcpStream::connect(server.addr()).await.unwrap();
    raw.write_all(b"GET / HTTP/1.1\r\nHost: devtools\r\n\r\n")
        .await
        .unwrap();
    let mut buf = [0u8; 256];
    // The server answers with an alert and hangs up
    loop {
        match timeout(WAIT, raw.read(&mut buf)).await.unwrap() {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
    assert!(server.next_connection(QUIET).await.is_none());

    let _client = connect(server.addr(), client_config(None)).await.unwrap();
    assert!(server.next_connection(WAIT).await.is_some());

    server.listening.close().await;
}

#[tokio::test]
async fn test_silent_client_is_closed_with_socket() {
    let mut server = start_server(ServerOptions::default()).await;

    let mut raw = TcpStream::connect(server.addr()).await.unwrap();
    assert!(server.next_connection(QUIET).await.is_none());

    server.listening.close().await;

    // At most an alert, then end of stream
    let mut buf = [0u8; 256];
    loop {
        match timeout(WAIT, raw.read(&mut buf)).await.unwrap() {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

#[tokio::test]
async fn test_resumption_follows_session_state() {
    for (session_cache, session_tickets) in [(true, true), (true, false), (false, true), (false, false)]
    {
        let mut server = start_server(ServerOptions {
            session_cache,
            session_tickets,
            ..ServerOptions::default()
        })
        .await;
        let config = client_config(None);

        let mut kinds = Vec::new();
        for _ in 0..2 {
            let mut client = connect(server.addr(), Arc::clone(&config)).await.unwrap();
            kinds.push(client.get_ref().1.handshake_kind());
            let connection = server.next_connection(WAIT).await.expect("no connection");
            assert!(connection.status().is_populated());

            // Round trip so the client sees any session ticket before reconnecting
            client.write_all(b"ping").await.unwrap();
            assert_eq!(read_exact(&connection, 4).await, b"ping");
            connection.write_all(b"pong").await.unwrap();
            let mut reply = [0u8; 4];
            timeout(WAIT, client.read_exact(&mut reply))
                .await
                .unwrap()
                .unwrap();
        }

        let second = if session_cache || session_tickets {
            HandshakeKind::Resumed
        } else {
            HandshakeKind::Full
        };
        assert_eq!(
            kinds,
            [Some(HandshakeKind::Full), Some(second)],
            "cache={session_cache} tickets={session_tickets}"
        );

        server.listening.close().await;
    }
}

#[tokio::test]
async fn test_identity_from_pem_files() {
    let dir = temp_dir();
    fs::create_dir_all(&dir).unwrap();
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let cert = rcgen::CertificateParams::new(vec!["devtools.local".to_string()])
        .unwrap()
        .self_signed(&key_pair)
        .unwrap();
    let cert_path = dir.join("server.pem");
    let key_path = dir.join("server.key");
    fs::write(&cert_path, cert.pem()).unwrap();
    fs::write(&key_path, key_pair.serialize_pem()).unwrap();

    let identity = ServerIdentity::from_pem_files("devtools", &cert_path, &key_path)
        .await
        .unwrap();
    let mut server = start_server_with_identity(Arc::new(identity), ServerOptions::default()).await;

    let client = connect(server.addr(), client_config(None)).await.unwrap();
    let presented = client.get_ref().1.peer_certificates().unwrap();
    assert_eq!(presented.first().unwrap().as_ref(), cert.der().as_ref());

    let connection = server.next_connection(WAIT).await.expect("no connection");
    assert!(connection.status().is_populated());

    server.listening.close().await;
    let _ = fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_tls12_client() {
    let mut server = start_server(ServerOptions::default()).await;

    ensure_crypto_provider();
    let config = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS12])
        .dangerous()
        .with_custom_certificate_verifier(no_verifier())
        .with_no_client_auth();

    let _client = connect(server.addr(), Arc::new(config)).await.unwrap();

    let connection = server.next_connection(WAIT).await.expect("no connection");
    let status = connection.status();
    assert_eq!(status.tls_version, TlsVersion::Tls1_2);
    assert_eq!(status.tls_version.code(), 0x0303);
    assert!(
        status.cipher_name.starts_with("TLS_ECDHE_ECDSA_WITH_"),
        "{}",
        status.cipher_name
    );

    server.listening.close().await;
}

#[tokio::test]
async fn test_closed_socket_refuses_connections() {
    let server = start_server(ServerOptions::default()).await;
    let addr = server.addr();

    server.listening.close().await;

    assert!(connect(addr, client_config(None)).await.is_err());
}

/// Answer one probe: read its message and send it back
async fn echo_once(connection: TlsConnection, len: usize) {
    let received = read_exact(&connection, len).await;
    connection.write_all(&received).await.unwrap();
}

#[tokio::test]
async fn test_probe_round_trip() {
    let mut server = start_server(ServerOptions::default()).await;
    let port = server.addr().port();

    let probe = tokio::spawn(async move { probe_server("127.0.0.1", port, None, "HELLO").await });

    let connection = server.next_connection(WAIT).await.expect("no connection");
    echo_once(connection, 5).await;

    let report = probe.await.unwrap().unwrap();
    assert_eq!(report.sent, "HELLO");
    assert_eq!(report.echoed, "HELLO");
    assert_eq!(report.metadata.version.as_deref(), Some("TLSv1.3"));
    assert_eq!(report.metadata.cert_subject.as_deref(), Some("CN=devtools"));
    assert!(report.metadata.cipher.is_some());

    server.listening.close().await;
}

#[tokio::test]
async fn test_probe_with_client_certificate() {
    let mut server = start_server(ServerOptions {
        client_cert: ClientCertMode::RequireAlways,
        ..ServerOptions::default()
    })
    .await;
    let port = server.addr().port();

    let dir = temp_dir();
    fs::create_dir_all(&dir).unwrap();
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let cert = rcgen::CertificateParams::new(vec!["probe-client".to_string()])
        .unwrap()
        .self_signed(&key_pair)
        .unwrap();
    let auth = ClientAuth {
        cert: dir.join("client.pem"),
        key: dir.join("client.key"),
    };
    fs::write(&auth.cert, cert.pem()).unwrap();
    fs::write(&auth.key, key_pair.serialize_pem()).unwrap();

    let probe =
        tokio::spawn(async move { probe_server("127.0.0.1", port, Some(&auth), "PING").await });

    let connection = server.next_connection(WAIT).await.expect("no connection");
    let peer = connection.status().peer_cert.clone().expect("no peer cert");
    assert_eq!(peer.der(), cert.der().as_ref());
    echo_once(connection, 4).await;

    let report = probe.await.unwrap().unwrap();
    assert_eq!(report.echoed, "PING");

    server.listening.close().await;
    let _ = fs::remove_dir_all(&dir);
}
