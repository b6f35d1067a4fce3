#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use chrono::Utc;
use rustls::{
    ClientConfig, DigitallySignedStruct, SignatureScheme, SupportedCipherSuite,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use std::{
    env,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};
use tlslisten::{
    identity::{Certificate, PrivateKey, ServerIdentity, generate_self_signed},
    tls::{ListeningSocket, ServerOptions, TlsConnection, TlsServerSocket, ensure_crypto_provider},
};
use tokio::{
    net::TcpStream,
    sync::mpsc,
    time::{Duration, timeout},
};
use tokio_rustls::{TlsConnector, client::TlsStream};

pub const WAIT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fresh self-signed identity named `name`
pub fn test_identity(name: &str) -> Arc<ServerIdentity> {
    let (certificate, key) = generate_self_signed(name, Utc::now()).unwrap();
    Arc::new(ServerIdentity::new(name, certificate, key))
}

pub struct TestServer {
    pub listening: ListeningSocket,
    pub connections: mpsc::UnboundedReceiver<TlsConnection>,
    pub identity: Arc<ServerIdentity>,
}

impl TestServer {
    pub fn addr(&self) -> SocketAddr {
        self.listening.local_addr()
    }

    /// Next connection handed to the consumer, `None` if nothing arrives in `wait`
    pub async fn next_connection(&mut self, wait: Duration) -> Option<TlsConnection> {
        timeout(wait, self.connections.recv()).await.ok().flatten()
    }
}

/// Listen on an ephemeral loopback port with `options`
pub async fn start_server(options: ServerOptions) -> TestServer {
    start_server_with_identity(test_identity("devtools"), options).await
}

/// Listen on an ephemeral loopback port presenting `identity`
pub async fn start_server_with_identity(
    identity: Arc<ServerIdentity>,
    options: ServerOptions,
) -> TestServer {
    init_tracing();

    let mut socket = TlsServerSocket::new();
    socket.set_server_identity(Arc::clone(&identity));
    socket.set_session_cache(options.session_cache);
    socket.set_session_tickets(options.session_tickets);
    socket.set_request_certificate(options.client_cert);

    let (tx, rx) = mpsc::unbounded_channel();
    let listening = socket
        .listen(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), tx)
        .await
        .expect("listen failed");

    TestServer {
        listening,
        connections: rx,
        identity,
    }
}

pub fn no_verifier() -> Arc<dyn ServerCertVerifier> {
    Arc::new(NoVerifier)
}

/// Client configuration trusting any server, optionally presenting a certificate
pub fn client_config(client_auth: Option<(&Certificate, &PrivateKey)>) -> Arc<ClientConfig> {
    ensure_crypto_provider();

    let builder = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(no_verifier());

    let config = match client_auth {
        Some((cert, key)) => builder
            .with_client_auth_cert(vec![cert.to_rustls()], key.to_rustls())
            .unwrap(),
        None => builder.with_no_client_auth(),
    };

    Arc::new(config)
}

/// TLS 1.3 client configuration offering only `suite`
pub fn client_config_with_suite(suite: SupportedCipherSuite) -> Arc<ClientConfig> {
    let provider = CryptoProvider {
        cipher_suites: vec![suite],
        ..rustls::crypto::ring::default_provider()
    };

    let config = ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .unwrap()
        .dangerous()
        .with_custom_certificate_verifier(no_verifier())
        .with_no_client_auth();

    Arc::new(config)
}

pub async fn connect(
    addr: SocketAddr,
    config: Arc<ClientConfig>,
) -> std::io::Result<TlsStream<TcpStream>> {
    let stream = TcpStream::connect(addr).await?;
    let server_name = ServerName::from(addr.ip());
    TlsConnector::from(config).connect(server_name, stream).await
}

/// Unique directory under the system temp dir
pub fn temp_dir() -> PathBuf {
    env::temp_dir().join(format!("tlslisten-test-{}", uuid::Uuid::new_v4()))
}

#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
