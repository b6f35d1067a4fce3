use super::{TlsMetadata, TlsVersion, cipher_info};
use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use rustls::{
    ClientConfig, DigitallySignedStruct, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
};
use rustls_pemfile::{certs, private_key};
use serde::Serialize;
use std::{
    io::Cursor,
    net::IpAddr,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
    time::Duration,
};
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tokio_rustls::{TlsConnector, client::TlsStream};
use tracing::debug;
use x509_parser::prelude::{FromDer, X509Certificate};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

static CRYPTO_PROVIDER_INIT: OnceLock<()> = OnceLock::new();

/// Ensure the rustls crypto provider is initialized
///
/// This should be called before any TLS operations. It's safe to call
/// multiple times as initialization only happens once.
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.get_or_init(|| {
        if let Err(err) = rustls::crypto::ring::default_provider().install_default() {
            eprintln!("failed to install ring crypto provider: {err:?}");
            std::process::exit(1);
        }
    });
}

/// PEM files of the certificate the probe presents to the server
#[derive(Debug, Clone)]
pub struct ClientAuth {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// What the probe learned about a server
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    #[serde(flatten)]
    pub metadata: TlsMetadata,
    pub sent: String,
    pub echoed: String,
}

/// Connect to a TLS server (accepting any certificate), send `message` and
/// read the same number of bytes back.
///
/// # Errors
///
/// Returns an error if the TCP connection, the TLS handshake, the echo
/// exchange or certificate parsing fails, or if it takes too long
pub async fn probe_server(
    host: &str,
    port: u16,
    client_auth: Option<&ClientAuth>,
    message: &str,
) -> Result<ProbeReport> {
    timeout(PROBE_TIMEOUT, probe(host, port, client_auth, message))
        .await
        .map_err(|_| anyhow!("probe of {host}:{port} timed out after {PROBE_TIMEOUT:?}"))?
}

async fn probe(
    host: &str,
    port: u16,
    client_auth: Option<&ClientAuth>,
    message: &str,
) -> Result<ProbeReport> {
    let stream = TcpStream::connect((host, port))
        .await
        .with_context(|| format!("failed to connect to {host}:{port}"))?;

    let connector = build_tls_connector(client_auth)
        .await
        .context("failed to build TLS connector for probe")?;
    let server_name = server_name_from_host(host)
        .with_context(|| format!("invalid server name for TLS probe: {host}"))?;
    let mut tls_stream = connector
        .connect(server_name, stream)
        .await
        .context("failed to complete TLS handshake")?;

    let metadata = extract_metadata_from_tls_stream(&tls_stream)
        .context("failed to extract certificate metadata from TLS stream")?;
    debug!(?metadata, "handshake complete");

    tls_stream
        .write_all(message.as_bytes())
        .await
        .context("failed to send probe message")?;
    tls_stream.flush().await?;

    let mut echoed = vec![0u8; message.len()];
    tls_stream
        .read_exact(&mut echoed)
        .await
        .context("failed to read echo")?;
    let _ = tls_stream.shutdown().await;

    Ok(ProbeReport {
        metadata,
        sent: message.to_string(),
        echoed: String::from_utf8_lossy(&echoed).into_owned(),
    })
}

async fn build_tls_connector(client_auth: Option<&ClientAuth>) -> Result<TlsConnector> {
    ensure_crypto_provider();

    let builder = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier));

    let config = if let Some(auth) = client_auth {
        let certs = load_cert_chain(&auth.cert).await?;
        let key = load_private_key(&auth.key).await?;
        builder.with_client_auth_cert(certs, key)?
    } else {
        builder.with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

async fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let data = fs::read(path)
        .await
        .with_context(|| format!("failed to read certificate {}", path.display()))?;
    let mut reader = Cursor::new(data);
    let parsed = certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| anyhow!("invalid certificate PEM: {e}"))?;

    if parsed.is_empty() {
        anyhow::bail!("no certificates found in {}", path.display());
    }

    Ok(parsed)
}

async fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let data = fs::read(path)
        .await
        .with_context(|| format!("failed to read private key {}", path.display()))?;

    let mut reader = Cursor::new(data);
    private_key(&mut reader)
        .map_err(|e| anyhow!("invalid private key PEM: {e}"))?
        .ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}

fn server_name_from_host(host: &str) -> Result<ServerName<'static>> {
    host.parse::<IpAddr>().map_or_else(
        |_| {
            ServerName::try_from(host.to_string())
                .map_err(|_| anyhow!("invalid server name: {host}"))
        },
        |ip| Ok(ServerName::from(ip).to_owned()),
    )
}

/// Extract certificate metadata (subject, issuer, expiry) from DER-encoded certificate
fn extract_cert_metadata(cert_der: &[u8]) -> Result<TlsMetadata> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| anyhow!("failed to parse certificate: {e}"))?;

    let raw = cert.validity().not_after.to_datetime();
    let not_after = chrono::DateTime::<Utc>::from_timestamp(raw.unix_timestamp(), raw.nanosecond())
        .ok_or_else(|| anyhow!("invalid certificate expiry timestamp"))?;

    Ok(TlsMetadata {
        cert_subject: Some(cert.subject().to_string()),
        cert_issuer: Some(cert.issuer().to_string()),
        cert_expiry_days: Some((not_after - Utc::now()).num_days()),
        ..Default::default()
    })
}

fn extract_metadata_from_tls_stream(stream: &TlsStream<TcpStream>) -> Result<TlsMetadata> {
    let (_, connection) = stream.get_ref();

    let mut metadata = match connection.peer_certificates().and_then(<[_]>::first) {
        Some(cert) => extract_cert_metadata(cert.as_ref())?,
        None => TlsMetadata::default(),
    };

    metadata.version = connection
        .protocol_version()
        .map(|v| TlsVersion::from_rustls(v).to_string());
    metadata.cipher = connection.negotiated_cipher_suite().map(|suite| {
        cipher_info(suite.suite())
            .map_or_else(|| format!("{:?}", suite.suite()), |info| info.name.to_string())
    });

    Ok(metadata)
}

/// Certificate verifier that accepts any server certificate.
///
/// Servers probed here present self-signed identities, so there is no chain
/// to verify; the probe only reports what the server offered.
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
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
