//! Transport-layer client certificate hook.
//!
//! The server accepts whatever certificate a client presents; trust decisions
//! belong to the consumer, which inspects
//! [`TlsClientStatus::peer_cert`](super::TlsClientStatus) once the
//! connection is handed over. Handshake signatures are still checked, so the
//! client must own the key of the certificate it presents.

use super::ClientCertMode;
use rustls::{
    DigitallySignedStruct, DistinguishedName, Error as TlsError, SignatureScheme,
    client::danger::HandshakeSignatureValid,
    crypto::WebPkiSupportedAlgorithms,
    pki_types::{CertificateDer, UnixTime},
    server::danger::{ClientCertVerified, ClientCertVerifier},
};
use std::sync::LazyLock;
use tracing::debug;

fn ring_signature_algorithms() -> &'static WebPkiSupportedAlgorithms {
    static ALGORITHMS: LazyLock<WebPkiSupportedAlgorithms> =
        LazyLock::new(|| rustls::crypto::ring::default_provider().signature_verification_algorithms);
    &ALGORITHMS
}

/// Accepts any client certificate; `mode` decides whether one is requested
/// and whether it is mandatory.
#[derive(Debug, Clone, Copy)]
pub struct AcceptAnyClientCert {
    mode: ClientCertMode,
}

impl AcceptAnyClientCert {
    #[must_use]
    pub const fn new(mode: ClientCertMode) -> Self {
        Self { mode }
    }
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        !matches!(self.mode, ClientCertMode::Never)
    }

    fn client_auth_mandatory(&self) -> bool {
        matches!(
            self.mode,
            ClientCertMode::RequireFirstHandshake | ClientCertMode::RequireAlways
        )
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, TlsError> {
        debug!(
            der_len = end_entity.len(),
            intermediates = intermediates.len(),
            "accepting client certificate"
        );
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, ring_signature_algorithms())
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, ring_signature_algorithms())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        ring_signature_algorithms().supported_schemes()
    }
}
