use crate::{
    error::{Error, Result},
    identity::Certificate,
    store::CertificateStore,
};
use rustls::{CipherSuite, ProtocolVersion, pki_types::CertificateDer};
use serde::{Serialize, Serializer};
use std::fmt;

/// Negotiated TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    /// Handshake not finished
    #[default]
    Unknown,
    Tls1_0,
    Tls1_1,
    Tls1_2,
    Tls1_3,
}

impl TlsVersion {
    /// Wire value of the version (`0x0303` for TLS 1.2), `-1` when unknown
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Unknown => -1,
            Self::Tls1_0 => 0x0301,
            Self::Tls1_1 => 0x0302,
            Self::Tls1_2 => 0x0303,
            Self::Tls1_3 => 0x0304,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Tls1_0 => "TLSv1.0",
            Self::Tls1_1 => "TLSv1.1",
            Self::Tls1_2 => "TLSv1.2",
            Self::Tls1_3 => "TLSv1.3",
        }
    }

    #[must_use]
    pub const fn from_rustls(version: ProtocolVersion) -> Self {
        match version {
            ProtocolVersion::TLSv1_0 => Self::Tls1_0,
            ProtocolVersion::TLSv1_1 => Self::Tls1_1,
            ProtocolVersion::TLSv1_2 => Self::Tls1_2,
            ProtocolVersion::TLSv1_3 => Self::Tls1_3,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TlsVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// IANA name, effective key bits and MAC bits of a cipher suite.
///
/// AEAD suites report the authentication tag size as MAC bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherInfo {
    pub name: &'static str,
    pub key_bits: u16,
    pub mac_bits: u16,
}

const fn info(name: &'static str, key_bits: u16, mac_bits: u16) -> Option<CipherInfo> {
    Some(CipherInfo {
        name,
        key_bits,
        mac_bits,
    })
}

/// Look up the suites the ring provider can negotiate.
#[must_use]
pub const fn cipher_info(suite: CipherSuite) -> Option<CipherInfo> {
    match suite {
        CipherSuite::TLS13_AES_128_GCM_SHA256 => info("TLS_AES_128_GCM_SHA256", 128, 128),
        CipherSuite::TLS13_AES_256_GCM_SHA384 => info("TLS_AES_256_GCM_SHA384", 256, 128),
        CipherSuite::TLS13_CHACHA20_POLY1305_SHA256 => {
            info("TLS_CHACHA20_POLY1305_SHA256", 256, 128)
        }
        CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256 => {
            info("TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256", 128, 128)
        }
        CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384 => {
            info("TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384", 256, 128)
        }
        CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256 => {
            info("TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256", 256, 128)
        }
        CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256 => {
            info("TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256", 128, 128)
        }
        CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384 => {
            info("TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384", 256, 128)
        }
        CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256 => {
            info("TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256", 256, 128)
        }
        _ => None,
    }
}

/// Raw handshake results as reported by the TLS session.
#[derive(Debug, Clone, Default)]
pub struct HandshakeDetails {
    pub protocol_version: Option<ProtocolVersion>,
    pub cipher_suite: Option<CipherSuite>,
    pub peer_certificates: Vec<CertificateDer<'static>>,
}

/// Negotiated parameters of an accepted connection.
///
/// Holds the sentinel values of [`Default`] until the handshake has
/// completed; the server only hands out populated instances.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TlsClientStatus {
    pub tls_version: TlsVersion,
    pub cipher_name: String,
    pub key_length: u16,
    pub mac_length: u16,
    pub peer_cert: Option<Certificate>,
}

impl TlsClientStatus {
    /// Populate the status from a finished handshake. The peer certificate,
    /// if any, is built through the store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandshakeExtractionFailed`] if the version or suite is
    /// missing or unknown, or the peer certificate does not parse
    pub fn from_handshake(details: &HandshakeDetails, store: &dyn CertificateStore) -> Result<Self> {
        let peer_cert = details
            .peer_certificates
            .first()
            .map(|der| store.construct_from_der(der.as_ref()))
            .transpose()
            .map_err(|e| Error::HandshakeExtractionFailed(format!("peer certificate: {e}")))?;

        let tls_version = details
            .protocol_version
            .map(TlsVersion::from_rustls)
            .filter(|version| *version != TlsVersion::Unknown)
            .ok_or_else(|| {
                Error::HandshakeExtractionFailed(format!(
                    "no usable protocol version: {:?}",
                    details.protocol_version
                ))
            })?;

        let suite = details
            .cipher_suite
            .ok_or_else(|| Error::HandshakeExtractionFailed("no cipher suite".to_string()))?;
        let cipher = cipher_info(suite).ok_or_else(|| {
            Error::HandshakeExtractionFailed(format!("unknown cipher suite: {suite:?}"))
        })?;

        Ok(Self {
            tls_version,
            cipher_name: cipher.name.to_string(),
            key_length: cipher.key_bits,
            mac_length: cipher.mac_bits,
            peer_cert,
        })
    }

    /// True once the handshake values have been filled in
    #[must_use]
    pub fn is_populated(&self) -> bool {
        self.tls_version != TlsVersion::Unknown
            && !self.cipher_name.is_empty()
            && self.key_length > 0
            && self.mac_length > 0
    }
}

/// Client-side view of a server reached by the probe
#[derive(Debug, Clone, Default, Serialize)]
pub struct TlsMetadata {
    /// TLS protocol version (e.g., "TLSv1.3")
    pub version: Option<String>,
    /// Cipher suite used (e.g., `TLS_AES_256_GCM_SHA384`)
    pub cipher: Option<String>,
    /// Certificate subject DN
    pub cert_subject: Option<String>,
    /// Certificate issuer DN
    pub cert_issuer: Option<String>,
    /// Days until certificate expiration (negative if expired)
    pub cert_expiry_days: Option<i64>,
}
