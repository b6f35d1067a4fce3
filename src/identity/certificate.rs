//! Certificates, private keys and the server identity that pairs them.
//!
//! Self-signed identities use an ECDSA P-256 key, subject `CN=<name>` and a
//! validity window of `[now - 1 day, now + 730 days]`. The serial number is
//! 63 random bits; collisions are possible in principle and are not checked.

use crate::error::{Error, Result};
use chrono::{DateTime, TimeDelta, Utc};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls_pemfile::{certs, private_key};
use serde::Serialize;
use std::{fmt, io::Cursor, path::Path};
use time::OffsetDateTime;
use tokio::fs;
use x509_parser::prelude::{FromDer, X509Certificate};

/// Days a generated certificate is back-dated to absorb clock skew.
const BACKDATE_DAYS: i64 = 1;

/// Lifetime of a generated certificate.
const VALIDITY_DAYS: i64 = 2 * 365;

/// A certificate is rejected when it expires within this many days.
const EXPIRY_MARGIN_DAYS: i64 = 1;

const ECDSA_WITH_SHA256_OID: &str = "1.2.840.10045.4.3.2";

/// A parsed X.509 certificate.
///
/// Equality compares the DER encoding.
#[derive(Clone, Serialize)]
pub struct Certificate {
    #[serde(skip)]
    der: Vec<u8>,
    subject: String,
    issuer: String,
    common_name: Option<String>,
    serial: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    signature_algorithm: String,
}

impl Certificate {
    /// Parse a DER-encoded certificate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCertificate`] if the bytes are not a valid X.509 certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::InvalidCertificate(format!("failed to parse certificate: {e}")))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(ToString::to_string);

        let serial = cert
            .raw_serial()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":");

        let oid = cert.signature_algorithm.algorithm.to_id_string();
        let signature_algorithm = if oid == ECDSA_WITH_SHA256_OID {
            "ecdsa-with-SHA256".to_string()
        } else {
            oid
        };

        Ok(Self {
            der: der.to_vec(),
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            common_name,
            serial,
            not_before: to_utc(cert.validity().not_before.to_datetime())?,
            not_after: to_utc(cert.validity().not_after.to_datetime())?,
            signature_algorithm,
        })
    }

    #[must_use]
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Subject distinguished name, e.g. `CN=devtools`
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[must_use]
    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    /// Serial number as colon-separated lowercase hex
    #[must_use]
    pub fn serial(&self) -> &str {
        &self.serial
    }

    #[must_use]
    pub const fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    #[must_use]
    pub const fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    #[must_use]
    pub fn signature_algorithm(&self) -> &str {
        &self.signature_algorithm
    }

    /// True when `now` is inside the validity window and the certificate does
    /// not expire within the next day.
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_before && now + TimeDelta::days(EXPIRY_MARGIN_DAYS) < self.not_after
    }

    /// Whole days until expiry (negative if expired)
    #[must_use]
    pub fn expiry_days(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now).num_days()
    }

    #[must_use]
    pub fn to_rustls(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.der.clone())
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for Certificate {}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject)
            .field("issuer", &self.issuer)
            .field("serial", &self.serial)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// A private key kept in DER form.
pub struct PrivateKey {
    der: PrivateKeyDer<'static>,
}

impl PrivateKey {
    #[must_use]
    pub fn from_pkcs8_der(der: Vec<u8>) -> Self {
        Self {
            der: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(der)),
        }
    }

    #[must_use]
    pub const fn from_rustls(der: PrivateKeyDer<'static>) -> Self {
        Self { der }
    }

    /// PKCS#8 encoding, if that is the key's format
    #[must_use]
    pub fn pkcs8_der(&self) -> Option<&[u8]> {
        match &self.der {
            PrivateKeyDer::Pkcs8(key) => Some(key.secret_pkcs8_der()),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_rustls(&self) -> PrivateKeyDer<'static> {
        self.der.clone_key()
    }
}

impl Clone for PrivateKey {
    fn clone(&self) -> Self {
        Self {
            der: self.der.clone_key(),
        }
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

/// The certificate and private key a server presents during the handshake.
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    nickname: String,
    certificate: Certificate,
    private_key: PrivateKey,
}

impl ServerIdentity {
    #[must_use]
    pub fn new(nickname: impl Into<String>, certificate: Certificate, private_key: PrivateKey) -> Self {
        Self {
            nickname: nickname.into(),
            certificate,
            private_key,
        }
    }

    /// Load an identity from PEM files (first certificate, first private key).
    ///
    /// # Errors
    ///
    /// Returns an error if either file cannot be read or holds no usable PEM block
    pub async fn from_pem_files(nickname: &str, cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = fs::read(cert_path).await?;
        let cert_der = certs(&mut Cursor::new(cert_pem))
            .next()
            .ok_or_else(|| {
                Error::InvalidCertificate(format!("no certificates found in {}", cert_path.display()))
            })??;

        let key_pem = fs::read(key_path).await?;
        let key = private_key(&mut Cursor::new(key_pem))?.ok_or_else(|| {
            Error::InvalidCertificate(format!("no private key found in {}", key_path.display()))
        })?;

        Ok(Self::new(
            nickname,
            Certificate::from_der(cert_der.as_ref())?,
            PrivateKey::from_rustls(key),
        ))
    }

    #[must_use]
    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    #[must_use]
    pub const fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    #[must_use]
    pub const fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }
}

/// Generate a self-signed certificate and its key for subject `CN=<name>`.
///
/// Nothing is persisted here; the caller imports the pair into a store once
/// both halves exist.
///
/// # Errors
///
/// Returns [`Error::KeyGenerationFailed`] or [`Error::SigningFailed`]
pub fn generate_self_signed(name: &str, now: DateTime<Utc>) -> Result<(Certificate, PrivateKey)> {
    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
        .map_err(|e| Error::KeyGenerationFailed(e.to_string()))?;

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, name);

    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name;
    params.not_before = to_offset(now - TimeDelta::days(BACKDATE_DAYS))?;
    params.not_after = to_offset(now + TimeDelta::days(VALIDITY_DAYS))?;
    params.serial_number = Some(SerialNumber::from_slice(&random_serial()));

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::SigningFailed(e.to_string()))?;

    let certificate = Certificate::from_der(cert.der().as_ref())?;
    let private_key = PrivateKey::from_pkcs8_der(key_pair.serialize_der());

    Ok((certificate, private_key))
}

/// 63 random bits, so the DER integer is always positive and non-zero.
fn random_serial() -> [u8; 8] {
    let serial = (rand::random::<u64>() & 0x7fff_ffff_ffff_ffff).max(1);
    serial.to_be_bytes()
}

fn to_offset(at: DateTime<Utc>) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| Error::SigningFailed(format!("invalid validity timestamp: {e}")))
}

fn to_utc(raw: OffsetDateTime) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(raw.unix_timestamp(), raw.nanosecond())
        .ok_or_else(|| Error::InvalidCertificate("invalid certificate timestamp".to_string()))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn test_generate_self_signed_subject() {
        let (cert, key) = generate_self_signed("devtools", Utc::now()).unwrap();
        assert_eq!(cert.subject(), "CN=devtools");
        assert_eq!(cert.issuer(), "CN=devtools");
        assert_eq!(cert.common_name(), Some("devtools"));
        assert_eq!(cert.signature_algorithm(), "ecdsa-with-SHA256");
        assert!(key.pkcs8_der().is_some());
    }

    #[test]
    fn test_generate_self_signed_validity_window() {
        let now = Utc::now();
        let (cert, _) = generate_self_signed("devtools", now).unwrap();

        let back = (now - cert.not_before()).num_hours();
        let ahead = (cert.not_after() - now).num_days();
        assert!((23..=24).contains(&back), "not_before is {back}h before now");
        assert!((729..=730).contains(&ahead), "not_after is {ahead}d after now");
        assert!(cert.is_valid_at(now));
    }

    #[test]
    fn test_generate_self_signed_random_serial() {
        let now = Utc::now();
        let (first, _) = generate_self_signed("a", now).unwrap();
        let (second, _) = generate_self_signed("a", now).unwrap();
        assert!(!first.serial().is_empty());
        assert_ne!(first.serial(), second.serial());
        assert_ne!(first, second);
    }

    #[test]
    fn test_is_valid_at_boundaries() {
        let now = Utc::now();
        let (cert, _) = generate_self_signed("edge", now).unwrap();

        // before not_before
        assert!(!cert.is_valid_at(cert.not_before() - TimeDelta::seconds(1)));
        assert!(cert.is_valid_at(cert.not_before()));
        // expiring within a day
        assert!(!cert.is_valid_at(cert.not_after() - TimeDelta::hours(23)));
        assert!(!cert.is_valid_at(cert.not_after() + TimeDelta::days(1)));
        assert!(cert.is_valid_at(cert.not_after() - TimeDelta::days(2)));
    }

    #[test]
    fn test_expired_certificate() {
        let three_years_ago = Utc::now() - TimeDelta::days(3 * 365);
        let (cert, _) = generate_self_signed("old", three_years_ago).unwrap();
        assert!(!cert.is_valid_at(Utc::now()));
        assert!(cert.expiry_days(Utc::now()) < 0);
    }

    #[test]
    fn test_from_der_roundtrip_equality() {
        let (cert, _) = generate_self_signed("parse", Utc::now()).unwrap();
        let parsed = Certificate::from_der(cert.der()).unwrap();
        assert_eq!(parsed, cert);
        assert_eq!(parsed.serial(), cert.serial());
        assert_eq!(parsed.not_after(), cert.not_after());
    }

    #[test]
    fn test_from_der_invalid() {
        let err = Certificate::from_der(b"not a certificate").unwrap_err();
        assert!(matches!(err, Error::InvalidCertificate(_)));
    }

    #[test]
    fn test_private_key_debug_redacted() {
        let (_, key) = generate_self_signed("secret", Utc::now()).unwrap();
        let debug_str = format!("{key:?}");
        assert_eq!(debug_str, "PrivateKey(<redacted>)");
    }

    #[test]
    fn test_certificate_serialize_skips_der() {
        let (cert, _) = generate_self_signed("json", Utc::now()).unwrap();
        let json = serde_json::to_value(&cert).unwrap();
        assert_eq!(json["subject"], "CN=json");
        assert!(json.get("der").is_none());
    }
}
