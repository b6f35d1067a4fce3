//! Error taxonomy for the TLS server socket and identity issuance.
//!
//! Certificate validation failures are recovered locally by the issuer (one
//! regeneration) and only surface as [`Error::CertificateExpiredOrInvalid`]
//! when the regenerated certificate is rejected too. Everything else
//! propagates to the nearest asynchronous caller.

use std::io;
use thiserror::Error;

/// Errors produced by the `tlslisten` library.
#[derive(Debug, Error)]
pub enum Error {
    // --- Identity / store ---
    #[error("certificate store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    #[error("certificate signing failed: {0}")]
    SigningFailed(String),

    #[error("certificate is expired or not yet valid")]
    CertificateExpiredOrInvalid,

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    // --- Server socket ---
    #[error("server identity has not been set")]
    NotInitialized,

    #[error("TLS configuration error: {0}")]
    TlsConfiguration(String),

    #[error("failed to extract handshake details: {0}")]
    HandshakeExtractionFailed(String),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Short label used for metrics and logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::StoreUnavailable(_) => "store",
            Self::KeyGenerationFailed(_) => "keygen",
            Self::SigningFailed(_) => "signing",
            Self::CertificateExpiredOrInvalid => "expired",
            Self::InvalidCertificate(_) => "certificate",
            Self::NotInitialized => "not_initialized",
            Self::TlsConfiguration(_) => "config",
            Self::HandshakeExtractionFailed(_) => "extraction",
            Self::Transport(_) => "transport",
        }
    }
}
