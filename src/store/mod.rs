//! Persistent storage for server identities, looked up by nickname.

mod file;
mod memory;

pub use file::FileCertStore;
pub use memory::MemoryCertStore;

use crate::{
    error::Result,
    identity::{Certificate, PrivateKey, ServerIdentity},
};

/// Certificate and key database.
///
/// Calls may block on I/O; the issuer only invokes them from a blocking
/// worker thread.
pub trait CertificateStore: Send + Sync {
    /// Return the identity stored under `nickname`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::StoreUnavailable`] if the store cannot be read
    fn find_by_nickname(&self, nickname: &str) -> Result<Option<ServerIdentity>>;

    /// Persist a certificate and its private key under `nickname`,
    /// replacing any previous entry.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::StoreUnavailable`] if the entry cannot be written
    fn import(&self, nickname: &str, certificate: &Certificate, key: &PrivateKey) -> Result<()>;

    /// Remove the entry holding `certificate` together with its key.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::StoreUnavailable`] if the entry cannot be removed
    fn delete_cert_and_key(&self, certificate: &Certificate) -> Result<()>;

    /// Build a certificate object from DER bytes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidCertificate`] if the bytes do not parse
    fn construct_from_der(&self, der: &[u8]) -> Result<Certificate> {
        Certificate::from_der(der)
    }
}
