use super::CertificateStore;
use crate::{
    error::{Error, Result},
    identity::{Certificate, PrivateKey, ServerIdentity},
};
use std::{collections::HashMap, sync::RwLock};
use tracing::debug;

/// In-process store; contents are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryCertStore {
    entries: RwLock<HashMap<String, ServerIdentity>>,
}

impl MemoryCertStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored identities
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the lock is poisoned
    pub fn len(&self) -> Result<usize> {
        Ok(self.entries.read().map_err(poisoned)?.len())
    }

    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the lock is poisoned
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl CertificateStore for MemoryCertStore {
    fn find_by_nickname(&self, nickname: &str) -> Result<Option<ServerIdentity>> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries.get(nickname).cloned())
    }

    fn import(&self, nickname: &str, certificate: &Certificate, key: &PrivateKey) -> Result<()> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.insert(
            nickname.to_string(),
            ServerIdentity::new(nickname, certificate.clone(), key.clone()),
        );
        debug!(nickname, serial = certificate.serial(), "imported identity");
        Ok(())
    }

    fn delete_cert_and_key(&self, certificate: &Certificate) -> Result<()> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.retain(|_, identity| identity.certificate() != certificate);
        Ok(())
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> Error {
    Error::StoreUnavailable("memory store lock poisoned".to_string())
}
