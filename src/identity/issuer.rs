//! Find-or-generate pipeline for the server's self-signed identity.

use super::{ServerIdentity, generate_self_signed};
use crate::{
    error::{Error, Result},
    metrics::{IDENTITY_EXPIRY_DAYS, IDENTITY_REGENERATIONS},
    store::CertificateStore,
};
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::Mutex,
    task::{self, JoinHandle},
};
use tracing::{debug, info, warn};

/// Resolve the identity stored under `name`, generating it when missing and
/// regenerating it once when the stored certificate is expired or not yet
/// valid.
///
/// Blocking: performs key generation and store I/O.
///
/// # Errors
///
/// Store, key generation and signing failures propagate unchanged.
/// [`Error::CertificateExpiredOrInvalid`] is returned only if the
/// regenerated certificate is rejected too.
pub fn resolve_identity(
    store: &dyn CertificateStore,
    name: &str,
    now: DateTime<Utc>,
) -> Result<ServerIdentity> {
    let identity = if let Some(identity) = store.find_by_nickname(name)? {
        debug!(name, serial = identity.certificate().serial(), "found stored identity");
        identity
    } else {
        IDENTITY_REGENERATIONS.with_label_values(&[name, "missing"]).inc();
        generate_and_import(store, name, now)?
    };

    if identity.certificate().is_valid_at(now) {
        return Ok(identity);
    }

    warn!(
        name,
        not_before = %identity.certificate().not_before(),
        not_after = %identity.certificate().not_after(),
        "stored identity is expired or not yet valid, regenerating"
    );
    store.delete_cert_and_key(identity.certificate())?;
    IDENTITY_REGENERATIONS.with_label_values(&[name, "invalid"]).inc();

    let identity = generate_and_import(store, name, now)?;
    if identity.certificate().is_valid_at(now) {
        Ok(identity)
    } else {
        Err(Error::CertificateExpiredOrInvalid)
    }
}

/// Generate a fresh pair, persist it, then read back the stored entry.
fn generate_and_import(
    store: &dyn CertificateStore,
    name: &str,
    now: DateTime<Utc>,
) -> Result<ServerIdentity> {
    let (certificate, private_key) = generate_self_signed(name, now)?;
    store.import(name, &certificate, &private_key)?;

    let identity = store.find_by_nickname(name)?.ok_or_else(|| {
        Error::StoreUnavailable(format!("identity {name:?} missing right after import"))
    })?;

    info!(
        name,
        serial = identity.certificate().serial(),
        not_after = %identity.certificate().not_after(),
        "generated self-signed identity"
    );
    Ok(identity)
}

/// Issues server identities and caches them for the lifetime of the issuer.
pub struct CertificateIssuer {
    store: Arc<dyn CertificateStore>,
    cache: Mutex<HashMap<String, Arc<ServerIdentity>>>,
}

impl CertificateIssuer {
    #[must_use]
    pub fn new(store: Arc<dyn CertificateStore>) -> Self {
        Self {
            store,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Return the identity for `name`, resolving it on a blocking worker the
    /// first time. Concurrent callers for the same name wait for a single
    /// resolution.
    ///
    /// # Errors
    ///
    /// See [`resolve_identity`]; a panicked worker maps to
    /// [`Error::StoreUnavailable`].
    pub async fn get_or_create_identity(&self, name: &str) -> Result<Arc<ServerIdentity>> {
        let mut cache = self.cache.lock().await;

        if let Some(identity) = cache.get(name) {
            if identity.certificate().is_valid_at(Utc::now()) {
                return Ok(Arc::clone(identity));
            }
            debug!(name, "cached identity no longer valid");
        }

        let store = Arc::clone(&self.store);
        let owned_name = name.to_string();
        let identity = task::spawn_blocking(move || {
            resolve_identity(store.as_ref(), &owned_name, Utc::now())
        })
        .await
        .map_err(|e| Error::StoreUnavailable(format!("identity worker failed: {e}")))??;

        IDENTITY_EXPIRY_DAYS
            .with_label_values(&[name])
            .set(identity.certificate().expiry_days(Utc::now()));

        let identity = Arc::new(identity);
        cache.insert(name.to_string(), Arc::clone(&identity));
        Ok(identity)
    }

    /// Callback flavour of [`Self::get_or_create_identity`].
    ///
    /// `callback` runs on a spawned tokio task, not on the caller's task.
    /// Callers that need the result in their own context await the returned
    /// handle (the callback has run once it resolves) or use
    /// [`Self::get_or_create_identity`] directly.
    pub fn request_identity<F>(self: &Arc<Self>, name: &str, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<Arc<ServerIdentity>>) + Send + 'static,
    {
        let issuer = Arc::clone(self);
        let name = name.to_string();
        tokio::spawn(async move {
            callback(issuer.get_or_create_identity(&name).await);
        })
    }
}
