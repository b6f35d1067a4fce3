use super::CertificateStore;
use crate::{
    error::{Error, Result},
    identity::{Certificate, PrivateKey, ServerIdentity},
};
use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

const CERT_SUFFIX: &str = ".cert.der";
const KEY_SUFFIX: &str = ".key.der";

/// Directory-backed store: `<nickname>.key.der` (PKCS#8) next to
/// `<nickname>.cert.der`.
#[derive(Debug, Clone)]
pub struct FileCertStore {
    dir: PathBuf,
}

impl FileCertStore {
    /// Open (and create if needed) a store rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the directory cannot be created
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| unavailable(&dir, &e))?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn cert_path(&self, nickname: &str) -> PathBuf {
        self.dir.join(format!("{nickname}{CERT_SUFFIX}"))
    }

    fn key_path(&self, nickname: &str) -> PathBuf {
        self.dir.join(format!("{nickname}{KEY_SUFFIX}"))
    }

    /// Nickname whose certificate file holds exactly `der`.
    fn nickname_for(&self, der: &[u8]) -> Result<Option<String>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| unavailable(&self.dir, &e))?;
        for entry in entries {
            let entry = entry.map_err(|e| unavailable(&self.dir, &e))?;
            let file_name = entry.file_name();
            let Some(nickname) = file_name
                .to_str()
                .and_then(|name| name.strip_suffix(CERT_SUFFIX))
            else {
                continue;
            };
            let path = entry.path();
            match fs::read(&path) {
                Ok(stored) if stored == der => return Ok(Some(nickname.to_string())),
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable certificate"),
            }
        }
        Ok(None)
    }
}

impl CertificateStore for FileCertStore {
    fn find_by_nickname(&self, nickname: &str) -> Result<Option<ServerIdentity>> {
        validate_nickname(nickname)?;

        let cert_path = self.cert_path(nickname);
        let cert_der = match fs::read(&cert_path) {
            Ok(der) => der,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(unavailable(&cert_path, &e)),
        };

        let key_path = self.key_path(nickname);
        let key_der = match fs::read(&key_path) {
            Ok(der) => der,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(nickname, "certificate without private key, ignoring entry");
                return Ok(None);
            }
            Err(e) => return Err(unavailable(&key_path, &e)),
        };

        let certificate = self.construct_from_der(&cert_der)?;
        Ok(Some(ServerIdentity::new(
            nickname,
            certificate,
            PrivateKey::from_pkcs8_der(key_der),
        )))
    }

    fn import(&self, nickname: &str, certificate: &Certificate, key: &PrivateKey) -> Result<()> {
        validate_nickname(nickname)?;

        let key_der = key.pkcs8_der().ok_or_else(|| {
            Error::StoreUnavailable("only PKCS#8 private keys can be stored".to_string())
        })?;

        let key_path = self.key_path(nickname);
        let cert_path = self.cert_path(nickname);

        // both files are fully written before either replaces a stored one
        let key_tmp = stage(&key_path, key_der, true)?;
        let cert_tmp = match stage(&cert_path, certificate.der(), false) {
            Ok(tmp) => tmp,
            Err(e) => {
                let _ = fs::remove_file(&key_tmp);
                return Err(e);
            }
        };

        let previous_key = match read_optional(&key_path) {
            Ok(previous) => previous,
            Err(e) => {
                let _ = fs::remove_file(&key_tmp);
                let _ = fs::remove_file(&cert_tmp);
                return Err(e);
            }
        };

        // key lands first so a certificate file is never without its key
        if let Err(e) = fs::rename(&key_tmp, &key_path) {
            let _ = fs::remove_file(&key_tmp);
            let _ = fs::remove_file(&cert_tmp);
            return Err(unavailable(&key_path, &e));
        }
        if let Err(e) = fs::rename(&cert_tmp, &cert_path) {
            let _ = fs::remove_file(&cert_tmp);
            restore_key(&key_path, previous_key.as_deref());
            return Err(unavailable(&cert_path, &e));
        }

        debug!(
            nickname,
            serial = certificate.serial(),
            dir = %self.dir.display(),
            "imported identity"
        );
        Ok(())
    }

    fn delete_cert_and_key(&self, certificate: &Certificate) -> Result<()> {
        let Some(nickname) = self.nickname_for(certificate.der())? else {
            return Ok(());
        };

        for path in [self.cert_path(&nickname), self.key_path(&nickname)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(unavailable(&path, &e)),
            }
        }

        debug!(nickname, "deleted identity");
        Ok(())
    }
}

fn validate_nickname(nickname: &str) -> Result<()> {
    let valid = !nickname.is_empty()
        && !nickname.starts_with('.')
        && nickname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));

    if valid {
        Ok(())
    } else {
        Err(Error::StoreUnavailable(format!(
            "invalid nickname: {nickname:?}"
        )))
    }
}

/// Write `contents` next to `path` as `<stem>.tmp` and return the temp path.
fn stage(path: &Path, contents: &[u8], private: bool) -> Result<PathBuf> {
    let tmp = path.with_extension("tmp");

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    if private {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    #[cfg(not(unix))]
    let _ = private;

    let result = options.open(&tmp).and_then(|mut file| {
        file.write_all(contents)?;
        file.sync_all()
    });
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(unavailable(path, &e));
    }
    Ok(tmp)
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(unavailable(path, &e)),
    }
}

/// Put back the key that was replaced, or remove the new one if there was none.
fn restore_key(key_path: &Path, previous: Option<&[u8]>) {
    let restored = match previous {
        Some(contents) => stage(key_path, contents, true).and_then(|tmp| {
            fs::rename(&tmp, key_path).map_err(|e| {
                let _ = fs::remove_file(&tmp);
                unavailable(key_path, &e)
            })
        }),
        None => match fs::remove_file(key_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(unavailable(key_path, &e)),
        },
    };
    if let Err(e) = restored {
        warn!(path = %key_path.display(), error = %e, "could not roll back private key");
    }
}

fn unavailable(path: &Path, e: &io::Error) -> Error {
    Error::StoreUnavailable(format!("{}: {e}", path.display()))
}
