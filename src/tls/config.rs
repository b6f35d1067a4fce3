use super::verifier::AcceptAnyClientCert;
use crate::{
    error::{Error, Result},
    identity::ServerIdentity,
};
use rustls::{
    ServerConfig,
    crypto::ring::{Ticketer, default_provider},
    server::{NoServerSessionStorage, ServerSessionMemoryCache, StoresServerSessions},
};
use std::{fmt, str::FromStr, sync::Arc};

/// Session cache capacity when caching is enabled.
const SESSION_CACHE_SIZE: usize = 256;

/// When the server asks clients for a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientCertMode {
    /// Never request a client certificate
    #[default]
    Never,
    /// Request one, continue without it
    Always,
    /// Require one on the first handshake
    RequireFirstHandshake,
    /// Require one on every handshake
    RequireAlways,
}

impl FromStr for ClientCertMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "never" => Ok(Self::Never),
            "always" => Ok(Self::Always),
            "require-first-handshake" => Ok(Self::RequireFirstHandshake),
            "require-always" => Ok(Self::RequireAlways),
            _ => Err(format!("Invalid client certificate mode: {s}")),
        }
    }
}

impl fmt::Display for ClientCertMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Never => "never",
            Self::Always => "always",
            Self::RequireFirstHandshake => "require-first-handshake",
            Self::RequireAlways => "require-always",
        })
    }
}

/// Server-side TLS options applied at listen time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerOptions {
    pub session_cache: bool,
    pub session_tickets: bool,
    pub client_cert: ClientCertMode,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            session_cache: true,
            session_tickets: true,
            client_cert: ClientCertMode::Never,
        }
    }
}

/// Bind `identity` into a rustls server configuration.
///
/// rustls never renegotiates, so a session keeps the parameters of its only
/// handshake.
///
/// # Errors
///
/// Returns [`Error::TlsConfiguration`] if the key does not match the
/// certificate or the ticketer cannot be created
pub fn build_server_config(
    identity: &ServerIdentity,
    options: &ServerOptions,
) -> Result<ServerConfig> {
    let verifier = Arc::new(AcceptAnyClientCert::new(options.client_cert));

    let mut config = ServerConfig::builder_with_provider(Arc::new(default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::TlsConfiguration(format!("TLS version config: {e}")))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(
            vec![identity.certificate().to_rustls()],
            identity.private_key().to_rustls(),
        )
        .map_err(|e| Error::TlsConfiguration(format!("server cert config: {e}")))?;

    let session_storage: Arc<dyn StoresServerSessions> = if options.session_cache {
        ServerSessionMemoryCache::new(SESSION_CACHE_SIZE)
    } else {
        Arc::new(NoServerSessionStorage {})
    };
    config.session_storage = session_storage;

    if options.session_tickets {
        config.ticketer = Ticketer::new()
            .map_err(|e| Error::TlsConfiguration(format!("session ticketer: {e}")))?;
    }

    if !options.session_cache && !options.session_tickets {
        config.send_tls13_tickets = 0;
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::identity::{CertificateIssuer, generate_self_signed};
    use chrono::Utc;

    fn identity() -> ServerIdentity {
        let (cert, key) = generate_self_signed("config", Utc::now()).unwrap();
        ServerIdentity::new("config", cert, key)
    }

    #[test]
    fn test_client_cert_mode_from_str() {
        assert_eq!("never".parse::<ClientCertMode>().unwrap(), ClientCertMode::Never);
        assert_eq!("always".parse::<ClientCertMode>().unwrap(), ClientCertMode::Always);
        assert_eq!(
            "require-first-handshake".parse::<ClientCertMode>().unwrap(),
            ClientCertMode::RequireFirstHandshake
        );
        assert_eq!(
            "REQUIRE-ALWAYS".parse::<ClientCertMode>().unwrap(),
            ClientCertMode::RequireAlways
        );
        assert!("sometimes".parse::<ClientCertMode>().is_err());
    }

    #[test]
    fn test_client_cert_mode_display_roundtrip() {
        for mode in [
            ClientCertMode::Never,
            ClientCertMode::Always,
            ClientCertMode::RequireFirstHandshake,
            ClientCertMode::RequireAlways,
        ] {
            assert_eq!(mode.to_string().parse::<ClientCertMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_server_options_default() {
        let options = ServerOptions::default();
        assert!(options.session_cache);
        assert!(options.session_tickets);
        assert_eq!(options.client_cert, ClientCertMode::Never);
    }

    #[test]
    fn test_build_server_config_defaults() {
        let config = build_server_config(&identity(), &ServerOptions::default()).unwrap();
        assert!(config.session_storage.can_cache());
        assert!(config.ticketer.enabled());
        assert!(config.send_tls13_tickets > 0);
    }

    #[test]
    fn test_build_server_config_no_resumption() {
        let options = ServerOptions {
            session_cache: false,
            session_tickets: false,
            client_cert: ClientCertMode::Always,
        };
        let config = build_server_config(&identity(), &options).unwrap();
        assert!(!config.session_storage.can_cache());
        assert!(!config.ticketer.enabled());
        assert_eq!(config.send_tls13_tickets, 0);
    }

    #[test]
    fn test_build_server_config_mismatched_key() {
        let (cert, _) = generate_self_signed("a", Utc::now()).unwrap();
        let (_, other_key) = generate_self_signed("b", Utc::now()).unwrap();
        let mismatched = ServerIdentity::new("a", cert, other_key);

        let err = build_server_config(&mismatched, &ServerOptions::default()).unwrap_err();
        assert!(matches!(err, Error::TlsConfiguration(_)));
    }

    #[tokio::test]
    async fn test_build_server_config_from_issuer() {
        let issuer = CertificateIssuer::new(Arc::new(crate::store::MemoryCertStore::new()));
        let identity = issuer.get_or_create_identity("issued").await.unwrap();
        assert!(build_server_config(&identity, &ServerOptions::default()).is_ok());
    }
}
