mod run;

use crate::tls::{ClientAuth, ServerOptions};
use std::{net::IpAddr, path::PathBuf};

/// PEM files of an existing server identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Arguments of the `serve` command
#[derive(Debug)]
pub struct ServeArgs {
    pub listen: Option<IpAddr>,
    pub port: u16,
    pub metrics_port: u16,
    pub name: String,
    pub store: Option<PathBuf>,
    pub identity_files: Option<IdentityFiles>,
    pub options: ServerOptions,
}

/// Arguments of the `probe` command
#[derive(Debug)]
pub struct ProbeArgs {
    pub host: String,
    pub port: u16,
    pub client_auth: Option<ClientAuth>,
    pub message: String,
}

/// Action enum representing each possible command
#[derive(Debug)]
pub enum Action {
    Serve(ServeArgs),
    Probe(ProbeArgs),
}

impl Action {
    /// Execute the action
    ///
    /// # Errors
    ///
    /// Returns an error if the action fails to execute
    pub async fn execute(self) -> anyhow::Result<()> {
        run::execute(self).await
    }
}
