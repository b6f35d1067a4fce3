use crate::{
    cli::actions::{Action, IdentityFiles, ProbeArgs, ServeArgs},
    tls::{ClientAuth, ClientCertMode, ServerOptions},
};
use anyhow::{Context, Result, anyhow};
use clap::ArgMatches;
use std::{net::IpAddr, path::PathBuf};

/// Convert `ArgMatches` into typed Action enum with validation
///
/// # Errors
///
/// Returns an error if the subcommand is unknown or a value is invalid
pub fn dispatch(matches: &ArgMatches) -> Result<Action> {
    match matches.subcommand() {
        Some(("serve", sub)) => dispatch_serve(sub).map(Action::Serve),
        Some(("probe", sub)) => dispatch_probe(sub).map(Action::Probe),
        Some((other, _)) => Err(anyhow!("unknown subcommand: {other}")),
        None => Err(anyhow!("a subcommand is required")),
    }
}

fn dispatch_serve(matches: &ArgMatches) -> Result<ServeArgs> {
    // Extract and validate listen address
    let listen = matches
        .get_one::<String>("listen")
        .map(|addr| {
            addr.parse::<IpAddr>()
                .with_context(|| format!("Invalid IP address: {addr}"))
        })
        .transpose()?;

    let port = matches.get_one::<u16>("port").copied().unwrap_or(6080);
    let metrics_port = matches
        .get_one::<u16>("metrics-port")
        .copied()
        .unwrap_or(9300);

    let name = matches
        .get_one::<String>("name")
        .cloned()
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());

    let store = matches.get_one::<String>("store").map(PathBuf::from);

    let identity_files = match (
        matches.get_one::<String>("identity-cert"),
        matches.get_one::<String>("identity-key"),
    ) {
        (Some(cert), Some(key)) => Some(IdentityFiles {
            cert: PathBuf::from(cert),
            key: PathBuf::from(key),
        }),
        (None, None) => None,
        _ => anyhow::bail!("--identity-cert and --identity-key must be given together"),
    };

    let defaults = ServerOptions::default();
    let client_cert = matches
        .get_one::<String>("request-cert")
        .map(|mode| mode.parse::<ClientCertMode>().map_err(|e| anyhow!(e)))
        .transpose()?
        .unwrap_or_default();

    Ok(ServeArgs {
        listen,
        port,
        metrics_port,
        name,
        store,
        identity_files,
        options: ServerOptions {
            session_cache: matches
                .get_one::<bool>("session-cache")
                .copied()
                .unwrap_or(defaults.session_cache),
            session_tickets: matches
                .get_one::<bool>("session-tickets")
                .copied()
                .unwrap_or(defaults.session_tickets),
            client_cert,
        },
    })
}

fn dispatch_probe(matches: &ArgMatches) -> Result<ProbeArgs> {
    let host = matches
        .get_one::<String>("host")
        .cloned()
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let port = matches.get_one::<u16>("port").copied().unwrap_or(6080);

    let client_auth = match (
        matches.get_one::<String>("cert"),
        matches.get_one::<String>("key"),
    ) {
        (Some(cert), Some(key)) => Some(ClientAuth {
            cert: PathBuf::from(cert),
            key: PathBuf::from(key),
        }),
        (None, None) => None,
        _ => anyhow::bail!("--cert and --key must be given together"),
    };

    let message = matches
        .get_one::<String>("message")
        .cloned()
        .unwrap_or_else(|| "HELLO".to_string());

    Ok(ProbeArgs {
        host,
        port,
        client_auth,
        message,
    })
}
