use crate::{
    cli::actions::ServeArgs,
    identity::{CertificateIssuer, ServerIdentity},
    metrics::encode_metrics,
    store::{CertificateStore, FileCertStore, MemoryCertStore},
    tls::{
        ListeningSocket, ServerSocketInfo, SocketListener, TlsClientStatus, TlsConnection,
        TlsServerSocket,
    },
};
use anyhow::Context;
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};
use tokio::{net::TcpListener, signal};
use tracing::{debug, info, warn};

const ECHO_BUFFER_SIZE: usize = 16 * 1024;

/// One line of output per accepted connection
#[derive(Serialize, Debug)]
struct Accepted<'a> {
    time: String,
    connection: u64,
    peer: SocketAddr,
    local: SocketAddr,
    identity: &'a str,
    #[serde(flatten)]
    status: &'a TlsClientStatus,
}

/// Consumer of the listening socket: reports every connection and echoes
/// whatever the client sends until it hangs up.
#[derive(Debug, Default, Clone, Copy)]
struct EchoConsumer;

impl SocketListener for EchoConsumer {
    fn on_socket_accepted(&mut self, server: &ServerSocketInfo, connection: TlsConnection) {
        let line = Accepted {
            time: now(),
            connection: connection.id().get(),
            peer: connection.peer_addr(),
            local: server.local_addr,
            identity: server.identity.nickname(),
            status: connection.status(),
        };
        match serde_json::to_string(&line) {
            Ok(serialized) => println!("{serialized}"),
            Err(e) => eprintln!("{e}"),
        }

        tokio::spawn(echo(connection));
    }

    fn on_stop_listening(&mut self) {
        println!("{} - Stopped listening", now());
    }
}

async fn echo(connection: TlsConnection) {
    let mut buf = vec![0u8; ECHO_BUFFER_SIZE];
    loop {
        match connection.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let Some(data) = buf.get(..n) else { break };
                if let Err(e) = connection.write_all(data).await {
                    debug!(connection = %connection.id(), error = %e, "echo write failed");
                    return;
                }
            }
            Err(e) => {
                debug!(connection = %connection.id(), error = %e, "echo read failed");
                return;
            }
        }
    }

    if let Err(e) = connection.shutdown().await {
        debug!(connection = %connection.id(), error = %e, "shutdown failed");
    }
    debug!(connection = %connection.id(), "client closed");
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Start the echo server
///
/// # Errors
///
/// Returns an error if the identity cannot be obtained or a port cannot be bound
pub async fn start(args: ServeArgs) -> anyhow::Result<()> {
    let store: Arc<dyn CertificateStore> = match &args.store {
        Some(dir) => Arc::new(
            FileCertStore::open(dir)
                .with_context(|| format!("failed to open certificate store {}", dir.display()))?,
        ),
        None => Arc::new(MemoryCertStore::new()),
    };

    let identity = server_identity(&args, &store).await?;

    let certificate = identity.certificate();
    println!(
        "{} - Identity {}, serial: {}, expires: {}",
        now(),
        certificate.subject(),
        certificate.serial(),
        certificate.not_after().to_rfc3339_opts(SecondsFormat::Secs, true)
    );

    let mut socket = TlsServerSocket::new();
    socket.set_server_identity(identity);
    socket.set_certificate_store(store);
    socket.set_session_cache(args.options.session_cache);
    socket.set_session_tickets(args.options.session_tickets);
    socket.set_request_certificate(args.options.client_cert);

    let listening = listen(&socket, args.listen, args.port).await?;
    println!(
        "{} - Listening on {}, client certificates: {}",
        now(),
        listening.local_addr(),
        socket.options().client_cert
    );

    let (metrics_listener, metrics_addr) = bind_metrics(args.listen, args.metrics_port).await?;
    println!("{} - Metrics on http://{metrics_addr}/metrics", now());

    let app = Router::new().route("/metrics", get(metrics_handler));
    let server = axum::serve(metrics_listener, app.into_make_service());

    tokio::select! {
        result = server => {
            result.context("metrics server failed")?;
        }
        result = signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            info!("shutting down");
        }
    }

    listening.close().await;

    Ok(())
}

/// The identity given as PEM files, else the one issued through `store`
async fn server_identity(
    args: &ServeArgs,
    store: &Arc<dyn CertificateStore>,
) -> anyhow::Result<Arc<ServerIdentity>> {
    if let Some(files) = &args.identity_files {
        let identity = ServerIdentity::from_pem_files(&args.name, &files.cert, &files.key)
            .await
            .with_context(|| {
                format!(
                    "failed to load identity from {} and {}",
                    files.cert.display(),
                    files.key.display()
                )
            })?;
        return Ok(Arc::new(identity));
    }

    CertificateIssuer::new(Arc::clone(store))
        .get_or_create_identity(&args.name)
        .await
        .with_context(|| format!("failed to obtain identity {}", args.name))
}

/// Listen on `listen:port`, or on `[::]:port` falling back to `0.0.0.0:port`
async fn listen(
    socket: &TlsServerSocket,
    listen: Option<IpAddr>,
    port: u16,
) -> anyhow::Result<ListeningSocket> {
    if let Some(addr) = listen {
        return socket
            .listen(SocketAddr::new(addr, port), EchoConsumer)
            .await
            .with_context(|| format!("failed to listen on {addr}:{port}"));
    }

    match socket
        .listen(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port), EchoConsumer)
        .await
    {
        Ok(listening) => Ok(listening),
        Err(e) => {
            warn!(error = %e, "IPv6 unavailable, falling back to IPv4");
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
            socket
                .listen(addr, EchoConsumer)
                .await
                .with_context(|| format!("failed to listen on {addr}"))
        }
    }
}

async fn bind_metrics(
    listen: Option<IpAddr>,
    port: u16,
) -> anyhow::Result<(TcpListener, SocketAddr)> {
    let listener = match listen {
        Some(addr) => TcpListener::bind((addr, port)).await?,
        None => {
            // Auto mode: try IPv6 first, fallback to IPv4
            if let Ok(l) = TcpListener::bind((Ipv6Addr::UNSPECIFIED, port)).await {
                l
            } else {
                TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?
            }
        }
    };
    let addr = listener.local_addr()?;
    Ok((listener, addr))
}

async fn metrics_handler() -> impl IntoResponse {
    match encode_metrics() {
        Ok(buffer) => (StatusCode::OK, buffer),
        Err(e) => {
            eprintln!("{e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Vec::new())
        }
    }
}
