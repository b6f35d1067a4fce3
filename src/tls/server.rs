//! Listening TLS socket.
//!
//! All per-socket work happens on one task: accepting, nudging pending
//! handshakes and handing finished connections to the consumer. Connections
//! live in a table keyed by [`ConnectionId`]; timers and handshake callbacks
//! only carry the id, so anything arriving for a closed connection is ignored.

use super::{
    config::{ClientCertMode, ServerOptions, build_server_config},
    connection::{ConnectionId, ConnectionState, PendingConnection, TlsConnection},
    metadata::TlsClientStatus,
    nudge::{NudgeOutcome, NudgeScheduler, TokioNudgeScheduler},
    transport::{TlsTransport, Transport},
};
use crate::{
    error::{Error, Result},
    identity::ServerIdentity,
    metrics::{
        CONNECTIONS_ACCEPTED, HANDSHAKE_DURATION, HANDSHAKE_FAILURES, HANDSHAKES_COMPLETED,
        HANDSHAKES_IN_FLIGHT, TLS_INFO,
    },
    store::{CertificateStore, MemoryCertStore},
};
use rustls::ServerConfig;
use std::{collections::HashMap, io, net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info, trace, warn};

/// What the consumer learns about the socket that accepted a connection.
#[derive(Debug, Clone)]
pub struct ServerSocketInfo {
    pub local_addr: SocketAddr,
    pub identity: Arc<ServerIdentity>,
    pub options: ServerOptions,
}

/// Receives the connections of a listening socket.
pub trait SocketListener: Send + 'static {
    /// A handshake completed. Called exactly once per successful connection.
    fn on_socket_accepted(&mut self, server: &ServerSocketInfo, connection: TlsConnection);

    /// `listen` failed; the socket never started.
    fn on_listen_error(&mut self, _error: &Error) {}

    /// The socket stopped accepting.
    fn on_stop_listening(&mut self) {}
}

impl SocketListener for mpsc::UnboundedSender<TlsConnection> {
    fn on_socket_accepted(&mut self, _server: &ServerSocketInfo, connection: TlsConnection) {
        if let Err(e) = self.send(connection) {
            debug!(connection = %e.0.id(), "consumer dropped, discarding connection");
        }
    }
}

/// Server-side TLS socket. Configure it, then [`listen`](Self::listen).
pub struct TlsServerSocket {
    identity: Option<Arc<ServerIdentity>>,
    options: ServerOptions,
    store: Arc<dyn CertificateStore>,
}

impl Default for TlsServerSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl TlsServerSocket {
    #[must_use]
    pub fn new() -> Self {
        Self {
            identity: None,
            options: ServerOptions::default(),
            store: Arc::new(MemoryCertStore::new()),
        }
    }

    pub fn set_server_identity(&mut self, identity: Arc<ServerIdentity>) {
        self.identity = Some(identity);
    }

    #[must_use]
    pub const fn server_identity(&self) -> Option<&Arc<ServerIdentity>> {
        self.identity.as_ref()
    }

    /// Store used to build client certificate objects
    pub fn set_certificate_store(&mut self, store: Arc<dyn CertificateStore>) {
        self.store = store;
    }

    pub const fn set_session_cache(&mut self, enabled: bool) {
        self.options.session_cache = enabled;
    }

    pub const fn set_session_tickets(&mut self, enabled: bool) {
        self.options.session_tickets = enabled;
    }

    pub const fn set_request_certificate(&mut self, mode: ClientCertMode) {
        self.options.client_cert = mode;
    }

    #[must_use]
    pub const fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Bind `addr` and start accepting on a background task.
    ///
    /// # Errors
    ///
    /// [`Error::NotInitialized`] without an identity,
    /// [`Error::TlsConfiguration`] if the identity cannot be used and
    /// [`Error::Transport`] if binding fails. The consumer's
    /// `on_listen_error` sees the error first.
    pub async fn listen<L: SocketListener>(
        &self,
        addr: SocketAddr,
        mut consumer: L,
    ) -> Result<ListeningSocket> {
        let identity = self
            .identity
            .clone()
            .ok_or_else(|| report(&mut consumer, Error::NotInitialized))?;

        let config = build_server_config(&identity, &self.options)
            .map(Arc::new)
            .map_err(|e| report(&mut consumer, e))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| report(&mut consumer, e.into()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| report(&mut consumer, e.into()))?;

        info!(
            %local_addr,
            identity = identity.nickname(),
            client_cert = %self.options.client_cert,
            session_cache = self.options.session_cache,
            session_tickets = self.options.session_tickets,
            "listening"
        );

        let info = ServerSocketInfo {
            local_addr,
            identity,
            options: self.options,
        };
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let socket_loop = SocketLoop::new(listener, config, Arc::clone(&self.store), info, consumer);
        let task = tokio::spawn(socket_loop.run(shutdown_rx));

        Ok(ListeningSocket {
            local_addr,
            shutdown: shutdown_tx,
            task,
        })
    }
}

fn report<L: SocketListener>(consumer: &mut L, error: Error) -> Error {
    warn!(error = %error, "listen failed");
    consumer.on_listen_error(&error);
    error
}

/// Handle of a running socket; dropping it stops the socket as well.
#[derive(Debug)]
pub struct ListeningSocket {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ListeningSocket {
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, close pending handshakes and wait for the loop to exit.
    pub async fn close(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            error!(error = %e, "socket loop failed");
        }
    }
}

struct SocketLoop<L> {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    store: Arc<dyn CertificateStore>,
    info: ServerSocketInfo,
    consumer: L,
    connections: HashMap<ConnectionId, PendingConnection>,
    next_id: u64,
    scheduler: Box<dyn NudgeScheduler>,
    nudge_rx: mpsc::UnboundedReceiver<ConnectionId>,
    handshake_tx: mpsc::UnboundedSender<ConnectionId>,
    handshake_rx: mpsc::UnboundedReceiver<ConnectionId>,
}

impl<L: SocketListener> SocketLoop<L> {
    fn new(
        listener: TcpListener,
        config: Arc<ServerConfig>,
        store: Arc<dyn CertificateStore>,
        info: ServerSocketInfo,
        consumer: L,
    ) -> Self {
        let (nudge_tx, nudge_rx) = mpsc::unbounded_channel();
        let (handshake_tx, handshake_rx) = mpsc::unbounded_channel();
        Self {
            listener,
            config,
            store,
            info,
            consumer,
            connections: HashMap::new(),
            next_id: 0,
            scheduler: Box::new(TokioNudgeScheduler::new(nudge_tx)),
            nudge_rx,
            handshake_tx,
            handshake_rx,
        }
    }

    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                _ = &mut shutdown => break,

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.on_accept(stream, peer),
                    // a failed accept never stops the socket
                    Err(e) => warn!(error = %e, "accept failed"),
                },

                Some(id) = self.handshake_rx.recv() => self.on_handshake_done(id),

                Some(id) = self.nudge_rx.recv() => self.on_nudge(id),
            }
        }

        let pending: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in pending {
            self.fail(
                id,
                &Error::Transport(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "listening socket closed",
                )),
            );
        }

        info!(local_addr = %self.info.local_addr, "stopped listening");
        self.consumer.on_stop_listening();
    }

    fn on_accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        CONNECTIONS_ACCEPTED.inc();

        let id = ConnectionId::new(self.next_id);
        self.next_id += 1;

        let transport = match TlsTransport::new(stream, Arc::clone(&self.config)) {
            Ok(transport) => Arc::new(transport),
            Err(e) => {
                warn!(connection = %id, %peer, error = %e, "could not start TLS session");
                HANDSHAKE_FAILURES.with_label_values(&[e.kind()]).inc();
                return;
            }
        };

        let handshake_tx = self.handshake_tx.clone();
        if let Err(e) = transport.on_handshake_complete(Box::new(move || {
            let _ = handshake_tx.send(id);
        })) {
            warn!(connection = %id, %peer, error = %e, "could not install handshake callback");
            return;
        }

        let mut pending = PendingConnection::new(transport);
        pending.advance(ConnectionState::Handshaking);
        let delay = pending.nudger.start();
        self.connections.insert(id, pending);
        HANDSHAKES_IN_FLIGHT.inc();

        debug!(connection = %id, %peer, "accepted connection");
        self.scheduler.schedule(id, delay);
    }

    fn on_nudge(&mut self, id: ConnectionId) {
        let Some(pending) = self.connections.get_mut(&id) else {
            trace!(connection = %id, "nudge for a connection that is gone");
            return;
        };

        let outcome = pending.nudger.nudge(pending.transport.as_ref());
        match outcome {
            NudgeOutcome::Retry(delay) => {
                trace!(connection = %id, ?delay, "handshake pending");
                self.scheduler.schedule(id, delay);
            }
            // completion is reported through the handshake channel
            NudgeOutcome::Progressed => trace!(connection = %id, "handshake progressed"),
            NudgeOutcome::Failed(e) => self.fail(id, &Error::Transport(e)),
        }
    }

    fn on_handshake_done(&mut self, id: ConnectionId) {
        let Some(mut pending) = self.connections.remove(&id) else {
            return;
        };
        HANDSHAKES_IN_FLIGHT.dec();

        let status = pending
            .transport
            .handshake_details()
            .map_err(Error::from)
            .and_then(|details| TlsClientStatus::from_handshake(&details, self.store.as_ref()));

        match status {
            Ok(status) => {
                pending.advance(ConnectionState::Ready);
                HANDSHAKES_COMPLETED.inc();
                HANDSHAKE_DURATION.observe(pending.accepted_at.elapsed().as_secs_f64());
                TLS_INFO
                    .with_label_values(&[status.tls_version.as_str(), status.cipher_name.as_str()])
                    .set(1);

                info!(
                    connection = %id,
                    peer = %pending.transport.peer_addr(),
                    version = %status.tls_version,
                    cipher = %status.cipher_name,
                    client_cert = status.peer_cert.is_some(),
                    "handshake complete"
                );

                let connection = TlsConnection::new(id, pending.transport, status);
                self.consumer.on_socket_accepted(&self.info, connection);
            }
            Err(e) => self.close_failed(id, pending, &e),
        }
    }

    /// Drop `id` from the table and close it.
    fn fail(&mut self, id: ConnectionId, reason: &Error) {
        if let Some(pending) = self.connections.remove(&id) {
            HANDSHAKES_IN_FLIGHT.dec();
            self.close_failed(id, pending, reason);
        }
    }

    // The consumer is not told about failed handshakes; they are only logged
    // and counted.
    fn close_failed(&self, id: ConnectionId, mut pending: PendingConnection, reason: &Error) {
        let previous = pending.state();
        pending.advance(ConnectionState::Failed);
        pending.transport.close(reason);
        HANDSHAKE_FAILURES.with_label_values(&[reason.kind()]).inc();
        warn!(
            connection = %id,
            peer = %pending.transport.peer_addr(),
            state = ?previous,
            local_addr = %self.info.local_addr,
            error = %reason,
            "handshake failed"
        );
    }
}
