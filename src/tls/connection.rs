use super::{
    metadata::TlsClientStatus,
    nudge::HandshakeNudger,
    transport::TlsTransport,
};
use std::{fmt, io, net::SocketAddr, sync::Arc, time::Instant};

/// Handle of a connection in a listening socket's table. Ids are never
/// reused within one socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// `Accepted -> Handshaking -> {Ready | Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Handshaking,
    Ready,
    Failed,
}

impl ConnectionState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }

    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Accepted, Self::Handshaking | Self::Failed)
                | (Self::Handshaking, Self::Ready | Self::Failed)
        )
    }
}

/// A connection still negotiating, owned by the socket loop.
#[derive(Debug)]
pub(crate) struct PendingConnection {
    pub(crate) transport: Arc<TlsTransport>,
    pub(crate) nudger: HandshakeNudger,
    pub(crate) accepted_at: Instant,
    state: ConnectionState,
}

impl PendingConnection {
    pub(crate) fn new(transport: Arc<TlsTransport>) -> Self {
        Self {
            transport,
            nudger: HandshakeNudger::new(),
            accepted_at: Instant::now(),
            state: ConnectionState::Accepted,
        }
    }

    pub(crate) const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `next`; invalid transitions leave the state unchanged.
    pub(crate) fn advance(&mut self, next: ConnectionState) -> bool {
        if self.state.can_advance_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }
}

/// A connection whose handshake has completed, handed to the consumer.
#[derive(Debug, Clone)]
pub struct TlsConnection {
    id: ConnectionId,
    transport: Arc<TlsTransport>,
    status: TlsClientStatus,
}

impl TlsConnection {
    pub(crate) const fn new(
        id: ConnectionId,
        transport: Arc<TlsTransport>,
        status: TlsClientStatus,
    ) -> Self {
        Self {
            id,
            transport,
            status,
        }
    }

    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.transport.peer_addr()
    }

    #[must_use]
    pub const fn transport(&self) -> &Arc<TlsTransport> {
        &self.transport
    }

    /// Parameters negotiated during the handshake
    #[must_use]
    pub const fn status(&self) -> &TlsClientStatus {
        &self.status
    }

    /// # Errors
    ///
    /// See [`TlsTransport::read`]
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.transport.read(buf).await
    }

    /// # Errors
    ///
    /// See [`TlsTransport::write_all`]
    pub async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        self.transport.write_all(buf).await
    }

    /// # Errors
    ///
    /// See [`TlsTransport::shutdown`]
    pub async fn shutdown(&self) -> io::Result<()> {
        self.transport.shutdown().await
    }
}
