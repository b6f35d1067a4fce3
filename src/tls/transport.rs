//! Non-blocking server-side TLS transport.
//!
//! A [`TlsTransport`] owns an accepted TCP stream and the rustls session on
//! top of it. Until the handshake completes nothing drives the session on its
//! own: the socket loop calls [`Transport::try_write`] with an empty buffer
//! (a nudge), which reads whatever the client has sent, flushes the server's
//! handshake flight and reports `WouldBlock` while negotiation is still in
//! progress. Once the connection is handed to the consumer the async
//! [`TlsTransport::read`] and [`TlsTransport::write_all`] drive it instead.

use super::metadata::HandshakeDetails;
use crate::error::{Error, Result};
use rustls::{ServerConfig, ServerConnection};
use std::{
    fmt,
    io::{self, Read, Write},
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Runs once when the handshake has completed.
pub type HandshakeCallback = Box<dyn FnOnce() + Send>;

/// Non-blocking byte transport seen by the handshake nudger.
pub trait Transport: Send + Sync {
    /// Write without blocking.
    ///
    /// # Errors
    ///
    /// `WouldBlock` while the write cannot make progress, any other error
    /// when the connection is unusable
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Close the transport because of `reason`.
    fn close(&self, reason: &Error);
}

/// std `Read`/`Write` over a tokio stream's non-blocking `try_*` calls.
struct SocketIo<'a>(&'a TcpStream);

impl Read for SocketIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl Write for SocketIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct Session {
    tls: ServerConnection,
    on_handshake: Option<HandshakeCallback>,
    eof: bool,
    closed: bool,
}

impl Session {
    /// Feed everything readable into the TLS session.
    fn read_socket(&mut self, stream: &TcpStream) -> io::Result<()> {
        while !self.eof && self.tls.wants_read() {
            match self.tls.read_tls(&mut SocketIo(stream)) {
                Ok(0) => self.eof = true,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }

            if let Err(e) = self.tls.process_new_packets() {
                // the session queued an alert, try to deliver it
                let _ = self.write_socket(stream);
                return Err(io::Error::new(io::ErrorKind::InvalidData, e));
            }
        }
        Ok(())
    }

    /// Send queued TLS records until the socket would block.
    fn write_socket(&mut self, stream: &TcpStream) -> io::Result<()> {
        while self.tls.wants_write() {
            match self.tls.write_tls(&mut SocketIo(stream)) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn pump(&mut self, stream: &TcpStream) -> io::Result<()> {
        self.read_socket(stream)?;
        self.write_socket(stream)
    }

    fn try_write(&mut self, stream: &TcpStream, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed"));
        }

        self.pump(stream)?;

        if self.tls.is_handshaking() {
            if self.eof {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed the connection during the handshake",
                ));
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let written = self.tls.writer().write(buf)?;
        self.write_socket(stream)?;
        Ok(written)
    }

    /// The completion callback, once the handshake is over.
    fn take_completed_callback(&mut self) -> Option<HandshakeCallback> {
        if self.tls.is_handshaking() {
            None
        } else {
            self.on_handshake.take()
        }
    }
}

/// Accepted TCP stream with its server-side TLS session.
pub struct TlsTransport {
    stream: TcpStream,
    peer_addr: SocketAddr,
    session: Mutex<Session>,
}

impl TlsTransport {
    /// Start a server session on an accepted stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the peer address cannot be read and
    /// [`Error::TlsConfiguration`] if rustls rejects the config
    pub fn new(stream: TcpStream, config: Arc<ServerConfig>) -> Result<Self> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;

        let tls = ServerConnection::new(config)
            .map_err(|e| Error::TlsConfiguration(format!("server session: {e}")))?;

        Ok(Self {
            stream,
            peer_addr,
            session: Mutex::new(Session {
                tls,
                on_handshake: None,
                eof: false,
                closed: false,
            }),
        })
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, Session>> {
        self.session
            .lock()
            .map_err(|_| io::Error::other("TLS session lock poisoned"))
    }

    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Install the callback fired the first time a write observes the
    /// finished handshake. Replaces a callback that has not fired yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the session lock is poisoned
    pub fn on_handshake_complete(&self, callback: HandshakeCallback) -> io::Result<()> {
        self.lock()?.on_handshake = Some(callback);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the session lock is poisoned
    pub fn is_handshaking(&self) -> io::Result<bool> {
        Ok(self.lock()?.tls.is_handshaking())
    }

    /// Negotiated version, suite and client certificate chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the session lock is poisoned
    pub fn handshake_details(&self) -> io::Result<HandshakeDetails> {
        let session = self.lock()?;
        Ok(HandshakeDetails {
            protocol_version: session.tls.protocol_version(),
            cipher_suite: session.tls.negotiated_cipher_suite().map(|s| s.suite()),
            peer_certificates: session
                .tls
                .peer_certificates()
                .map(<[_]>::to_vec)
                .unwrap_or_default(),
        })
    }

    /// Read decrypted application data; `Ok(0)` once the peer is gone.
    ///
    /// # Errors
    ///
    /// Returns an error on socket failures or TLS protocol violations
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            {
                let mut session = self.lock()?;
                session.pump(&self.stream)?;
                match session.tls.reader().read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock && !session.eof => {}
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::WouldBlock | io::ErrorKind::UnexpectedEof
                        ) =>
                    {
                        return Ok(0);
                    }
                    Err(e) => return Err(e),
                }
            }
            self.stream.readable().await?;
        }
    }

    /// Encrypt and send all of `buf`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails before everything is sent
    pub async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let written = {
                let mut session = self.lock()?;
                if session.closed {
                    return Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed"));
                }
                let written = session.tls.writer().write(buf)?;
                session.write_socket(&self.stream)?;
                written
            };

            if written == 0 {
                self.stream.writable().await?;
            }
            buf = buf.get(written..).unwrap_or_default();
        }
        self.flush().await
    }

    /// Wait until every queued TLS record has reached the socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket fails
    pub async fn flush(&self) -> io::Result<()> {
        loop {
            {
                let mut session = self.lock()?;
                session.write_socket(&self.stream)?;
                if !session.tls.wants_write() {
                    return Ok(());
                }
            }
            self.stream.writable().await?;
        }
    }

    /// Send `close_notify` and stop accepting writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the alert cannot be flushed
    pub async fn shutdown(&self) -> io::Result<()> {
        {
            let mut session = self.lock()?;
            if !session.closed {
                session.tls.send_close_notify();
                session.closed = true;
            }
        }
        self.flush().await
    }
}

impl Transport for TlsTransport {
    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        let (result, callback) = {
            let mut session = self.lock()?;
            let result = session.try_write(&self.stream, buf);
            let callback = if result.is_ok() {
                session.take_completed_callback()
            } else {
                None
            };
            (result, callback)
        };

        // outside the lock: the callback may touch this transport again
        if let Some(callback) = callback {
            trace!(peer = %self.peer_addr, "handshake complete");
            callback();
        }
        result
    }

    fn close(&self, reason: &Error) {
        let Ok(mut session) = self.lock() else {
            return;
        };
        if session.closed {
            return;
        }
        session.closed = true;
        session.on_handshake = None;
        session.tls.send_close_notify();
        let _ = session.write_socket(&self.stream);
        debug!(peer = %self.peer_addr, reason = %reason, "closed transport");
    }
}

impl fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsTransport")
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::{
        identity::{ServerIdentity, generate_self_signed},
        tls::config::{ServerOptions, build_server_config},
    };
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::{io::AsyncWriteExt, net::TcpListener};

    fn server_config() -> Arc<ServerConfig> {
        let (cert, key) = generate_self_signed("transport", Utc::now()).unwrap();
        let identity = ServerIdentity::new("transport", cert, key);
        Arc::new(build_server_config(&identity, &ServerOptions::default()).unwrap())
    }

    async fn accepted_pair() -> (TlsTransport, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (TlsTransport::new(server, server_config()).unwrap(), client)
    }

    #[tokio::test]
    async fn test_would_block_before_client_hello() {
        let (transport, _client) = accepted_pair().await;
        let err = transport.try_write(&[]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert!(transport.is_handshaking().unwrap());
    }

    #[tokio::test]
    async fn test_garbage_is_invalid_data() {
        let (transport, mut client) = accepted_pair().await;
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        client.flush().await.unwrap();

        let mut last = transport.try_write(&[]);
        for _ in 0..100 {
            if !matches!(&last, Err(e) if e.kind() == io::ErrorKind::WouldBlock) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            last = transport.try_write(&[]);
        }
        assert_eq!(last.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_peer_hangup_is_unexpected_eof() {
        let (transport, client) = accepted_pair().await;
        drop(client);

        let mut last = transport.try_write(&[]);
        for _ in 0..100 {
            if !matches!(&last, Err(e) if e.kind() == io::ErrorKind::WouldBlock) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            last = transport.try_write(&[]);
        }
        assert_eq!(last.unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_callback_not_fired_while_handshaking() {
        let (transport, _client) = accepted_pair().await;
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        transport
            .on_handshake_complete(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        let _ = transport.try_write(&[]);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_writes() {
        let (transport, _client) = accepted_pair().await;
        transport.close(&Error::NotInitialized);
        let err = transport.try_write(&[]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_handshake_details_before_handshake() {
        let (transport, _client) = accepted_pair().await;
        let details = transport.handshake_details().unwrap();
        assert!(details.cipher_suite.is_none());
        assert!(details.peer_certificates.is_empty());
    }
}
