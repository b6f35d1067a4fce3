//! TLS-terminating server socket and client-side probe
//!
//! # Module Organization
//!
//! - `config` - server options and rustls configuration
//! - `verifier` - accept-any client certificate hook
//! - `metadata` - negotiated version, cipher suite table, client status
//! - `transport` - non-blocking TLS transport over an accepted stream
//! - `nudge` - handshake nudging with backoff
//! - `connection` - connection ids, states and accepted connections
//! - `server` - listening socket and its event loop
//! - `probe` - TLS client used to exercise a server
//!
//! # Example
//!
//! ```rust,ignore
//! use tlslisten::tls::{TlsServerSocket, ClientCertMode};
//!
//! let mut socket = TlsServerSocket::new();
//! socket.set_server_identity(identity);
//! socket.set_request_certificate(ClientCertMode::Always);
//!
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! let listening = socket.listen("127.0.0.1:0".parse()?, tx).await?;
//! while let Some(connection) = rx.recv().await {
//!     println!("{:?}", connection.status());
//! }
//! ```

pub mod config;
pub mod connection;
pub mod metadata;
pub mod nudge;
pub mod probe;
pub mod server;
pub mod transport;
pub mod verifier;

// Re-export commonly used types
pub use config::{ClientCertMode, ServerOptions, build_server_config};
pub use connection::{ConnectionId, ConnectionState, TlsConnection};
pub use metadata::{
    CipherInfo, HandshakeDetails, TlsClientStatus, TlsMetadata, TlsVersion, cipher_info,
};
pub use nudge::{HandshakeNudger, NudgeOutcome, NudgeScheduler, TokioNudgeScheduler, backoff_delay};
pub use probe::{ClientAuth, ProbeReport, ensure_crypto_provider, probe_server};
pub use server::{ListeningSocket, ServerSocketInfo, SocketListener, TlsServerSocket};
pub use transport::{HandshakeCallback, TlsTransport, Transport};
pub use verifier::AcceptAnyClientCert;
