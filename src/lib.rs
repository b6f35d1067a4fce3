//! TLS-terminating server socket.
//!
//! Accepted TCP connections are upgraded to server-side TLS sessions whose
//! handshakes are pumped forward by a backoff-driven nudger; the consumer
//! only sees connections that finished the handshake, together with the
//! negotiated parameters. The server identity is a self-signed certificate
//! issued on demand and kept in a [`store::CertificateStore`].

pub mod cli;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod serve;
pub mod store;
pub mod tls;

pub use error::{Error, Result};
