mod certificate;
mod issuer;

pub use certificate::{Certificate, PrivateKey, ServerIdentity, generate_self_signed};
pub use issuer::{CertificateIssuer, resolve_identity};
