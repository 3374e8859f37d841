//! Shared TLS configuration for the DoT and proxy listeners.
//!
//! Both listeners present the gateway server certificate and require a
//! client certificate chaining to the CA — the CA pool is the single
//! trust anchor, with no intermediates. Peers that fail verification
//! never reach the application layer; peers that pass are identified
//! solely by the CN extracted here.

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

/// Deadline for the TLS handshake on both listeners.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// TLS setup errors (fatal at startup).
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to parse PEM material: {0}")]
    Pem(String),

    #[error("failed to build TLS config: {0}")]
    Config(String),
}

/// Build the mTLS server config shared by both listeners.
pub fn server_config(
    server_cert_pem: &str,
    server_key_pem: &str,
    ca_cert_pem: &str,
) -> Result<Arc<ServerConfig>, TlsError> {
    let cert_chain: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut server_cert_pem.as_bytes())
            .collect::<Result<_, _>>()
            .map_err(|e| TlsError::Pem(format!("server certificate: {e}")))?;

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut server_key_pem.as_bytes())
        .map_err(|e| TlsError::Pem(format!("server key: {e}")))?
        .ok_or_else(|| TlsError::Pem("no private key in server key PEM".into()))?;

    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut ca_cert_pem.as_bytes()) {
        let cert = cert.map_err(|e| TlsError::Pem(format!("CA certificate: {e}")))?;
        roots
            .add(cert)
            .map_err(|e| TlsError::Config(format!("CA root store: {e}")))?;
    }

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| TlsError::Config(format!("client verifier: {e}")))?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(cert_chain, key)
        .map_err(|e| TlsError::Config(e.to_string()))?;

    Ok(Arc::new(config))
}

/// An acceptor plus the handshake deadline, shared by both listeners.
pub fn acceptor(config: Arc<ServerConfig>) -> TlsAcceptor {
    TlsAcceptor::from(config)
}

/// Extract the authenticated peer's CN from a completed handshake.
///
/// Returns `None` when no certificate is present or it carries no CN —
/// callers drop the connection.
pub fn peer_common_name(stream: &TlsStream<TcpStream>) -> Option<String> {
    let (_, conn) = stream.get_ref();
    let certs = conn.peer_certificates()?;
    let leaf = certs.first()?;
    ztp_pki::common_name(leaf.as_ref()).ok()
}
