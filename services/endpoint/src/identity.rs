//! Bundle loading: verified configuration plus the mTLS client identity.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use ztp_signed_config::ConfigPayload;

/// Everything the stub needs to talk to the gateway.
pub struct Identity {
    pub payload: ConfigPayload,
    pub connector: TlsConnector,
    pub server_name: ServerName<'static>,
}

/// Load and verify the bundle directory.
pub fn load(dir: &Path) -> Result<Identity> {
    for file in ["config.zt", "ca.crt", "endpoint.crt", "endpoint.key"] {
        if !dir.join(file).exists() {
            bail!("missing required file {file}; extract the full deployment bundle");
        }
    }

    let token = fs::read_to_string(dir.join("config.zt")).context("failed to read config.zt")?;
    let ca_pem = fs::read_to_string(dir.join("ca.crt")).context("failed to read ca.crt")?;

    let payload = ztp_signed_config::verify(&token, &ca_pem, Utc::now())
        .context("configuration token rejected")?;

    let cert_pem = fs::read(dir.join("endpoint.crt")).context("failed to read endpoint.crt")?;
    let key_pem = fs::read(dir.join("endpoint.key")).context("failed to read endpoint.key")?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::result::Result<_, _>>()
        .context("failed to parse endpoint.crt")?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .context("failed to parse endpoint.key")?
        .context("no private key in endpoint.key")?;

    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut ca_pem.as_bytes()) {
        roots.add(cert.context("failed to parse ca.crt")?)?;
    }

    let client_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .context("failed to build TLS client config")?;

    let server_name = ServerName::try_from(payload.server_name.clone())
        .context("invalid server name in configuration")?;

    Ok(Identity {
        payload,
        connector: TlsConnector::from(Arc::new(client_config)),
        server_name,
    })
}
