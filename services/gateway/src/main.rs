//! ZeroTrust gateway entry point.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ztp_gateway::admin::Admin;
use ztp_gateway::config::Config;
use ztp_gateway::dns::DotServer;
use ztp_gateway::proxy::ProxyServer;
use ztp_gateway::store::Store;
use ztp_gateway::{api, tls};
use ztp_pki::{CertificateAuthority, DEFAULT_KEY_BITS};

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        external_addr = %config.external_addr,
        dot_bind = %config.dot_bind,
        proxy_bind = %config.proxy_bind,
        api_bind = %config.api_bind,
        data_dir = %config.data_dir.display(),
        "Starting ZeroTrust gateway"
    );

    // Credential errors are fatal: the process refuses to serve without
    // working CA material.
    let certs_dir = config.certs_dir();
    let ca = CertificateAuthority::load_or_generate(&certs_dir, DEFAULT_KEY_BITS)
        .context("CA bootstrap failed")?;
    let server = ca
        .ensure_server_cert(&certs_dir, &config.server_name, config.external_addr)
        .context("server certificate bootstrap failed")?;

    let store = Arc::new(Store::open(config.documents_dir()).context("registry load failed")?);

    let tls_config = tls::server_config(&server.cert_pem, &server.key_pem, ca.ca_cert_pem())
        .context("TLS configuration failed")?;

    let dot = Arc::new(
        DotServer::bind(
            config.dot_bind,
            tls::acceptor(Arc::clone(&tls_config)),
            Arc::clone(&store),
            config.upstream_dns,
        )
        .await
        .context("DoT listener bind failed")?,
    );

    let proxy = Arc::new(
        ProxyServer::bind(
            config.proxy_bind,
            tls::acceptor(tls_config),
            Arc::clone(&store),
        )
        .await
        .context("proxy listener bind failed")?,
    );

    let api_bind = config.api_bind;
    let admin = Arc::new(Admin { config, store, ca });

    info!("ZeroTrust gateway running");

    tokio::try_join!(
        dot.run(),
        proxy.run(),
        api::serve(api_bind, Arc::clone(&admin)),
    )?;

    Ok(())
}
