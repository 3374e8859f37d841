//! ZeroTrust endpoint.
//!
//! Runs from an extracted deployment bundle: verifies the signed
//! configuration against the bundled CA certificate before opening any
//! sockets, then serves a local DNS stub that forwards queries to the
//! gateway over mutually-authenticated DNS-over-TLS.

use anyhow::Result;
use clap::Parser;
use tracing::info;

mod identity;
mod stub;

#[derive(Parser)]
#[command(name = "ztp-endpoint", about = "ZeroTrust endpoint agent")]
struct Args {
    /// Directory containing config.zt, ca.crt, endpoint.crt, endpoint.key
    #[arg(long, default_value = ".")]
    dir: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    // Corruption, signature mismatch, or expiry fail here, before any
    // socket is opened.
    let identity = identity::load(&args.dir)?;
    info!(
        role = %identity.payload.role,
        server = %identity.payload.server,
        proxy = %identity.payload.proxy,
        "Configuration verified"
    );
    if !identity.payload.domains.is_empty() {
        info!(domains = ?identity.payload.domains, "Authorized domains");
    }

    stub::run(identity).await
}
