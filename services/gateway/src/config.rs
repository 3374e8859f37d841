//! Gateway configuration (env-driven).

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Gateway configuration.
///
/// The externally visible address is deliberately a configuration value:
/// it is the A-record value private zones answer with and a SAN on the
/// server certificate, and guessing it from interfaces is unreliable in
/// containers.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for `certs/` and `data/`.
    pub data_dir: PathBuf,

    /// Externally visible IP of the gateway.
    pub external_addr: IpAddr,

    /// TLS server name endpoints expect from both listeners.
    pub server_name: String,

    /// DNS-over-TLS listener.
    pub dot_bind: SocketAddr,

    /// Transport proxy listener.
    pub proxy_bind: SocketAddr,

    /// Administrative API listener.
    pub api_bind: SocketAddr,

    /// Public resolver used for non-private queries.
    pub upstream_dns: SocketAddr,

    /// Directory holding the per-platform endpoint binaries for bundles.
    pub binaries_dir: PathBuf,

    /// Log level fallback when RUST_LOG is unset.
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let data_dir = std::env::var("ZTP_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/opt/ztp"));

        let external_addr: IpAddr = std::env::var("ZTP_EXTERNAL_ADDR")
            .context("Missing external address. Set ZTP_EXTERNAL_ADDR.")?
            .parse()
            .context("ZTP_EXTERNAL_ADDR must be an IP address.")?;

        let server_name =
            std::env::var("ZTP_SERVER_NAME").unwrap_or_else(|_| "dns-server".to_string());

        let dot_bind = parse_bind("ZTP_DOT_BIND", "0.0.0.0:853")?;
        let proxy_bind = parse_bind("ZTP_PROXY_BIND", "0.0.0.0:8443")?;
        let api_bind = parse_bind("ZTP_API_BIND", "127.0.0.1:5001")?;
        let upstream_dns = parse_bind("ZTP_UPSTREAM_DNS", "1.1.1.1:53")?;

        let binaries_dir = std::env::var("ZTP_BINARIES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("binaries"));

        let log_level = std::env::var("ZTP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            data_dir,
            external_addr,
            server_name,
            dot_bind,
            proxy_bind,
            api_bind,
            upstream_dns,
            binaries_dir,
            log_level,
        })
    }

    /// Directory holding CA, server, and endpoint certificates.
    pub fn certs_dir(&self) -> PathBuf {
        self.data_dir.join("certs")
    }

    /// Directory holding the persisted JSON documents.
    pub fn documents_dir(&self) -> PathBuf {
        self.data_dir.join("data")
    }

    /// The DoT address advertised to endpoints.
    pub fn advertised_server(&self) -> String {
        format!("{}:{}", self.external_addr, self.dot_bind.port())
    }

    /// The proxy address advertised to endpoints.
    pub fn advertised_proxy(&self) -> String {
        format!("{}:{}", self.external_addr, self.proxy_bind.port())
    }
}

fn parse_bind(var: &str, default: &str) -> Result<SocketAddr> {
    std::env::var(var)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("{var} must be a socket address (host:port)."))
}
