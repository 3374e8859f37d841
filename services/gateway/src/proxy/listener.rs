//! The proxy listener: accept, authenticate, discover, authorize, dial,
//! replay, tunnel.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn, Instrument};

use crate::store::{normalize_name, Store};
use crate::tls::{peer_common_name, HANDSHAKE_TIMEOUT};

use super::discovery::discover_hostname;
use super::tunnel::run_tunnel;
use super::{DIAL_TIMEOUT, MAX_PEEK_BYTES, PEEK_TIMEOUT};

/// The TLS transport proxy.
pub struct ProxyServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    store: Arc<Store>,
}

impl ProxyServer {
    /// Bind the listener.
    pub async fn bind(
        bind_addr: SocketAddr,
        acceptor: TlsAcceptor,
        store: Arc<Store>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        info!(bind_addr = %listener.local_addr()?, "Proxy listener bound");
        Ok(Self {
            listener,
            acceptor,
            store,
        })
    }

    /// Local address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the process exits.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(
                        async move {
                            if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                debug!(peer_addr = %peer_addr, error = %e, "Proxy connection ended");
                            }
                        }
                        .instrument(tracing::info_span!("tunnel", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Proxy accept error");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// One tunnel. Every failure before the backend dial drops the
    /// client without a response; the tunnel owns exactly two sockets
    /// and both are released on every exit path.
    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> io::Result<()> {
        let mut tls = timeout(HANDSHAKE_TIMEOUT, self.acceptor.accept(stream))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "handshake timeout"))??;

        let Some(cn) = peer_common_name(&tls) else {
            warn!(peer_addr = %peer_addr, "Peer certificate has no CN, dropping");
            return Ok(());
        };
        if !self.store.endpoint_exists(&cn).await {
            warn!(peer_addr = %peer_addr, cn = %cn, "Unknown endpoint CN, dropping");
            return Ok(());
        }

        debug!(cn = %cn, "Proxy client authenticated");

        // Hostname discovery over the initial peek. The buffer holds
        // protocol bytes the backend must receive intact.
        let zone_names = self.store.zone_names().await;
        let mut peeked = Vec::new();
        let Some(hostname) = self.peek_hostname(&mut tls, &mut peeked, &zone_names).await else {
            info!(cn = %cn, peeked = peeked.len(), "No destination hostname discovered, dropping");
            return Ok(());
        };

        // Authorization and routing.
        let qname = normalize_name(&hostname);
        let Some((zone_name, zone)) = self.store.find_zone(&qname).await else {
            info!(cn = %cn, hostname = %qname, "No zone matches hostname, dropping");
            return Ok(());
        };
        if !zone.allows(&cn) {
            warn!(cn = %cn, zone = %zone_name, "CN not authorized for zone, dropping");
            return Ok(());
        }
        let Some(service_cn) = zone.service_cn else {
            info!(zone = %zone_name, "Zone has no owning service, dropping");
            return Ok(());
        };
        let Some(route) = self.store.route(&service_cn).await else {
            warn!(zone = %zone_name, service_cn = %service_cn, "No route for service, dropping");
            return Ok(());
        };

        // Backend dial.
        let backend_addr = (route.host.as_str(), route.port);
        let mut backend = match timeout(
            DIAL_TIMEOUT,
            TcpStream::connect(backend_addr),
        )
        .await
        {
            Ok(Ok(backend)) => backend,
            Ok(Err(e)) => {
                warn!(cn = %cn, host = %route.host, port = route.port, error = %e, "Backend dial failed");
                return Ok(());
            }
            Err(_) => {
                warn!(cn = %cn, host = %route.host, port = route.port, "Backend dial timed out");
                return Ok(());
            }
        };

        info!(
            cn = %cn,
            zone = %zone_name,
            service_cn = %service_cn,
            backend = %format!("{}:{}", route.host, route.port),
            "Tunnel established"
        );

        // Replay the peeked bytes before any further client reads.
        backend.write_all(&peeked).await?;

        let (to_backend, to_client) = run_tunnel(tls, backend).await;
        debug!(
            cn = %cn,
            to_backend = to_backend + peeked.len() as u64,
            to_client,
            "Tunnel closed"
        );

        Ok(())
    }

    /// Accumulate up to `MAX_PEEK_BYTES` within `PEEK_TIMEOUT`, retrying
    /// discovery as bytes arrive (headers may straddle reads).
    async fn peek_hostname(
        &self,
        tls: &mut TlsStream<TcpStream>,
        buffer: &mut Vec<u8>,
        zone_names: &[String],
    ) -> Option<String> {
        let deadline = Instant::now() + PEEK_TIMEOUT;
        let mut chunk = [0u8; 2048];

        loop {
            if let Some(hostname) = discover_hostname(buffer, zone_names) {
                return Some(hostname);
            }
            if buffer.len() >= MAX_PEEK_BYTES {
                return None;
            }

            let want = (MAX_PEEK_BYTES - buffer.len()).min(chunk.len());
            match timeout_at(deadline, tls.read(&mut chunk[..want])).await {
                Ok(Ok(0)) => return discover_hostname(buffer, zone_names),
                Ok(Ok(n)) => buffer.extend_from_slice(&chunk[..n]),
                Ok(Err(_)) | Err(_) => return discover_hostname(buffer, zone_names),
            }
        }
    }
}
