//! The DoT listener: mTLS accept loop and RFC 7858 framing.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use hickory_proto::op::{Message, ResponseCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn, Instrument};

use crate::store::{normalize_name, Store};
use crate::tls::{peer_common_name, HANDSHAKE_TIMEOUT};

use super::resolver::{answer_zone_query, build_raw_error, build_response, ZoneAnswer};
use super::upstream::forward_upstream;
use super::{MAX_MESSAGE_BYTES, READ_TIMEOUT};

/// The DNS-over-TLS server.
pub struct DotServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    store: Arc<Store>,
    upstream: SocketAddr,
}

impl DotServer {
    /// Bind the listener.
    pub async fn bind(
        bind_addr: SocketAddr,
        acceptor: TlsAcceptor,
        store: Arc<Store>,
        upstream: SocketAddr,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        info!(bind_addr = %listener.local_addr()?, "DoT listener bound");
        Ok(Self {
            listener,
            acceptor,
            store,
            upstream,
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
                                debug!(peer_addr = %peer_addr, error = %e, "DoT connection ended");
                            }
                        }
                        .instrument(tracing::info_span!("dot", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "DoT accept error");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// One connection: authenticate, then serve framed queries until the
    /// peer goes away. Any socket error terminates without retry.
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

        debug!(cn = %cn, "DoT client authenticated");

        loop {
            let mut len_buf = [0u8; 2];
            match timeout(READ_TIMEOUT, tls.read_exact(&mut len_buf)).await {
                Ok(Ok(_)) => {}
                // EOF or timeout between queries: the peer is done.
                Ok(Err(_)) | Err(_) => break,
            }

            let len = u16::from_be_bytes(len_buf) as usize;
            if len == 0 || len > MAX_MESSAGE_BYTES {
                warn!(cn = %cn, len, "Rejecting oversized DoT message");
                break;
            }

            let mut query = vec![0u8; len];
            timeout(READ_TIMEOUT, tls.read_exact(&mut query))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "query read timeout"))??;

            let Some(response) = self.answer(&query, &cn).await else {
                break;
            };

            write_framed(&mut tls, &response).await?;
        }

        tls.shutdown().await.ok();
        Ok(())
    }

    /// Produce the wire response for one query, or `None` to drop the
    /// connection.
    async fn answer(&self, raw_query: &[u8], cn: &str) -> Option<Vec<u8>> {
        let request = match Message::from_vec(raw_query) {
            Ok(request) => request,
            Err(e) => {
                debug!(cn = %cn, error = %e, "Unparseable query");
                return build_raw_error(raw_query, ResponseCode::FormErr);
            }
        };

        // Only the first question is honored.
        let Some(query) = request.queries().first().cloned() else {
            return build_response(&request, ResponseCode::FormErr, vec![]).to_vec().ok();
        };

        let qname = normalize_name(&query.name().to_ascii());

        if let Some((zone_name, zone)) = self.store.find_zone(&qname).await {
            let response = match answer_zone_query(&qname, &query, &zone_name, &zone, cn) {
                ZoneAnswer::Refused => {
                    info!(cn = %cn, qname = %qname, zone = %zone_name, "Query refused");
                    build_response(&request, ResponseCode::Refused, vec![])
                }
                ZoneAnswer::NxDomain => build_response(&request, ResponseCode::NXDomain, vec![]),
                ZoneAnswer::Records(answers) => {
                    debug!(cn = %cn, qname = %qname, answers = answers.len(), "Private zone answer");
                    build_response(&request, ResponseCode::NoError, answers)
                }
            };
            return response.to_vec().ok();
        }

        // Not a private zone: relay through the public upstream.
        match forward_upstream(raw_query, self.upstream).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(cn = %cn, qname = %qname, error = %e, "Upstream forward failed");
                build_response(&request, ResponseCode::ServFail, vec![]).to_vec().ok()
            }
        }
    }
}

async fn write_framed(tls: &mut TlsStream<TcpStream>, response: &[u8]) -> io::Result<()> {
    if response.len() > u16::MAX as usize {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "response too large"));
    }
    let mut framed = Vec::with_capacity(2 + response.len());
    framed.extend_from_slice(&(response.len() as u16).to_be_bytes());
    framed.extend_from_slice(response);
    tls.write_all(&framed).await
}
