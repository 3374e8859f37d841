//! Local DNS stub: UDP on loopback, forwarding over DoT to the gateway.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use ztp_signed_config::EndpointRole;

use crate::identity::Identity;

/// Preferred and fallback loopback ports.
const STUB_PORTS: [u16; 2] = [53, 5353];

/// Deadline for connecting to the gateway.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for the public-DNS probe used by service endpoints.
const PUBLIC_TIMEOUT: Duration = Duration::from_secs(2);

/// Public resolver probed first by service endpoints.
const PUBLIC_DNS: &str = "1.1.1.1:53";

/// Largest DNS message relayed by the stub.
const MAX_MESSAGE_BYTES: usize = 4096;

/// Bind the stub and serve queries until the process exits.
pub async fn run(identity: Identity) -> Result<()> {
    let identity = Arc::new(identity);

    let socket = bind_stub().await?;
    let local = socket.local_addr()?;
    info!(addr = %local, "Local DNS stub listening");
    if local.port() != STUB_PORTS[0] {
        warn!(
            "Could not bind port {}, using {} (run as root or grant CAP_NET_BIND_SERVICE)",
            STUB_PORTS[0],
            local.port()
        );
    }

    let socket = Arc::new(socket);
    let mut buf = vec![0u8; MAX_MESSAGE_BYTES];
    loop {
        let (n, client_addr) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!(error = %e, "Stub receive error");
                continue;
            }
        };

        let query = buf[..n].to_vec();
        let socket = Arc::clone(&socket);
        let identity = Arc::clone(&identity);
        tokio::spawn(async move {
            if let Some(response) = resolve(&query, &identity).await {
                if let Err(e) = socket.send_to(&response, client_addr).await {
                    debug!(error = %e, "Failed to send stub response");
                }
            }
        });
    }
}

async fn bind_stub() -> Result<UdpSocket> {
    let mut last_err = None;
    for port in STUB_PORTS {
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().expect("valid address");
        match UdpSocket::bind(addr).await {
            Ok(socket) => return Ok(socket),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.expect("at least one bind attempt"))
        .context("failed to bind the local DNS stub to 127.0.0.1:53 or :5353")
}

/// Resolve one query. Service endpoints sit on the backend side of the
/// gateway and want public resolution by default, so they probe the
/// public resolver first; everything else (and every public miss) goes
/// to the gateway over mTLS.
async fn resolve(query: &[u8], identity: &Identity) -> Option<Vec<u8>> {
    if identity.payload.role == EndpointRole::Service {
        if let Some(response) = try_public(query).await {
            return Some(response);
        }
    }

    match forward_dot(query, identity).await {
        Ok(response) => Some(response),
        Err(e) => {
            warn!(error = %e, "Gateway DoT query failed");
            None
        }
    }
}

async fn try_public(query: &[u8]) -> Option<Vec<u8>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect(PUBLIC_DNS).await.ok()?;
    socket.send(query).await.ok()?;

    let mut buf = vec![0u8; MAX_MESSAGE_BYTES];
    let n = timeout(PUBLIC_TIMEOUT, socket.recv(&mut buf)).await.ok()?.ok()?;
    // Anything shorter than a DNS header is not an answer.
    if n <= 12 {
        return None;
    }
    buf.truncate(n);
    Some(buf)
}

/// One RFC 7858 exchange over a fresh mTLS connection, with read-exact
/// semantics on both length and body.
async fn forward_dot(query: &[u8], identity: &Identity) -> Result<Vec<u8>> {
    let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect(&identity.payload.server))
        .await
        .context("gateway connect timed out")?
        .context("gateway connect failed")?;

    let mut tls = identity
        .connector
        .connect(identity.server_name.clone(), tcp)
        .await
        .context("gateway TLS handshake failed")?;

    let mut framed = Vec::with_capacity(2 + query.len());
    framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
    framed.extend_from_slice(query);
    tls.write_all(&framed).await.context("failed to send query")?;

    let mut len_buf = [0u8; 2];
    tls.read_exact(&mut len_buf)
        .await
        .context("failed to read response length")?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_MESSAGE_BYTES {
        anyhow::bail!("invalid response length {len}");
    }

    let mut response = vec![0u8; len];
    tls.read_exact(&mut response)
        .await
        .context("failed to read response")?;
    Ok(response)
}
