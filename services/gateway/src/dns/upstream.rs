//! Plain-UDP forwarding to the public upstream resolver.

use std::io;
use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use super::{MAX_MESSAGE_BYTES, UPSTREAM_TIMEOUT};

/// Forward a raw query to the upstream and return the raw response.
///
/// One ephemeral socket per query; the response is relayed verbatim.
pub async fn forward_upstream(query: &[u8], upstream: SocketAddr) -> io::Result<Vec<u8>> {
    let bind_addr: SocketAddr = if upstream.is_ipv4() {
        "0.0.0.0:0".parse().expect("valid bind address")
    } else {
        "[::]:0".parse().expect("valid bind address")
    };

    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(upstream).await?;
    socket.send(query).await?;

    let mut buf = vec![0u8; MAX_MESSAGE_BYTES];
    let n = timeout(UPSTREAM_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "upstream timeout"))??;
    buf.truncate(n);
    Ok(buf)
}
