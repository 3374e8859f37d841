//! Bidirectional copy between the client TLS stream and the backend.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const COPY_BUF_BYTES: usize = 8192;

/// Copy both directions until each closes or errors.
///
/// When one direction ends, the write side of the other peer is shut
/// down so it observes EOF, and the opposite direction keeps draining.
/// Both streams are consumed and dropped here, so every exit path
/// releases both sockets. Returns (client→backend, backend→client)
/// byte counts.
pub async fn run_tunnel<C, B>(client: C, backend: B) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let client_to_backend = async {
        let mut total = 0u64;
        let mut buf = vec![0u8; COPY_BUF_BYTES];
        loop {
            match client_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if backend_write.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                    total += n as u64;
                }
                Err(_) => break,
            }
        }
        backend_write.shutdown().await.ok();
        total
    };

    let backend_to_client = async {
        let mut total = 0u64;
        let mut buf = vec![0u8; COPY_BUF_BYTES];
        loop {
            match backend_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if client_write.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                    total += n as u64;
                }
                Err(_) => break,
            }
        }
        client_write.shutdown().await.ok();
        total
    };

    tokio::join!(client_to_backend, backend_to_client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn bytes_flow_both_ways_and_eof_propagates() {
        let (client_near, client_far) = duplex(1024);
        let (backend_near, backend_far) = duplex(1024);

        let tunnel = tokio::spawn(run_tunnel(client_far, backend_near));

        let (mut client_read, mut client_write) = tokio::io::split(client_near);
        let (mut backend_read, mut backend_write) = tokio::io::split(backend_far);

        client_write.write_all(b"to backend").await.unwrap();
        let mut buf = [0u8; 10];
        backend_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to backend");

        backend_write.write_all(b"to client").await.unwrap();
        let mut buf = [0u8; 9];
        client_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to client");

        // Client half-close: backend drains to EOF, reverse stays open
        // until the backend closes too.
        client_write.shutdown().await.unwrap();
        assert_eq!(backend_read.read(&mut buf).await.unwrap(), 0);

        backend_write.shutdown().await.unwrap();
        let (to_backend, to_client) = tunnel.await.unwrap();
        assert_eq!(to_backend, 10);
        assert_eq!(to_client, 9);
    }
}
