//! One-shot readiness handshake with the consumer (game / robot).
//!
//! The consumer sends `READY` over UDP; we answer with the session
//! directory so it knows where the logs live, then close the socket.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{info, warn};

use crate::error::SessionError;

const READY: &str = "READY";

/// Bind `addr` and wait for `READY`.
pub async fn handshake(
    addr: &str,
    reply: &str,
    timeout: Duration,
) -> Result<SocketAddr, SessionError> {
    let socket = UdpSocket::bind(addr)
        .await
        .map_err(|e| SessionError::StreamUnavailable(format!("handshake {addr}: {e}")))?;
    info!("Waiting for READY on {}", addr);
    await_ready(socket, reply, timeout).await
}

/// Consumes the socket: once the reply is sent the port is released, so a
/// late or repeated `READY` goes unanswered.
pub async fn await_ready(
    socket: UdpSocket,
    reply: &str,
    timeout: Duration,
) -> Result<SocketAddr, SessionError> {
    let mut buf = [0u8; 256];
    let wait = async {
        loop {
            let (n, from) = socket.recv_from(&mut buf).await?;
            if std::str::from_utf8(&buf[..n]).map(str::trim) == Ok(READY) {
                socket.send_to(reply.as_bytes(), from).await?;
                return Ok::<_, SessionError>(from);
            }
            warn!("Ignoring non-READY handshake datagram from {}", from);
        }
    };
    let peer = tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| SessionError::HandshakeTimeout(timeout))??;
    info!("Consumer ready at {}", peer);
    Ok(peer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replies_once_with_path() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let task = tokio::spawn(await_ready(
            server,
            "/tmp/session",
            Duration::from_secs(2),
        ));
        client.send_to(b"hello", addr).await.unwrap();
        client.send_to(b"READY\n", addr).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"/tmp/session");
        let peer = task.await.unwrap().unwrap();
        assert_eq!(peer, client.local_addr().unwrap());

        // Socket is gone; a second READY gets no answer.
        let _ = client.send_to(b"READY", addr).await;
        let second =
            tokio::time::timeout(Duration::from_millis(100), client.recv_from(&mut buf)).await;
        assert!(!matches!(second, Ok(Ok(_))));
    }

    #[tokio::test]
    async fn times_out_without_ready() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let err = await_ready(server, "x", Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::HandshakeTimeout(_)));
    }
}
