//! Context channel: the game (or robot) reports which class the user was
//! actually asked to perform.
//!
//! One UDP datagram per message, either `{"correct_class": 2}` or a bare
//! integer. Malformed or out-of-range messages are logged and skipped.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::warn;

use emgadapt::memory::ClassId;

use crate::error::SessionError;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ContextMessage {
    Tagged { correct_class: ClassId },
    Bare(ClassId),
}

/// Decode one datagram. `None` for anything that isn't a class id.
pub fn parse_context(bytes: &[u8]) -> Option<ClassId> {
    let text = std::str::from_utf8(bytes).ok()?;
    match serde_json::from_str::<ContextMessage>(text.trim()).ok()? {
        ContextMessage::Tagged { correct_class } => Some(correct_class),
        ContextMessage::Bare(c) => Some(c),
    }
}

#[derive(Debug)]
pub struct ContextChannel {
    socket: UdpSocket,
}

impl ContextChannel {
    pub async fn bind(addr: &str) -> Result<Self, SessionError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| SessionError::StreamUnavailable(format!("context {addr}: {e}")))?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SessionError> {
        Ok(self.socket.local_addr()?)
    }

    /// Wait for the next valid context message. Invalid datagrams don't
    /// extend the deadline.
    pub async fn recv(
        &self,
        timeout: Duration,
        num_classes: usize,
    ) -> Result<ClassId, SessionError> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 1024];
        loop {
            let (n, from) = tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buf))
                .await
                .map_err(|_| SessionError::ContextTimeout(timeout))??;
            match parse_context(&buf[..n]) {
                Some(c) if (c as usize) < num_classes => return Ok(c),
                Some(c) => warn!("Context class {} from {} is out of range", c, from),
                None => warn!("Ignoring malformed context message from {}", from),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_message_shapes_parse() {
        assert_eq!(parse_context(br#"{"correct_class": 3}"#), Some(3));
        assert_eq!(parse_context(b" 2\n"), Some(2));
        assert_eq!(parse_context(b"left"), None);
        assert_eq!(parse_context(b"-1"), None);
        assert_eq!(parse_context(&[0xff, 0xfe]), None);
    }

    #[tokio::test]
    async fn recv_skips_garbage_and_out_of_range() {
        let chan = ContextChannel::bind("127.0.0.1:0").await.unwrap();
        let addr = chan.local_addr().unwrap();
        let tx = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        tx.send_to(b"nonsense", addr).await.unwrap();
        tx.send_to(b"9", addr).await.unwrap();
        tx.send_to(br#"{"correct_class": 1}"#, addr).await.unwrap();

        let c = chan.recv(Duration::from_secs(2), 3).await.unwrap();
        assert_eq!(c, 1);
    }

    #[tokio::test]
    async fn recv_times_out() {
        let chan = ContextChannel::bind("127.0.0.1:0").await.unwrap();
        let err = chan.recv(Duration::from_millis(30), 3).await.unwrap_err();
        assert!(matches!(err, SessionError::ContextTimeout(_)));
    }
}
