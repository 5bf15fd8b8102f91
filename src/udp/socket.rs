//! Datagram side of the transport adapter.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

use crate::types::{HandshakeError, Stage};

/// A UDP socket with deadline-bounded receives.
///
/// The socket sits behind an `Arc` so the server's well-known endpoint can
/// be shared between the acceptor and the tasks replying through it.
#[derive(Debug, Clone)]
pub struct DatagramChannel {
    socket: Arc<UdpSocket>,
    read_size: usize,
}

impl DatagramChannel {
    /// Bind to `addr`; port 0 lets the OS choose.
    pub async fn bind(addr: SocketAddr, read_size: usize) -> Result<Self, HandshakeError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
            read_size,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, HandshakeError> {
        self.socket.local_addr().map_err(HandshakeError::Io)
    }

    pub async fn send_to(&self, bytes: &[u8], dest: SocketAddr) -> Result<(), HandshakeError> {
        self.socket.send_to(bytes, dest).await?;
        debug!("Sent {} bytes to {}", bytes.len(), dest);
        Ok(())
    }

    /// Receive one datagram of at most `read_size` bytes.
    ///
    /// Silence for longer than `wait` is [`HandshakeError::Timeout`] tagged
    /// with `stage`.
    pub async fn recv_timeout(
        &self,
        stage: Stage,
        wait: Duration,
    ) -> Result<(Bytes, SocketAddr), HandshakeError> {
        let mut buf = vec![0u8; self.read_size];
        match timeout(wait, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => {
                debug!("Received {} bytes from {}", len, from);
                buf.truncate(len);
                Ok((Bytes::from(buf), from))
            }
            Ok(Err(e)) => Err(HandshakeError::Io(e)),
            Err(_) => Err(HandshakeError::Timeout { stage, after: wait }),
        }
    }
}
