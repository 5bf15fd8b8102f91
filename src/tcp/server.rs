use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::info;

use crate::tcp::stream::StreamChannel;
use crate::types::{HandshakeError, Stage};

/// Per-session TCP listener for Stages C and D.
///
/// Bound before the port is advertised to the client; accepts exactly one
/// connection.
#[derive(Debug)]
pub struct StageListener {
    listener: TcpListener,
}

impl StageListener {
    /// Bind to the specified address
    pub async fn bind(addr: SocketAddr) -> Result<Self, HandshakeError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Stage listener bound to {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    /// Get the local address this listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, HandshakeError> {
        self.listener.local_addr().map_err(HandshakeError::Io)
    }

    /// Accept one connection, failing after `wait`.
    pub async fn accept(
        &self,
        stage: Stage,
        wait: Duration,
    ) -> Result<(StreamChannel, SocketAddr), HandshakeError> {
        match timeout(wait, self.listener.accept()).await {
            Ok(Ok((socket, addr))) => {
                info!("New connection from {}", addr);
                Ok((StreamChannel::new(socket), addr))
            }
            Ok(Err(source)) => Err(HandshakeError::Accept { stage, source }),
            Err(_) => Err(HandshakeError::Timeout { stage, after: wait }),
        }
    }
}
