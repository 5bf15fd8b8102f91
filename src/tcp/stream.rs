//! Stream side of the transport adapter.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::codec::FixedFrameCodec;
use crate::types::{HandshakeError, Stage};

/// A byte stream read in exact-length frames.
///
/// Generic over the underlying I/O so stage handlers run equally over a
/// `TcpStream` or a scripted test double.
#[derive(Debug)]
pub struct StreamChannel<T = TcpStream> {
    framed: Framed<T, FixedFrameCodec>,
}

impl StreamChannel<TcpStream> {
    /// Connect to `addr`, failing after `wait`.
    pub async fn connect(stage: Stage, addr: SocketAddr, wait: Duration) -> Result<Self, HandshakeError> {
        let stream = match timeout(wait, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(HandshakeError::Connect { stage, addr, source }),
            Err(_) => return Err(HandshakeError::Timeout { stage, after: wait }),
        };
        debug!("Connected to {}", addr);
        Ok(Self::new(stream))
    }
}

impl<T> StreamChannel<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: T) -> Self {
        Self {
            framed: Framed::new(io, FixedFrameCodec::default()),
        }
    }

    /// Write `bytes` and flush.
    pub async fn send(&mut self, bytes: Bytes) -> Result<(), HandshakeError> {
        let len = bytes.len();
        self.framed.send(bytes).await?;
        debug!("Wrote {} bytes", len);
        Ok(())
    }

    /// Queue `bytes` `times` times back to back, then flush once.
    pub async fn send_repeated(&mut self, bytes: Bytes, times: u32) -> Result<(), HandshakeError> {
        for _ in 0..times {
            self.framed.feed(bytes.clone()).await?;
        }
        SinkExt::<Bytes>::flush(&mut self.framed).await?;
        debug!("Wrote {} x {} bytes", times, bytes.len());
        Ok(())
    }

    /// Read exactly `len` bytes, failing after `wait`.
    ///
    /// Bytes beyond `len` stay buffered for the next call.
    pub async fn recv_frame(
        &mut self,
        stage: Stage,
        len: usize,
        wait: Duration,
    ) -> Result<BytesMut, HandshakeError> {
        self.framed.codec_mut().set_frame_len(len);
        match timeout(wait, self.framed.next()).await {
            Ok(Some(Ok(frame))) => Ok(frame),
            Ok(Some(Err(e))) => Err(HandshakeError::Io(e)),
            Ok(None) => Err(HandshakeError::ConnectionClosed { stage }),
            Err(_) => Err(HandshakeError::Timeout { stage, after: wait }),
        }
    }

    /// Flush and shut down the write half.
    pub async fn close(&mut self) -> Result<(), HandshakeError> {
        SinkExt::<Bytes>::close(&mut self.framed).await?;
        Ok(())
    }
}
