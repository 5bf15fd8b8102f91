//! Server acceptor loop on the well-known datagram port.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::handler::{validate_stage_a, SessionHandler, SessionSummary};
use crate::params::{default_factory, SourceFactory};
use crate::types::{HandshakeError, Stage};
use crate::udp::socket::DatagramChannel;

/// Handshake server.
///
/// Validates Stage-A requests on the well-known port and spawns one task
/// per valid request to run Stages B to D. Shuts down once no Stage-A
/// traffic has arrived for the configured idle period.
pub struct Server {
    channel: DatagramChannel,
    config: Arc<Config>,
    sources: SourceFactory,
}

impl Server {
    /// Bind the well-known port described by `config.server`.
    pub async fn bind(config: Config) -> Result<Self, HandshakeError> {
        config.validate()?;
        let addr = config.server.listen_addr();
        let channel = DatagramChannel::bind(addr, config.protocol.read_size).await?;
        info!("Handshake server bound to {}", channel.local_addr()?);

        Ok(Self {
            channel,
            sources: default_factory(&config.server),
            config: Arc::new(config),
        })
    }

    /// Replace the per-session randomness.
    pub fn with_sources(mut self, sources: SourceFactory) -> Self {
        self.sources = sources;
        self
    }

    /// Get the local address this server is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, HandshakeError> {
        self.channel.local_addr()
    }

    /// Run until idle shutdown, discarding session outcomes.
    pub async fn run(self) -> Result<(), HandshakeError> {
        self.run_with(|_, _| {}).await
    }

    /// Run until idle shutdown, reporting every finished session to
    /// `on_complete`.
    ///
    /// Sessions still in flight at shutdown are awaited before returning.
    pub async fn run_with<F>(self, on_complete: F) -> Result<(), HandshakeError>
    where
        F: Fn(SocketAddr, Result<SessionSummary, HandshakeError>) + Send + Sync + Clone + 'static,
    {
        let idle = self.config.server.idle_shutdown();
        let mut deadline = Instant::now() + idle;
        let mut sessions = JoinSet::new();

        info!("Handshake server starting...");

        loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            tokio::select! {
                received = self.channel.recv_timeout(Stage::A, wait) => match received {
                    Ok((buf, peer)) => {
                        deadline = Instant::now() + idle;
                        self.accept(&buf, peer, &mut sessions, &on_complete);
                    }
                    Err(HandshakeError::Timeout { .. }) => {
                        info!("No Stage-A request for {:?}, shutting down", idle);
                        break;
                    }
                    Err(e) => error!("Error receiving datagram: {}", e),
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!("Session task failed: {}", e);
                    }
                }
            }
        }

        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                error!("Session task failed: {}", e);
            }
        }
        Ok(())
    }

    /// Validate one inbound datagram and spawn its session.
    fn accept<F>(&self, buf: &[u8], peer: SocketAddr, sessions: &mut JoinSet<()>, on_complete: &F)
    where
        F: Fn(SocketAddr, Result<SessionSummary, HandshakeError>) + Send + Sync + Clone + 'static,
    {
        if let Err(e) = validate_stage_a(&self.config.protocol, buf) {
            warn!("Dropping Stage-A request from {}: {}", peer, e);
            return;
        }
        debug!("Valid Stage-A request from {}", peer);

        let handler = SessionHandler::new(self.config.clone(), peer, (self.sources)());
        let reply_via = self.channel.clone();
        let on_complete = on_complete.clone();
        sessions.spawn(async move {
            let result = handler.run(reply_via).await;
            on_complete(peer, result);
        });
    }
}
