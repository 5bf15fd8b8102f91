//! Mutable state threaded through the stages of one protocol run.
//!
//! Each session is owned by exactly one driver (the client, or one server
//! session task) and is never shared.

use std::net::SocketAddr;

use tracing::info;

use crate::config::Config;
use crate::types::{Header, Phase, Stage, CLIENT_STEP};

/// Client-side session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSession {
    /// Latest secret; 0 until Stage A completes.
    pub secret: u32,
    /// Step tag stamped on every outgoing header.
    pub step: u16,
    /// Server port for the next stage.
    pub port: u16,
    pub identifier: u16,
    pub byte_align: usize,
    pub phase: Phase,
}

impl ClientSession {
    pub fn new(config: &Config) -> Self {
        Self {
            secret: 0,
            step: CLIENT_STEP,
            port: config.client.server_port,
            identifier: config.protocol.identifier,
            byte_align: config.protocol.byte_align,
            phase: Phase::default(),
        }
    }

    /// Header for an outgoing message with the current secret.
    pub fn header(&self, payload_len: u32) -> Header {
        Header::new(payload_len, self.secret, self.step, self.identifier)
    }

    pub fn enter(&mut self, stage: Stage) {
        info!("Client entering stage {}", stage);
        self.phase = Phase::Running(stage);
    }

    pub fn finish(&mut self) {
        self.phase = Phase::Done;
    }

    /// Mark the current stage as failed.
    pub fn abort(&mut self) {
        if let Phase::Running(stage) = self.phase {
            self.phase = Phase::Aborted(stage);
        }
    }
}

/// Server-side state for one client's run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSession {
    pub peer: SocketAddr,
    /// Identifier configured on the server; clients must echo it.
    pub identifier: u16,
    pub byte_align: usize,
    /// Secret issued by the most recent stage.
    pub secret: u32,
    /// Every secret issued so far, Stage A first.
    pub issued: Vec<u32>,
    pub phase: Phase,
}

impl ServerSession {
    pub fn new(config: &Config, peer: SocketAddr) -> Self {
        Self {
            peer,
            identifier: config.protocol.identifier,
            byte_align: config.protocol.byte_align,
            secret: 0,
            issued: Vec::with_capacity(4),
            phase: Phase::default(),
        }
    }

    /// Header for a reply in `stage`.
    ///
    /// Replies carry the secret the client currently holds, not the one
    /// being issued in the payload.
    pub fn reply_header(&self, stage: Stage, payload_len: u32) -> Header {
        Header::new(payload_len, self.secret, stage.server_step(), self.identifier)
    }

    /// Record a newly issued secret the client must echo from now on.
    pub fn issue(&mut self, secret: u32) {
        self.issued.push(secret);
        self.secret = secret;
    }

    pub fn enter(&mut self, stage: Stage) {
        info!("Session {} entering stage {}", self.peer, stage);
        self.phase = Phase::Running(stage);
    }

    pub fn finish(&mut self) {
        self.phase = Phase::Done;
    }

    pub fn abort(&mut self) {
        if let Phase::Running(stage) = self.phase {
            self.phase = Phase::Aborted(stage);
        }
    }
}
