//! Immutable configuration shared by client and server.
//!
//! Every field has a default, so a JSON file only needs the values it
//! changes:
//!
//! ```json
//! { "protocol": { "byte_align": 8 }, "server": { "listen_port": 4000 } }
//! ```

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::align::aligned_len;
use crate::frame::ACK_LEN;
use crate::params::MAX_STAGE_B_LENGTH;
use crate::types::{HandshakeError, HEADER_LEN};

/// Largest payload a single UDP datagram can carry over IPv4.
pub const MAX_DATAGRAM: usize = 65_507;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub protocol: ProtocolConfig,
    pub server: ServerConfig,
    pub client: ClientConfig,
}

/// Values both sides must agree on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Shared identifier stamped on every header.
    pub identifier: u16,
    /// Alignment boundary for padded payloads.
    pub byte_align: usize,
    /// Datagram receive buffer size.
    pub read_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            identifier: 246,
            byte_align: 4,
            read_size: 1024,
        }
    }
}

/// Inclusive port range the server draws session ports from.
///
/// `0..=0` lets the OS pick an ephemeral port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub low: u16,
    pub high: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            low: 49152,
            high: 65535,
        }
    }
}

impl PortRange {
    /// Let the OS choose every session port.
    pub const EPHEMERAL: PortRange = PortRange { low: 0, high: 0 };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: IpAddr,
    pub listen_port: u16,
    pub port_range: PortRange,
    /// Per-receive/accept deadline inside a session.
    pub recv_timeout_ms: u64,
    /// Shut the acceptor down after this long without Stage-A traffic.
    pub idle_shutdown_ms: u64,
    /// Chance that a valid Stage-B message is acknowledged.
    pub ack_probability: f64,
    /// Seed for reproducible session parameters.
    pub seed: Option<u64>,
    /// Fresh ports tried when a drawn port is already taken.
    pub port_bind_attempts: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listen_port: 12235,
            port_range: PortRange::default(),
            recv_timeout_ms: 3_000,
            idle_shutdown_ms: 30_000,
            ack_probability: 0.5,
            seed: None,
            port_bind_attempts: 16,
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.listen_port)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn idle_shutdown(&self) -> Duration {
        Duration::from_millis(self.idle_shutdown_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_addr: IpAddr,
    pub server_port: u16,
    pub stage_a_timeout_ms: u64,
    /// Wait per Stage-B attempt before retransmitting.
    pub retry_timeout_ms: u64,
    /// Stage-B timeouts tolerated before giving up.
    pub max_timeouts: u32,
    /// Connect and receive deadline for Stages C and D.
    pub stream_timeout_ms: u64,
    /// Deadline for the Stage-B completion datagram.
    pub completion_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            server_port: 12235,
            stage_a_timeout_ms: 5_000,
            retry_timeout_ms: 500,
            max_timeouts: 100,
            stream_timeout_ms: 5_000,
            completion_timeout_ms: 10_000,
        }
    }
}

impl ClientConfig {
    pub fn stage_a_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_a_timeout_ms)
    }

    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_timeout_ms)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }
}

impl Config {
    /// Load a JSON configuration file and validate it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, HandshakeError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| HandshakeError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the protocol cannot run with.
    pub fn validate(&self) -> Result<(), HandshakeError> {
        let invalid = |msg: String| Err(HandshakeError::Config(msg));

        if self.protocol.byte_align == 0 {
            return invalid("byte_align must be at least 1".into());
        }
        // Every Stage-B data message must fit one datagram and one read.
        let largest = aligned_len(self.protocol.byte_align, MAX_STAGE_B_LENGTH as usize)
            .checked_add(HEADER_LEN + ACK_LEN)
            .filter(|&len| len <= MAX_DATAGRAM);
        let Some(largest) = largest else {
            return invalid(format!(
                "byte_align {} pads Stage-B messages past the {MAX_DATAGRAM}-byte datagram limit",
                self.protocol.byte_align
            ));
        };
        if self.protocol.read_size < largest {
            return invalid(format!(
                "read_size must be at least {largest} for byte_align {}, got {}",
                self.protocol.byte_align, self.protocol.read_size
            ));
        }
        let range = self.server.port_range;
        if range.low > range.high {
            return invalid(format!(
                "port_range low {} is above high {}",
                range.low, range.high
            ));
        }
        if !(0.0..=1.0).contains(&self.server.ack_probability) {
            return invalid(format!(
                "ack_probability must be within [0, 1], got {}",
                self.server.ack_probability
            ));
        }
        if self.server.port_bind_attempts == 0 {
            return invalid("port_bind_attempts must be at least 1".into());
        }
        if self.client.max_timeouts == 0 {
            return invalid("max_timeouts must be at least 1".into());
        }
        Ok(())
    }
}
