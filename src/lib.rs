//! # stagewire
//!
//! A four-stage handshake between one client and one server, exercising
//! datagram and stream sockets, fixed binary framing, byte alignment and
//! timeout/retry over an unreliable channel.
//!
//! ## Quick Start
//!
//! ```no_run
//! use stagewire::{Client, Config, Server};
//!
//! # async fn demo() -> Result<(), stagewire::HandshakeError> {
//! let server = Server::bind(Config::default()).await?;
//! tokio::spawn(server.run());
//!
//! let mut client = Client::new(Config::default())?;
//! let report = client.run().await?;
//! println!("final secret: {}", report.stage_d);
//! # Ok(())
//! # }
//! ```
//!
//! ## Protocol Overview
//!
//! Every message starts with a 12-byte big-endian header:
//!
//! - PAYLOAD_LEN (4B): payload length, alignment padding excluded
//! - SECRET (4B): secret issued by the previous stage
//! - STEP (2B): step tag (always 1 from the client)
//! - ID (2B): shared identifier
//!
//! ## Stages
//!
//! | Stage | Transport | Client sends                   | Server replies                    |
//! |-------|-----------|--------------------------------|-----------------------------------|
//! | A     | UDP       | `"hello world\0"`              | count, length, UDP port, secret   |
//! | B     | UDP       | `count` zero-filled messages   | one ack each, then TCP port+secret|
//! | C     | TCP       | (connect)                      | count2, length2, secret, fill byte|
//! | D     | TCP       | `count2` fill-byte messages    | final secret                      |
//!
//! In Stage B the server withholds acks at random, and the client
//! retransmits until acknowledged or out of retries.

pub mod align;
pub mod client;
pub mod codec;
pub mod config;
pub mod frame;
pub mod handler;
pub mod params;
pub mod session;
pub mod tcp;
pub mod types;
pub mod udp;

// Re-export main types for convenience
pub use types::{Check, HandshakeError, Header, Phase, Stage, HEADER_LEN, MARKER};

pub use client::{Client, HandshakeReport};
pub use codec::FixedFrameCodec;
pub use config::{Config, PortRange};
pub use handler::SessionSummary;
pub use udp::Server;
