//! Core protocol types: the fixed header, stage tags and the error type.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Size of the encoded [`Header`] in bytes.
pub const HEADER_LEN: usize = 12;

/// Stage-A marker the client sends and the server expects, NUL included.
pub const MARKER: &[u8] = b"hello world\0";

/// Step value every client message carries.
pub const CLIENT_STEP: u16 = 1;

/// Fixed 12-byte message header, big-endian on the wire.
///
/// ```text
///  0               4               8       10      12
///  +---------------+---------------+-------+-------+
///  |  payload_len  |    secret     | step  |  id   |
///  +---------------+---------------+-------+-------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Declared payload length. Alignment padding is never counted here.
    pub payload_len: u32,
    /// Secret issued by the previous stage (0 for Stage A).
    pub secret: u32,
    /// Stage step tag.
    pub step: u16,
    /// Shared identifier used as a correlation token.
    pub id: u16,
}

impl Header {
    pub fn new(payload_len: u32, secret: u32, step: u16, id: u16) -> Self {
        Self {
            payload_len,
            secret,
            step,
            id,
        }
    }

    /// Append the encoded header to `buf`.
    pub fn put(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_LEN);
        buf.put_u32(self.payload_len);
        buf.put_u32(self.secret);
        buf.put_u16(self.step);
        buf.put_u16(self.id);
    }

    /// Encode into a standalone 12-byte array.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        BigEndian::write_u32(&mut out[0..4], self.payload_len);
        BigEndian::write_u32(&mut out[4..8], self.secret);
        BigEndian::write_u16(&mut out[8..10], self.step);
        BigEndian::write_u16(&mut out[10..12], self.id);
        out
    }

    /// Decode the first [`HEADER_LEN`] bytes of `buf`.
    ///
    /// Trailing bytes are ignored; fewer than 12 bytes is
    /// [`HandshakeError::MalformedHeader`].
    pub fn decode(buf: &[u8]) -> Result<Self, HandshakeError> {
        if buf.len() < HEADER_LEN {
            return Err(HandshakeError::MalformedHeader {
                needed: HEADER_LEN,
                got: buf.len(),
            });
        }
        Ok(Self {
            payload_len: BigEndian::read_u32(&buf[0..4]),
            secret: BigEndian::read_u32(&buf[4..8]),
            step: BigEndian::read_u16(&buf[8..10]),
            id: BigEndian::read_u16(&buf[10..12]),
        })
    }
}

/// One of the four protocol stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    A,
    B,
    C,
    D,
}

impl Stage {
    /// Step tag the server stamps on its replies for this stage.
    pub fn server_step(self) -> u16 {
        match self {
            Stage::A => 0,
            Stage::B => 1,
            Stage::C => 2,
            Stage::D => 3,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::A => "A",
            Stage::B => "B",
            Stage::C => "C",
            Stage::D => "D",
        };
        f.write_str(name)
    }
}

/// Lifecycle of one protocol run on either side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Executing the given stage.
    Running(Stage),
    /// All four stages completed.
    Done,
    /// A stage failed; no further stages run.
    Aborted(Stage),
}

impl Default for Phase {
    fn default() -> Self {
        Phase::Running(Stage::A)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Running(stage) => write!(f, "stage {stage}"),
            Phase::Done => f.write_str("done"),
            Phase::Aborted(stage) => write!(f, "aborted in stage {stage}"),
        }
    }
}

/// Which validation rule a message broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    Identifier,
    Step,
    Secret,
    PayloadLength,
    PayloadContent,
    FrameLength,
    /// Stage-B ack number ahead of the one the server expects.
    AckAhead,
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Check::Identifier => "identifier",
            Check::Step => "step",
            Check::Secret => "secret",
            Check::PayloadLength => "payload length",
            Check::PayloadContent => "payload content",
            Check::FrameLength => "frame length",
            Check::AckAhead => "ack number",
        };
        f.write_str(name)
    }
}

/// Errors that end a protocol run.
///
/// Every variant is fatal to the current session only; the server's
/// acceptor loop keeps running.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("stage {stage}: no response within {after:?}")]
    Timeout { stage: Stage, after: Duration },

    #[error("stage {stage}: gave up after {attempts} timed-out attempts")]
    RetriesExhausted { stage: Stage, attempts: u32 },

    #[error("stage {stage}: {check} mismatch, expected {expected} but got {actual}")]
    Validation {
        stage: Stage,
        check: Check,
        expected: String,
        actual: String,
    },

    #[error("malformed header: need {needed} bytes, got {got}")]
    MalformedHeader { needed: usize, got: usize },

    #[error("stage {stage}: connect to {addr} failed: {source}")]
    Connect {
        stage: Stage,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("stage {stage}: accept failed: {source}")]
    Accept {
        stage: Stage,
        #[source]
        source: io::Error,
    },

    #[error("stage {stage}: peer closed the connection")]
    ConnectionClosed { stage: Stage },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl HandshakeError {
    /// Build a [`HandshakeError::Validation`] from displayable values.
    pub fn mismatch(
        stage: Stage,
        check: Check,
        expected: impl fmt::Display,
        actual: impl fmt::Display,
    ) -> Self {
        HandshakeError::Validation {
            stage,
            check,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Stage the error occurred in, when known.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            HandshakeError::Timeout { stage, .. }
            | HandshakeError::RetriesExhausted { stage, .. }
            | HandshakeError::Validation { stage, .. }
            | HandshakeError::Connect { stage, .. }
            | HandshakeError::Accept { stage, .. }
            | HandshakeError::ConnectionClosed { stage } => Some(*stage),
            _ => None,
        }
    }

    /// The failed check, for validation errors.
    pub fn check(&self) -> Option<Check> {
        match self {
            HandshakeError::Validation { check, .. } => Some(*check),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_big_endian_on_the_wire() {
        let bytes = Header::new(0x0102_0304, 0x0506_0708, 0x090a, 0x0b0c).to_bytes();
        assert_eq!(bytes, [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn put_and_to_bytes_agree() {
        let header = Header::new(16, 77, 0, 246);
        let mut buf = BytesMut::new();
        header.put(&mut buf);
        assert_eq!(&buf[..], &header.to_bytes()[..]);
    }

    #[test]
    fn decode_ignores_trailing_bytes() {
        let mut bytes = Header::new(4, 9, 3, 246).to_bytes().to_vec();
        bytes.extend_from_slice(&[0xff; 4]);
        assert_eq!(Header::decode(&bytes).unwrap(), Header::new(4, 9, 3, 246));
    }

    #[test]
    fn short_header_is_malformed() {
        let err = Header::decode(&[0u8; 11]).unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::MalformedHeader { needed: 12, got: 11 }
        ));
    }

    #[test]
    fn server_steps_ascend() {
        let steps: Vec<u16> = [Stage::A, Stage::B, Stage::C, Stage::D]
            .iter()
            .map(|s| s.server_step())
            .collect();
        assert_eq!(steps, vec![0, 1, 2, 3]);
    }

    #[test]
    fn validation_error_names_stage_and_check() {
        let err = HandshakeError::mismatch(Stage::B, Check::Secret, 10, 11);
        assert_eq!(err.stage(), Some(Stage::B));
        assert_eq!(err.check(), Some(Check::Secret));
        assert_eq!(
            err.to_string(),
            "stage B: secret mismatch, expected 10 but got 11"
        );
    }
}
