//! Wire codec for every message the protocol exchanges.
//!
//! A message is a [`Header`] followed by a fixed-layout, big-endian payload
//! with no implicit padding inside it. Alignment padding, where a stage
//! uses it, trails the payload and is not counted in `payload_len`.
//!
//! | Stage  | Direction | `payload_len` | Payload                                   |
//! |--------|-----------|---------------|-------------------------------------------|
//! | A req  | C→S       | aligned 12    | `"hello world\0"` zero-padded             |
//! | A resp | S→C       | 16            | count, length, udp_port, secret           |
//! | B req  | C→S       | length + 4    | ack, zero fill (aligned)                  |
//! | B ack  | S→C       | 4             | ack                                       |
//! | B resp | S→C       | 8             | tcp_port, secret                          |
//! | C resp | S→C       | 13            | count2, length2, secret, fill byte        |
//! | D req  | C→S       | length2       | fill byte repeated (aligned)              |
//! | D resp | S→C       | 4             | final secret                              |

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};

use crate::align::{aligned_len, pad};
use crate::types::{Check, HandshakeError, Header, Stage, CLIENT_STEP, HEADER_LEN, MARKER};

/// Size of the ack counter carried in Stage-B data messages.
pub const ACK_LEN: usize = 4;

/// A fixed-layout payload that follows the header.
pub trait Payload: Sized {
    /// Encoded size in bytes.
    const LEN: usize;

    fn put(&self, buf: &mut BytesMut);

    /// Parse from exactly [`Payload::LEN`] bytes.
    fn parse(buf: &[u8]) -> Self;
}

/// Stage-A reply: parameters for Stage B.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageAReply {
    pub count: u32,
    pub length: u32,
    pub udp_port: u32,
    pub secret: u32,
}

impl Payload for StageAReply {
    const LEN: usize = 16;

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32(self.count);
        buf.put_u32(self.length);
        buf.put_u32(self.udp_port);
        buf.put_u32(self.secret);
    }

    fn parse(buf: &[u8]) -> Self {
        Self {
            count: BigEndian::read_u32(&buf[0..4]),
            length: BigEndian::read_u32(&buf[4..8]),
            udp_port: BigEndian::read_u32(&buf[8..12]),
            secret: BigEndian::read_u32(&buf[12..16]),
        }
    }
}

/// Stage-B acknowledgement of one data message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageBAck {
    pub ack: u32,
}

impl Payload for StageBAck {
    const LEN: usize = 4;

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32(self.ack);
    }

    fn parse(buf: &[u8]) -> Self {
        Self {
            ack: BigEndian::read_u32(&buf[0..4]),
        }
    }
}

/// Stage-B completion: where to connect for Stage C.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageBCompletion {
    pub tcp_port: u32,
    pub secret: u32,
}

impl Payload for StageBCompletion {
    const LEN: usize = 8;

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32(self.tcp_port);
        buf.put_u32(self.secret);
    }

    fn parse(buf: &[u8]) -> Self {
        Self {
            tcp_port: BigEndian::read_u32(&buf[0..4]),
            secret: BigEndian::read_u32(&buf[4..8]),
        }
    }
}

/// Stage-C reply: parameters for Stage D.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageCReply {
    pub count: u32,
    pub length: u32,
    pub secret: u32,
    pub fill: u8,
}

impl Payload for StageCReply {
    const LEN: usize = 13;

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32(self.count);
        buf.put_u32(self.length);
        buf.put_u32(self.secret);
        buf.put_u8(self.fill);
    }

    fn parse(buf: &[u8]) -> Self {
        Self {
            count: BigEndian::read_u32(&buf[0..4]),
            length: BigEndian::read_u32(&buf[4..8]),
            secret: BigEndian::read_u32(&buf[8..12]),
            fill: buf[12],
        }
    }
}

/// Stage-D reply carrying the terminal secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDReply {
    pub secret: u32,
}

impl Payload for StageDReply {
    const LEN: usize = 4;

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32(self.secret);
    }

    fn parse(buf: &[u8]) -> Self {
        Self {
            secret: BigEndian::read_u32(&buf[0..4]),
        }
    }
}

/// Encode `header` followed by `payload`.
///
/// The header's `payload_len` is taken as given; callers set it per stage.
pub fn encode_message<P: Payload>(header: Header, payload: &P) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + P::LEN);
    header.put(&mut buf);
    payload.put(&mut buf);
    buf.freeze()
}

/// Size of a header plus payload `P`.
pub const fn message_len<P: Payload>() -> usize {
    HEADER_LEN + P::LEN
}

/// Decode a header and payload `P` from the front of `buf`.
///
/// Bytes after the payload are ignored. A buffer too short for the payload
/// fails the frame-length check for `stage`.
pub fn decode_message<P: Payload>(stage: Stage, buf: &[u8]) -> Result<(Header, P), HandshakeError> {
    let header = Header::decode(buf)?;
    let body = buf
        .get(HEADER_LEN..HEADER_LEN + P::LEN)
        .ok_or_else(|| {
            HandshakeError::mismatch(
                stage,
                Check::FrameLength,
                format!("at least {}", HEADER_LEN + P::LEN),
                buf.len(),
            )
        })?;
    Ok((header, P::parse(body)))
}

/// Stage-A request: header plus the zero-padded marker.
pub fn stage_a_request(align: usize, id: u16) -> Bytes {
    let payload = pad(align, MARKER);
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    Header::new(payload.len() as u32, 0, CLIENT_STEP, id).put(&mut buf);
    buf.extend_from_slice(&payload);
    buf.freeze()
}

/// On-wire size of a Stage-B data message for a `length`-byte payload.
pub fn stage_b_frame_len(align: usize, length: usize) -> usize {
    HEADER_LEN + ACK_LEN + aligned_len(align, length)
}

/// On-wire size of a Stage-D message for a `length`-byte payload.
pub fn stage_d_frame_len(align: usize, length: usize) -> usize {
    HEADER_LEN + aligned_len(align, length)
}

/// Reusable Stage-B data message; only the ack slot changes between sends.
#[derive(Debug, Clone)]
pub struct StageBMessage {
    buf: BytesMut,
}

impl StageBMessage {
    /// Build the message for a `length`-byte zero payload.
    ///
    /// `payload_len` in the header is `length + 4`: the ack field counts,
    /// the alignment tail does not.
    pub fn new(align: usize, length: u32, secret: u32, id: u16) -> Self {
        let frame_len = stage_b_frame_len(align, length as usize);
        let mut buf = BytesMut::with_capacity(frame_len);
        Header::new(length + ACK_LEN as u32, secret, CLIENT_STEP, id).put(&mut buf);
        buf.put_u32(0);
        buf.resize(frame_len, 0);
        Self { buf }
    }

    pub fn set_ack(&mut self, ack: u32) {
        BigEndian::write_u32(&mut self.buf[HEADER_LEN..HEADER_LEN + ACK_LEN], ack);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// A decoded Stage-B data message, borrowed from the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageBData<'a> {
    pub header: Header,
    pub ack: u32,
    /// Everything after the ack field, padding included.
    pub payload: &'a [u8],
}

/// Split a Stage-B data datagram into header, ack and payload.
pub fn parse_stage_b_data(buf: &[u8]) -> Result<StageBData<'_>, HandshakeError> {
    let header = Header::decode(buf)?;
    if buf.len() < HEADER_LEN + ACK_LEN {
        return Err(HandshakeError::mismatch(
            Stage::B,
            Check::FrameLength,
            format!("at least {}", HEADER_LEN + ACK_LEN),
            buf.len(),
        ));
    }
    Ok(StageBData {
        header,
        ack: BigEndian::read_u32(&buf[HEADER_LEN..HEADER_LEN + ACK_LEN]),
        payload: &buf[HEADER_LEN + ACK_LEN..],
    })
}

/// Stage-D message: header plus `fill` repeated up to the aligned length.
pub fn stage_d_request(align: usize, length: u32, secret: u32, id: u16, fill: u8) -> Bytes {
    let frame_len = stage_d_frame_len(align, length as usize);
    let mut buf = BytesMut::with_capacity(frame_len);
    Header::new(length, secret, CLIENT_STEP, id).put(&mut buf);
    buf.resize(frame_len, fill);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_a_request_layout() {
        let msg = stage_a_request(4, 246);
        assert_eq!(msg.len(), 24);
        let header = Header::decode(&msg).unwrap();
        assert_eq!(header, Header::new(12, 0, 1, 246));
        assert_eq!(&msg[HEADER_LEN..], MARKER);
    }

    #[test]
    fn stage_a_request_pads_to_wider_alignment() {
        let msg = stage_a_request(8, 246);
        assert_eq!(msg.len(), HEADER_LEN + 16);
        assert_eq!(Header::decode(&msg).unwrap().payload_len, 16);
        assert!(msg[HEADER_LEN + MARKER.len()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn stage_b_message_sizes() {
        let msg = StageBMessage::new(4, 50, 7, 246);
        assert_eq!(msg.as_bytes().len(), 68);
        assert_eq!(stage_b_frame_len(4, 50), 68);
        let header = Header::decode(msg.as_bytes()).unwrap();
        assert_eq!(header.payload_len, 54);
        assert_eq!(header.secret, 7);
    }

    #[test]
    fn stage_b_ack_slot_is_rewritten_in_place() {
        let mut msg = StageBMessage::new(4, 33, 1, 246);
        msg.set_ack(5);
        let data = parse_stage_b_data(msg.as_bytes()).unwrap();
        assert_eq!(data.ack, 5);
        assert_eq!(data.payload.len(), 36);
        assert!(data.payload.iter().all(|&b| b == 0));

        msg.set_ack(6);
        assert_eq!(parse_stage_b_data(msg.as_bytes()).unwrap().ack, 6);
    }

    #[test]
    fn stage_b_ack_message_is_sixteen_bytes() {
        let bytes = encode_message(Header::new(4, 1, 1, 246), &StageBAck { ack: 3 });
        assert_eq!(bytes.len(), 16);
        assert_eq!(message_len::<StageBAck>(), 16);
    }

    #[test]
    fn stage_c_reply_decodes_fill_byte() {
        let reply = StageCReply {
            count: 9,
            length: 40,
            secret: 1234,
            fill: b'q',
        };
        let bytes = encode_message(Header::new(13, 55, 2, 246), &reply);
        assert_eq!(bytes.len(), 25);
        let (header, decoded) = decode_message::<StageCReply>(Stage::C, &bytes).unwrap();
        assert_eq!(header.step, 2);
        assert_eq!(decoded, reply);
    }

    #[test]
    fn truncated_payload_fails_frame_length() {
        let bytes = encode_message(
            Header::new(16, 0, 0, 246),
            &StageAReply {
                count: 1,
                length: 2,
                udp_port: 3,
                secret: 4,
            },
        );
        let err = decode_message::<StageAReply>(Stage::A, &bytes[..20]).unwrap_err();
        assert_eq!(err.check(), Some(Check::FrameLength));
    }

    #[test]
    fn stage_d_request_fills_padding_with_fill_byte() {
        let msg = stage_d_request(4, 33, 9, 246, b'x');
        assert_eq!(msg.len(), HEADER_LEN + 36);
        assert_eq!(Header::decode(&msg).unwrap().payload_len, 33);
        assert!(msg[HEADER_LEN..].iter().all(|&b| b == b'x'));
    }

    #[test]
    fn short_stage_b_data_is_rejected() {
        let header = Header::new(54, 0, 1, 246).to_bytes();
        let err = parse_stage_b_data(&header).unwrap_err();
        assert_eq!(err.check(), Some(Check::FrameLength));
    }
}
