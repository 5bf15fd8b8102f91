//! Server side of the protocol: validation of client messages and the
//! per-session stage machine that runs after a valid Stage-A request.
//!
//! Each session owns its sockets and its [`ServerSession`]; nothing is
//! shared between sessions except the well-known socket the Stage-A reply
//! leaves through.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

use crate::align::{aligned_len, strip};
use crate::config::{Config, ProtocolConfig};
use crate::frame::{
    encode_message, parse_stage_b_data, stage_b_frame_len, stage_d_frame_len, Payload,
    StageAReply, StageBAck, StageBCompletion, StageCReply, StageDReply, ACK_LEN,
};
use crate::params::{SessionSources, StageAParams, StageCParams};
use crate::session::ServerSession;
use crate::tcp::{StageListener, StreamChannel};
use crate::types::{Check, HandshakeError, Header, Stage, CLIENT_STEP, HEADER_LEN, MARKER};
use crate::udp::DatagramChannel;

/// Identifier and step rules every client message must pass.
fn check_header(stage: Stage, identifier: u16, header: &Header) -> Result<(), HandshakeError> {
    if header.id != identifier {
        return Err(HandshakeError::mismatch(stage, Check::Identifier, identifier, header.id));
    }
    if header.step != CLIENT_STEP {
        return Err(HandshakeError::mismatch(stage, Check::Step, CLIENT_STEP, header.step));
    }
    Ok(())
}

/// Validate a Stage-A request datagram.
///
/// The declared payload length may name either the bare marker or the
/// padded marker; either way the datagram must be exactly the header plus
/// the aligned marker, and the secret must be 0.
pub fn validate_stage_a(config: &ProtocolConfig, buf: &[u8]) -> Result<Header, HandshakeError> {
    let header = Header::decode(buf)?;
    check_header(Stage::A, config.identifier, &header)?;

    let padded = aligned_len(config.byte_align, MARKER.len());
    let declared = header.payload_len as usize;
    if declared != MARKER.len() && declared != padded {
        return Err(HandshakeError::mismatch(
            Stage::A,
            Check::PayloadLength,
            padded,
            declared,
        ));
    }

    let payload = strip(&buf[HEADER_LEN..], declared).ok_or_else(|| {
        HandshakeError::mismatch(Stage::A, Check::FrameLength, HEADER_LEN + padded, buf.len())
    })?;
    let (marker, tail) = payload.split_at(MARKER.len());
    if marker != MARKER || tail.iter().any(|&b| b != 0) {
        return Err(HandshakeError::mismatch(
            Stage::A,
            Check::PayloadContent,
            MARKER.escape_ascii(),
            payload.escape_ascii(),
        ));
    }

    if buf.len() != HEADER_LEN + padded {
        return Err(HandshakeError::mismatch(
            Stage::A,
            Check::FrameLength,
            HEADER_LEN + padded,
            buf.len(),
        ));
    }
    if header.secret != 0 {
        return Err(HandshakeError::mismatch(Stage::A, Check::Secret, 0, header.secret));
    }
    Ok(header)
}

/// How a structurally valid Stage-B message relates to the expected ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckVerdict {
    /// Carries the ack number the server is waiting for.
    Current,
    /// A retransmission of an ack already counted; ignore it.
    Stale { received: u32 },
}

/// Validate a Stage-B data datagram against the session and Stage-A
/// parameters.
pub fn check_stage_b(
    session: &ServerSession,
    length: u32,
    expected_ack: u32,
    buf: &[u8],
) -> Result<AckVerdict, HandshakeError> {
    let data = parse_stage_b_data(buf)?;
    check_header(Stage::B, session.identifier, &data.header)?;

    if data.header.secret != session.secret {
        return Err(HandshakeError::mismatch(
            Stage::B,
            Check::Secret,
            session.secret,
            data.header.secret,
        ));
    }
    let frame_len = stage_b_frame_len(session.byte_align, length as usize);
    if buf.len() != frame_len {
        return Err(HandshakeError::mismatch(Stage::B, Check::FrameLength, frame_len, buf.len()));
    }
    let declared = length + ACK_LEN as u32;
    if data.header.payload_len != declared {
        return Err(HandshakeError::mismatch(
            Stage::B,
            Check::PayloadLength,
            declared,
            data.header.payload_len,
        ));
    }
    let zeros = &data.payload[..length as usize];
    if let Some(pos) = zeros.iter().position(|&b| b != 0) {
        return Err(HandshakeError::mismatch(
            Stage::B,
            Check::PayloadContent,
            "all zero bytes",
            format!("{:#04x} at offset {pos}", zeros[pos]),
        ));
    }

    if data.ack > expected_ack {
        return Err(HandshakeError::mismatch(Stage::B, Check::AckAhead, expected_ack, data.ack));
    }
    if data.ack < expected_ack {
        return Ok(AckVerdict::Stale { received: data.ack });
    }
    Ok(AckVerdict::Current)
}

/// Validate one Stage-D frame of exactly the expected on-wire length.
pub fn check_stage_d(
    session: &ServerSession,
    params: &StageCParams,
    frame: &[u8],
) -> Result<(), HandshakeError> {
    let header = Header::decode(frame)?;
    check_header(Stage::D, session.identifier, &header)?;

    if header.secret != session.secret {
        return Err(HandshakeError::mismatch(
            Stage::D,
            Check::Secret,
            session.secret,
            header.secret,
        ));
    }
    if header.payload_len != params.length {
        return Err(HandshakeError::mismatch(
            Stage::D,
            Check::PayloadLength,
            params.length,
            header.payload_len,
        ));
    }
    let frame_len = stage_d_frame_len(session.byte_align, params.length as usize);
    let payload = frame
        .get(HEADER_LEN..HEADER_LEN + params.length as usize)
        .ok_or_else(|| HandshakeError::mismatch(Stage::D, Check::FrameLength, frame_len, frame.len()))?;
    if let Some(pos) = payload.iter().position(|&b| b != params.fill) {
        return Err(HandshakeError::mismatch(
            Stage::D,
            Check::PayloadContent,
            format!("{:?} repeated", params.fill as char),
            format!("{:?} at offset {pos}", payload[pos] as char),
        ));
    }
    if frame.len() != frame_len {
        return Err(HandshakeError::mismatch(Stage::D, Check::FrameLength, frame_len, frame.len()));
    }
    Ok(())
}

/// Outcome of a completed server session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub peer: SocketAddr,
    /// Secrets issued in Stages A, B, C and D, in order.
    pub secrets: Vec<u32>,
}

impl SessionSummary {
    /// The terminal secret sent in the Stage-D reply.
    pub fn final_secret(&self) -> Option<u32> {
        self.secrets.last().copied()
    }
}

/// Typed server stage: each variant carries what the stage needs from the
/// one before it.
enum ServerStage {
    A,
    B(DatagramChannel, StageAParams),
    C(StageListener),
    D(StreamChannel, StageListener, StageCParams),
    Done,
}

/// Drives one client through Stages A to D.
pub struct SessionHandler {
    config: Arc<Config>,
    session: ServerSession,
    sources: SessionSources,
}

impl SessionHandler {
    pub fn new(config: Arc<Config>, peer: SocketAddr, sources: SessionSources) -> Self {
        let session = ServerSession::new(&config, peer);
        Self {
            config,
            session,
            sources,
        }
    }

    pub fn session(&self) -> &ServerSession {
        &self.session
    }

    /// Run the session to completion; `reply_via` carries the Stage-A reply.
    ///
    /// The Stage-A request must already have passed [`validate_stage_a`].
    pub async fn run(mut self, reply_via: DatagramChannel) -> Result<SessionSummary, HandshakeError> {
        match self.drive(&reply_via).await {
            Ok(()) => {
                self.session.finish();
                info!(
                    "Session {} completed after issuing {} secrets",
                    self.session.peer,
                    self.session.issued.len()
                );
                Ok(SessionSummary {
                    peer: self.session.peer,
                    secrets: self.session.issued,
                })
            }
            Err(e) => {
                self.session.abort();
                error!("Session {} {}: {}", self.session.peer, self.session.phase, e);
                Err(e)
            }
        }
    }

    async fn drive(&mut self, reply_via: &DatagramChannel) -> Result<(), HandshakeError> {
        let mut stage = ServerStage::A;
        loop {
            stage = match stage {
                ServerStage::A => {
                    self.session.enter(Stage::A);
                    let (chan, params) = self.stage_a(reply_via).await?;
                    ServerStage::B(chan, params)
                }
                ServerStage::B(chan, params) => {
                    self.session.enter(Stage::B);
                    ServerStage::C(self.stage_b(chan, params).await?)
                }
                ServerStage::C(listener) => {
                    self.session.enter(Stage::C);
                    let (chan, params) = self.stage_c(&listener).await?;
                    ServerStage::D(chan, listener, params)
                }
                ServerStage::D(mut chan, listener, params) => {
                    self.session.enter(Stage::D);
                    self.stage_d(&mut chan, params).await?;
                    if let Err(e) = chan.close().await {
                        debug!("Closing stream for {}: {}", self.session.peer, e);
                    }
                    drop(listener);
                    ServerStage::Done
                }
                ServerStage::Done => return Ok(()),
            };
        }
    }

    /// Bind a session endpoint on a port drawn from the configured range,
    /// drawing again while the port is taken.
    async fn bind_session_port<T, F, Fut>(&mut self, bind: F) -> Result<T, HandshakeError>
    where
        F: Fn(SocketAddr) -> Fut,
        Fut: Future<Output = Result<T, HandshakeError>>,
    {
        let server = &self.config.server;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let port = self.sources.params.port(server.port_range);
            match bind(SocketAddr::new(server.bind_addr, port)).await {
                Err(HandshakeError::Io(e))
                    if e.kind() == std::io::ErrorKind::AddrInUse
                        && attempts < server.port_bind_attempts =>
                {
                    debug!("Port {} in use, drawing another", port);
                }
                result => return result,
            }
        }
    }

    async fn stage_a(
        &mut self,
        reply_via: &DatagramChannel,
    ) -> Result<(DatagramChannel, StageAParams), HandshakeError> {
        let params = self.sources.params.stage_a();
        let read_size = self.config.protocol.read_size;
        let chan = self
            .bind_session_port(|addr| DatagramChannel::bind(addr, read_size))
            .await?;
        let udp_port = chan.local_addr()?.port();

        let reply = StageAReply {
            count: params.count,
            length: params.length,
            udp_port: u32::from(udp_port),
            secret: params.secret,
        };
        let header = self.session.reply_header(Stage::A, StageAReply::LEN as u32);
        reply_via
            .send_to(&encode_message(header, &reply), self.session.peer)
            .await?;
        self.session.issue(params.secret);
        info!(
            "Session {}: expecting {} messages of {} bytes on port {}",
            self.session.peer, params.count, params.length, udp_port
        );
        Ok((chan, params))
    }

    async fn stage_b(
        &mut self,
        chan: DatagramChannel,
        params: StageAParams,
    ) -> Result<StageListener, HandshakeError> {
        let wait = self.config.server.recv_timeout();
        let mut client = self.session.peer;
        let mut ack = 0;

        while ack < params.count {
            let (buf, from) = chan.recv_timeout(Stage::B, wait).await?;
            if let AckVerdict::Stale { received } =
                check_stage_b(&self.session, params.length, ack, &buf)?
            {
                debug!("Ignoring retransmitted ack {} (expecting {})", received, ack);
                continue;
            }
            client = from;

            if self.sources.acks.should_ack(ack) {
                let header = self.session.reply_header(Stage::B, StageBAck::LEN as u32);
                chan.send_to(&encode_message(header, &StageBAck { ack }), from)
                    .await?;
                ack += 1;
            } else {
                debug!("Withholding ack {} from {}", ack, from);
            }
        }
        info!("Session {}: received all {} messages", self.session.peer, params.count);

        let listener = self.bind_session_port(StageListener::bind).await?;
        let tcp_port = listener.local_addr()?.port();
        let secret = self.sources.params.stage_b_secret();
        let header = self.session.reply_header(Stage::B, StageBCompletion::LEN as u32);
        let completion = StageBCompletion {
            tcp_port: u32::from(tcp_port),
            secret,
        };
        chan.send_to(&encode_message(header, &completion), client)
            .await?;
        self.session.issue(secret);
        Ok(listener)
    }

    async fn stage_c(
        &mut self,
        listener: &StageListener,
    ) -> Result<(StreamChannel, StageCParams), HandshakeError> {
        let (mut chan, _) = listener
            .accept(Stage::C, self.config.server.recv_timeout())
            .await?;
        let params = self.sources.params.stage_c();
        let header = self.session.reply_header(Stage::C, StageCReply::LEN as u32);
        let reply = StageCReply {
            count: params.count,
            length: params.length,
            secret: params.secret,
            fill: params.fill,
        };
        chan.send(encode_message(header, &reply)).await?;
        self.session.issue(params.secret);
        Ok((chan, params))
    }

    /// Read and validate all Stage-D messages, then send the final secret.
    ///
    /// A single bad message aborts the session; nothing is skipped.
    pub async fn stage_d<T>(
        &mut self,
        chan: &mut StreamChannel<T>,
        params: StageCParams,
    ) -> Result<u32, HandshakeError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let wait = self.config.server.recv_timeout();
        let frame_len = stage_d_frame_len(self.session.byte_align, params.length as usize);

        for index in 0..params.count {
            let frame = chan.recv_frame(Stage::D, frame_len, wait).await?;
            if let Err(e) = check_stage_d(&self.session, &params, &frame) {
                warn!("Rejecting message {} of {}", index + 1, params.count);
                return Err(e);
            }
        }
        info!("Session {}: validated {} messages", self.session.peer, params.count);

        let secret = self.sources.params.final_secret();
        let header = self.session.reply_header(Stage::D, StageDReply::LEN as u32);
        chan.send(encode_message(header, &StageDReply { secret })).await?;
        self.session.issue(secret);
        Ok(secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{stage_a_request, stage_d_request, StageBMessage};
    use crate::params::{AlwaysAck, ParamSource};
    use crate::config::PortRange;
    use tokio_test::io::Builder;

    const ID: u16 = 246;

    fn session(secret: u32) -> ServerSession {
        let mut session = ServerSession::new(&Config::default(), "127.0.0.1:5000".parse().unwrap());
        session.issue(secret);
        session
    }

    #[derive(Clone)]
    struct Fixed;

    impl ParamSource for Fixed {
        fn stage_a(&mut self) -> StageAParams {
            StageAParams { count: 2, length: 40, secret: 11 }
        }
        fn port(&mut self, _range: PortRange) -> u16 {
            0
        }
        fn stage_b_secret(&mut self) -> u32 {
            22
        }
        fn stage_c(&mut self) -> StageCParams {
            StageCParams { count: 3, length: 5, secret: 33, fill: b'k' }
        }
        fn final_secret(&mut self) -> u32 {
            44
        }
    }

    fn handler_at_stage_d(secret: u32) -> SessionHandler {
        let sources = SessionSources {
            params: Box::new(Fixed),
            acks: Box::new(AlwaysAck),
        };
        let mut handler = SessionHandler::new(
            Arc::new(Config::default()),
            "127.0.0.1:5000".parse().unwrap(),
            sources,
        );
        handler.session.issue(secret);
        handler
    }

    #[test]
    fn stage_a_accepts_padded_marker() {
        let request = stage_a_request(4, ID);
        let header = validate_stage_a(&ProtocolConfig::default(), &request).unwrap();
        assert_eq!(header.payload_len, 12);
    }

    #[test]
    fn stage_a_accepts_wider_alignment() {
        let config = ProtocolConfig {
            byte_align: 8,
            ..ProtocolConfig::default()
        };
        assert!(validate_stage_a(&config, &stage_a_request(8, ID)).is_ok());
    }

    #[test]
    fn stage_a_rejects_nonzero_secret() {
        let mut request = stage_a_request(4, ID).to_vec();
        request[4..8].copy_from_slice(&1u32.to_be_bytes());
        let err = validate_stage_a(&ProtocolConfig::default(), &request).unwrap_err();
        assert_eq!(err.check(), Some(Check::Secret));
        assert_eq!(err.stage(), Some(Stage::A));
    }

    #[test]
    fn stage_a_rejects_wrong_identifier() {
        let request = stage_a_request(4, 99);
        let err = validate_stage_a(&ProtocolConfig::default(), &request).unwrap_err();
        assert_eq!(err.check(), Some(Check::Identifier));
    }

    #[test]
    fn stage_a_rejects_wrong_marker() {
        let mut request = stage_a_request(4, ID).to_vec();
        request[HEADER_LEN] = b'j';
        let err = validate_stage_a(&ProtocolConfig::default(), &request).unwrap_err();
        assert_eq!(err.check(), Some(Check::PayloadContent));
    }

    #[test]
    fn stage_a_rejects_extra_bytes() {
        let mut request = stage_a_request(4, ID).to_vec();
        request.extend_from_slice(&[0; 4]);
        let err = validate_stage_a(&ProtocolConfig::default(), &request).unwrap_err();
        assert_eq!(err.check(), Some(Check::FrameLength));
    }

    #[test]
    fn stage_a_rejects_truncated_request() {
        let request = stage_a_request(4, ID);
        let err = validate_stage_a(&ProtocolConfig::default(), &request[..18]).unwrap_err();
        assert_eq!(err.check(), Some(Check::FrameLength));
    }

    #[test]
    fn stage_b_current_and_stale_acks() {
        let session = session(7);
        let mut msg = StageBMessage::new(4, 50, 7, ID);
        msg.set_ack(3);
        assert_eq!(check_stage_b(&session, 50, 3, msg.as_bytes()).unwrap(), AckVerdict::Current);
        assert_eq!(
            check_stage_b(&session, 50, 4, msg.as_bytes()).unwrap(),
            AckVerdict::Stale { received: 3 }
        );
    }

    #[test]
    fn stage_b_ack_ahead_is_fatal() {
        let session = session(7);
        let mut msg = StageBMessage::new(4, 50, 7, ID);
        msg.set_ack(5);
        let err = check_stage_b(&session, 50, 4, msg.as_bytes()).unwrap_err();
        assert_eq!(err.check(), Some(Check::AckAhead));
    }

    #[test]
    fn stage_b_rejects_wrong_secret_and_length() {
        let session = session(7);
        let msg = StageBMessage::new(4, 50, 8, ID);
        let err = check_stage_b(&session, 50, 0, msg.as_bytes()).unwrap_err();
        assert_eq!(err.check(), Some(Check::Secret));

        let msg = StageBMessage::new(4, 51, 7, ID);
        let err = check_stage_b(&session, 50, 0, msg.as_bytes()).unwrap_err();
        assert_eq!(err.check(), Some(Check::PayloadLength));

        let msg = StageBMessage::new(4, 60, 7, ID);
        let err = check_stage_b(&session, 50, 0, msg.as_bytes()).unwrap_err();
        assert_eq!(err.check(), Some(Check::FrameLength));
    }

    #[test]
    fn stage_b_rejects_nonzero_fill() {
        let session = session(7);
        let mut bytes = StageBMessage::new(4, 50, 7, ID).as_bytes().to_vec();
        bytes[HEADER_LEN + ACK_LEN + 10] = 1;
        let err = check_stage_b(&session, 50, 0, &bytes).unwrap_err();
        assert_eq!(err.check(), Some(Check::PayloadContent));
    }

    #[test]
    fn stage_b_ignores_padding_bytes() {
        let session = session(7);
        let mut bytes = StageBMessage::new(4, 50, 7, ID).as_bytes().to_vec();
        let last = bytes.len() - 1;
        bytes[last] = 0xff;
        assert_eq!(check_stage_b(&session, 50, 0, &bytes).unwrap(), AckVerdict::Current);
    }

    #[test]
    fn stage_d_frame_checks() {
        let session = session(33);
        let params = Fixed.stage_c();
        let good = stage_d_request(4, params.length, 33, ID, params.fill);
        assert!(check_stage_d(&session, &params, &good).is_ok());

        let wrong_secret = stage_d_request(4, params.length, 34, ID, params.fill);
        assert_eq!(
            check_stage_d(&session, &params, &wrong_secret).unwrap_err().check(),
            Some(Check::Secret)
        );

        let wrong_fill = stage_d_request(4, params.length, 33, ID, b'z');
        assert_eq!(
            check_stage_d(&session, &params, &wrong_fill).unwrap_err().check(),
            Some(Check::PayloadContent)
        );

        let mut wrong_step = good.to_vec();
        wrong_step[8..10].copy_from_slice(&2u16.to_be_bytes());
        assert_eq!(
            check_stage_d(&session, &params, &wrong_step).unwrap_err().check(),
            Some(Check::Step)
        );
    }

    #[tokio::test]
    async fn stage_d_replies_after_every_message_validates() {
        let params = Fixed.stage_c();
        let frame = stage_d_request(4, params.length, 33, ID, params.fill);
        let incoming: Vec<u8> = frame.iter().copied().cycle().take(frame.len() * 3).collect();
        let reply = encode_message(Header::new(4, 33, 3, ID), &StageDReply { secret: 44 });

        let io = Builder::new().read(&incoming).write(&reply).build();
        let mut chan = StreamChannel::new(io);
        let mut handler = handler_at_stage_d(33);

        assert_eq!(handler.stage_d(&mut chan, params).await.unwrap(), 44);
        assert_eq!(handler.session().secret, 44);
        assert_eq!(StageDReply::LEN, 4);
    }

    #[tokio::test]
    async fn stage_d_aborts_on_corrupted_middle_message() {
        let params = Fixed.stage_c();
        let good = stage_d_request(4, params.length, 33, ID, params.fill);
        let bad = stage_d_request(4, params.length, 33, ID, b'x');
        let mut incoming = good.to_vec();
        incoming.extend_from_slice(&bad);
        incoming.extend_from_slice(&good);

        let io = Builder::new().read(&incoming).build();
        let mut chan = StreamChannel::new(io);
        let mut handler = handler_at_stage_d(33);

        let err = handler.stage_d(&mut chan, params).await.unwrap_err();
        assert_eq!(err.check(), Some(Check::PayloadContent));
        assert_eq!(handler.session().secret, 33);
    }

    #[tokio::test]
    async fn stage_d_short_stream_is_closed_connection() {
        let params = Fixed.stage_c();
        let good = stage_d_request(4, params.length, 33, ID, params.fill);
        let mut incoming = good.to_vec();
        incoming.extend_from_slice(&good[..10]);

        let io = Builder::new().read(&incoming).build();
        let mut chan = StreamChannel::new(io);
        let mut handler = handler_at_stage_d(33);

        let err = handler.stage_d(&mut chan, params).await.unwrap_err();
        assert!(matches!(err, HandshakeError::ConnectionClosed { stage: Stage::D }));
    }
}
