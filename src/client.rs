//! Client side of the protocol.
//!
//! The client drives the four stages strictly in order. Each stage consumes
//! the validated reply of the one before it; a timeout or a malformed reply
//! aborts the run and no later stage starts.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tracing::{debug, error, info};

use crate::config::Config;
use crate::frame::{
    decode_message, message_len, stage_a_request, stage_d_request, StageAReply,
    StageBCompletion, StageBMessage, StageCReply, StageDReply,
};
use crate::session::ClientSession;
use crate::tcp::StreamChannel;
use crate::types::{Check, HandshakeError, Phase, Stage};
use crate::udp::DatagramChannel;

/// Secrets the client collected, one per stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandshakeReport {
    pub stage_a: u32,
    pub stage_b: u32,
    pub stage_c: u32,
    /// Terminal secret from the Stage-D reply.
    pub stage_d: u32,
}

/// Typed client stage: each variant carries the previous stage's reply.
enum ClientStage {
    A,
    B(StageAReply),
    C,
    D(StreamChannel, StageCReply),
    Done,
}

/// Handshake client.
#[derive(Debug)]
pub struct Client {
    config: Config,
    session: ClientSession,
    report: HandshakeReport,
}

impl Client {
    pub fn new(config: Config) -> Result<Self, HandshakeError> {
        config.validate()?;
        Ok(Self {
            session: ClientSession::new(&config),
            config,
            report: HandshakeReport::default(),
        })
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    /// Whether the last run finished all four stages.
    pub fn is_done(&self) -> bool {
        self.session.phase == Phase::Done
    }

    /// Run Stages A to D against the configured server.
    pub async fn run(&mut self) -> Result<HandshakeReport, HandshakeError> {
        match self.drive().await {
            Ok(report) => {
                self.session.finish();
                info!("Handshake complete, final secret {}", report.stage_d);
                Ok(report)
            }
            Err(e) => {
                self.session.abort();
                error!("Handshake {}: {}", self.session.phase, e);
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<HandshakeReport, HandshakeError> {
        let mut stage = ClientStage::A;
        loop {
            stage = match stage {
                ClientStage::A => {
                    self.session.enter(Stage::A);
                    ClientStage::B(self.stage_a().await?)
                }
                ClientStage::B(reply) => {
                    self.session.enter(Stage::B);
                    self.stage_b(reply).await?;
                    ClientStage::C
                }
                ClientStage::C => {
                    self.session.enter(Stage::C);
                    let (chan, reply) = self.stage_c().await?;
                    ClientStage::D(chan, reply)
                }
                ClientStage::D(mut chan, reply) => {
                    self.session.enter(Stage::D);
                    self.stage_d(&mut chan, reply).await?;
                    if let Err(e) = chan.close().await {
                        debug!("Closing stream: {}", e);
                    }
                    ClientStage::Done
                }
                ClientStage::Done => return Ok(self.report),
            };
        }
    }

    fn server(&self) -> SocketAddr {
        SocketAddr::new(self.config.client.server_addr, self.session.port)
    }

    /// Wildcard local address of the same family as the server.
    fn local_any(&self) -> SocketAddr {
        let ip = match self.config.client.server_addr {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        SocketAddr::new(ip, 0)
    }

    fn record(&mut self, stage: Stage, secret: u32) {
        info!("Stage {} secret is {}", stage, secret);
        self.session.secret = secret;
        let slot = match stage {
            Stage::A => &mut self.report.stage_a,
            Stage::B => &mut self.report.stage_b,
            Stage::C => &mut self.report.stage_c,
            Stage::D => &mut self.report.stage_d,
        };
        *slot = secret;
    }

    fn set_port(&mut self, stage: Stage, port: u32) -> Result<(), HandshakeError> {
        self.session.port = u16::try_from(port).map_err(|_| {
            HandshakeError::mismatch(stage, Check::PayloadContent, "a port number", port)
        })?;
        Ok(())
    }

    async fn stage_a(&mut self) -> Result<StageAReply, HandshakeError> {
        let chan = DatagramChannel::bind(self.local_any(), self.config.protocol.read_size).await?;
        let request = stage_a_request(self.session.byte_align, self.session.identifier);
        chan.send_to(&request, self.server()).await?;

        let (buf, _) = chan
            .recv_timeout(Stage::A, self.config.client.stage_a_timeout())
            .await?;
        let (_, reply) = decode_message::<StageAReply>(Stage::A, &buf)?;
        self.set_port(Stage::A, reply.udp_port)?;
        self.record(Stage::A, reply.secret);
        Ok(reply)
    }

    async fn stage_b(&mut self, params: StageAReply) -> Result<(), HandshakeError> {
        let client = &self.config.client;
        let chan = DatagramChannel::bind(self.local_any(), self.config.protocol.read_size).await?;
        let dest = self.server();
        let mut message = StageBMessage::new(
            self.session.byte_align,
            params.length,
            self.session.secret,
            self.session.identifier,
        );

        info!("Sending {} messages to {}", params.count, dest);
        let mut ack = 0;
        let mut timeouts_left = client.max_timeouts;
        while ack < params.count {
            message.set_ack(ack);
            chan.send_to(message.as_bytes(), dest).await?;
            match chan.recv_timeout(Stage::B, client.retry_timeout()).await {
                // Any reply counts as the ack for the message just sent.
                Ok(_) => ack += 1,
                Err(HandshakeError::Timeout { .. }) => {
                    timeouts_left -= 1;
                    if timeouts_left == 0 {
                        return Err(HandshakeError::RetriesExhausted {
                            stage: Stage::B,
                            attempts: client.max_timeouts,
                        });
                    }
                    debug!("No ack for {}, retransmitting ({} timeouts left)", ack, timeouts_left);
                }
                Err(e) => return Err(e),
            }
        }

        let (buf, _) = chan
            .recv_timeout(Stage::B, client.completion_timeout())
            .await?;
        let (_, completion) = decode_message::<StageBCompletion>(Stage::B, &buf)?;
        self.set_port(Stage::B, completion.tcp_port)?;
        self.record(Stage::B, completion.secret);
        Ok(())
    }

    async fn stage_c(&mut self) -> Result<(StreamChannel, StageCReply), HandshakeError> {
        let wait = self.config.client.stream_timeout();
        let addr = self.server();
        info!("Connecting to {}", addr);
        let mut chan = StreamChannel::connect(Stage::C, addr, wait).await?;

        let frame = chan
            .recv_frame(Stage::C, message_len::<StageCReply>(), wait)
            .await?;
        let (_, reply) = decode_message::<StageCReply>(Stage::C, &frame)?;
        self.record(Stage::C, reply.secret);
        Ok((chan, reply))
    }

    async fn stage_d(
        &mut self,
        chan: &mut StreamChannel,
        params: StageCReply,
    ) -> Result<(), HandshakeError> {
        let message = stage_d_request(
            self.session.byte_align,
            params.length,
            self.session.secret,
            self.session.identifier,
            params.fill,
        );
        info!("Sending {} messages of {} bytes", params.count, message.len());
        chan.send_repeated(message, params.count).await?;

        let frame = chan
            .recv_frame(
                Stage::D,
                message_len::<StageDReply>(),
                self.config.client.stream_timeout(),
            )
            .await?;
        let (_, reply) = decode_message::<StageDReply>(Stage::D, &frame)?;
        self.record(Stage::D, reply.secret);
        Ok(())
    }
}
