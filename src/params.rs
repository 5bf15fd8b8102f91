//! Server-side session parameters and the Stage-B ack strategy.
//!
//! Both are traits so a test can pin every random draw and force either
//! branch of the lossy-channel simulation.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{PortRange, ServerConfig};

/// Largest Stage-B payload length the server hands out.
pub const MAX_STAGE_B_LENGTH: u32 = 128;

/// Parameters issued in the Stage-A reply, before the port is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageAParams {
    pub count: u32,
    pub length: u32,
    pub secret: u32,
}

/// Parameters issued in the Stage-C reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageCParams {
    pub count: u32,
    pub length: u32,
    pub secret: u32,
    pub fill: u8,
}

/// Source of every value the server makes up during a session.
pub trait ParamSource: Send {
    fn stage_a(&mut self) -> StageAParams;

    /// Candidate session port; `0` asks the OS to choose.
    fn port(&mut self, range: PortRange) -> u16;

    /// Secret sent with the Stage-B completion.
    fn stage_b_secret(&mut self) -> u32;

    fn stage_c(&mut self) -> StageCParams;

    fn final_secret(&mut self) -> u32;
}

/// Decides whether a valid, current Stage-B message gets acknowledged.
pub trait AckPolicy: Send {
    fn should_ack(&mut self, ack: u32) -> bool;
}

/// [`ParamSource`] drawing from an RNG within the protocol's ranges.
#[derive(Debug, Clone)]
pub struct RngParams<R> {
    rng: R,
}

impl<R: Rng> RngParams<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }

    fn secret(&mut self) -> u32 {
        self.rng.gen_range(1..=10_000)
    }
}

impl RngParams<StdRng> {
    pub fn seeded(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }
}

impl<R: Rng + Send> ParamSource for RngParams<R> {
    fn stage_a(&mut self) -> StageAParams {
        StageAParams {
            count: self.rng.gen_range(8..=32),
            length: self.rng.gen_range(32..=MAX_STAGE_B_LENGTH),
            secret: self.secret(),
        }
    }

    fn port(&mut self, range: PortRange) -> u16 {
        self.rng.gen_range(range.low..=range.high)
    }

    fn stage_b_secret(&mut self) -> u32 {
        self.secret()
    }

    fn stage_c(&mut self) -> StageCParams {
        StageCParams {
            count: self.rng.gen_range(8..=32),
            length: self.rng.gen_range(32..=128),
            secret: self.secret(),
            fill: self.rng.gen_range(b'a'..=b'z'),
        }
    }

    fn final_secret(&mut self) -> u32 {
        self.secret()
    }
}

/// Acknowledge with a fixed probability.
#[derive(Debug, Clone)]
pub struct CoinFlip<R> {
    rng: R,
    probability: f64,
}

impl<R: Rng> CoinFlip<R> {
    /// `probability` is clamped to `[0, 1]`.
    pub fn new(rng: R, probability: f64) -> Self {
        Self {
            rng,
            probability: probability.clamp(0.0, 1.0),
        }
    }
}

impl<R: Rng + Send> AckPolicy for CoinFlip<R> {
    fn should_ack(&mut self, _ack: u32) -> bool {
        self.rng.gen_bool(self.probability)
    }
}

/// Acknowledge every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAck;

impl AckPolicy for AlwaysAck {
    fn should_ack(&mut self, _ack: u32) -> bool {
        true
    }
}

/// Never acknowledge; the client exhausts its retry budget.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverAck;

impl AckPolicy for NeverAck {
    fn should_ack(&mut self, _ack: u32) -> bool {
        false
    }
}

impl<F> AckPolicy for F
where
    F: FnMut(u32) -> bool + Send,
{
    fn should_ack(&mut self, ack: u32) -> bool {
        self(ack)
    }
}

/// Per-session randomness handed to a spawned session task.
pub struct SessionSources {
    pub params: Box<dyn ParamSource>,
    pub acks: Box<dyn AckPolicy>,
}

impl fmt::Debug for SessionSources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSources").finish_non_exhaustive()
    }
}

/// Builds fresh [`SessionSources`] for every accepted session.
pub type SourceFactory = Arc<dyn Fn() -> SessionSources + Send + Sync>;

/// Factory matching the server configuration.
///
/// With a seed, session `n` draws from `seed + n`, so a whole run can be
/// replayed; without one every session is seeded from OS entropy.
pub fn default_factory(config: &ServerConfig) -> SourceFactory {
    let seed = config.seed;
    let probability = config.ack_probability;
    let counter = AtomicU64::new(0);
    Arc::new(move || {
        let mut rng = match seed {
            Some(seed) => {
                let n = counter.fetch_add(1, Ordering::Relaxed);
                StdRng::seed_from_u64(seed.wrapping_add(n))
            }
            None => StdRng::from_entropy(),
        };
        let ack_rng = StdRng::seed_from_u64(rng.gen());
        SessionSources {
            params: Box::new(RngParams::new(rng)),
            acks: Box::new(CoinFlip::new(ack_rng, probability)),
        }
    })
}

/// Factory that always hands out the given fixed sources.
pub fn fixed_factory<P, A>(params: P, acks: A) -> SourceFactory
where
    P: ParamSource + Clone + Sync + 'static,
    A: AckPolicy + Clone + Sync + 'static,
{
    Arc::new(move || SessionSources {
        params: Box::new(params.clone()),
        acks: Box::new(acks.clone()),
    })
}
