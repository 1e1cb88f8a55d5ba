//! Packet-loss simulation for exercising the reliability mechanisms.
//!
//! Real networks drop packets.  To test retransmission without depending on
//! actual network conditions, every [`crate::socket::LossySocket`] carries a
//! [`LossModel`] that discards each successfully received datagram with a
//! fixed probability.
//!
//! The model owns its own seeded RNG, so two sockets never share a random
//! stream and a test can pin the seed to make a loss pattern reproducible.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Fault-injection settings for one socket.
///
/// `loss_probability` is clamped to `[0.0, 1.0]`.
#[derive(Debug, Clone, Default)]
pub struct SimulatorConfig {
    /// Probability that any given inbound datagram is silently dropped.
    pub loss_probability: f64,
    /// Seed for the loss RNG (`None` = seeded from the thread RNG).
    pub seed: Option<u64>,
}

impl SimulatorConfig {
    pub fn lossless() -> Self {
        Self::default()
    }

    pub fn with_loss(loss_probability: f64) -> Self {
        Self {
            loss_probability,
            seed: None,
        }
    }
}

/// Per-socket Bernoulli loss process.
#[derive(Debug)]
pub struct LossModel {
    probability: f64,
    rng: StdRng,
    dropped: u64,
    delivered: u64,
}

impl LossModel {
    pub fn new(config: &SimulatorConfig) -> Self {
        let seed = config.seed.unwrap_or_else(|| rand::rng().random());
        let probability = if config.loss_probability.is_nan() {
            0.0
        } else {
            config.loss_probability.clamp(0.0, 1.0)
        };
        Self {
            probability,
            rng: StdRng::seed_from_u64(seed),
            dropped: 0,
            delivered: 0,
        }
    }

    /// Decide the fate of one received datagram: `true` means drop it.
    pub fn should_drop(&mut self) -> bool {
        // random() is in [0, 1): p = 0 never drops, p = 1 always drops.
        let drop = self.probability > 0.0 && self.rng.random::<f64>() < self.probability;
        if drop {
            self.dropped += 1;
        } else {
            self.delivered += 1;
        }
        drop
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }

    /// Number of datagrams discarded so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Number of datagrams let through so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }
}
