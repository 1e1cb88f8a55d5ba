//! Per-stream tuning knobs.

use std::time::Duration;

use crate::segment::{MAX_PAYLOAD_SIZE, MAX_SEGMENT_SIZE};
use crate::simulator::SimulatorConfig;
use crate::timer::TimerConfig;

/// Capacity of each of the send and receive buffers, in bytes.
pub const BUFF_CAPACITY: usize = 64_000;

/// Settings for one stream, shared by both ends of the handshake.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Probability that the stream's socket discards an inbound datagram.
    pub loss_probability: f64,
    /// Fixed seed for the loss RNG.
    pub loss_seed: Option<u64>,
    /// Local cap on unacknowledged bytes, independent of the peer's window.
    pub window_limit: usize,
    /// Capacity of the send buffer and of the receive buffer.
    pub buffer_capacity: usize,
    /// Largest payload put in one segment (at most [`MAX_PAYLOAD_SIZE`]).
    pub max_payload: usize,
    /// Fixed initial sequence number; random when `None`.
    pub initial_sequence: Option<u32>,
    pub timers: TimerConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            loss_probability: 0.0,
            loss_seed: None,
            window_limit: BUFF_CAPACITY,
            buffer_capacity: BUFF_CAPACITY,
            max_payload: MAX_PAYLOAD_SIZE,
            initial_sequence: None,
            timers: TimerConfig::default(),
        }
    }
}

impl StreamConfig {
    pub fn with_loss(mut self, probability: f64) -> Self {
        self.loss_probability = probability;
        self
    }

    pub fn with_loss_seed(mut self, seed: u64) -> Self {
        self.loss_seed = Some(seed);
        self
    }

    pub fn with_window_limit(mut self, bytes: usize) -> Self {
        self.window_limit = bytes;
        self
    }

    pub fn with_buffer_capacity(mut self, bytes: usize) -> Self {
        self.buffer_capacity = bytes;
        self
    }

    pub fn with_max_payload(mut self, bytes: usize) -> Self {
        self.max_payload = bytes;
        self
    }

    pub fn with_initial_sequence(mut self, isn: u32) -> Self {
        self.initial_sequence = Some(isn);
        self
    }

    pub fn with_timers(mut self, timers: TimerConfig) -> Self {
        self.timers = timers;
        self
    }

    /// Shorthand for [`TimerConfig::with_retransmit_timeout`].
    pub fn with_retransmit_timeout(self, rto: Duration) -> Self {
        self.with_timers(TimerConfig::with_retransmit_timeout(rto))
    }

    /// Payload size actually used: clamped to `1..=MAX_PAYLOAD_SIZE`.
    pub fn effective_max_payload(&self) -> usize {
        self.max_payload.clamp(1, MAX_PAYLOAD_SIZE)
    }

    /// Receive-window value that fits the 32-bit wire field.
    pub fn advertised_capacity(&self) -> u32 {
        u32::try_from(self.buffer_capacity).unwrap_or(u32::MAX)
    }

    /// Loss settings for the stream's data-phase socket.
    pub fn simulator(&self) -> SimulatorConfig {
        SimulatorConfig {
            loss_probability: self.loss_probability,
            seed: self.loss_seed,
        }
    }

    pub fn max_segment_size(&self) -> usize {
        MAX_SEGMENT_SIZE
    }
}
