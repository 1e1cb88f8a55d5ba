//! `udp-stream`: a reliable, ordered, flow-controlled byte stream over UDP.
//!
//! # Architecture
//!
//! ```text
//!  ┌────────────┐ connect ┌──────────────┐  accept  ┌────────────┐
//!  │ Connector  │────────▶│  handshake   │◀─────────│  Acceptor  │
//!  └────────────┘         └──────┬───────┘          └────────────┘
//!                                │ (LossySocket, Negotiated)
//!                         ┌──────▼───────┐
//!                         │    Stream    │  send / recv / close
//!                         │ sender task  │──▶ SendBuffer (go-back-N)
//!                         │ receiver task│──▶ RecvBuffer (cumulative ACK)
//!                         └──────┬───────┘
//!                                │ Segment::encode / decode
//!                         ┌──────▼───────┐
//!                         │ LossySocket  │  (tokio UdpSocket + LossModel)
//!                         └──────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`segment`]   : wire format (encode / decode, flags)
//! - [`socket`]    : async UDP transport with a default peer and simulated loss
//! - [`simulator`] : seeded random loss model
//! - [`negotiator`]: [`Connector`] / [`Acceptor`] endpoints
//! - [`handshake`] : SYN, SYN+ACK exchange for both roles
//! - [`stream`]    : the established connection and its two workers
//! - [`sender`]    : outbound buffer, window and retransmission state
//! - [`receiver`]  : inbound buffer and cumulative ACK state
//! - [`timer`]     : retransmit timer and timing knobs
//! - [`state`]     : connection state machine
//! - [`config`]    : per-stream configuration
//! - [`transfer`]  : REQUEST / DENY / DATA file transfer on top of a stream
//! - [`error`]     : error types

pub mod config;
pub mod error;
pub mod handshake;
pub mod negotiator;
pub mod receiver;
pub mod segment;
pub mod sender;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod stream;
pub mod timer;
pub mod transfer;

pub use config::StreamConfig;
pub use error::{Result, StreamError};
pub use negotiator::{Acceptor, Connector};
pub use segment::Segment;
pub use state::ConnectionState;
pub use stream::{Stream, StreamStats};
pub use timer::TimerConfig;
