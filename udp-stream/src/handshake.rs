//! Connection establishment.
//!
//! One routine, [`open`], performs the handshake for either role and returns
//! the stream's own socket plus the negotiated sequence numbers:
//!
//! ```text
//!  initiator                               responder (acceptor port)
//!      │ ── SYN seq=ISN_i ───────────────────────▶ │
//!      │                                           │ bind ephemeral port
//!      │ ◀── SYN+ACK seq=ISN_r ack=ISN_i+1 ─────── │ (from ephemeral port)
//!      │ peer := SYN+ACK source                    │
//!      │ ── ACK ack=ISN_r+1 (first worker send) ──▶│
//! ```
//!
//! Both sides are ESTABLISHED as soon as they have sent or derived
//! `send_base = own ISN + 1` and `ack_number = peer ISN + 1`.  The initiator
//! retries SYN on a timer up to a fixed budget; a lost SYN+ACK is covered by
//! the responder's stream, which repeats it until the peer is heard from.

use std::net::SocketAddr;

use rand::Rng;
use tokio::time::Instant;

use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::negotiator::{Acceptor, Connector};
use crate::segment::{flags, Segment};
use crate::socket::{resolve, unspecified_like, LossySocket};

/// Which side of the handshake a stream played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Active open: sent the SYN.
    Initiator,
    /// Passive open: answered with SYN+ACK.
    Responder,
}

/// Sequence numbers agreed by the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub role: Role,
    pub local_isn: u32,
    pub peer_isn: u32,
    /// Receive window the peer advertised during the handshake.
    pub peer_window: u32,
}

impl Negotiated {
    /// First sequence number of our data (`sender_base_sequence`).
    pub fn send_base(&self) -> u32 {
        self.local_isn.wrapping_add(1)
    }

    /// First sequence number expected from the peer (`self_ack_number`).
    pub fn ack_number(&self) -> u32 {
        self.peer_isn.wrapping_add(1)
    }

    /// The responder's SYN+ACK, rebuilt for retransmission.
    pub fn syn_ack(&self, window: u32) -> Segment {
        Segment::new(self.local_isn, self.ack_number(), window)
            .with_flag(flags::SYN)
            .with_flag(flags::ACK)
    }
}

/// Where the handshake starts from.
#[derive(Debug, Clone, Copy)]
pub enum Rendezvous<'a> {
    Connect(&'a Connector),
    Accept(&'a Acceptor),
}

/// Run the handshake for the role implied by `rendezvous`.
pub async fn open(
    rendezvous: Rendezvous<'_>,
    config: &StreamConfig,
) -> Result<(LossySocket, Negotiated)> {
    let isn = config
        .initial_sequence
        .unwrap_or_else(|| rand::rng().random());
    match rendezvous {
        Rendezvous::Connect(connector) => initiate(connector, isn, config).await,
        Rendezvous::Accept(acceptor) => respond(acceptor, isn, config).await,
    }
}

async fn initiate(
    connector: &Connector,
    isn: u32,
    config: &StreamConfig,
) -> Result<(LossySocket, Negotiated)> {
    let target = resolve(connector.host(), connector.port(), true).await?;
    let mut socket = LossySocket::bind_addr(
        unspecified_like(&target),
        config.max_segment_size(),
        &config.simulator(),
    )
    .await?;
    socket.set_peer_addr(target);

    let timers = &config.timers;
    let syn = Segment::new(isn, 0, config.advertised_capacity()).with_flag(flags::SYN);
    let wire = syn.encode();

    for attempt in 1..=timers.max_handshake_attempts {
        socket.send(&wire).await?;
        log::debug!("[handshake] → SYN {syn} (attempt {attempt})");

        let deadline = Instant::now() + timers.handshake_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let bytes = socket.recv(Some(remaining)).await?;
            if bytes.is_empty() {
                continue;
            }
            let seg = match Segment::decode(&bytes) {
                Ok(seg) => seg,
                Err(e) => {
                    log::warn!("[handshake] dropping {e}");
                    continue;
                }
            };
            if !(seg.is_syn() && seg.is_ack() && seg.ack == isn.wrapping_add(1)) {
                log::debug!("[handshake] ignoring {seg}");
                continue;
            }

            // Responders answer from a fresh port; talk to that one from now on.
            if let Some(from) = socket.last_received_from() {
                socket.set_peer_addr(from);
            }
            let negotiated = Negotiated {
                role: Role::Initiator,
                local_isn: isn,
                peer_isn: seg.sequence,
                peer_window: seg.window,
            };
            log::info!(
                "[handshake] ← SYN+ACK {seg}; established with {}",
                socket.peer().map_or_else(|| "?".to_owned(), |p| p.to_string())
            );
            return Ok((socket, negotiated));
        }
    }

    log::warn!(
        "[handshake] no SYN+ACK from {target} after {} attempt(s)",
        timers.max_handshake_attempts
    );
    Err(StreamError::HandshakeTimeout {
        attempts: timers.max_handshake_attempts,
    })
}

async fn respond(
    acceptor: &Acceptor,
    isn: u32,
    config: &StreamConfig,
) -> Result<(LossySocket, Negotiated)> {
    let rendezvous = acceptor.socket();
    loop {
        let bytes = rendezvous.recv(None).await?;
        if bytes.is_empty() {
            continue;
        }
        let syn = match Segment::decode(&bytes) {
            Ok(seg) => seg,
            Err(e) => {
                log::warn!("[handshake] dropping {e}");
                continue;
            }
        };
        if !syn.is_syn() || syn.is_ack() {
            continue;
        }
        let Some(client) = rendezvous.last_received_from() else {
            continue;
        };
        if !acceptor.claim(client, syn.sequence) {
            log::debug!("[handshake] repeated SYN from {client}; ignoring");
            continue;
        }
        log::debug!("[handshake] ← SYN {syn} from {client}");

        let mut socket = LossySocket::bind_addr(
            ephemeral_beside(rendezvous.local_addr()),
            config.max_segment_size(),
            &config.simulator(),
        )
        .await?;
        socket.set_peer_addr(client);

        let negotiated = Negotiated {
            role: Role::Responder,
            local_isn: isn,
            peer_isn: syn.sequence,
            peer_window: syn.window,
        };
        let syn_ack = negotiated.syn_ack(config.advertised_capacity());
        socket.send(&syn_ack.encode()).await?;
        log::info!(
            "[handshake] → SYN+ACK {syn_ack} from {}; established with {client}",
            socket.local_addr()
        );
        return Ok((socket, negotiated));
    }
}

/// Port 0 on the same interface as the rendezvous socket.
fn ephemeral_beside(rendezvous: SocketAddr) -> SocketAddr {
    SocketAddr::new(rendezvous.ip(), 0)
}
