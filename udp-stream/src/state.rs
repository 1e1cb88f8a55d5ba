//! Connection finite-state machine (FSM) types.
//!
//! The protocol has a deliberately small lifecycle:
//!
//! ```text
//!  HANDSHAKING ──SYN / SYN+ACK──▶ ESTABLISHED
//!                                      │
//!                   local close or     │
//!                   peer EXIT          ▼
//!  CLOSED ◀──EXIT exchanged or──── CLOSING
//!            retry budget spent
//! ```
//!
//! HANDSHAKING belongs to the handshake routine, before any stream exists.
//! Every constructed stream begins at ESTABLISHED.
//!
//! The current state is shared between the application thread and the two
//! worker tasks, so it is stored as an atomic byte; [`ConnectionState`]
//! converts to and from that representation.

use std::fmt;

/// All possible states of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ConnectionState {
    /// SYN / SYN+ACK exchange in progress.
    ///
    /// Only held while `Stream::connect` or `Stream::accept` is running. A
    /// `Stream` is built after the handshake completes and starts in
    /// [`Established`](Self::Established), so `Stream::state` never returns
    /// this variant.
    #[default]
    Handshaking = 0,
    /// Data may flow in both directions.
    Established = 1,
    /// One side asked to close; remaining data drains, then EXIT is exchanged.
    Closing = 2,
    /// Terminal.
    Closed = 3,
}

impl ConnectionState {
    /// Decode the atomic representation.  Unknown values map to `Closed`.
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Handshaking,
            1 => Self::Established,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// `true` once the stream will accept no further local writes.
    pub fn is_finished(self) -> bool {
        self == Self::Closed
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Handshaking => "HANDSHAKING",
            Self::Established => "ESTABLISHED",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}
