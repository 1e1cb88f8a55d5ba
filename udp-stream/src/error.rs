//! Error taxonomy for the transport, handshake and stream layers.

use std::io;

use thiserror::Error;

use crate::segment::SegmentError;

/// Errors surfaced by sockets, negotiators and streams.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The local endpoint could not be bound (port in use, no permission).
    #[error("failed to bind local port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// The peer's hostname did not resolve to any usable address.
    #[error("could not resolve `{host}`")]
    Resolution {
        host: String,
        #[source]
        source: Option<io::Error>,
    },

    /// `send` was called on a socket with no peer configured.
    #[error("socket has no peer")]
    NoPeer,

    /// A datagram could not be decoded, or a segment could not be built.
    #[error(transparent)]
    Segment(#[from] SegmentError),

    /// The send buffer cannot take the whole write.
    #[error("send buffer full ({buffered} of {capacity} bytes queued)")]
    BufferFull { buffered: usize, capacity: usize },

    /// The peer never answered the handshake.
    #[error("handshake timed out after {attempts} attempt(s)")]
    HandshakeTimeout { attempts: u32 },

    /// The connection has been torn down (or is being torn down locally).
    #[error("connection closed")]
    ConnectionClosed,

    /// Teardown gave up before the peer confirmed it.
    #[error("connection timed out while closing")]
    CloseTimeout,

    /// Any other socket-level failure.
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, StreamError>;
