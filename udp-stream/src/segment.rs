//! Wire-format definitions for protocol segments.
//!
//! Every datagram exchanged between peers is a [`Segment`].  This module is
//! responsible for:
//! - Defining the on-wire binary layout (header fields, flags, payload).
//! - Serialising a [`Segment`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Segment`], rejecting input
//!   too short to hold a header.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Acknowledgment Number                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          Window Size                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |S|A|E|        Reserved         |             Port              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           Reserved            |          Payload ...          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_SIZE`] = 18 bytes.
//! seq(4) + ack(4) + window(4) + flags(2) + port(2) + reserved(2)
//!
//! The payload length is not carried in the header; it is whatever remains
//! of the datagram after the header.

use std::fmt;

use thiserror::Error;

/// Bit-flag constants for the `flags` header field.
pub mod flags {
    /// Synchronise sequence numbers (handshake).
    pub const SYN: u16 = 1 << 15;
    /// Acknowledgement field is valid.
    pub const ACK: u16 = 1 << 14;
    /// Sender is closing its half of the stream.
    pub const EXIT: u16 = 1 << 13;

    /// Every bit the protocol assigns a meaning to.
    pub const DEFINED: u16 = SYN | ACK | EXIT;
}

/// Largest datagram either side will send or accept without truncation.
pub const MAX_SEGMENT_SIZE: usize = 1024;

/// Byte length of the fixed-size header on the wire.
pub const HEADER_SIZE: usize = 18;

/// Largest payload that fits in one segment.
pub const MAX_PAYLOAD_SIZE: usize = MAX_SEGMENT_SIZE - HEADER_SIZE;

// Byte offsets of each field within the serialised header.
const OFF_SEQ: usize = 0;
const OFF_ACK: usize = 4;
const OFF_WINDOW: usize = 8;
const OFF_FLAGS: usize = 12;
const OFF_PORT: usize = 14;

/// Errors raised while building or parsing a segment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SegmentError {
    /// Datagram shorter than the fixed header.
    #[error("malformed segment: {len} bytes is shorter than the {HEADER_SIZE}-byte header")]
    MalformedSegment { len: usize },
    /// Payload exceeds [`MAX_PAYLOAD_SIZE`].
    #[error("payload of {len} bytes exceeds the maximum of {max}")]
    PayloadTooLarge { len: usize, max: usize },
}

/// A complete protocol datagram: header fields + payload bytes.
///
/// Fields are in host byte order; [`Segment::encode`] converts to big-endian
/// on the wire and [`Segment::decode`] converts back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Segment {
    /// Sequence number of the first payload byte (or of the SYN / EXIT).
    pub sequence: u32,
    /// Next sequence number expected from the peer; valid with [`flags::ACK`].
    pub ack: u32,
    /// Free receive-buffer capacity advertised by the sender, in bytes.
    pub window: u32,
    /// Auxiliary port field, zero unless a caller has a use for it.
    pub port: u16,
    flags: u16,
    payload: Vec<u8>,
}

impl Segment {
    /// Build a header-only segment.
    pub fn new(sequence: u32, ack: u32, window: u32) -> Self {
        Self {
            sequence,
            ack,
            window,
            ..Self::default()
        }
    }

    /// Builder-style variant of [`Segment::set_payload`].
    pub fn with_payload(mut self, payload: Vec<u8>) -> Result<Self, SegmentError> {
        self.set_payload(payload)?;
        Ok(self)
    }

    /// Builder-style variant of [`Segment::set_flag`].
    pub fn with_flag(mut self, flag: u16) -> Self {
        self.set_flag(flag);
        self
    }

    /// Replace the payload.
    ///
    /// Payloads longer than [`MAX_PAYLOAD_SIZE`] are a caller error and are
    /// rejected without touching the current payload.
    pub fn set_payload(&mut self, payload: Vec<u8>) -> Result<(), SegmentError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(SegmentError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        self.payload = payload;
        Ok(())
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Raw flag bits (reserved bits are always zero).
    pub fn flags(&self) -> u16 {
        self.flags
    }

    /// `true` when every bit of `flag` is set.
    pub fn has_flag(&self, flag: u16) -> bool {
        let flag = flag & flags::DEFINED;
        flag != 0 && self.flags & flag == flag
    }

    /// Set `flag` without disturbing the other bits.
    pub fn set_flag(&mut self, flag: u16) {
        self.flags |= flag & flags::DEFINED;
    }

    /// Clear `flag` without disturbing the other bits.
    pub fn clear_flag(&mut self, flag: u16) {
        self.flags &= !flag;
    }

    pub fn is_syn(&self) -> bool {
        self.has_flag(flags::SYN)
    }

    pub fn is_ack(&self) -> bool {
        self.has_flag(flags::ACK)
    }

    pub fn is_exit(&self) -> bool {
        self.has_flag(flags::EXIT)
    }

    /// Serialise this segment into a newly allocated byte vector of exactly
    /// `HEADER_SIZE + payload.len()` bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_SIZE + self.payload.len()];

        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 4].copy_from_slice(&self.ack.to_be_bytes());
        buf[OFF_WINDOW..OFF_WINDOW + 4].copy_from_slice(&self.window.to_be_bytes());
        buf[OFF_FLAGS..OFF_FLAGS + 2].copy_from_slice(&self.flags.to_be_bytes());
        buf[OFF_PORT..OFF_PORT + 2].copy_from_slice(&self.port.to_be_bytes());
        // Reserved trailer stays zero.

        buf[HEADER_SIZE..].copy_from_slice(&self.payload);
        buf
    }

    /// Parse a [`Segment`] from a raw datagram.
    ///
    /// Returns [`SegmentError::MalformedSegment`] if `buf` is shorter than
    /// [`HEADER_SIZE`].  A payload longer than [`MAX_PAYLOAD_SIZE`] cannot be
    /// produced by a conforming sender; it is truncated rather than rejected.
    pub fn decode(buf: &[u8]) -> Result<Self, SegmentError> {
        let Some((header, payload)) = buf.split_first_chunk::<HEADER_SIZE>() else {
            return Err(SegmentError::MalformedSegment { len: buf.len() });
        };

        let payload = &payload[..payload.len().min(MAX_PAYLOAD_SIZE)];

        Ok(Segment {
            sequence: read_u32(header, OFF_SEQ),
            ack: read_u32(header, OFF_ACK),
            window: read_u32(header, OFF_WINDOW),
            flags: read_u16(header, OFF_FLAGS) & flags::DEFINED,
            port: read_u16(header, OFF_PORT),
            payload: payload.to_vec(),
        })
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "seq={} ack={} wnd={} len={} flags=[",
            self.sequence,
            self.ack,
            self.window,
            self.payload.len()
        )?;
        let names = [(flags::SYN, "SYN"), (flags::ACK, "ACK"), (flags::EXIT, "EXIT")];
        let mut first = true;
        for (bit, name) in names {
            if self.has_flag(bit) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        f.write_str("]")
    }
}

fn read_u32(header: &[u8; HEADER_SIZE], at: usize) -> u32 {
    u32::from_be_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]])
}

fn read_u16(header: &[u8; HEADER_SIZE], at: usize) -> u16 {
    u16::from_be_bytes([header[at], header[at + 1]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_segment(seq: u32, ack: u32, flag_bits: u16, window: u32, payload: &[u8]) -> Segment {
        let mut seg = Segment::new(seq, ack, window)
            .with_payload(payload.to_vec())
            .unwrap();
        seg.set_flag(flag_bits);
        seg
    }

    #[test]
    fn encode_decode_roundtrip() {
        let seg = make_segment(42, 7, flags::SYN | flags::ACK, 64_000, b"hello");
        let decoded = Segment::decode(&seg.encode()).unwrap();
        assert_eq!(decoded, seg);
    }

    #[test]
    fn max_payload_roundtrip() {
        let seg = make_segment(1, 2, flags::ACK, 3, &[0xab; MAX_PAYLOAD_SIZE]);
        let bytes = seg.encode();
        assert_eq!(bytes.len(), MAX_SEGMENT_SIZE);
        assert_eq!(Segment::decode(&bytes).unwrap(), seg);
    }

    #[test]
    fn header_size_constants_are_consistent() {
        // seq(4) + ack(4) + window(4) + flags(2) + port(2) + reserved(2) = 18
        assert_eq!(HEADER_SIZE, 18);
        assert_eq!(MAX_PAYLOAD_SIZE, 1006);
    }

    #[test]
    fn encoded_length_equals_header_plus_payload() {
        let payload = b"exactly twelve!";
        let bytes = make_segment(0, 0, 0, 0, payload).encode();
        assert_eq!(bytes.len(), HEADER_SIZE + payload.len());
    }

    #[test]
    fn decode_empty_buffer_returns_error() {
        assert_eq!(
            Segment::decode(&[]),
            Err(SegmentError::MalformedSegment { len: 0 })
        );
    }

    #[test]
    fn decode_short_header_returns_error() {
        assert_eq!(
            Segment::decode(&[0u8; HEADER_SIZE - 1]),
            Err(SegmentError::MalformedSegment {
                len: HEADER_SIZE - 1
            })
        );
    }

    #[test]
    fn decode_header_only_gives_empty_payload() {
        let decoded = Segment::decode(&[0u8; HEADER_SIZE]).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn decode_oversized_datagram_truncates_payload() {
        let mut bytes = make_segment(9, 0, flags::ACK, 0, b"").encode();
        bytes.extend(std::iter::repeat(0x5a).take(MAX_PAYLOAD_SIZE + 40));
        let decoded = Segment::decode(&bytes).unwrap();
        assert_eq!(decoded.len(), MAX_PAYLOAD_SIZE);
        assert_eq!(decoded.sequence, 9);
    }

    #[test]
    fn oversized_payload_is_rejected_on_construction() {
        let err = Segment::new(0, 0, 0)
            .with_payload(vec![0; MAX_PAYLOAD_SIZE + 1])
            .unwrap_err();
        assert_eq!(
            err,
            SegmentError::PayloadTooLarge {
                len: MAX_PAYLOAD_SIZE + 1,
                max: MAX_PAYLOAD_SIZE
            }
        );
    }

    #[test]
    fn fields_are_big_endian_on_wire() {
        let bytes = make_segment(0x0102_0304, 0x0506_0708, 0, 0x090a_0b0c, b"").encode();
        assert_eq!(&bytes[OFF_SEQ..OFF_SEQ + 4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[OFF_ACK..OFF_ACK + 4], &[0x05, 0x06, 0x07, 0x08]);
        assert_eq!(&bytes[OFF_WINDOW..OFF_WINDOW + 4], &[0x09, 0x0a, 0x0b, 0x0c]);
    }

    #[test]
    fn flag_bits_sit_at_the_top_of_the_field() {
        let bytes = make_segment(0, 0, flags::SYN, 0, b"").encode();
        assert_eq!(&bytes[OFF_FLAGS..OFF_FLAGS + 2], &[0x80, 0x00]);
        let bytes = make_segment(0, 0, flags::ACK | flags::EXIT, 0, b"").encode();
        assert_eq!(&bytes[OFF_FLAGS..OFF_FLAGS + 2], &[0x60, 0x00]);
    }

    #[test]
    fn setting_one_flag_leaves_others_alone() {
        for flag in [flags::SYN, flags::ACK, flags::EXIT] {
            for others in [0, flags::SYN, flags::ACK, flags::EXIT, flags::DEFINED] {
                let mut seg = Segment::new(0, 0, 0);
                seg.set_flag(others);
                seg.set_flag(flag);
                assert!(seg.has_flag(flag));
                assert_eq!(seg.flags() & !flag, others & !flag);

                seg.clear_flag(flag);
                assert!(!seg.has_flag(flag));
                assert_eq!(seg.flags(), others & !flag);
            }
        }
    }

    #[test]
    fn reserved_flag_bits_never_round_trip() {
        let mut seg = Segment::new(0, 0, 0);
        seg.set_flag(0x00ff);
        assert_eq!(seg.flags(), 0);

        let mut bytes = seg.encode();
        bytes[OFF_FLAGS + 1] = 0xff;
        let decoded = Segment::decode(&bytes).unwrap();
        assert_eq!(decoded.flags(), 0);
    }

    #[test]
    fn display_lists_flags() {
        let seg = make_segment(1, 2, flags::SYN | flags::ACK, 3, b"ab");
        assert_eq!(seg.to_string(), "seq=1 ack=2 wnd=3 len=2 flags=[SYN|ACK]");
    }
}
