//! Receive-side buffer and cumulative-ACK state.
//!
//! [`RecvBuffer`] implements the receiver side of go-back-N:
//!
//! - Only **in-order** segments are accepted (`seq == rcv_nxt`), and only if
//!   the whole payload fits in the free buffer space.
//! - Out-of-order, duplicate or oversized segments are **discarded**; the
//!   unchanged cumulative ACK tells the peer where to resume.
//! - The advertised window is the free buffer capacity, so it shrinks by
//!   exactly the number of bytes accepted and grows back when the
//!   application drains the buffer.
//!
//! This module only manages state; all socket I/O is the caller's
//! responsibility.

use std::collections::VecDeque;

/// Outcome of offering a segment to the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Payload appended; `rcv_nxt` advanced by its length.
    Accepted,
    /// Sequence number is not the next expected one.
    OutOfOrder,
    /// In order, but larger than the free buffer space.
    NoRoom,
}

/// Receive-side state for one stream.
#[derive(Debug)]
pub struct RecvBuffer {
    /// Next in-order sequence number expected from the peer (`self_ack_number`).
    rcv_nxt: u32,
    buffer: VecDeque<u8>,
    capacity: usize,
}

impl RecvBuffer {
    /// `rcv_nxt` is the first sequence number expected from the peer; after
    /// the handshake this is `peer_isn + 1`.
    pub fn new(rcv_nxt: u32, capacity: usize) -> Self {
        Self {
            rcv_nxt,
            buffer: VecDeque::with_capacity(capacity.min(1 << 16)),
            capacity,
        }
    }

    /// Offer an inbound payload.
    pub fn on_segment(&mut self, seq: u32, payload: &[u8]) -> Delivery {
        if seq != self.rcv_nxt {
            return Delivery::OutOfOrder;
        }
        if payload.len() > self.free() {
            return Delivery::NoRoom;
        }
        self.buffer.extend(payload);
        self.rcv_nxt = self.rcv_nxt.wrapping_add(payload.len() as u32);
        Delivery::Accepted
    }

    /// Consume the peer's EXIT, which occupies one sequence number.
    ///
    /// Returns `true` when the EXIT was in order.  A repeated EXIT (one
    /// behind `rcv_nxt`) or an early one leaves the state unchanged.
    pub fn on_exit(&mut self, exit_seq: u32) -> bool {
        if exit_seq == self.rcv_nxt {
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            true
        } else {
            false
        }
    }

    /// Cumulative ACK number for outbound segments.
    pub fn ack_number(&self) -> u32 {
        self.rcv_nxt
    }

    /// Advertised receive window: free buffer space, saturated to the wire field.
    pub fn window(&self) -> u32 {
        u32::try_from(self.free()).unwrap_or(u32::MAX)
    }

    pub fn free(&self) -> usize {
        self.capacity.saturating_sub(self.buffer.len())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Remove and return everything buffered.
    pub fn drain(&mut self) -> Vec<u8> {
        self.buffer.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state() {
        let r = RecvBuffer::new(42, 100);
        assert_eq!(r.ack_number(), 42);
        assert_eq!(r.window(), 100);
        assert!(r.is_empty());
    }

    #[test]
    fn in_order_segment_accepted() {
        let mut r = RecvBuffer::new(100, 1000);
        assert_eq!(r.on_segment(100, b"hello"), Delivery::Accepted);
        assert_eq!(r.ack_number(), 105);
        assert_eq!(r.len(), 5);
    }

    #[test]
    fn window_and_ack_move_by_exactly_n() {
        let mut r = RecvBuffer::new(7, 64_000);
        let (ack0, wnd0) = (r.ack_number(), r.window());
        for n in [1usize, 17, 1006, 3] {
            let before = (r.ack_number(), r.window());
            assert_eq!(r.on_segment(r.ack_number(), &vec![0u8; n]), Delivery::Accepted);
            assert_eq!(r.ack_number(), before.0 + n as u32);
            assert_eq!(r.window(), before.1 - n as u32);
        }
        assert_eq!(r.ack_number() - ack0, wnd0 - r.window());
    }

    #[test]
    fn out_of_order_segment_discarded() {
        let mut r = RecvBuffer::new(100, 1000);
        assert_eq!(r.on_segment(110, b"future"), Delivery::OutOfOrder);
        assert_eq!(r.ack_number(), 100);
        assert!(r.is_empty());
    }

    #[test]
    fn duplicate_segment_discarded() {
        let mut r = RecvBuffer::new(100, 1000);
        r.on_segment(100, b"hello");
        assert_eq!(r.on_segment(100, b"hello"), Delivery::OutOfOrder);
        assert_eq!(r.len(), 5);
    }

    #[test]
    fn segment_larger_than_free_space_rejected_whole() {
        let mut r = RecvBuffer::new(0, 8);
        assert_eq!(r.on_segment(0, b"abcdef"), Delivery::Accepted);
        assert_eq!(r.on_segment(6, b"ghi"), Delivery::NoRoom);
        assert_eq!(r.ack_number(), 6);
        assert_eq!(r.window(), 2);
        assert_eq!(r.on_segment(6, b"gh"), Delivery::Accepted);
        assert_eq!(r.window(), 0);
    }

    #[test]
    fn drain_reopens_window() {
        let mut r = RecvBuffer::new(0, 10);
        r.on_segment(0, b"hello world"[..10].as_ref());
        assert_eq!(r.window(), 0);
        assert_eq!(r.drain(), b"hello worl");
        assert_eq!(r.window(), 10);
        assert!(r.drain().is_empty());
    }

    #[test]
    fn exit_consumes_one_sequence_number() {
        let mut r = RecvBuffer::new(50, 10);
        assert!(!r.on_exit(51)); // early
        assert!(r.on_exit(50));
        assert_eq!(r.ack_number(), 51);
        assert!(!r.on_exit(50)); // repeated
        assert_eq!(r.ack_number(), 51);
    }

    #[test]
    fn seq_wrap_around() {
        let start = u32::MAX - 2;
        let mut r = RecvBuffer::new(start, 100);
        assert_eq!(r.on_segment(start, b"abcde"), Delivery::Accepted);
        assert_eq!(r.ack_number(), start.wrapping_add(5));
    }
}
