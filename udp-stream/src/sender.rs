//! Send-side buffer and sliding-window state.
//!
//! [`SendBuffer`] holds every byte the application has queued but the peer
//! has not yet acknowledged.  The front of the buffer always corresponds to
//! sequence number `base`.
//!
//! # Protocol contract
//!
//! - At most `min(peer window, local window limit)` bytes are in flight.
//! - ACKs are **cumulative**: `ack = K` means the peer holds every byte
//!   before sequence number `K`.  Acknowledged bytes are dropped from the
//!   front of the buffer.
//! - On timeout the whole unacknowledged window is sent again from `base`
//!   (go back N): `offset` is reset to zero.
//! - Sequence numbers are u32 and wrap around using modular arithmetic.
//!
//! This module only manages state; all socket I/O is the caller's
//! responsibility.  The stream keeps it behind the send-buffer mutex.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::error::StreamError;
use crate::timer::RetransmitTimer;

/// Send-side state for one stream.
///
/// # Sequence-number layout
///
/// ```text
///  base            base+offset        base+len
///    │                  │                 │
///  ──┼──────────────────┼─────────────────┼──▶ seq space
///    │ <── in flight ──▶│ <── unsent ───▶ │
/// ```
#[derive(Debug)]
pub struct SendBuffer {
    /// Sequence number of the oldest unacknowledged byte (`sender_base_sequence`).
    base: u32,
    /// Bytes `[base, base + offset)` are on the wire awaiting an ACK.
    offset: usize,
    /// Furthest extent ever transmitted, relative to `base`.
    ///
    /// Differs from `offset` after a go-back: ACKs up to `base + sent_high`
    /// are still legitimate.
    sent_high: usize,
    buffer: VecDeque<u8>,
    capacity: usize,
    timer: RetransmitTimer,
    /// Sequence number given to EXIT; once set, nothing more may be queued.
    exit_sequence: Option<u32>,
}

impl SendBuffer {
    /// `base` is the first data sequence number (`ISN + 1`).
    pub fn new(base: u32, capacity: usize, retransmit_timeout: Duration) -> Self {
        Self {
            base,
            offset: 0,
            sent_high: 0,
            buffer: VecDeque::with_capacity(capacity.min(1 << 16)),
            capacity,
            timer: RetransmitTimer::new(retransmit_timeout),
            exit_sequence: None,
        }
    }

    /// Queue `data` in full, or fail with [`StreamError::BufferFull`] leaving
    /// the buffer untouched.  Fails with [`StreamError::ConnectionClosed`]
    /// once EXIT has been assigned a sequence number.
    pub fn push(&mut self, data: &[u8]) -> Result<(), StreamError> {
        if self.exit_sequence.is_some() {
            return Err(StreamError::ConnectionClosed);
        }
        if data.len() > self.free() {
            return Err(StreamError::BufferFull {
                buffered: self.buffer.len(),
                capacity: self.capacity,
            });
        }
        self.buffer.extend(data);
        Ok(())
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    /// Bytes currently on the wire awaiting acknowledgement.
    pub fn in_flight(&self) -> usize {
        self.offset
    }

    /// Sequence number the next new byte will carry.
    pub fn next_sequence(&self) -> u32 {
        self.base.wrapping_add(self.offset as u32)
    }

    /// Total bytes held (in flight and unsent).
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn free(&self) -> usize {
        self.capacity.saturating_sub(self.buffer.len())
    }

    /// Bytes queued but not yet on the wire.
    pub fn unsent(&self) -> usize {
        self.buffer.len() - self.offset
    }

    /// `true` while some transmitted byte is still unacknowledged.
    pub fn has_unacked(&self) -> bool {
        self.sent_high > 0
    }

    /// Size of the next segment payload:
    /// `min(unsent, peer_window - offset, window_limit - offset, max_payload)`.
    pub fn sendable(&self, peer_window: u32, window_limit: usize, max_payload: usize) -> usize {
        let by_peer = (peer_window as usize).saturating_sub(self.offset);
        let by_limit = window_limit.saturating_sub(self.offset);
        self.unsent().min(by_peer).min(by_limit).min(max_payload)
    }

    /// Take the next slice of unsent bytes (possibly empty) and mark it as
    /// in flight.  Returns `(sequence, payload)`.
    pub fn next_payload(
        &mut self,
        peer_window: u32,
        window_limit: usize,
        max_payload: usize,
        now: Instant,
    ) -> (u32, Vec<u8>) {
        let size = self.sendable(peer_window, window_limit, max_payload);
        let seq = self.next_sequence();
        let payload: Vec<u8> = self
            .buffer
            .range(self.offset..self.offset + size)
            .copied()
            .collect();
        if size > 0 {
            self.offset += size;
            self.sent_high = self.sent_high.max(self.offset);
            self.timer.arm(now);
        }
        (seq, payload)
    }

    /// Apply a cumulative ACK.
    ///
    /// Drops the newly acknowledged prefix, advances `base`, shrinks `offset`
    /// and returns the number of bytes acknowledged.  Returns `0` for a
    /// duplicate ACK, an ACK behind `base`, or one beyond anything sent.
    pub fn on_ack(&mut self, ack: u32, now: Instant) -> usize {
        let acked = ack.wrapping_sub(self.base) as usize;
        if acked == 0 || acked > self.sent_high {
            return 0;
        }

        self.buffer.drain(..acked);
        self.base = ack;
        self.offset = self.offset.saturating_sub(acked);
        self.sent_high -= acked;

        if self.sent_high == 0 {
            self.timer.disarm();
        } else {
            self.timer.restart(now);
        }
        acked
    }

    /// Check the retransmit timer; on expiry rewind to `base` (go back N).
    ///
    /// Returns `true` when the window was rewound.
    pub fn poll_retransmit(&mut self, now: Instant) -> bool {
        if !self.has_unacked() {
            self.timer.disarm();
            return false;
        }
        if self.timer.poll_expired(now) {
            self.go_back();
            return true;
        }
        false
    }

    /// Rewind so the next transmission starts again at `base`.
    pub fn go_back(&mut self) {
        self.offset = 0;
    }

    /// Number of times the retransmit timer has fired.
    pub fn retransmit_timeouts(&self) -> u64 {
        self.timer.expirations()
    }

    /// Once everything queued is acknowledged, give EXIT the next sequence
    /// number and refuse further writes.  `None` while data is outstanding.
    ///
    /// Repeated calls return the sequence number already assigned.
    pub fn seal(&mut self) -> Option<u32> {
        if self.exit_sequence.is_none() && self.buffer.is_empty() {
            self.exit_sequence = Some(self.base);
        }
        self.exit_sequence
    }

    /// Sequence number of our EXIT, if one has been assigned.
    pub fn exit_sequence(&self) -> Option<u32> {
        self.exit_sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RTO: Duration = Duration::from_millis(100);
    const BIG: u32 = 1 << 20;

    fn buffer(base: u32, capacity: usize) -> SendBuffer {
        SendBuffer::new(base, capacity, RTO)
    }

    #[test]
    fn initial_state() {
        let s = buffer(100, 64);
        assert_eq!(s.base(), 100);
        assert_eq!(s.next_sequence(), 100);
        assert_eq!(s.in_flight(), 0);
        assert!(!s.has_unacked());
        assert_eq!(s.free(), 64);
    }

    #[test]
    fn push_is_all_or_nothing() {
        let mut s = buffer(0, 8);
        s.push(b"12345678").unwrap();
        let err = s.push(b"9").unwrap_err();
        assert!(matches!(
            err,
            StreamError::BufferFull {
                buffered: 8,
                capacity: 8
            }
        ));
        assert_eq!(s.len(), 8);
        let (_, payload) = s.next_payload(BIG, 64, 64, Instant::now());
        assert_eq!(payload, b"12345678");
    }

    #[test]
    fn payload_split_by_max_payload() {
        let mut s = buffer(10, 64);
        s.push(b"hello").unwrap();
        let now = Instant::now();
        let mut parts = Vec::new();
        loop {
            let (seq, p) = s.next_payload(BIG, 64, 2, now);
            if p.is_empty() {
                break;
            }
            parts.push((seq, p));
        }
        assert_eq!(
            parts,
            vec![
                (10, b"he".to_vec()),
                (12, b"ll".to_vec()),
                (14, b"o".to_vec())
            ]
        );
        assert_eq!(s.in_flight(), 5);
    }

    #[test]
    fn cumulative_ack_trims_prefix() {
        let mut s = buffer(0, 64);
        s.push(b"abcdefgh").unwrap();
        let now = Instant::now();
        s.next_payload(BIG, 64, 64, now);

        assert_eq!(s.on_ack(3, now), 3);
        assert_eq!(s.base(), 3);
        assert_eq!(s.in_flight(), 5);
        assert_eq!(s.len(), 5);
        assert!(s.has_unacked());

        assert_eq!(s.on_ack(8, now), 5);
        assert!(s.is_empty());
        assert!(!s.has_unacked());
    }

    #[test]
    fn duplicate_ack_is_idempotent() {
        let mut s = buffer(1000, 64);
        s.push(b"0123456789").unwrap();
        let now = Instant::now();
        s.next_payload(BIG, 64, 64, now);

        assert_eq!(s.on_ack(1004, now), 4);
        let (base, len, off) = (s.base(), s.len(), s.in_flight());
        assert_eq!(s.on_ack(1004, now), 0);
        assert_eq!((s.base(), s.len(), s.in_flight()), (base, len, off));
    }

    #[test]
    fn stale_and_spurious_acks_ignored() {
        let mut s = buffer(50, 64);
        s.push(b"abcd").unwrap();
        let now = Instant::now();
        s.next_payload(BIG, 64, 64, now);
        assert_eq!(s.on_ack(40, now), 0); // behind base
        assert_eq!(s.on_ack(55, now), 0); // beyond anything sent
        assert_eq!(s.base(), 50);
    }

    #[test]
    fn peer_window_caps_in_flight() {
        let mut s = buffer(0, 64);
        s.push(&[1u8; 40]).unwrap();
        let now = Instant::now();
        let (_, p) = s.next_payload(10, 64, 64, now);
        assert_eq!(p.len(), 10);
        let (_, p) = s.next_payload(10, 64, 64, now);
        assert!(p.is_empty());
        assert_eq!(s.in_flight(), 10);
    }

    #[test]
    fn window_limit_caps_in_flight() {
        let mut s = buffer(0, 64);
        s.push(&[1u8; 40]).unwrap();
        let now = Instant::now();
        let (_, p) = s.next_payload(BIG, 16, 10, now);
        assert_eq!(p.len(), 10);
        let (_, p) = s.next_payload(BIG, 16, 10, now);
        assert_eq!(p.len(), 6);
        assert_eq!(s.sendable(BIG, 16, 10), 0);
    }

    #[test]
    fn in_flight_never_exceeds_min_window() {
        let mut s = buffer(7, 4096);
        let now = Instant::now();
        let mut rwnd: u32 = 300;
        let limit = 200;
        for round in 0..200u32 {
            if s.free() > 50 {
                s.push(&[round as u8; 50]).unwrap();
            }
            let _ = s.next_payload(rwnd, limit, 37, now);
            assert!(s.in_flight() <= (rwnd as usize).min(limit));
            if round % 3 == 0 {
                let ack = s.base().wrapping_add((s.in_flight() / 2) as u32);
                s.on_ack(ack, now);
            }
            rwnd = 150 + (round * 37) % 300;
            if s.in_flight() > rwnd as usize {
                // Peer shrank its window below what is already out.
                s.go_back();
            }
        }
    }

    #[test]
    fn timeout_rewinds_whole_window() {
        let mut s = buffer(0, 64);
        s.push(b"abcdefghij").unwrap();
        let start = Instant::now();
        s.next_payload(BIG, 64, 4, start);
        s.next_payload(BIG, 64, 4, start);
        assert_eq!(s.in_flight(), 8);

        assert!(!s.poll_retransmit(start + RTO / 2));
        assert!(s.poll_retransmit(start + RTO));
        assert_eq!(s.in_flight(), 0);
        assert_eq!(s.retransmit_timeouts(), 1);

        let (seq, p) = s.next_payload(BIG, 64, 64, start + RTO);
        assert_eq!(seq, 0);
        assert_eq!(p, b"abcdefghij");
    }

    #[test]
    fn ack_after_go_back_is_still_accepted() {
        let mut s = buffer(0, 64);
        s.push(b"abcdefgh").unwrap();
        let start = Instant::now();
        s.next_payload(BIG, 64, 64, start);
        assert!(s.poll_retransmit(start + RTO));
        assert_eq!(s.in_flight(), 0);

        // ACK for the original transmission arrives late.
        assert_eq!(s.on_ack(6, start + RTO), 6);
        assert_eq!(s.base(), 6);
        assert_eq!(s.in_flight(), 0);
        assert_eq!(s.unsent(), 2);
    }

    #[test]
    fn ack_progress_restarts_timer() {
        let mut s = buffer(0, 64);
        s.push(b"abcdefgh").unwrap();
        let start = Instant::now();
        s.next_payload(BIG, 64, 64, start);
        s.on_ack(4, start + RTO / 2);
        assert!(!s.poll_retransmit(start + RTO));
        assert!(s.poll_retransmit(start + RTO + RTO / 2));
    }

    #[test]
    fn fully_acked_buffer_never_retransmits() {
        let mut s = buffer(0, 64);
        s.push(b"abc").unwrap();
        let start = Instant::now();
        s.next_payload(BIG, 64, 64, start);
        s.on_ack(3, start);
        assert!(!s.poll_retransmit(start + RTO * 5));
    }

    #[test]
    fn seq_wrap_around() {
        let start = u32::MAX - 2;
        let mut s = buffer(start, 64);
        s.push(b"abcdef").unwrap();
        let now = Instant::now();
        let (seq, _) = s.next_payload(BIG, 64, 64, now);
        assert_eq!(seq, start);
        assert_eq!(s.next_sequence(), start.wrapping_add(6));

        assert_eq!(s.on_ack(start.wrapping_add(6), now), 6);
        assert_eq!(s.base(), 3);
    }

    #[test]
    fn seal_waits_for_the_buffer_to_drain() {
        let now = Instant::now();
        let mut s = buffer(10, 100);
        s.push(b"abc").unwrap();
        assert_eq!(s.seal(), None);
        s.push(b"d").expect("still open while data is outstanding");

        s.next_payload(BIG, 100, 100, now);
        assert_eq!(s.on_ack(14, now), 4);
        assert_eq!(s.seal(), Some(14));
        assert_eq!(s.exit_sequence(), Some(14));
    }

    #[test]
    fn sealed_buffer_refuses_writes() {
        let mut s = buffer(7, 100);
        assert_eq!(s.seal(), Some(7));
        assert!(matches!(s.push(b"late"), Err(StreamError::ConnectionClosed)));
        assert!(s.is_empty());
        assert_eq!(s.next_sequence(), 7);
        // Sealing again keeps the first EXIT number.
        assert_eq!(s.seal(), Some(7));
    }
}
